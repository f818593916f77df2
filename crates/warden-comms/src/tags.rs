//! Tags identifying the payload type of each record.
//!
//! Tags at or above `0x8000_0000` are reserved for the typed helpers on
//! [`Comms`](crate::Comms). Callers of `send_tlv` pick tags below that range.

/// `bool` encoded as one byte.
pub const BOOL: u32 = 0x8000_0001;
/// `i8`.
pub const I8: u32 = 0x8000_0002;
/// `u8`.
pub const U8: u32 = 0x8000_0003;
/// `i16`.
pub const I16: u32 = 0x8000_0004;
/// `u16`.
pub const U16: u32 = 0x8000_0005;
/// `i32`.
pub const I32: u32 = 0x8000_0006;
/// `u32`.
pub const U32: u32 = 0x8000_0007;
/// `i64`.
pub const I64: u32 = 0x8000_0008;
/// `u64`.
pub const U64: u32 = 0x8000_0009;
/// UTF-8 string.
pub const STRING: u32 = 0x8000_0100;
/// Opaque bytes.
pub const BYTES: u32 = 0x8000_0101;
/// Serialised structured message.
pub const MESSAGE: u32 = 0x8000_0102;
/// Serialised [`Status`](warden_util::Status).
pub const STATUS: u32 = 0x8000_0103;
/// Zero-length record carrying a descriptor.
pub const FD: u32 = 0x8000_0201;
