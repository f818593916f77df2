//! The [`Comms`] channel.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, sockopt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};
use warden_util::Status;

use crate::error::CommsError;
use crate::socket::{recv_once, send_once};
use crate::{DEFAULT_MAX_MSG_SIZE, tags};


const COMMS_TARGET: &str = "warden_comms";
const HEADER_LEN: usize = 8;

/// Credentials of the process on the other end of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    /// Peer process id.
    pub pid: i32,
    /// Peer user id.
    pub uid: u32,
    /// Peer group id.
    pub gid: u32,
}

/// A bidirectional, typed message channel over a Unix stream socket.
///
/// Sends and receives are serialised independently, so one thread may block
/// in a receive while another sends.
#[derive(Debug)]
pub struct Comms {
    fd: OwnedFd,
    max_msg_size: u32,
    terminated: AtomicBool,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
}

struct Record {
    tag: u32,
    payload: Vec<u8>,
    fd: Option<OwnedFd>,
}

macro_rules! scalar_ops {
    ($($send:ident, $recv:ident, $ty:ty, $tag:expr;)*) => {
        $(
            #[doc = concat!("Sends one `", stringify!($ty), "`.")]
            ///
            /// # Errors
            ///
            /// Fails on transport errors.
            #[expect(clippy::little_endian_bytes, reason = "scalars are little-endian on the wire")]
            pub fn $send(&self, value: $ty) -> Result<(), CommsError> {
                self.send_tlv($tag, &value.to_le_bytes())
            }

            #[doc = concat!("Receives one `", stringify!($ty), "`.")]
            ///
            /// # Errors
            ///
            /// Fails on transport errors or when the next record is not of
            /// this type.
            #[expect(clippy::little_endian_bytes, reason = "scalars are little-endian on the wire")]
            pub fn $recv(&self) -> Result<$ty, CommsError> {
                let bytes = self.recv_fixed::<{ size_of::<$ty>() }>($tag)?;
                Ok(<$ty>::from_le_bytes(bytes))
            }
        )*
    };
}

impl Comms {
    /// Creates a connected pair of channels.
    ///
    /// # Errors
    ///
    /// Fails when the socket pair cannot be created.
    pub fn pair() -> Result<(Self, Self), CommsError> {
        let (left, right) = socket::socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|errno| CommsError::from(std::io::Error::from(errno)))?;
        Ok((Self::from_fd(left), Self::from_fd(right)))
    }

    /// Wraps a connected stream socket.
    #[must_use]
    pub const fn from_fd(fd: OwnedFd) -> Self {
        Self {
            fd,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            terminated: AtomicBool::new(false),
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        }
    }

    /// Adopts a descriptor inherited at a well-known number, such as
    /// [`SANDBOXEE_COMMS_FD`](crate::SANDBOXEE_COMMS_FD).
    ///
    /// # Errors
    ///
    /// Fails when `fd` is not open in this process.
    pub fn from_inherited_fd(fd: RawFd) -> Result<Self, CommsError> {
        // SAFETY: F_GETFD only inspects the descriptor table.
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: the descriptor is open and was handed to this process for
        // exclusive use by the comms channel.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self::from_fd(owned))
    }

    /// Returns a copy with a different payload limit.
    #[must_use]
    pub const fn with_max_msg_size(mut self, max_msg_size: u32) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    /// Largest payload this channel sends or accepts.
    #[must_use]
    pub const fn max_msg_size(&self) -> u32 {
        self.max_msg_size
    }

    /// Raw descriptor number, for policies that pin syscalls to it.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Gives up the channel and returns its socket, for handing it to a
    /// child process.
    #[must_use]
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Shuts the socket down in both directions and marks the channel
    /// terminated. Blocked receives on either end return.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            debug!(target: COMMS_TARGET, fd = self.raw_fd(), "terminating comms channel");
            if let Err(errno) = socket::shutdown(self.raw_fd(), socket::Shutdown::Both) {
                trace!(target: COMMS_TARGET, %errno, "shutdown of comms socket failed");
            }
        }
    }

    /// Returns `true` once the channel has been terminated or failed.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Sends a record with an arbitrary tag. Zero-length payloads are valid.
    ///
    /// # Errors
    ///
    /// Fails with [`CommsError::MessageTooLarge`] before writing anything when
    /// the payload exceeds the limit, or on transport errors.
    pub fn send_tlv(&self, tag: u32, payload: &[u8]) -> Result<(), CommsError> {
        self.send_record(tag, payload, None)
    }

    /// Receives the next record and returns its tag and payload.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or an oversized announced length.
    pub fn recv_tlv(&self) -> Result<(u32, Vec<u8>), CommsError> {
        let record = self.recv_record()?;
        Ok((record.tag, record.payload))
    }

    /// Sends a boolean.
    ///
    /// # Errors
    ///
    /// Fails on transport errors.
    pub fn send_bool(&self, value: bool) -> Result<(), CommsError> {
        self.send_tlv(tags::BOOL, &[u8::from(value)])
    }

    /// Receives a boolean.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or a record of another type.
    pub fn recv_bool(&self) -> Result<bool, CommsError> {
        let [byte] = self.recv_fixed::<1>(tags::BOOL)?;
        Ok(byte != 0)
    }

    scalar_ops! {
        send_i8, recv_i8, i8, tags::I8;
        send_u8, recv_u8, u8, tags::U8;
        send_i16, recv_i16, i16, tags::I16;
        send_u16, recv_u16, u16, tags::U16;
        send_i32, recv_i32, i32, tags::I32;
        send_u32, recv_u32, u32, tags::U32;
        send_i64, recv_i64, i64, tags::I64;
        send_u64, recv_u64, u64, tags::U64;
    }

    /// Sends opaque bytes.
    ///
    /// # Errors
    ///
    /// See [`Comms::send_tlv`].
    pub fn send_bytes(&self, bytes: &[u8]) -> Result<(), CommsError> {
        self.send_tlv(tags::BYTES, bytes)
    }

    /// Receives opaque bytes.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or a record of another type.
    pub fn recv_bytes(&self) -> Result<Vec<u8>, CommsError> {
        self.recv_tagged(tags::BYTES)
    }

    /// Sends a string. Embedded NUL bytes are preserved.
    ///
    /// # Errors
    ///
    /// See [`Comms::send_tlv`].
    pub fn send_string(&self, value: &str) -> Result<(), CommsError> {
        self.send_tlv(tags::STRING, value.as_bytes())
    }

    /// Receives a string.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, a record of another type, or invalid UTF-8.
    pub fn recv_string(&self) -> Result<String, CommsError> {
        String::from_utf8(self.recv_tagged(tags::STRING)?).map_err(|_| CommsError::InvalidUtf8)
    }

    /// Passes a descriptor to the peer. The caller keeps its own copy.
    ///
    /// # Errors
    ///
    /// Fails on transport errors.
    pub fn send_fd(&self, fd: BorrowedFd<'_>) -> Result<(), CommsError> {
        self.send_record(tags::FD, &[], Some(fd.as_raw_fd()))
    }

    /// Receives a descriptor passed by the peer.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, a record of another type, or a descriptor
    /// record without a descriptor.
    pub fn recv_fd(&self) -> Result<OwnedFd, CommsError> {
        let record = self.recv_record()?;
        expect_tag(tags::FD, record.tag).map_err(|error| self.fail(error))?;
        record.fd.ok_or_else(|| self.fail(CommsError::MissingFd))
    }

    /// Sends a structured message encoded as JSON.
    ///
    /// # Errors
    ///
    /// Fails when the value cannot be encoded or on transport errors.
    pub fn send_message<T: Serialize>(&self, message: &T) -> Result<(), CommsError> {
        let payload =
            serde_json::to_vec(message).map_err(|error| CommsError::Serialize(error.to_string()))?;
        self.send_tlv(tags::MESSAGE, &payload)
    }

    /// Receives a structured message encoded as JSON.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, a record of another type, or a payload
    /// that does not decode as `T`.
    pub fn recv_message<T: DeserializeOwned>(&self) -> Result<T, CommsError> {
        let payload = self.recv_tagged(tags::MESSAGE)?;
        serde_json::from_slice(&payload).map_err(|error| CommsError::Deserialize(error.to_string()))
    }

    /// Sends a [`Status`].
    ///
    /// # Errors
    ///
    /// Fails on transport errors.
    pub fn send_status(&self, status: &Status) -> Result<(), CommsError> {
        let payload =
            serde_json::to_vec(status).map_err(|error| CommsError::Serialize(error.to_string()))?;
        self.send_tlv(tags::STATUS, &payload)
    }

    /// Receives a [`Status`].
    ///
    /// # Errors
    ///
    /// Fails on transport errors, a record of another type, or a malformed
    /// status payload.
    pub fn recv_status(&self) -> Result<Status, CommsError> {
        let payload = self.recv_tagged(tags::STATUS)?;
        serde_json::from_slice(&payload).map_err(|error| CommsError::Deserialize(error.to_string()))
    }

    /// Reads the credentials of the peer process.
    ///
    /// For a socket pair these are the credentials of the process that
    /// created the pair, captured at creation time.
    ///
    /// # Errors
    ///
    /// Fails when `SO_PEERCRED` cannot be read.
    pub fn recv_creds(&self) -> Result<Credentials, CommsError> {
        self.ensure_active()?;
        let creds = socket::getsockopt(&self.fd, sockopt::PeerCredentials)
            .map_err(|errno| self.fail(std::io::Error::from(errno).into()))?;
        Ok(Credentials {
            pid: creds.pid(),
            uid: creds.uid(),
            gid: creds.gid(),
        })
    }

    fn ensure_active(&self) -> Result<(), CommsError> {
        if self.is_terminated() {
            return Err(CommsError::Terminated);
        }
        Ok(())
    }

    fn fail(&self, error: CommsError) -> CommsError {
        if error.is_transport() || error.is_protocol() {
            self.terminated.store(true, Ordering::Release);
            debug!(target: COMMS_TARGET, fd = self.raw_fd(), %error, "comms channel failed");
        }
        error
    }

    fn check_len(&self, len: usize) -> Result<u32, CommsError> {
        u32::try_from(len)
            .ok()
            .filter(|length| *length <= self.max_msg_size)
            .ok_or(CommsError::MessageTooLarge {
                len,
                max: self.max_msg_size,
            })
    }

    #[expect(clippy::little_endian_bytes, reason = "record headers are little-endian")]
    fn send_record(
        &self,
        tag: u32,
        payload: &[u8],
        pass_fd: Option<RawFd>,
    ) -> Result<(), CommsError> {
        self.ensure_active()?;
        let len = self.check_len(payload.len())?;

        let mut header = [0_u8; HEADER_LEN];
        let (tag_bytes, len_bytes) = header.split_at_mut(4);
        tag_bytes.copy_from_slice(&tag.to_le_bytes());
        len_bytes.copy_from_slice(&len.to_le_bytes());

        let _guard = self
            .send_lock
            .lock()
            .map_err(|_| CommsError::Terminated)?;
        trace!(target: COMMS_TARGET, tag, len, "sending record");
        self.write_all(&header, payload, pass_fd)
            .map_err(|error| self.fail(error))
    }

    fn write_all(
        &self,
        header: &[u8],
        payload: &[u8],
        mut pass_fd: Option<RawFd>,
    ) -> Result<(), CommsError> {
        let mut header_sent = 0;
        let mut payload_sent = 0;
        while header_sent < header.len() || payload_sent < payload.len() {
            let header_rest = header.get(header_sent..).unwrap_or_default();
            let payload_rest = payload.get(payload_sent..).unwrap_or_default();
            let sent = send_once(self.raw_fd(), &[header_rest, payload_rest], pass_fd.take())?;
            if sent == 0 {
                return Err(CommsError::Closed);
            }
            let from_header = sent.min(header_rest.len());
            header_sent += from_header;
            payload_sent += sent - from_header;
        }
        Ok(())
    }

    #[expect(clippy::little_endian_bytes, reason = "record headers are little-endian")]
    fn recv_record(&self) -> Result<Record, CommsError> {
        self.ensure_active()?;
        let _guard = self
            .recv_lock
            .lock()
            .map_err(|_| CommsError::Terminated)?;

        let mut header = [0_u8; HEADER_LEN];
        let fd = self
            .read_exact(&mut header)
            .map_err(|error| self.fail(error))?;
        let [t0, t1, t2, t3, l0, l1, l2, l3] = header;
        let tag = u32::from_le_bytes([t0, t1, t2, t3]);
        let len = u32::from_le_bytes([l0, l1, l2, l3]);
        let size = usize::try_from(len).unwrap_or(usize::MAX);

        if len > self.max_msg_size {
            // The payload stays unread, so the stream is out of sync.
            self.terminate();
            return Err(CommsError::MessageTooLarge {
                len: size,
                max: self.max_msg_size,
            });
        }

        let mut payload = vec![0_u8; size];
        self.read_exact(&mut payload)
            .map_err(|error| self.fail(error))?;
        trace!(target: COMMS_TARGET, tag, len, "received record");
        Ok(Record { tag, payload, fd })
    }

    fn read_exact(&self, buf: &mut [u8]) -> Result<Option<OwnedFd>, CommsError> {
        let mut passed = None;
        let mut filled = 0;
        while filled < buf.len() {
            let rest = buf.get_mut(filled..).unwrap_or_default();
            let (received, fd) = recv_once(self.raw_fd(), rest)?;
            if fd.is_some() {
                passed = fd;
            }
            if received == 0 {
                return Err(CommsError::Closed);
            }
            filled += received;
        }
        Ok(passed)
    }

    fn recv_tagged(&self, expected: u32) -> Result<Vec<u8>, CommsError> {
        let record = self.recv_record()?;
        expect_tag(expected, record.tag).map_err(|error| self.fail(error))?;
        Ok(record.payload)
    }

    fn recv_fixed<const N: usize>(&self, expected: u32) -> Result<[u8; N], CommsError> {
        let payload = self.recv_tagged(expected)?;
        let actual = payload.len();
        payload.try_into().map_err(|_| {
            self.fail(CommsError::LengthMismatch {
                expected: N,
                actual,
            })
        })
    }
}

impl AsFd for Comms {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn expect_tag(expected: u32, actual: u32) -> Result<(), CommsError> {
    if expected == actual {
        Ok(())
    } else {
        Err(CommsError::TagMismatch { expected, actual })
    }
}
