//! Error types for the comms channel.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised by [`Comms`](crate::Comms) operations.
///
/// Transport failures leave the channel terminated; every later call fails
/// with [`CommsError::Terminated`].
#[derive(Debug, Clone, Error)]
pub enum CommsError {
    /// The underlying socket call failed.
    #[error("comms I/O failed: {0}")]
    Io(#[source] Arc<io::Error>),
    /// The peer closed its end.
    #[error("comms peer closed the channel")]
    Closed,
    /// The channel was terminated earlier.
    #[error("comms channel is terminated")]
    Terminated,
    /// A record arrived with an unexpected tag.
    #[error("expected tag {expected:#x}, received {actual:#x}")]
    TagMismatch {
        /// Tag the caller asked for.
        expected: u32,
        /// Tag found on the wire.
        actual: u32,
    },
    /// A fixed-size record arrived with the wrong length.
    #[error("expected {expected} payload bytes, received {actual}")]
    LengthMismatch {
        /// Length the record type requires.
        expected: usize,
        /// Length found on the wire.
        actual: usize,
    },
    /// A payload exceeds the channel's size limit.
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge {
        /// Requested or announced payload length.
        len: usize,
        /// Configured limit.
        max: u32,
    },
    /// A descriptor record arrived without a descriptor attached.
    #[error("descriptor record carried no descriptor")]
    MissingFd,
    /// A structured message could not be encoded.
    #[error("failed to serialise message: {0}")]
    Serialize(String),
    /// A structured message could not be decoded.
    #[error("failed to deserialise message: {0}")]
    Deserialize(String),
    /// A string record held invalid UTF-8.
    #[error("string record is not valid UTF-8")]
    InvalidUtf8,
    /// The peer attached more than one descriptor to a record.
    #[error("peer passed more than one descriptor with a record")]
    ExcessDescriptors,
}

impl CommsError {
    /// Returns `true` for failures that leave the stream out of sync.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Closed | Self::Terminated)
    }

    /// Returns `true` when the peer broke the record protocol: a record of
    /// the wrong type or size, or mangled descriptor passing. The channel
    /// is terminated afterwards just as for transport failures.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::TagMismatch { .. }
                | Self::LengthMismatch { .. }
                | Self::MissingFd
                | Self::ExcessDescriptors
        )
    }
}

impl From<io::Error> for CommsError {
    fn from(error: io::Error) -> Self {
        match error.raw_os_error() {
            Some(libc::EPIPE | libc::ECONNRESET) => Self::Closed,
            _ => Self::Io(Arc::new(error)),
        }
    }
}
