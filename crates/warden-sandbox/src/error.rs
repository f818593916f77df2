//! Domain errors raised by the executor, the monitor and the RPC layer.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use warden_comms::CommsError;
use warden_config::ConfigError;
use warden_policy::PolicyError;
use warden_util::Status;

use crate::result::SandboxResult;

/// Errors raised while preparing, running or talking to a sandboxee.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    /// The policy failed to build or compile.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The channel to the sandboxee failed before a session existed.
    #[error(transparent)]
    Comms(#[from] CommsError),

    /// The executor description is unusable.
    #[error("invalid executor: {reason}")]
    InvalidExecutor {
        /// Why the executor was rejected.
        reason: String,
    },

    /// The binary to run could not be opened.
    #[error("failed to open {path}: {source}")]
    OpenBinary {
        /// Host path of the binary.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: Arc<io::Error>,
    },

    /// An OS call made while preparing the sandboxee failed.
    #[error("{context} failed: {source}")]
    Os {
        /// The operation that failed.
        context: &'static str,
        /// Underlying error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The sandbox has no live sandboxee.
    #[error("the sandbox is not active")]
    NotActive,

    /// The session ended; the result says why.
    #[error("the sandboxee terminated: {0}")]
    Terminated(Box<SandboxResult>),

    /// The sandboxee did not identify itself as an RPC server.
    #[error("unexpected handshake 0x{magic:08x} from the sandboxee")]
    Handshake {
        /// Value received instead of the expected magic.
        magic: u32,
    },

    /// A pointer from another session was used.
    #[error("pointer belongs to session {pointer_session}, the active session is {active_session}")]
    ForeignPointer {
        /// Session the pointer was allocated in.
        pointer_session: u64,
        /// Current session.
        active_session: u64,
    },

    /// The sandboxee rejected a request.
    #[error("sandboxee error: {0}")]
    Remote(Status),

    /// The sandboxee sent a reply that does not answer the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A request was malformed on the host side.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl SandboxError {
    pub(crate) fn os(context: &'static str, source: io::Error) -> Self {
        Self::Os {
            context,
            source: Arc::new(source),
        }
    }

    pub(crate) fn errno(context: &'static str, errno: nix::errno::Errno) -> Self {
        Self::os(context, io::Error::from(errno))
    }

    /// The result of the run, when the error is a terminated session.
    #[must_use]
    pub fn result(&self) -> Option<&SandboxResult> {
        match self {
            Self::Terminated(result) => Some(result),
            _ => None,
        }
    }
}
