//! One-shot sandboxed operations with bounded retries and a time limit.
//!
//! A [`Transaction`] drives a [`TransactionBody`] against a session. Each
//! attempt starts the session if needed, runs `main` under the time limit
//! and, on failure, terminates the session so the next attempt starts
//! fresh.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::result::SandboxResult;
use crate::rpc::Sandbox;


const TRANSACTION_TARGET: &str = "warden_sandbox::transaction";

/// Why an attempt failed.
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    /// The sandbox failed, including timeouts and violations.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// A check inside the body failed.
    #[error("transaction failed: {0}")]
    Failed(String),
}

/// Returns [`TransactionError::Failed`] from the enclosing function when
/// `cond` is false.
///
/// ```
/// use warden_sandbox::{TransactionError, transaction_fail_if_not};
///
/// fn check(len: usize) -> Result<(), TransactionError> {
///     transaction_fail_if_not!(len > 0, "empty output");
///     Ok(())
/// }
///
/// assert!(check(0).is_err());
/// ```
#[macro_export]
macro_rules! transaction_fail_if_not {
    ($cond:expr, $($msg:tt)+) => {
        if !$cond {
            return Err($crate::TransactionError::Failed(format!(
                "{}: {}",
                stringify!($cond),
                format_args!($($msg)+)
            )));
        }
    };
}

/// The lifecycle operations a transaction needs from a sandbox.
#[cfg_attr(test, mockall::automock)]
pub trait Session {
    /// Returns `true` while the sandboxee runs.
    fn is_active(&self) -> bool;

    /// Starts the sandboxee.
    ///
    /// # Errors
    ///
    /// Fails when the sandboxee cannot be started.
    fn init(&mut self) -> Result<(), SandboxError>;

    /// Replaces the wall-time limit.
    ///
    /// # Errors
    ///
    /// Fails without an active session.
    fn set_wall_time_limit(&self, limit: Option<Duration>) -> Result<(), SandboxError>;

    /// Ends the sandboxee.
    ///
    /// # Errors
    ///
    /// Fails without a session.
    fn terminate(&mut self, graceful: bool) -> Result<SandboxResult, SandboxError>;
}

impl Session for Sandbox {
    fn is_active(&self) -> bool {
        Self::is_active(self)
    }

    fn init(&mut self) -> Result<(), SandboxError> {
        Self::init(self)
    }

    fn set_wall_time_limit(&self, limit: Option<Duration>) -> Result<(), SandboxError> {
        Self::set_wall_time_limit(self, limit)
    }

    fn terminate(&mut self, graceful: bool) -> Result<SandboxResult, SandboxError> {
        Self::terminate(self, graceful)
    }
}

/// The work of a transaction.
pub trait TransactionBody<S = Sandbox> {
    /// Runs after each fresh start of the session.
    ///
    /// # Errors
    ///
    /// A failure fails the attempt.
    fn init(&mut self, _sandbox: &mut S) -> Result<(), TransactionError> {
        Ok(())
    }

    /// The operation itself.
    ///
    /// # Errors
    ///
    /// A failure fails the attempt.
    fn main(&mut self, sandbox: &mut S) -> Result<(), TransactionError>;

    /// Runs once from [`Transaction::finish`].
    ///
    /// # Errors
    ///
    /// Returned from `finish`.
    fn finish(&mut self, _sandbox: &mut S) -> Result<(), TransactionError> {
        Ok(())
    }
}

type Step<S> = Box<dyn FnMut(&mut S) -> Result<(), TransactionError> + Send>;

/// A [`TransactionBody`] made of closures.
pub struct BasicTransaction<S = Sandbox> {
    init: Option<Step<S>>,
    main: Step<S>,
    finish: Option<Step<S>>,
}

impl<S> BasicTransaction<S> {
    /// A body running `main`.
    #[must_use]
    pub fn new<F>(main: F) -> Self
    where
        F: FnMut(&mut S) -> Result<(), TransactionError> + Send + 'static,
    {
        Self {
            init: None,
            main: Box::new(main),
            finish: None,
        }
    }

    /// Runs `init` after each fresh start.
    #[must_use]
    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: FnMut(&mut S) -> Result<(), TransactionError> + Send + 'static,
    {
        self.init = Some(Box::new(init));
        self
    }

    /// Runs `finish` from [`Transaction::finish`].
    #[must_use]
    pub fn with_finish<F>(mut self, finish: F) -> Self
    where
        F: FnMut(&mut S) -> Result<(), TransactionError> + Send + 'static,
    {
        self.finish = Some(Box::new(finish));
        self
    }
}

impl<S> TransactionBody<S> for BasicTransaction<S> {
    fn init(&mut self, sandbox: &mut S) -> Result<(), TransactionError> {
        self.init.as_mut().map_or(Ok(()), |init| init(sandbox))
    }

    fn main(&mut self, sandbox: &mut S) -> Result<(), TransactionError> {
        (self.main)(sandbox)
    }

    fn finish(&mut self, sandbox: &mut S) -> Result<(), TransactionError> {
        self.finish.as_mut().map_or(Ok(()), |finish| finish(sandbox))
    }
}

/// Runs a body with retries and a time limit.
#[derive(Debug)]
pub struct Transaction<B, S = Sandbox> {
    sandbox: S,
    body: B,
    retries: usize,
    time_limit: Option<Duration>,
}

impl<B, S> Transaction<B, S>
where
    B: TransactionBody<S>,
    S: Session,
{
    /// A transaction of one attempt without a time limit.
    #[must_use]
    pub const fn new(sandbox: S, body: B) -> Self {
        Self {
            sandbox,
            body,
            retries: 0,
            time_limit: None,
        }
    }

    /// Number of extra attempts after a failure; 0 means exactly one.
    pub const fn set_retry_count(&mut self, retries: usize) {
        self.retries = retries;
    }

    /// Wall-time limit of each `main`; `None` or zero means none.
    pub fn set_time_limit(&mut self, limit: Option<Duration>) {
        self.time_limit = limit.filter(|wall| !wall.is_zero());
    }

    /// The session the transaction runs against.
    #[must_use]
    pub const fn sandbox(&self) -> &S {
        &self.sandbox
    }

    /// Runs attempts until one succeeds or the retries run out.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub fn run(&mut self) -> Result<(), TransactionError> {
        let mut attempt = 0;
        loop {
            match self.attempt() {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(
                        target: TRANSACTION_TARGET,
                        attempt,
                        %error,
                        "transaction attempt failed"
                    );
                    self.discard_session();
                    if attempt >= self.retries {
                        return Err(error);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Runs the body's `finish` and ends the session gracefully.
    ///
    /// # Errors
    ///
    /// Returns the body's error; a session that already ended is not an
    /// error.
    pub fn finish(&mut self) -> Result<(), TransactionError> {
        let finished = self.body.finish(&mut self.sandbox);
        if self.sandbox.is_active()
            && let Err(error) = self.sandbox.terminate(true)
        {
            debug!(target: TRANSACTION_TARGET, %error, "terminating after finish failed");
        }
        finished
    }

    fn attempt(&mut self) -> Result<(), TransactionError> {
        if !self.sandbox.is_active() {
            self.sandbox.init()?;
            self.body.init(&mut self.sandbox)?;
        }
        self.sandbox.set_wall_time_limit(self.time_limit)?;
        let outcome = self.body.main(&mut self.sandbox);
        if outcome.is_ok() && self.sandbox.is_active() {
            self.sandbox.set_wall_time_limit(None)?;
        }
        outcome
    }

    fn discard_session(&mut self) {
        if !self.sandbox.is_active() {
            return;
        }
        if let Err(error) = self.sandbox.terminate(false) {
            debug!(target: TRANSACTION_TARGET, %error, "terminating failed session");
        }
    }
}
