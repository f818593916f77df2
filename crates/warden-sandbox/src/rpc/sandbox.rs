//! Host side: one generic sandbox for any RPC-serving sandboxee binary.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info};
use warden_comms::SANDBOXEE_COMMS_FD;
use warden_config::Config;
use warden_policy::{Policy, PolicyBuilder};

use super::channel::Channel;
use super::{Arg, RemotePtr, Value};
use crate::error::SandboxError;
use crate::executor::{Executor, Limits};
use crate::monitor::Monitor;
use crate::result::SandboxResult;

const SANDBOX_TARGET: &str = "warden_sandbox::sandbox";

/// How long a broken session waits for the monitor's verdict before killing
/// the sandboxee itself.
const TERMINATION_GRACE: Duration = Duration::from_secs(1);

/// How long a graceful terminate waits for the sandboxee to exit.
const GRACEFUL_EXIT_WAIT: Duration = Duration::from_secs(1);

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

type PolicyModifier = dyn Fn(PolicyBuilder) -> PolicyBuilder + Send + Sync;

/// Everything needed to start a sandboxee: the binary, its arguments and
/// environment, policy additions and limits.
///
/// The base policy covers Rust runtime startup, the system allocator, exit
/// and the comms channel. The modifier adds whatever the served functions
/// need. With namespaces enabled the binary's libraries are mapped too.
pub struct SandboxSpec {
    binary: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    policy: Option<Box<PolicyModifier>>,
    limits: Limits,
    config: Config,
}

impl fmt::Debug for SandboxSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxSpec")
            .field("binary", &self.binary)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("policy", &self.policy.is_some())
            .field("limits", &self.limits)
            .field("config", &self.config)
            .finish()
    }
}

impl SandboxSpec {
    /// Describes a sandboxee running `binary`.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            env: Vec::new(),
            policy: None,
            limits: Limits::new(),
            config: Config::default(),
        }
    }

    /// Appends an argument after `argv[0]`.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Extends the base policy.
    #[must_use]
    pub fn policy<F>(mut self, modifier: F) -> Self
    where
        F: Fn(PolicyBuilder) -> PolicyBuilder + Send + Sync + 'static,
    {
        self.policy = Some(Box::new(modifier));
        self
    }

    /// Resource limits of each sandboxee.
    #[must_use]
    pub const fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn build_policy(&self) -> Result<Policy, SandboxError> {
        let mut builder = PolicyBuilder::new()
            .allow_runtime_startup()
            .allow_system_malloc()
            .allow_exit()
            .allow_safe_fcntl()
            .allow_syscall_on_fd(libc::SYS_sendmsg, SANDBOXEE_COMMS_FD)
            .allow_syscall_on_fd(libc::SYS_recvmsg, SANDBOXEE_COMMS_FD);
        if let Some(modifier) = &self.policy {
            builder = modifier(builder);
        }
        if builder.namespaces_enabled() {
            let binary = self.binary.to_str().ok_or_else(|| {
                SandboxError::InvalidArgument(format!(
                    "{} is not valid UTF-8",
                    self.binary.display()
                ))
            })?;
            builder = builder.add_mappings_for_binary(binary, self.ld_library_path());
        }
        Ok(builder.try_build()?)
    }

    fn ld_library_path(&self) -> &str {
        self.env
            .iter()
            .rev()
            .find(|(key, _)| key == "LD_LIBRARY_PATH")
            .map_or("", |(_, value)| value.as_str())
    }

    fn executor(&self) -> Executor {
        let with_args = self
            .args
            .iter()
            .fold(Executor::new(&self.binary).limits(self.limits), |acc, arg| {
                acc.arg(arg.as_str())
            });
        self.env
            .iter()
            .fold(with_args, |acc, (key, value)| acc.env(key.as_str(), value.as_str()))
    }
}

struct ActiveSession {
    id: u64,
    monitor: Monitor,
}

/// A sandboxee serving RPC requests.
///
/// A session starts with [`Sandbox::init`] and ends when the sandboxee
/// exits, violates its policy, is killed or the channel breaks. After that
/// every call returns [`SandboxError::Terminated`] with the result until
/// `init` starts a new session.
pub struct Sandbox {
    spec: SandboxSpec,
    session: Option<ActiveSession>,
    last_result: Option<SandboxResult>,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("spec", &self.spec)
            .field("session", &self.session.as_ref().map(|session| session.id))
            .field("last_result", &self.last_result)
            .finish()
    }
}

impl Sandbox {
    /// A sandbox with no session yet.
    #[must_use]
    pub const fn new(spec: SandboxSpec) -> Self {
        Self {
            spec,
            session: None,
            last_result: None,
        }
    }

    /// Starts a sandboxee and waits for its handshake. Does nothing while a
    /// session is active.
    ///
    /// # Errors
    ///
    /// Fails when the policy does not build, the sandboxee cannot be started,
    /// or it ends or answers wrongly before the handshake.
    pub fn init(&mut self) -> Result<(), SandboxError> {
        if self.is_active() {
            return Ok(());
        }
        self.session = None;
        let policy = self.spec.build_policy()?;
        let monitor = Monitor::spawn(self.spec.executor(), &policy, &self.spec.config)?;
        let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        self.session = Some(ActiveSession { id, monitor });

        if let Some(result) = self
            .session
            .as_ref()
            .and_then(|session| session.monitor.await_result_timeout(Duration::ZERO))
        {
            return Err(self.record_end(result));
        }
        self.with_channel(|channel| channel.handshake())
            .inspect_err(|_| self.kill_session())?;
        info!(
            target: SANDBOX_TARGET,
            session = id,
            binary = %self.spec.binary.display(),
            "sandbox ready"
        );
        self.last_result = None;
        Ok(())
    }

    /// Returns `true` while a session is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.monitor.is_terminated())
    }

    /// Calls `name` and returns its value.
    ///
    /// # Errors
    ///
    /// Fails on foreign pointers, remote errors, protocol errors and ended
    /// sessions.
    pub fn call(&mut self, name: &str, args: &[Arg]) -> Result<Value, SandboxError> {
        self.with_channel(|channel| channel.call(name, args))
    }

    /// Calls `name`, which returns a region of sandboxee memory.
    ///
    /// # Errors
    ///
    /// See [`Sandbox::call`].
    pub fn call_ptr(&mut self, name: &str, args: &[Arg]) -> Result<RemotePtr, SandboxError> {
        self.with_channel(|channel| channel.call_ptr(name, args))
    }

    /// Allocates `size` zeroed bytes in the sandboxee.
    ///
    /// # Errors
    ///
    /// See [`Sandbox::call`].
    pub fn allocate(&mut self, size: u64) -> Result<RemotePtr, SandboxError> {
        self.with_channel(|channel| channel.allocate(size))
    }

    /// Releases a region.
    ///
    /// # Errors
    ///
    /// See [`Sandbox::call`].
    pub fn free(&mut self, ptr: &RemotePtr) -> Result<(), SandboxError> {
        self.with_channel(|channel| channel.free(ptr))
    }

    /// Copies `data` to the start of `ptr`'s region.
    ///
    /// # Errors
    ///
    /// Fails when `data` is larger than the region; see also
    /// [`Sandbox::call`].
    pub fn transfer_to_sandboxee(
        &mut self,
        ptr: &RemotePtr,
        data: &[u8],
    ) -> Result<(), SandboxError> {
        self.with_channel(|channel| channel.transfer_to(ptr, data))
    }

    /// Copies `ptr`'s region back.
    ///
    /// # Errors
    ///
    /// See [`Sandbox::call`].
    pub fn transfer_from_sandboxee(&mut self, ptr: &RemotePtr) -> Result<Vec<u8>, SandboxError> {
        self.with_channel(|channel| channel.transfer_from(ptr))
    }

    /// Replaces the session's wall-time limit, counted from now.
    ///
    /// # Errors
    ///
    /// Fails without an active session.
    pub fn set_wall_time_limit(&self, limit: Option<Duration>) -> Result<(), SandboxError> {
        let session = self.session.as_ref().ok_or(SandboxError::NotActive)?;
        session.monitor.set_wall_time_limit(limit);
        Ok(())
    }

    /// Ends the session. A graceful terminate asks the sandboxee to exit
    /// first and kills it only if it does not.
    ///
    /// # Errors
    ///
    /// Fails without a session.
    pub fn terminate(&mut self, graceful: bool) -> Result<SandboxResult, SandboxError> {
        let session = self.session.as_ref().ok_or(SandboxError::NotActive)?;
        if graceful && !session.monitor.is_terminated() {
            let channel = Channel::new(session.monitor.comms(), session.id);
            if let Err(error) = channel.exit() {
                debug!(target: SANDBOX_TARGET, %error, "graceful exit request failed");
            }
            let exited = session.monitor.await_result_timeout(GRACEFUL_EXIT_WAIT);
            if exited.is_none() {
                session.monitor.kill();
            }
        } else {
            session.monitor.kill();
        }
        self.await_result()
    }

    /// Waits for the session to end and returns its result. Without a
    /// session, returns the result of the last one.
    ///
    /// # Errors
    ///
    /// Fails when no session was ever started.
    pub fn await_result(&mut self) -> Result<SandboxResult, SandboxError> {
        match self.session.take() {
            Some(session) => {
                let result = session.monitor.await_result();
                self.last_result = Some(result.clone());
                Ok(result)
            }
            None => self.last_result.clone().ok_or(SandboxError::NotActive),
        }
    }

    fn with_channel<T>(
        &mut self,
        exchange: impl FnOnce(&Channel<'_>) -> Result<T, SandboxError>,
    ) -> Result<T, SandboxError> {
        let Some(session) = &self.session else {
            return Err(self.ended());
        };
        if let Some(result) = session.monitor.await_result_timeout(Duration::ZERO) {
            return Err(self.record_end(result));
        }
        let outcome = exchange(&Channel::new(session.monitor.comms(), session.id));
        match outcome {
            Err(SandboxError::Comms(error)) if error.is_transport() => {
                debug!(target: SANDBOX_TARGET, %error, "session channel broke");
                Err(self.end_session())
            }
            other => other,
        }
    }

    fn ended(&self) -> SandboxError {
        self.last_result
            .clone()
            .map_or(SandboxError::NotActive, |result| {
                SandboxError::Terminated(Box::new(result))
            })
    }

    /// Waits briefly for the monitor's verdict, killing the sandboxee if it
    /// is still running.
    fn end_session(&mut self) -> SandboxError {
        let Some(session) = &self.session else {
            return self.ended();
        };
        let result = session
            .monitor
            .await_result_timeout(TERMINATION_GRACE)
            .unwrap_or_else(|| {
                session.monitor.kill();
                session.monitor.await_result()
            });
        self.record_end(result)
    }

    fn kill_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.monitor.kill();
            self.last_result = Some(session.monitor.await_result());
        }
    }

    fn record_end(&mut self, result: SandboxResult) -> SandboxError {
        info!(target: SANDBOX_TARGET, %result, "sandbox session ended");
        self.session = None;
        self.last_result = Some(result.clone());
        SandboxError::Terminated(Box::new(result))
    }
}
