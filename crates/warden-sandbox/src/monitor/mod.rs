//! Running and supervising a sandboxee.
//!
//! A [`Monitor`] owns one sandboxee. Its supervisor thread forks the child,
//! traces it and every process it creates, and turns the way the run ends
//! into a [`SandboxResult`]. Kill requests, deadline changes and network
//! violations wake the supervisor through a condition variable.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use tracing::{debug, error, info};
use warden_comms::Comms;
use warden_config::Config;
use warden_network::{AllowedHosts, ViolationNotifier};
use warden_policy::{ExecGuard, Policy};

use crate::error::SandboxError;
use crate::executor::Executor;
use crate::executor::plan::ChildPlan;
use crate::result::SandboxResult;

mod supervisor;


pub(crate) const MONITOR_TARGET: &str = "warden_sandbox::monitor";

/// Requests and results shared between the handle and the supervisor.
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) kill_requested: bool,
    pub(crate) network_violation: Option<String>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) result: Option<SandboxResult>,
}

#[derive(Debug, Default)]
pub(crate) struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    pub(crate) fn with_wall_time(limit: Option<Duration>) -> Self {
        let shared = Self::default();
        shared.lock().deadline = deadline_after(limit);
        shared
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `update` and wakes every waiter.
    pub(crate) fn update(&self, update: impl FnOnce(&mut State)) {
        update(&mut self.lock());
        self.changed.notify_all();
    }

    /// Waits at most `timeout` for a change.
    pub(crate) fn wait<'a>(
        &self,
        guard: MutexGuard<'a, State>,
        timeout: Duration,
    ) -> MutexGuard<'a, State> {
        match self.changed.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    fn await_result(&self, timeout: Option<Duration>) -> Option<SandboxResult> {
        let give_up = timeout.map(|limit| Instant::now() + limit);
        let mut state = self.lock();
        loop {
            if let Some(result) = &state.result {
                return Some(result.clone());
            }
            state = match give_up {
                None => self
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    self.wait(state, remaining)
                }
            };
        }
    }
}

impl ViolationNotifier for Shared {
    fn notify_violation(&self, description: &str) {
        self.update(|state| {
            if state.network_violation.is_none() {
                state.network_violation = Some(description.to_owned());
            }
        });
    }
}

pub(crate) fn deadline_after(limit: Option<Duration>) -> Option<Instant> {
    limit
        .filter(|wall| !wall.is_zero())
        .map(|wall| Instant::now() + wall)
}

/// Handle to a running sandboxee.
///
/// Dropping the handle kills the sandboxee and waits for the supervisor.
#[derive(Debug)]
pub struct Monitor {
    shared: Arc<Shared>,
    comms: Comms,
    pid: Pid,
    thread: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Starts `executor` under `policy` and returns once the binary has been
    /// executed or setup has failed. A setup failure is reported through the
    /// result, not as an error.
    ///
    /// # Errors
    ///
    /// Fails when the executor is invalid, the policy does not compile, or
    /// the host side cannot create channels, pipes or the supervisor thread.
    pub fn spawn(
        executor: Executor,
        policy: &Policy,
        config: &Config,
    ) -> Result<Self, SandboxError> {
        executor.validate()?;
        let wall_time = executor
            .resource_limits()
            .wall_time()
            .or_else(|| config.default_wall_time_limit());
        let program = policy.compile(&ExecGuard::reserved())?;

        let (host_end, sandboxee) = Comms::pair()?;
        let host = host_end.with_max_msg_size(config.max_msg_size());
        let (proxy, proxy_fd) = if policy.network_proxy_enabled() {
            let (proxy_host, proxy_sandboxee) = Comms::pair()?;
            let hosts = policy
                .allowed_hosts()
                .cloned()
                .unwrap_or_else(|| Arc::new(AllowedHosts::default()));
            (Some((proxy_host, hosts)), Some(proxy_sandboxee.into_fd()))
        } else {
            (None, None)
        };

        let plan = ChildPlan::prepare(executor, policy, program, sandboxee.into_fd(), proxy_fd)?;
        let shared = Arc::new(Shared::with_wall_time(wall_time));
        let supervisor = supervisor::Supervisor::new(
            Arc::clone(&shared),
            config.monitor_poll_interval(),
            proxy,
        );

        let (started_tx, started_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(String::from("warden-monitor"))
            .spawn(move || supervisor.run(plan, &started_tx))
            .map_err(|error| SandboxError::os("starting the monitor thread", error))?;

        match started_rx.recv() {
            Ok(Ok(pid)) => {
                info!(target: MONITOR_TARGET, pid = pid.as_raw(), "sandboxee started");
                Ok(Self {
                    shared,
                    comms: host,
                    pid,
                    thread: Some(thread),
                })
            }
            Ok(Err(error)) => {
                join(thread);
                Err(error)
            }
            Err(_) => {
                join(thread);
                Err(SandboxError::NotActive)
            }
        }
    }

    /// Runs `executor` to completion.
    ///
    /// # Errors
    ///
    /// See [`Monitor::spawn`].
    pub fn run(
        executor: Executor,
        policy: &Policy,
        config: &Config,
    ) -> Result<SandboxResult, SandboxError> {
        let monitor = Self::spawn(executor, policy, config)?;
        Ok(monitor.await_result())
    }

    /// Process id of the sandboxee.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Host end of the sandboxee's comms channel.
    #[must_use]
    pub const fn comms(&self) -> &Comms {
        &self.comms
    }

    /// Kills the sandboxee; the result becomes
    /// [`Outcome::ExternalKill`](crate::Outcome::ExternalKill) unless the
    /// run already ended.
    pub fn kill(&self) {
        debug!(target: MONITOR_TARGET, pid = self.pid.as_raw(), "kill requested");
        self.shared.update(|state| state.kill_requested = true);
    }

    /// Replaces the wall-time limit, counted from now. `None` or zero removes
    /// it.
    pub fn set_wall_time_limit(&self, limit: Option<Duration>) {
        self.shared
            .update(|state| state.deadline = deadline_after(limit));
    }

    /// Returns `true` once the result is available.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.lock().result.is_some()
    }

    /// Blocks until the run ends.
    #[must_use]
    pub fn await_result(&self) -> SandboxResult {
        loop {
            if let Some(result) = self.shared.await_result(None) {
                return result;
            }
        }
    }

    /// Blocks for at most `timeout`.
    #[must_use]
    pub fn await_result_timeout(&self, timeout: Duration) -> Option<SandboxResult> {
        self.shared.await_result(Some(timeout))
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if !self.is_terminated() {
            self.kill();
        }
        if let Some(thread) = self.thread.take() {
            join(thread);
        }
    }
}

fn join(thread: JoinHandle<()>) {
    if thread.join().is_err() {
        error!(target: MONITOR_TARGET, "monitor thread panicked");
    }
}
