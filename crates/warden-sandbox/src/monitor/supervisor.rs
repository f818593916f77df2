//! The thread that forks and traces one sandboxee.

use std::collections::HashSet;
use std::fs;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::ptrace::{self, Event, Options};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getgid, getuid};
use tracing::{debug, info, warn};
use warden_comms::Comms;
use warden_network::{AllowedHosts, NetworkProxyServer, ViolationNotifier};

use super::{MONITOR_TARGET, Shared};
use crate::error::SandboxError;
use crate::executor::child::{self, ExecArgs, read_failure};
use crate::executor::plan::{ChildPlan, NamespacePlan, SyncPipes};
use crate::result::{Outcome, SandboxResult, Violation};

type Started = Sender<Result<Pid, SandboxError>>;

/// `NT_PRSTATUS`, the general-purpose register set.
const NT_PRSTATUS: usize = 1;

pub(super) struct Supervisor {
    shared: Arc<Shared>,
    poll_interval: Duration,
    proxy: Option<(Comms, Arc<AllowedHosts>)>,
}

/// Parent ends of the id-map handshake pipes.
struct ParentSync {
    ready: File,
    go: File,
}

/// What the parent keeps from the plan after `fork`.
struct Parent {
    pid: Pid,
    status_read: OwnedFd,
    namespaces: Option<NamespacePlan>,
    started_at: Instant,
}

impl Supervisor {
    pub(super) fn new(
        shared: Arc<Shared>,
        poll_interval: Duration,
        proxy: Option<(Comms, Arc<AllowedHosts>)>,
    ) -> Self {
        Self {
            shared,
            poll_interval,
            proxy,
        }
    }

    pub(super) fn run(mut self, plan: ChildPlan, started: &Started) {
        let root_dir = plan.namespaces.as_ref().map(|namespaces| namespaces.root_dir.clone());
        match launch(plan) {
            Ok((parent, sync)) => {
                let proxy = self.start_proxy();
                let outcome = self.supervise(&parent, sync, started);
                let result = SandboxResult::new(outcome, parent.started_at.elapsed());
                info!(
                    target: MONITOR_TARGET,
                    pid = parent.pid.as_raw(),
                    %result,
                    "sandboxee finished"
                );
                self.shared.update(|state| state.result = Some(result));
                if started.send(Ok(parent.pid)).is_err() {
                    debug!(target: MONITOR_TARGET, "spawner stopped waiting");
                }
                if let Some(thread) = proxy
                    && thread.join().is_err()
                {
                    warn!(target: MONITOR_TARGET, "network proxy thread panicked");
                }
            }
            Err(error) => {
                if started.send(Err(error)).is_err() {
                    debug!(target: MONITOR_TARGET, "spawner stopped waiting");
                }
            }
        }
        remove_root(root_dir);
    }

    fn start_proxy(&mut self) -> Option<JoinHandle<()>> {
        let (comms, hosts) = self.proxy.take()?;
        let notifier: Arc<dyn ViolationNotifier> = Arc::<Shared>::clone(&self.shared);
        let server = NetworkProxyServer::new(comms, hosts, notifier);
        match thread::Builder::new()
            .name(String::from("warden-network-proxy"))
            .spawn(move || server.run())
        {
            Ok(handle) => Some(handle),
            Err(error) => {
                warn!(target: MONITOR_TARGET, %error, "network proxy thread failed to start");
                None
            }
        }
    }

    fn supervise(&self, parent: &Parent, sync: Option<ParentSync>, started: &Started) -> Outcome {
        let mut tracees = HashSet::from([parent.pid]);
        let outcome = match attach(parent, sync) {
            Ok(()) => self.trace(parent, started, &mut tracees),
            Err(outcome) => outcome,
        };
        kill_and_reap(&tracees);
        outcome
    }

    fn trace(&self, parent: &Parent, started: &Started, tracees: &mut HashSet<Pid>) -> Outcome {
        let mut tracer = Tracer {
            parent,
            started,
            fresh: HashSet::new(),
            executed: false,
        };
        loop {
            if let Some(outcome) = tracer.drain(tracees) {
                return outcome;
            }
            if let Some(outcome) = self.wait_for_host(parent.pid) {
                return outcome;
            }
        }
    }

    /// Sleeps until the next poll or host-side event; `Some` ends the run.
    fn wait_for_host(&self, main: Pid) -> Option<Outcome> {
        let state = self.shared.lock();
        if state.kill_requested {
            return Some(Outcome::ExternalKill);
        }
        if let Some(description) = &state.network_violation {
            return Some(Outcome::Violation(Violation::Network {
                description: description.clone(),
            }));
        }
        let mut timeout = self.poll_interval;
        if let Some(deadline) = state.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                info!(target: MONITOR_TARGET, pid = main.as_raw(), "wall-time limit exceeded");
                return Some(Outcome::Timeout);
            }
            timeout = timeout.min(remaining);
        }
        drop(self.shared.wait(state, timeout));
        None
    }
}

/// Bookkeeping for one traced run.
struct Tracer<'a> {
    parent: &'a Parent,
    started: &'a Started,
    /// Tracees whose initial `SIGSTOP` was already swallowed.
    fresh: HashSet<Pid>,
    executed: bool,
}

impl Tracer<'_> {
    /// Handles every pending stop; `Some` ends the run.
    fn drain(&mut self, tracees: &mut HashSet<Pid>) -> Option<Outcome> {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD;
        loop {
            match waitpid(Pid::from_raw(-1), Some(flags)) {
                Ok(WaitStatus::StillAlive) => return None,
                Ok(status) => {
                    if let Some(outcome) = self.on_status(status, tracees) {
                        return Some(outcome);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    return Some(setup_error(format!("waiting for the sandboxee: {errno}")));
                }
            }
        }
    }

    fn on_status(&mut self, status: WaitStatus, tracees: &mut HashSet<Pid>) -> Option<Outcome> {
        match status {
            WaitStatus::Exited(pid, code) => {
                self.on_exit(pid, tracees, Outcome::Ok { exit_code: code })
            }
            WaitStatus::Signaled(pid, signal, _) => self.on_exit(
                pid,
                tracees,
                Outcome::Signaled {
                    signal: signal as i32,
                },
            ),
            WaitStatus::PtraceEvent(pid, _, event) => self.on_event(pid, event, tracees),
            WaitStatus::Stopped(pid, Signal::SIGSTOP)
                if pid != self.parent.pid && self.fresh.insert(pid) =>
            {
                tracees.insert(pid);
                resume(pid, None);
                None
            }
            WaitStatus::Stopped(pid, signal) => {
                resume(pid, Some(signal));
                None
            }
            WaitStatus::PtraceSyscall(pid) => {
                resume(pid, None);
                None
            }
            WaitStatus::Continued(_) | WaitStatus::StillAlive => None,
        }
    }

    /// Only the main process ending ends the run.
    fn on_exit(&self, pid: Pid, tracees: &mut HashSet<Pid>, outcome: Outcome) -> Option<Outcome> {
        tracees.remove(&pid);
        (pid == self.parent.pid).then(|| {
            if self.executed {
                outcome
            } else {
                early_exit(self.parent)
            }
        })
    }

    fn on_event(&mut self, pid: Pid, event: i32, tracees: &mut HashSet<Pid>) -> Option<Outcome> {
        if event == Event::PTRACE_EVENT_SECCOMP as i32 {
            let violation = Violation::syscall(stopped_syscall(pid).unwrap_or(u32::MAX));
            info!(target: MONITOR_TARGET, pid = pid.as_raw(), %violation, "policy violation");
            return Some(if self.executed {
                Outcome::Violation(violation)
            } else {
                setup_error(format!("{violation} before exec"))
            });
        }
        if event == Event::PTRACE_EVENT_EXEC as i32 && pid == self.parent.pid && !self.executed {
            self.executed = true;
            debug!(target: MONITOR_TARGET, pid = pid.as_raw(), "sandboxee executed");
            if self.started.send(Ok(pid)).is_err() {
                debug!(target: MONITOR_TARGET, "spawner stopped waiting");
            }
        }
        if is_fork_event(event)
            && let Ok(message) = ptrace::getevent(pid)
            && let Ok(child) = i32::try_from(message)
        {
            tracees.insert(Pid::from_raw(child));
        }
        resume(pid, None);
        None
    }
}

fn is_fork_event(event: i32) -> bool {
    [
        Event::PTRACE_EVENT_CLONE,
        Event::PTRACE_EVENT_FORK,
        Event::PTRACE_EVENT_VFORK,
    ]
    .into_iter()
    .any(|kind| kind as i32 == event)
}

fn launch(plan: ChildPlan) -> Result<(Parent, Option<ParentSync>), SandboxError> {
    let exec = ExecArgs::new(&plan);
    // SAFETY: the child branch only makes raw system calls on memory that
    // was prepared before the fork.
    let pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => child::run(&plan, &exec),
        Ok(ForkResult::Parent { child }) => child,
        Err(errno) => return Err(SandboxError::errno("forking the sandboxee", errno)),
    };
    drop(exec);
    let started_at = Instant::now();
    let ChildPlan {
        status_read,
        status_write,
        namespaces,
        sync,
        sources,
        ..
    } = plan;
    drop(status_write);
    drop(sources);
    let sync = sync.map(|pipes| {
        let SyncPipes {
            ready_read,
            ready_write,
            go_read,
            go_write,
        } = pipes;
        drop(ready_write);
        drop(go_read);
        ParentSync {
            ready: File::from(ready_read),
            go: File::from(go_write),
        }
    });
    debug!(target: MONITOR_TARGET, pid = pid.as_raw(), "forked sandboxee");
    Ok((
        Parent {
            pid,
            status_read,
            namespaces,
            started_at,
        },
        sync,
    ))
}

/// Writes the id maps, releases the child and attaches the tracer.
fn attach(parent: &Parent, sync: Option<ParentSync>) -> Result<(), Outcome> {
    let pid = parent.pid;
    if let Some(mut pipes) = sync {
        let mut byte = [0_u8];
        if !matches!(pipes.ready.read(&mut byte), Ok(1)) {
            return Err(early_exit_after_wait(parent));
        }
        write_id_maps(pid).map_err(setup_error)?;
        if pipes.go.write_all(&[1]).is_err() {
            return Err(early_exit_after_wait(parent));
        }
    }

    match waitpid(pid, Some(WaitPidFlag::__WALL)) {
        Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {}
        Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => return Err(early_exit(parent)),
        Ok(other) => return Err(setup_error(format!("unexpected first stop: {other:?}"))),
        Err(errno) => return Err(setup_error(format!("waiting for the sandboxee: {errno}"))),
    }

    let options = Options::PTRACE_O_TRACESECCOMP
        | Options::PTRACE_O_EXITKILL
        | Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACEEXEC;
    ptrace::setoptions(pid, options)
        .map_err(|errno| setup_error(format!("setting ptrace options: {errno}")))?;
    ptrace::cont(pid, None)
        .map_err(|errno| setup_error(format!("resuming the sandboxee: {errno}")))?;
    Ok(())
}

fn write_id_maps(pid: Pid) -> Result<(), String> {
    let uid = getuid();
    let gid = getgid();
    let proc_dir = format!("/proc/{}", pid.as_raw());
    let write = |file: &str, contents: String| {
        fs::write(format!("{proc_dir}/{file}"), contents)
            .map_err(|error| format!("writing {file}: {error}"))
    };
    write("uid_map", format!("{uid} {uid} 1\n"))?;
    write("setgroups", String::from("deny"))?;
    write("gid_map", format!("{gid} {gid} 1\n"))
}

fn resume(pid: Pid, signal: Option<Signal>) {
    if let Err(errno) = ptrace::cont(pid, signal) {
        debug!(target: MONITOR_TARGET, pid = pid.as_raw(), %errno, "tracee vanished");
    }
}

fn setup_error(message: String) -> Outcome {
    warn!(target: MONITOR_TARGET, %message, "sandboxee setup failed");
    Outcome::SetupError { message }
}

/// Reaps the main process, then reads why it ended before `exec`.
fn early_exit_after_wait(parent: &Parent) -> Outcome {
    if let Err(errno) = waitpid(parent.pid, Some(WaitPidFlag::__WALL)) {
        debug!(target: MONITOR_TARGET, %errno, "sandboxee already reaped");
    }
    early_exit(parent)
}

fn early_exit(parent: &Parent) -> Outcome {
    let Ok(status) = parent.status_read.try_clone() else {
        return setup_error(String::from("the sandboxee exited before exec"));
    };
    match read_failure(status) {
        Ok(Some(failure)) => setup_error(failure.describe(parent.namespaces.as_ref())),
        Ok(None) => setup_error(String::from("the sandboxee exited before exec")),
        Err(error) => setup_error(format!("reading the setup status: {error}")),
    }
}

/// Kills every remaining child of this thread and reaps them.
fn kill_and_reap(tracees: &HashSet<Pid>) {
    for &pid in tracees {
        kill_quietly(pid);
    }
    let flags = WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD;
    loop {
        match waitpid(Pid::from_raw(-1), Some(flags)) {
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {}
            Ok(WaitStatus::PtraceEvent(pid, _, _)) => {
                if let Ok(message) = ptrace::getevent(pid)
                    && let Ok(child) = i32::try_from(message)
                    && child > 0
                {
                    kill_quietly(Pid::from_raw(child));
                }
                kill_quietly(pid);
            }
            Ok(status) => {
                if let Some(pid) = status.pid() {
                    kill_quietly(pid);
                }
            }
            Err(Errno::EINTR) => {}
            Err(_) => break,
        }
    }
}

fn kill_quietly(pid: Pid) {
    if kill(pid, Signal::SIGKILL).is_err() {
        debug!(target: MONITOR_TARGET, pid = pid.as_raw(), "tracee already gone");
    }
}

fn remove_root(root: Option<PathBuf>) {
    let Some(root_dir) = root else {
        return;
    };
    if let Err(error) = fs::remove_dir(&root_dir) {
        warn!(
            target: MONITOR_TARGET,
            path = %root_dir.display(),
            %error,
            "failed to remove the sandbox root"
        );
    }
}

/// Number of the syscall `pid` is stopped in, read from its registers since
/// the trace data only says that a violation happened.
fn stopped_syscall(pid: Pid) -> Option<u32> {
    // SAFETY: user_regs_struct is plain integers, so all zeroes is valid.
    let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: (&raw mut regs).cast(),
        iov_len: size_of::<libc::user_regs_struct>(),
    };
    // SAFETY: the kernel writes at most iov_len bytes into regs.
    let rc = unsafe {
        libc::ptrace(libc::PTRACE_GETREGSET, pid.as_raw(), NT_PRSTATUS, &raw mut iov)
    };
    if rc != 0 {
        return None;
    }
    #[cfg(target_arch = "x86_64")]
    let nr = regs.orig_rax;
    #[cfg(target_arch = "aarch64")]
    let nr = *regs.regs.get(8)?;
    u32::try_from(nr).ok()
}
