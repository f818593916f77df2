//! The sandboxee side of `fork`.
//!
//! Code here runs in a copy of a multithreaded process, so it only makes raw
//! system calls on data prepared by [`ChildPlan::prepare`]. A failing step
//! writes a [`Failure`] record to the status pipe and exits; a successful
//! `execveat` closes the pipe instead.
//!
//! [`ChildPlan::prepare`]: super::plan::ChildPlan::prepare

use std::convert::Infallible;
use std::ffi::{CString, c_char};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr;

use nix::errno::Errno;

use super::plan::{ChildPlan, MountOp, NamespacePlan};

const RECORD_LEN: usize = 12;
const CLOSE_FALLBACK_LIMIT: RawFd = 65_536;

/// The step of sandboxee setup that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum Stage {
    DeathSignal = 1,
    Unshare = 2,
    Sync = 3,
    Hostname = 4,
    Mount = 5,
    PivotRoot = 6,
    Descriptors = 7,
    Rlimit = 8,
    Chdir = 9,
    Trace = 10,
    Seccomp = 11,
    Exec = 12,
}

impl Stage {
    const ALL: [Self; 12] = [
        Self::DeathSignal,
        Self::Unshare,
        Self::Sync,
        Self::Hostname,
        Self::Mount,
        Self::PivotRoot,
        Self::Descriptors,
        Self::Rlimit,
        Self::Chdir,
        Self::Trace,
        Self::Seccomp,
        Self::Exec,
    ];

    fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| *stage as u32 == code)
    }

    const fn describe(self) -> &'static str {
        match self {
            Self::DeathSignal => "arming the parent death signal",
            Self::Unshare => "entering namespaces",
            Self::Sync => "waiting for id maps",
            Self::Hostname => "setting the hostname",
            Self::Mount => "building the filesystem",
            Self::PivotRoot => "switching the root",
            Self::Descriptors => "arranging descriptors",
            Self::Rlimit => "applying resource limits",
            Self::Chdir => "changing directory",
            Self::Trace => "attaching the tracer",
            Self::Seccomp => "installing the seccomp filter",
            Self::Exec => "executing the binary",
        }
    }
}

/// A setup failure reported by the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Failure {
    pub(crate) stage: Stage,
    pub(crate) errno: i32,
    pub(crate) index: u32,
}

impl Failure {
    const fn new(stage: Stage, errno: i32) -> Self {
        Self {
            stage,
            errno,
            index: 0,
        }
    }

    fn last(stage: Stage) -> Self {
        Self::new(stage, Errno::last_raw())
    }

    #[expect(clippy::host_endian_bytes, reason = "the record never leaves this host")]
    pub(crate) const fn encode(&self) -> [u8; RECORD_LEN] {
        let [s0, s1, s2, s3] = (self.stage as u32).to_ne_bytes();
        let [e0, e1, e2, e3] = self.errno.to_ne_bytes();
        let [i0, i1, i2, i3] = self.index.to_ne_bytes();
        [s0, s1, s2, s3, e0, e1, e2, e3, i0, i1, i2, i3]
    }

    #[expect(clippy::host_endian_bytes, reason = "the record never leaves this host")]
    fn decode(record: [u8; RECORD_LEN]) -> Option<Self> {
        let [s0, s1, s2, s3, e0, e1, e2, e3, i0, i1, i2, i3] = record;
        Some(Self {
            stage: Stage::from_code(u32::from_ne_bytes([s0, s1, s2, s3]))?,
            errno: i32::from_ne_bytes([e0, e1, e2, e3]),
            index: u32::from_ne_bytes([i0, i1, i2, i3]),
        })
    }

    /// Human-readable description.
    pub(crate) fn describe(&self, namespaces: Option<&NamespacePlan>) -> String {
        let error = io::Error::from_raw_os_error(self.errno);
        let mount = namespaces.and_then(|plan| plan.describe_mount(self.index));
        match (self.stage, mount) {
            (Stage::Mount, Some(op)) => format!("{} ({op}): {error}", self.stage.describe()),
            (stage, _) => format!("{}: {error}", stage.describe()),
        }
    }
}

/// Reads the child's status record. `Ok(None)` means the pipe closed on
/// `exec` without a record.
pub(crate) fn read_failure(status: OwnedFd) -> io::Result<Option<Failure>> {
    let mut file = File::from(status);
    let mut record = [0_u8; RECORD_LEN];
    let mut filled = 0;
    while filled < RECORD_LEN {
        let Some(rest) = record.get_mut(filled..) else {
            break;
        };
        match file.read(rest) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    if filled == 0 {
        return Ok(None);
    }
    Failure::decode(record)
        .map(Some)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed setup record"))
}

/// Null-terminated pointer arrays for `execveat`, built before `fork`.
pub(crate) struct ExecArgs {
    argv: Vec<*const c_char>,
    envp: Vec<*const c_char>,
}

impl ExecArgs {
    /// Borrows pointers from `plan`, which must outlive the returned value.
    pub(crate) fn new(plan: &ChildPlan) -> Self {
        Self {
            argv: pointer_array(&plan.argv),
            envp: pointer_array(&plan.envp),
        }
    }
}

fn pointer_array(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|value| value.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Runs the child side of setup and never returns.
pub(crate) fn run(plan: &ChildPlan, exec: &ExecArgs) -> ! {
    let failure = match setup(plan, exec) {
        Err(failure) => failure,
        Ok(never) => match never {},
    };
    let record = failure.encode();
    // SAFETY: write and _exit are async-signal-safe and the buffer is live.
    unsafe {
        let _ = libc::write(
            plan.status_write.as_raw_fd(),
            record.as_ptr().cast(),
            record.len(),
        );
        libc::_exit(127)
    }
}

fn check(stage: Stage, rc: libc::c_int) -> Result<(), Failure> {
    if rc == -1 {
        Err(Failure::last(stage))
    } else {
        Ok(())
    }
}

fn check_long(stage: Stage, rc: libc::c_long) -> Result<(), Failure> {
    if rc == -1 {
        Err(Failure::last(stage))
    } else {
        Ok(())
    }
}

fn setup(plan: &ChildPlan, exec: &ExecArgs) -> Result<Infallible, Failure> {
    // SAFETY: every call below is a raw system call on memory owned by
    // `plan` or `exec`, which stay alive until exec or _exit.
    unsafe {
        check(
            Stage::DeathSignal,
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0),
        )?;
        if libc::getppid() != plan.parent_pid {
            return Err(Failure::new(Stage::DeathSignal, libc::ESRCH));
        }

        if let Some(namespaces) = &plan.namespaces {
            check(Stage::Unshare, libc::unshare(namespaces.flags))?;
            if let Some(sync) = &plan.sync {
                let byte = [1_u8];
                if libc::write(sync.ready_write.as_raw_fd(), byte.as_ptr().cast(), 1) != 1 {
                    return Err(Failure::last(Stage::Sync));
                }
                let mut reply = [0_u8];
                if libc::read(sync.go_read.as_raw_fd(), reply.as_mut_ptr().cast(), 1) != 1 {
                    return Err(Failure::new(Stage::Sync, libc::EPIPE));
                }
            }
            enter_root(namespaces)?;
        }

        arrange_descriptors(plan)?;

        for &(resource, value) in &plan.rlimits {
            let limit = libc::rlimit {
                rlim_cur: value,
                rlim_max: value,
            };
            check(Stage::Rlimit, libc::setrlimit(resource, &raw const limit))?;
        }

        if let Some(cwd) = &plan.cwd {
            check(Stage::Chdir, libc::chdir(cwd.as_ptr()))?;
        }

        check_long(
            Stage::Trace,
            libc::ptrace(
                libc::PTRACE_TRACEME,
                0,
                ptr::null_mut::<libc::c_void>(),
                ptr::null_mut::<libc::c_void>(),
            ),
        )?;
        check(Stage::Trace, libc::raise(libc::SIGSTOP))?;

        plan.program
            .install()
            .map_err(|_| Failure::last(Stage::Seccomp))?;

        libc::syscall(
            libc::SYS_execveat,
            warden_comms::SANDBOXEE_EXEC_FD,
            c"".as_ptr(),
            exec.argv.as_ptr(),
            exec.envp.as_ptr(),
            libc::AT_EMPTY_PATH,
        );
        Err(Failure::last(Stage::Exec))
    }
}

/// Builds the new root, pivots into it and makes it read-only.
///
/// # Safety
///
/// Must only run in the freshly forked child.
unsafe fn enter_root(namespaces: &NamespacePlan) -> Result<(), Failure> {
    let null = ptr::null::<c_char>();
    // SAFETY: raw mount calls on NUL-terminated strings owned by the plan.
    unsafe {
        let hostname = &namespaces.hostname;
        check(
            Stage::Hostname,
            libc::sethostname(hostname.as_ptr().cast(), hostname.len()),
        )?;

        check(
            Stage::Mount,
            libc::mount(null, c"/".as_ptr(), null, libc::MS_REC | libc::MS_PRIVATE, ptr::null()),
        )?;
        check(
            Stage::Mount,
            libc::mount(
                c"tmpfs".as_ptr(),
                namespaces.new_root.as_ptr(),
                c"tmpfs".as_ptr(),
                libc::MS_NOSUID | libc::MS_NODEV,
                c"mode=0755".as_ptr().cast(),
            ),
        )?;
        for (index, op) in (0_u32..).zip(&namespaces.mounts) {
            apply(op).map_err(|mut failure| {
                failure.index = index;
                failure
            })?;
        }

        check(Stage::PivotRoot, libc::chdir(namespaces.new_root.as_ptr()))?;
        check_long(
            Stage::PivotRoot,
            libc::syscall(libc::SYS_pivot_root, c".".as_ptr(), c".".as_ptr()),
        )?;
        check(Stage::PivotRoot, libc::umount2(c".".as_ptr(), libc::MNT_DETACH))?;
        check(Stage::PivotRoot, libc::chdir(c"/".as_ptr()))?;
        check(
            Stage::PivotRoot,
            libc::mount(
                null,
                c"/".as_ptr(),
                null,
                libc::MS_BIND
                    | libc::MS_REMOUNT
                    | libc::MS_RDONLY
                    | libc::MS_NOSUID
                    | libc::MS_NODEV,
                ptr::null(),
            ),
        )?;
    }
    Ok(())
}

unsafe fn apply(op: &MountOp) -> Result<(), Failure> {
    let null = ptr::null::<c_char>();
    // SAFETY: see `enter_root`.
    unsafe {
        match op {
            MountOp::Mkdir(path) => {
                if libc::mkdir(path.as_ptr(), 0o755) == -1 && Errno::last_raw() != libc::EEXIST {
                    return Err(Failure::last(Stage::Mount));
                }
            }
            MountOp::Touch(path) => {
                let fd = libc::open(
                    path.as_ptr(),
                    libc::O_CREAT | libc::O_WRONLY | libc::O_CLOEXEC,
                    0o644,
                );
                check(Stage::Mount, fd)?;
                libc::close(fd);
            }
            MountOp::Bind { source, target } => check(
                Stage::Mount,
                libc::mount(
                    source.as_ptr(),
                    target.as_ptr(),
                    null,
                    libc::MS_BIND | libc::MS_REC,
                    ptr::null(),
                ),
            )?,
            MountOp::RemountReadOnly { target, flags } => check(
                Stage::Mount,
                libc::mount(null, target.as_ptr(), null, *flags, ptr::null()),
            )?,
            MountOp::Tmpfs { target, data } => check(
                Stage::Mount,
                libc::mount(
                    c"tmpfs".as_ptr(),
                    target.as_ptr(),
                    c"tmpfs".as_ptr(),
                    libc::MS_NOSUID | libc::MS_NODEV,
                    data.as_ptr().cast(),
                ),
            )?,
        }
    }
    Ok(())
}

/// Moves descriptors into place and closes everything else.
unsafe fn arrange_descriptors(plan: &ChildPlan) -> Result<(), Failure> {
    // SAFETY: dup2, fcntl and close only touch the descriptor table.
    unsafe {
        for &(source, target) in &plan.moves {
            if source == target {
                check(Stage::Descriptors, libc::fcntl(target, libc::F_SETFD, 0))?;
            } else {
                check(Stage::Descriptors, libc::dup2(source, target))?;
            }
        }
        let mut first: RawFd = 0;
        for &kept in &plan.keep {
            if kept > first {
                close_between(first, kept - 1)?;
            }
            first = kept + 1;
        }
        close_between(first, RawFd::MAX)
    }
}

unsafe fn close_between(first: RawFd, last: RawFd) -> Result<(), Failure> {
    // SAFETY: close_range and close only release descriptors.
    unsafe {
        let rc = libc::syscall(
            libc::SYS_close_range,
            first.cast_unsigned(),
            last.cast_unsigned(),
            0_u32,
        );
        if rc == 0 {
            return Ok(());
        }
        if Errno::last_raw() != libc::ENOSYS {
            return Err(Failure::last(Stage::Descriptors));
        }
        let mut fd = first;
        while fd <= last.min(CLOSE_FALLBACK_LIMIT) {
            libc::close(fd);
            fd += 1;
        }
    }
    Ok(())
}

