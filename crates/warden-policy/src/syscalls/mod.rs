//! Syscall name and number lookup for the build architecture.

use std::fmt;

#[cfg(test)]
mod tests;

macro_rules! syscall_table {
    ($($sys:ident),* $(,)?) => {
        &[$((libc::$sys, stringify!($sys))),*]
    };
}

type Entry = (libc::c_long, &'static str);

const COMMON: &[Entry] = syscall_table![
    SYS_read, SYS_write, SYS_openat, SYS_close, SYS_fstat, SYS_newfstatat, SYS_statx,
    SYS_lseek, SYS_mmap, SYS_mprotect, SYS_munmap, SYS_brk, SYS_rt_sigaction,
    SYS_rt_sigprocmask, SYS_rt_sigreturn, SYS_ioctl, SYS_pread64, SYS_pwrite64, SYS_readv,
    SYS_writev, SYS_preadv, SYS_pwritev, SYS_sched_yield, SYS_mremap, SYS_msync,
    SYS_mincore, SYS_madvise, SYS_dup, SYS_dup3, SYS_nanosleep, SYS_getitimer,
    SYS_setitimer, SYS_getpid, SYS_sendfile, SYS_socket, SYS_connect, SYS_accept,
    SYS_accept4, SYS_sendto, SYS_recvfrom, SYS_sendmsg, SYS_recvmsg, SYS_sendmmsg,
    SYS_recvmmsg, SYS_shutdown, SYS_bind, SYS_listen, SYS_getsockname, SYS_getpeername,
    SYS_socketpair, SYS_setsockopt, SYS_getsockopt, SYS_clone, SYS_execve, SYS_execveat,
    SYS_exit, SYS_exit_group, SYS_wait4, SYS_waitid, SYS_kill, SYS_tkill, SYS_tgkill,
    SYS_uname, SYS_fcntl, SYS_flock, SYS_fsync, SYS_fdatasync, SYS_truncate,
    SYS_ftruncate, SYS_getdents64, SYS_getcwd, SYS_chdir, SYS_fchdir, SYS_fchmod,
    SYS_fchmodat, SYS_fchown, SYS_fchownat, SYS_umask, SYS_gettimeofday, SYS_getrlimit,
    SYS_setrlimit, SYS_prlimit64, SYS_getrusage, SYS_sysinfo, SYS_times, SYS_ptrace,
    SYS_getuid, SYS_getgid, SYS_setuid, SYS_setgid, SYS_geteuid, SYS_getegid,
    SYS_setpgid, SYS_getppid, SYS_setsid, SYS_setreuid, SYS_setregid, SYS_getgroups,
    SYS_setgroups, SYS_setresuid, SYS_getresuid, SYS_setresgid, SYS_getresgid,
    SYS_getpgid, SYS_getsid, SYS_capget, SYS_capset, SYS_rt_sigpending,
    SYS_rt_sigtimedwait, SYS_rt_sigqueueinfo, SYS_rt_sigsuspend, SYS_sigaltstack,
    SYS_personality, SYS_statfs, SYS_fstatfs, SYS_getpriority, SYS_setpriority,
    SYS_sched_setparam, SYS_sched_getparam, SYS_sched_setscheduler,
    SYS_sched_getscheduler, SYS_sched_setaffinity, SYS_sched_getaffinity, SYS_mlock,
    SYS_munlock, SYS_mlockall, SYS_munlockall, SYS_pivot_root, SYS_prctl, SYS_chroot,
    SYS_sync, SYS_mount, SYS_umount2, SYS_sethostname, SYS_setdomainname, SYS_reboot,
    SYS_init_module, SYS_finit_module, SYS_delete_module, SYS_gettid, SYS_futex,
    SYS_set_tid_address, SYS_set_robust_list, SYS_get_robust_list, SYS_restart_syscall,
    SYS_clock_gettime, SYS_clock_settime, SYS_clock_getres, SYS_clock_nanosleep,
    SYS_timer_create, SYS_timer_settime, SYS_timer_gettime, SYS_timer_delete,
    SYS_epoll_create1, SYS_epoll_ctl, SYS_epoll_pwait, SYS_eventfd2, SYS_signalfd4,
    SYS_timerfd_create, SYS_timerfd_settime, SYS_timerfd_gettime, SYS_inotify_init1,
    SYS_inotify_add_watch, SYS_inotify_rm_watch, SYS_pipe2, SYS_ppoll, SYS_pselect6,
    SYS_mkdirat, SYS_mknodat, SYS_unlinkat, SYS_renameat, SYS_renameat2, SYS_linkat,
    SYS_symlinkat, SYS_readlinkat, SYS_faccessat, SYS_utimensat, SYS_fallocate,
    SYS_splice, SYS_tee, SYS_vmsplice, SYS_unshare, SYS_setns, SYS_getcpu,
    SYS_process_vm_readv, SYS_process_vm_writev, SYS_kcmp, SYS_seccomp, SYS_getrandom,
    SYS_memfd_create, SYS_bpf, SYS_userfaultfd, SYS_membarrier, SYS_mlock2,
    SYS_copy_file_range, SYS_perf_event_open, SYS_rseq, SYS_keyctl, SYS_add_key,
    SYS_request_key, SYS_quotactl, SYS_acct, SYS_swapon, SYS_swapoff, SYS_syslog,
    SYS_mbind, SYS_set_mempolicy, SYS_get_mempolicy, SYS_migrate_pages, SYS_move_pages,
];

#[cfg(target_arch = "x86_64")]
const ARCH_SPECIFIC: &[Entry] = syscall_table![
    SYS_open, SYS_stat, SYS_lstat, SYS_access, SYS_pipe, SYS_poll, SYS_select,
    SYS_dup2, SYS_pause, SYS_alarm, SYS_fork, SYS_vfork, SYS_getdents, SYS_rename,
    SYS_mkdir, SYS_rmdir, SYS_creat, SYS_link, SYS_unlink, SYS_symlink, SYS_readlink,
    SYS_chmod, SYS_chown, SYS_lchown, SYS_getpgrp, SYS_mknod, SYS_arch_prctl,
    SYS_time, SYS_epoll_create, SYS_epoll_wait, SYS_inotify_init, SYS_eventfd,
    SYS_signalfd, SYS_utimes, SYS_futimesat, SYS_iopl, SYS_ioperm, SYS_modify_ldt,
];

#[cfg(target_arch = "aarch64")]
const ARCH_SPECIFIC: &[Entry] = &[];

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("warden-policy supports x86_64 and aarch64 only");

/// Every known syscall as `(number, name)`, names without the `SYS_` prefix.
pub fn all() -> impl Iterator<Item = (u32, &'static str)> {
    COMMON.iter().chain(ARCH_SPECIFIC).filter_map(|&(raw, name)| {
        let nr = u32::try_from(raw).ok()?;
        Some((nr, name.strip_prefix("SYS_").unwrap_or(name)))
    })
}

/// Returns the name of syscall `nr`, if known.
#[must_use]
pub fn name(nr: u32) -> Option<&'static str> {
    all().find(|(entry, _)| *entry == nr).map(|(_, name)| name)
}

/// Returns the number of the syscall called `name`, if known.
#[must_use]
pub fn number(name: &str) -> Option<u32> {
    all()
        .find(|(_, entry)| *entry == name)
        .map(|(nr, _)| nr)
}

/// Converts a `libc::SYS_*` constant to the `u32` seccomp compares against.
#[must_use]
pub fn nr(sys: libc::c_long) -> u32 {
    u32::try_from(sys).unwrap_or(u32::MAX)
}

/// Displays a syscall as `name (nr)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallDisplay(pub u32);

impl fmt::Display for SyscallDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", name(self.0).unwrap_or("unknown"), self.0)
    }
}
