//! Everything the child needs, prepared before `fork`.
//!
//! After `fork` in a multithreaded process the child may only make
//! async-signal-safe calls, so strings are converted to `CString`s, mount
//! operations are listed in order and descriptor moves are computed here.

use std::collections::HashSet;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::statvfs::{FsFlags, statvfs};
use tracing::debug;
use warden_comms::{SANDBOXEE_COMMS_FD, SANDBOXEE_EXEC_FD, SANDBOXEE_NETWORK_PROXY_FD};
use warden_policy::{MountEntry, Policy, SeccompProgram};

use super::{Executor, RESERVED_FDS, StdioMode};
use crate::error::SandboxError;

const PLAN_TARGET: &str = "warden_sandbox::executor";

#[cfg(target_env = "gnu")]
pub(crate) type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(target_env = "gnu"))]
pub(crate) type RlimitResource = libc::c_int;

/// One step of building the sandboxee's filesystem.
#[derive(Debug)]
pub(crate) enum MountOp {
    Mkdir(CString),
    Touch(CString),
    Bind { source: CString, target: CString },
    RemountReadOnly { target: CString, flags: libc::c_ulong },
    Tmpfs { target: CString, data: CString },
}

impl MountOp {
    pub(crate) fn describe(&self) -> String {
        let lossy = |value: &CString| value.to_string_lossy().into_owned();
        match self {
            Self::Mkdir(path) => format!("creating directory {}", lossy(path)),
            Self::Touch(path) => format!("creating mount point {}", lossy(path)),
            Self::Bind { source, target } => {
                format!("binding {} to {}", lossy(source), lossy(target))
            }
            Self::RemountReadOnly { target, .. } => {
                format!("remounting {} read-only", lossy(target))
            }
            Self::Tmpfs { target, .. } => format!("mounting tmpfs at {}", lossy(target)),
        }
    }
}

/// Namespace and filesystem setup.
#[derive(Debug)]
pub(crate) struct NamespacePlan {
    pub(crate) flags: libc::c_int,
    pub(crate) hostname: Vec<u8>,
    pub(crate) new_root: CString,
    pub(crate) root_dir: PathBuf,
    pub(crate) mounts: Vec<MountOp>,
}

impl NamespacePlan {
    /// Describes mount operation `index` for error messages.
    pub(crate) fn describe_mount(&self, index: u32) -> Option<String> {
        let slot = usize::try_from(index).ok()?;
        self.mounts.get(slot).map(MountOp::describe)
    }
}

/// Pipes the child uses to wait for its user namespace id maps.
#[derive(Debug)]
pub(crate) struct SyncPipes {
    pub(crate) ready_read: OwnedFd,
    pub(crate) ready_write: OwnedFd,
    pub(crate) go_read: OwnedFd,
    pub(crate) go_write: OwnedFd,
}

/// Fork-ready description of a sandboxee.
#[derive(Debug)]
pub(crate) struct ChildPlan {
    pub(crate) parent_pid: libc::pid_t,
    pub(crate) argv: Vec<CString>,
    pub(crate) envp: Vec<CString>,
    pub(crate) cwd: Option<CString>,
    pub(crate) namespaces: Option<NamespacePlan>,
    pub(crate) sync: Option<SyncPipes>,
    pub(crate) moves: Vec<(RawFd, RawFd)>,
    pub(crate) keep: Vec<RawFd>,
    pub(crate) rlimits: Vec<(RlimitResource, u64)>,
    pub(crate) program: SeccompProgram,
    pub(crate) status_read: OwnedFd,
    pub(crate) status_write: OwnedFd,
    /// Host descriptors that `moves` refers to; closed in the parent after
    /// `fork`.
    pub(crate) sources: Vec<OwnedFd>,
}

impl ChildPlan {
    /// Builds the plan for `executor` under `policy`.
    ///
    /// `comms` and `proxy` are the sandboxee ends of the comms and network
    /// proxy channels.
    pub(crate) fn prepare(
        executor: Executor,
        policy: &Policy,
        program: SeccompProgram,
        comms: OwnedFd,
        proxy: Option<OwnedFd>,
    ) -> Result<Self, SandboxError> {
        executor.validate()?;
        let Executor {
            path,
            args,
            env,
            cwd: working_dir,
            stdin,
            stdout,
            stderr,
            fd_map,
            limits,
        } = executor;

        let mut avoid: Vec<RawFd> = vec![0, 1, 2];
        avoid.extend(RESERVED_FDS);
        avoid.extend(fd_map.iter().map(|&(_, target)| target));

        let binary = File::open(&path).map_err(|source| SandboxError::OpenBinary {
            path: path.clone(),
            source: source.into(),
        })?;

        let mut sources = Vec::new();
        let mut moves = Vec::new();
        let mut place = |fd: OwnedFd, target: RawFd| -> Result<(), SandboxError> {
            let moved = relocate(fd, &avoid)?;
            moves.push((moved.as_raw_fd(), target));
            sources.push(moved);
            Ok(())
        };
        place(OwnedFd::from(binary), SANDBOXEE_EXEC_FD)?;
        place(comms, SANDBOXEE_COMMS_FD)?;
        if let Some(proxy) = proxy {
            place(proxy, SANDBOXEE_NETWORK_PROXY_FD)?;
        }
        let null_targets: Vec<RawFd> = [stdin, stdout, stderr]
            .iter()
            .zip(0..)
            .filter(|(mode, _)| **mode == StdioMode::Null)
            .map(|(_, target)| target)
            .collect();
        if !null_targets.is_empty() {
            let null = OwnedFd::from(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open("/dev/null")
                    .map_err(|error| SandboxError::os("opening /dev/null", error))?,
            );
            for target in null_targets {
                let copy = null
                    .try_clone()
                    .map_err(|error| SandboxError::os("duplicating /dev/null", error))?;
                place(copy, target)?;
            }
        }
        for (fd, target) in fd_map {
            place(fd, target)?;
        }

        let (status_read, unplaced_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
            .map_err(|errno| SandboxError::errno("creating the status pipe", errno))?;
        let status_write = relocate(unplaced_write, &avoid)?;

        let mut keep: Vec<RawFd> = vec![0, 1, 2];
        keep.extend(moves.iter().map(|&(_, target)| target));
        keep.push(status_write.as_raw_fd());
        keep.sort_unstable();
        keep.dedup();

        let (namespaces, sync) = if policy.namespaces_enabled() {
            (Some(namespace_plan(policy)?), Some(sync_pipes()?))
        } else {
            (None, None)
        };

        let mut rlimits: Vec<(RlimitResource, u64)> = vec![(libc::RLIMIT_CORE, 0)];
        let optional = [
            (libc::RLIMIT_AS, limits.address_space()),
            (libc::RLIMIT_FSIZE, limits.file_size()),
            (libc::RLIMIT_NOFILE, limits.open_files()),
            (libc::RLIMIT_CPU, limits.cpu_seconds()),
        ];
        rlimits.extend(
            optional
                .into_iter()
                .filter_map(|(resource, limit)| limit.map(|value| (resource, value))),
        );

        let argv = args
            .iter()
            .map(|arg| c_string(arg.as_bytes(), "argument"))
            .collect::<Result<Vec<_>, _>>()?;
        let envp = env
            .iter()
            .map(|(key, value)| c_string(format!("{key}={value}").as_bytes(), "environment"))
            .collect::<Result<Vec<_>, _>>()?;
        let cwd = working_dir
            .map(|dir| c_string(dir.as_bytes(), "working directory"))
            .transpose()?;

        debug!(
            target: PLAN_TARGET,
            binary = %path.display(),
            moves = moves.len(),
            namespaced = namespaces.is_some(),
            "prepared sandboxee plan"
        );

        Ok(Self {
            parent_pid: nix::unistd::getpid().as_raw(),
            argv,
            envp,
            cwd,
            namespaces,
            sync,
            moves,
            keep,
            rlimits,
            program,
            status_read,
            status_write,
            sources,
        })
    }
}

/// Returns a descriptor for `fd` whose number is not in `avoid`.
fn relocate(fd: OwnedFd, avoid: &[RawFd]) -> Result<OwnedFd, SandboxError> {
    let mut held = Vec::new();
    let mut current = fd;
    while avoid.contains(&current.as_raw_fd()) {
        let next = current
            .try_clone()
            .map_err(|error| SandboxError::os("duplicating a descriptor", error))?;
        held.push(current);
        current = next;
    }
    Ok(current)
}

fn sync_pipes() -> Result<SyncPipes, SandboxError> {
    let pipe = || {
        nix::unistd::pipe2(OFlag::O_CLOEXEC)
            .map_err(|errno| SandboxError::errno("creating a sync pipe", errno))
    };
    let (ready_read, ready_write) = pipe()?;
    let (go_read, go_write) = pipe()?;
    Ok(SyncPipes {
        ready_read,
        ready_write,
        go_read,
        go_write,
    })
}

fn c_string(bytes: &[u8], what: &str) -> Result<CString, SandboxError> {
    CString::new(bytes).map_err(|_| SandboxError::InvalidExecutor {
        reason: format!("{what} contains a NUL byte"),
    })
}

fn path_c_string(path: &Path) -> Result<CString, SandboxError> {
    c_string(path.as_os_str().as_bytes(), "mount path")
}

fn namespace_plan(policy: &Policy) -> Result<NamespacePlan, SandboxError> {
    let mut flags =
        libc::CLONE_NEWUSER | libc::CLONE_NEWNS | libc::CLONE_NEWIPC | libc::CLONE_NEWUTS;
    if !policy.unrestricted_networking() {
        flags |= libc::CLONE_NEWNET;
    }

    let root_dir = warden_util::temp::create_temp_dir(&format!(
        "{}/warden-root-",
        std::env::temp_dir().display()
    ))
    .map_err(|error| SandboxError::os("creating the sandbox root", error))?;
    let new_root = path_c_string(&root_dir)?;

    let entries = policy.mounts().entries();
    let bind_dirs: Vec<&str> = entries
        .iter()
        .filter(|(_, entry)| matches!(entry, MountEntry::Directory { .. }))
        .map(|(inside, _)| inside.as_str())
        .collect();
    let beneath_bind = |path: &str| {
        bind_dirs
            .iter()
            .any(|dir| warden_util::path::is_within(path, dir) && path != *dir)
    };

    let mut mounts = Vec::new();
    let mut created: HashSet<String> = HashSet::new();
    for (inside, entry) in &entries {
        let target_path = root_dir.join(inside.trim_start_matches('/'));
        let target = path_c_string(&target_path)?;

        let mut ancestor = String::new();
        let components: Vec<&str> = inside.split('/').filter(|part| !part.is_empty()).collect();
        if let Some((_, parents)) = components.split_last() {
            for part in parents {
                ancestor.push('/');
                ancestor.push_str(part);
                if beneath_bind(&ancestor) || !created.insert(ancestor.clone()) {
                    continue;
                }
                let dir = root_dir.join(ancestor.trim_start_matches('/'));
                mounts.push(MountOp::Mkdir(path_c_string(&dir)?));
            }
        }

        if !beneath_bind(inside) && created.insert(inside.clone()) {
            mounts.push(match entry {
                MountEntry::File { .. } => MountOp::Touch(target.clone()),
                MountEntry::Directory { .. } | MountEntry::Tmpfs { .. } => {
                    MountOp::Mkdir(target.clone())
                }
            });
        }

        match entry {
            MountEntry::File { outside, writable }
            | MountEntry::Directory { outside, writable } => {
                mounts.push(MountOp::Bind {
                    source: path_c_string(outside)?,
                    target: target.clone(),
                });
                if !*writable {
                    mounts.push(MountOp::RemountReadOnly {
                        target,
                        flags: locked_flags(outside),
                    });
                }
            }
            MountEntry::Tmpfs { size } => mounts.push(MountOp::Tmpfs {
                target,
                data: c_string(format!("size={size},mode=0755").as_bytes(), "tmpfs options")?,
            }),
        }
    }

    Ok(NamespacePlan {
        flags,
        hostname: policy.hostname().as_bytes().to_vec(),
        new_root,
        root_dir,
        mounts,
    })
}

/// Flags a read-only bind remount must repeat to be allowed in a user
/// namespace.
fn locked_flags(outside: &Path) -> libc::c_ulong {
    let mut flags = libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY;
    let Ok(stat) = statvfs(outside) else {
        return flags;
    };
    let mapping = [
        (FsFlags::ST_NOSUID, libc::MS_NOSUID),
        (FsFlags::ST_NODEV, libc::MS_NODEV),
        (FsFlags::ST_NOEXEC, libc::MS_NOEXEC),
        (FsFlags::ST_NOATIME, libc::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, libc::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, libc::MS_RELATIME),
    ];
    for (stat_flag, mount_flag) in mapping {
        if stat.flags().contains(stat_flag) {
            flags |= mount_flag;
        }
    }
    flags
}
