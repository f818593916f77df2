//! Sandboxee that performs one action named by its first argument.
//!
//! Each action touches a known set of syscalls so a test can pair it with a
//! policy that either allows or forbids them.

use std::ffi::CStr;
use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;
use std::{env, fs, thread};

use warden_testcases::{EXIT_FAILED, EXIT_MISMATCH, EXIT_USAGE};

fn main() -> ExitCode {
    let owned: Vec<String> = env::args().skip(1).collect();
    let args: Vec<&str> = owned.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["exit", code] => code
            .parse::<u8>()
            .map_or(ExitCode::from(EXIT_USAGE), ExitCode::from),
        ["write"] => greet(),
        ["thread-write"] => thread::spawn(greet)
            .join()
            .unwrap_or_else(|_| ExitCode::from(EXIT_FAILED)),
        ["read", path, expected] => match fs::read(path) {
            Ok(contents) if contents == expected.as_bytes() => ExitCode::SUCCESS,
            Ok(_) => ExitCode::from(EXIT_MISMATCH),
            Err(_) => ExitCode::from(EXIT_FAILED),
        },
        ["sync"] => sync(),
        ["hostname", expected] => match hostname() {
            Some(name) if name == *expected => ExitCode::SUCCESS,
            Some(_) => ExitCode::from(EXIT_MISMATCH),
            None => ExitCode::from(EXIT_FAILED),
        },
        ["sleep"] => {
            thread::sleep(Duration::from_secs(3600));
            ExitCode::SUCCESS
        }
        ["abort"] => std::process::abort(),
        _ => ExitCode::from(EXIT_USAGE),
    }
}

fn greet() -> ExitCode {
    match io::stdout().write_all(b"hello\n") {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::from(EXIT_FAILED),
    }
}

/// Calls `sync` directly and exits with the errno it returned, so a policy
/// that blocks it with an errno is observable from the exit status.
fn sync() -> ExitCode {
    // SAFETY: `sync` takes no arguments and touches no memory.
    let rc = unsafe { libc::syscall(libc::SYS_sync) };
    if rc == 0 {
        return ExitCode::SUCCESS;
    }
    io::Error::last_os_error()
        .raw_os_error()
        .and_then(|errno| u8::try_from(errno).ok())
        .map_or(ExitCode::from(EXIT_FAILED), ExitCode::from)
}

fn hostname() -> Option<String> {
    // SAFETY: `utsname` is plain data; all-zero is a valid value.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    // SAFETY: `uts` is a valid, writable `utsname`.
    if unsafe { libc::uname(&raw mut uts) } != 0 {
        return None;
    }
    // SAFETY: the kernel NUL-terminates `nodename`.
    let name = unsafe { CStr::from_ptr(uts.nodename.as_ptr()) };
    name.to_str().ok().map(str::to_owned)
}
