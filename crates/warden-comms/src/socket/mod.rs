//! Raw `sendmsg`/`recvmsg` wrappers with descriptor passing.

use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::error::CommsError;


/// Control buffer for one `SCM_RIGHTS` descriptor, aligned for `cmsghdr`.
/// Alignment padding leaves room for a second; anything beyond that arrives
/// with `MSG_CTRUNC`.
#[repr(C, align(8))]
struct ControlBuffer([u8; 32]);

impl ControlBuffer {
    const fn new() -> Self {
        Self([0; 32])
    }
}

fn fd_payload_len() -> u32 {
    u32::try_from(mem::size_of::<RawFd>()).unwrap_or(u32::MAX)
}

fn fd_space() -> usize {
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(fd_payload_len()) };
    usize::try_from(space).unwrap_or(usize::MAX)
}

fn fd_len() -> usize {
    // SAFETY: CMSG_LEN is a pure size computation.
    let len = unsafe { libc::CMSG_LEN(fd_payload_len()) };
    usize::try_from(len).unwrap_or(usize::MAX)
}

fn iovec_of(bytes: &[u8]) -> libc::iovec {
    libc::iovec {
        iov_base: bytes.as_ptr().cast_mut().cast(),
        iov_len: bytes.len(),
    }
}

/// Sends as much of `parts` as the kernel accepts in one call, attaching
/// `pass_fd` when given.
pub(crate) fn send_once(fd: RawFd, parts: &[&[u8]], pass_fd: Option<RawFd>) -> io::Result<usize> {
    let iov: Vec<libc::iovec> = parts.iter().map(|part| iovec_of(part)).collect();
    let mut control = ControlBuffer::new();

    // SAFETY: msghdr is plain data; zeroed is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_ptr().cast_mut();
    msg.msg_iovlen = iov.len();

    if let Some(passed) = pass_fd {
        msg.msg_control = control.0.as_mut_ptr().cast();
        msg.msg_controllen = fd_space();
        // SAFETY: the control buffer is aligned and at least CMSG_SPACE bytes,
        // so the first header and its data area lie inside it.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = fd_len();
            ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), passed);
        }
    }

    loop {
        // SAFETY: msg points at live iovecs and control data for this call.
        let sent = unsafe { libc::sendmsg(fd, &raw const msg, libc::MSG_NOSIGNAL) };
        if sent >= 0 {
            return Ok(sent.unsigned_abs());
        }
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

/// Receives into `buf` with one call and returns the byte count together
/// with any descriptor that arrived.
///
/// Fails with [`CommsError::ExcessDescriptors`] when the peer attached more
/// than one descriptor. Every descriptor that arrived is closed.
pub(crate) fn recv_once(
    fd: RawFd,
    buf: &mut [u8],
) -> Result<(usize, Option<OwnedFd>), CommsError> {
    let iov = [libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    }];
    let mut control = ControlBuffer::new();

    // SAFETY: msghdr is plain data; zeroed is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_ptr().cast_mut();
    msg.msg_iovlen = iov.len();
    msg.msg_control = control.0.as_mut_ptr().cast();
    msg.msg_controllen = fd_space();

    let received = loop {
        // SAFETY: msg points at live buffers for the duration of the call.
        let count = unsafe { libc::recvmsg(fd, &raw mut msg, libc::MSG_CMSG_CLOEXEC) };
        if count >= 0 {
            break count.unsigned_abs();
        }
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error.into());
        }
    };

    let mut passed = take_passed_fds(&msg);
    if msg.msg_flags & libc::MSG_CTRUNC != 0 || passed.len() > 1 {
        // Dropping the vector closes every descriptor that did arrive.
        drop(passed);
        return Err(CommsError::ExcessDescriptors);
    }
    Ok((received, passed.pop()))
}

fn cmsg_data_len(cmsg_len: usize) -> usize {
    // SAFETY: CMSG_LEN is a pure size computation.
    let header = unsafe { libc::CMSG_LEN(0) };
    cmsg_len.saturating_sub(usize::try_from(header).unwrap_or(usize::MAX))
}

fn take_passed_fds(msg: &libc::msghdr) -> Vec<OwnedFd> {
    let width = mem::size_of::<RawFd>();
    let mut passed = Vec::new();
    // SAFETY: the kernel filled the control buffer; the CMSG_* macros walk it
    // within msg_controllen, and each SCM_RIGHTS entry holds cmsg_len bytes.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let count = cmsg_data_len((*cmsg).cmsg_len).checked_div(width).unwrap_or(0);
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for slot in 0..count {
                    let raw = ptr::read_unaligned(data.add(slot));
                    // The kernel installed a fresh descriptor for this process.
                    passed.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    passed
}
