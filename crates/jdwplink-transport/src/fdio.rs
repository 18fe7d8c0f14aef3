// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Raw descriptor I/O helpers shared by the transport modules.
//!
//! The session's blocking points are allowed to block indefinitely, so these
//! helpers retry `EINTR` and nothing else; deadlines are the multiplexer's
//! business.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Create the cancellation pipe (read end, write end), close-on-exec.
pub(crate) fn create_wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Write the whole buffer, retrying on `EINTR`.
pub(crate) fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let written = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if written < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "failed to write to socket",
            ));
        }
        buf = &buf[written as usize..];
    }
    Ok(())
}

/// One read attempt. `EINTR` is reported to the caller, which decides
/// whether to re-enter its readiness wait.
pub(crate) fn read_once(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let count = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if count < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(count as usize)
}

/// Bidirectional shutdown, best effort. Closing is never done here; the
/// descriptor's owner decides when the fd itself goes away.
pub(crate) fn shutdown_both(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}
