// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process mock of the relay daemon: accepts control connections on an
//! abstract socket, validates registrations, and passes debugger
//! descriptors with `SCM_RIGHTS`.

use std::io::{self, Read};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A per-test abstract socket name, so concurrently running tests never
/// collide on a rendezvous address.
pub fn unique_endpoint(tag: &str) -> String {
    format!(
        "jdwplink-test-{}-{}-{}",
        tag,
        std::process::id(),
        NAME_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

pub struct MockRelayDaemon {
    listener: OwnedFd,
}

impl MockRelayDaemon {
    /// Bind and listen on an abstract-namespace name.
    pub fn bind(name: &str) -> Self {
        let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        assert!(raw >= 0, "socket failed: {}", io::Error::last_os_error());
        let listener = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in addr.sun_path[1..].iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        let len = (mem::size_of::<libc::sa_family_t>() + 1 + name.len()) as libc::socklen_t;
        let rc = unsafe {
            libc::bind(
                listener.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        assert_eq!(rc, 0, "bind failed: {}", io::Error::last_os_error());
        let rc = unsafe { libc::listen(listener.as_raw_fd(), 8) };
        assert_eq!(rc, 0, "listen failed: {}", io::Error::last_os_error());

        Self { listener }
    }

    /// Block until the runtime under test connects its control channel.
    pub fn accept_control(&self) -> UnixStream {
        loop {
            let rc = unsafe {
                libc::accept(
                    self.listener.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
            };
            if rc >= 0 {
                return UnixStream::from(unsafe { OwnedFd::from_raw_fd(rc) });
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            panic!("accept failed: {err}");
        }
    }
}

/// The registration is exactly four hex digits, no terminator.
pub fn read_registration(control: &mut UnixStream) -> [u8; 4] {
    let mut registration = [0u8; 4];
    control
        .read_exact(&mut registration)
        .expect("failed to read registration");
    registration
}

/// Pass a descriptor over the control channel, the daemon way: one dummy
/// payload byte plus an `SCM_RIGHTS` control message.
pub fn send_fd(control: &UnixStream, fd: &OwnedFd) {
    let dummy_data = [b'!'; 1];
    let mut iov = libc::iovec {
        iov_base: dummy_data.as_ptr() as *mut libc::c_void,
        iov_len: dummy_data.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as libc::c_uint) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    assert!(!cmsg.is_null(), "failed to get control message header");
    unsafe {
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as libc::c_uint) as _;
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        *(libc::CMSG_DATA(cmsg) as *mut RawFd) = fd.as_raw_fd();
    }

    let result = unsafe { libc::sendmsg(control.as_raw_fd(), &msg, 0) };
    assert!(result >= 0, "sendmsg failed: {}", io::Error::last_os_error());
}

/// A connected stream pair: one end for the test's fake debugger, one end
/// to pass through the daemon.
pub fn socketpair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "socketpair failed: {}", io::Error::last_os_error());
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}
