// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The relay daemon's rendezvous address.
//!
//! The daemon listens on an abstract-namespace Unix stream socket, so the
//! address never appears on the filesystem. The address value is built once
//! per session and exposes only `connect`.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::error::TransportError;

/// Abstract names occupy `sun_path` after a leading NUL byte.
const MAX_NAME_LEN: usize = 107;

/// Typed value object for the daemon's well-known control address.
pub(crate) struct ControlEndpoint {
    name: String,
}

/// Socket creation is a local resource failure; a refused connection is an
/// ordinary retry case. The caller treats the two very differently.
pub(crate) enum ConnectError {
    Socket(io::Error),
    Connect(io::Error),
}

impl ControlEndpoint {
    pub(crate) fn new(name: &str) -> Result<Self, TransportError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.as_bytes().contains(&0) {
            return Err(TransportError::InvalidEndpoint(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// One connection attempt against the abstract address, `EINTR` retried.
    pub(crate) fn connect(&self) -> Result<OwnedFd, ConnectError> {
        let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(ConnectError::Socket(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let (addr, addr_len) = self.socket_address();
        loop {
            let rc = unsafe {
                libc::connect(
                    fd.as_raw_fd(),
                    &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                    addr_len,
                )
            };
            if rc == 0 {
                return Ok(fd);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(ConnectError::Connect(err));
        }
    }

    fn socket_address(&self) -> (libc::sockaddr_un, libc::socklen_t) {
        let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        // sun_path[0] stays NUL: abstract namespace.
        for (dst, src) in addr.sun_path[1..].iter_mut().zip(self.name.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        let len = (mem::size_of::<libc::sa_family_t>() + 1 + self.name.len()) as libc::socklen_t;
        (addr, len)
    }
}
