// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Control channel to the relay daemon.
//!
//! The protocol is the daemon's, summarized: connect to the well-known
//! abstract socket, send the local process id as exactly four ASCII hex
//! digits (no terminator), then issue ancillary-data receives; each carries
//! at most one passed descriptor, a pass-through to one debugger.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::endpoint::ConnectError;
use crate::error::{TransportError, TransportResult};
use crate::fdio;
use crate::state::{Session, Shared};

/// Connect-retry backoff: starts at 500 ms, grows by half each round,
/// capped at 2 s.
pub(crate) struct Backoff {
    next_ms: u64,
    cap_ms: u64,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            next_ms: initial.as_millis() as u64,
            cap_ms: cap.as_millis() as u64,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let current = self.next_ms.min(self.cap_ms);
        self.next_ms = current + (current >> 1);
        Duration::from_millis(current)
    }
}

/// Transient descriptor-receive failures. Any of these clears the control
/// descriptor so the next accept attempt reconnects.
#[derive(thiserror::Error, Debug)]
pub(crate) enum FdReceiveError {
    #[error("control channel not connected")]
    NotConnected,
    #[error("control channel closed by the daemon")]
    Closed,
    #[error("control message carried no descriptor")]
    NoDescriptor,
    #[error("recvmsg failed: {0}")]
    Io(#[from] io::Error),
}

/// Ensure the control channel is connected and registered.
///
/// Loops forever on connect failure (only shutdown stops it), sleeping the
/// backoff interval between attempts. Trust-check rejection and registration
/// send failure are non-retryable: the daemon is reachable but unusable.
pub(crate) fn connect_and_register(session: &Session) -> TransportResult<()> {
    if session.shared.fds.lock().unwrap().control.is_some() {
        return Ok(());
    }

    let mut backoff = Backoff::new(session.config.backoff_initial, session.config.backoff_cap);
    loop {
        if session.shutting_down() {
            return Err(TransportError::ShuttingDown);
        }

        match session.endpoint.connect() {
            Ok(fd) => {
                if let Some(verifier) = &session.config.peer_verifier {
                    if !verifier.verify(fd.as_fd()) {
                        warn!(
                            endpoint = session.endpoint.name(),
                            "relay daemon failed the trust check; refusing control channel"
                        );
                        fdio::shutdown_both(fd.as_raw_fd());
                        return Err(TransportError::PeerRejected);
                    }
                }

                let registration = registration_digits(session.config.effective_pid());
                if let Err(err) = fdio::write_all(fd.as_raw_fd(), &registration) {
                    // The daemon accepted the connection but we cannot talk
                    // to it; retrying will not improve matters.
                    error!(error = %err, "control channel accepted but registration send failed");
                    return Err(TransportError::RegistrationFailed(err));
                }
                debug!(
                    endpoint = session.endpoint.name(),
                    registration = %String::from_utf8_lossy(&registration),
                    "registered with relay daemon"
                );
                session.shared.fds.lock().unwrap().control = Some(fd);
                return Ok(());
            }
            Err(ConnectError::Socket(err)) => {
                error!(error = %err, "could not create control socket");
                return Err(TransportError::Resource(err));
            }
            Err(ConnectError::Connect(err)) => {
                // The daemon may simply not be running yet; wait for it.
                let delay = backoff.next_delay();
                debug!(
                    endpoint = session.endpoint.name(),
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "relay daemon unavailable; backing off"
                );
                thread::sleep(delay);
            }
        }
    }
}

/// The process id as exactly four ASCII hex digits. Wider pids keep their
/// leading digits, matching the daemon's fixed 4-byte read.
fn registration_digits(pid: u32) -> [u8; 4] {
    let hex = format!("{:04x}", pid);
    let bytes = hex.as_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// One blocking ancillary-data receive on the control channel, expecting
/// exactly one passed descriptor.
///
/// Every failure is transient: the control descriptor is dropped so the
/// acceptor reconnects on its next attempt.
pub(crate) fn receive_fd(shared: &Shared) -> Result<OwnedFd, FdReceiveError> {
    let control = shared
        .fds
        .lock()
        .unwrap()
        .control_raw()
        .ok_or(FdReceiveError::NotConnected)?;

    let result = recv_one_fd(control);
    if let Err(err) = &result {
        debug!(error = %err, "descriptor receive failed; dropping control channel");
        shared.fds.lock().unwrap().drop_control_if(control);
    }
    result
}

fn recv_one_fd(control: RawFd) -> Result<OwnedFd, FdReceiveError> {
    let mut dummy = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: dummy.as_mut_ptr() as *mut libc::c_void,
        iov_len: dummy.len(),
    };
    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as libc::c_uint) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    let received = loop {
        let rc = unsafe { libc::recvmsg(control, &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(FdReceiveError::Io(err));
        }
        break rc;
    };
    if received == 0 {
        return Err(FdReceiveError::Closed);
    }

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(FdReceiveError::NoDescriptor);
    }
    let header = unsafe { *cmsg };
    if header.cmsg_level != libc::SOL_SOCKET || header.cmsg_type != libc::SCM_RIGHTS {
        return Err(FdReceiveError::NoDescriptor);
    }
    let fd = unsafe { std::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd) };
    if fd < 0 {
        return Err(FdReceiveError::NoDescriptor);
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
