// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Blocking readiness wait over the session's descriptors.
//!
//! Closing our copy of a descriptor does not count as activity for a thread
//! already parked in `poll`, so the wake pipe is part of every readiness
//! set; it is the only wake-up the owner thread can force. Priority on
//! wake-up: the wake pipe, then control-channel activity, then the debugger
//! socket.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use jdwplink_proto::{Packet, PacketHeader};
use tracing::{debug, error, info, warn};

use crate::control;
use crate::error::{TransportError, TransportResult};
use crate::fdio;
use crate::handshake;
use crate::state::{Session, INPUT_BUFFER_CAPACITY};
use crate::{PacketHandler, ReplyWriter};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Wake,
    Control,
    Client,
}

/// Block until more bytes are buffered or one complete unit was dispatched.
///
/// `Ok(true)`: keep pumping. `Ok(false)`: the debugger departed in an
/// orderly fashion and the connection is over. Errors signal every other
/// terminal condition for the session.
pub(crate) fn pump(
    session: &mut Session,
    handler: &mut dyn PacketHandler,
) -> TransportResult<bool> {
    if !session.have_full_packet() {
        let count = wait_for_input(session)?;
        if count == 0 {
            debug!("debugger disconnected");
            session.close_client();
            return Ok(false);
        }
        session.advance(count);
        if !session.have_full_packet() {
            // Not there yet; the caller re-invokes.
            return Ok(true);
        }
    }

    dispatch(session, handler)?;
    Ok(true)
}

/// The readiness loop. Returns the number of bytes read from the debugger,
/// zero meaning orderly departure.
fn wait_for_input(session: &mut Session) -> TransportResult<usize> {
    loop {
        if session.shutting_down() {
            return Err(TransportError::ShuttingDown);
        }

        // Snapshot the descriptor set; another thread may clear table
        // entries at any time, but raw values stay valid until teardown.
        let (wake, control, client) = {
            let fds = session.shared.fds.lock().unwrap();
            (fds.wake_rx_raw(), fds.control_raw(), fds.client_raw())
        };

        let mut roles: Vec<Role> = Vec::with_capacity(3);
        let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(3);
        let mut watch = |role: Role, fd: Option<RawFd>| {
            if let Some(fd) = fd {
                roles.push(role);
                pfds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }
        };
        watch(Role::Control, control);
        watch(Role::Client, client);
        watch(Role::Wake, wake);

        if pfds.is_empty() {
            warn!("all descriptors are gone; connection has no means of activity");
            return Err(TransportError::NoDescriptors);
        }
        if wake.is_none() {
            info!("entering readiness wait without a wake pipe");
        }

        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %err, "readiness wait failed");
            session.close_client();
            return Err(TransportError::Io(err));
        }

        let is_ready = |want: Role| {
            roles.iter().zip(pfds.iter()).any(|(role, pfd)| {
                *role == want
                    && pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0
            })
        };

        // Highest priority: forced wake-up from the shutdown path.
        if is_ready(Role::Wake) {
            debug!("woken by the cancellation pipe");
            session.close_client();
            return Err(TransportError::ShuttingDown);
        }

        // Control activity while a debugger is attached is another passed
        // descriptor: accept it and drop it so the second debugger sees a
        // closed connection instead of a silent hang. Buffered input is
        // left untouched.
        if is_ready(Role::Control) && client.is_some() {
            match control::receive_fd(&session.shared) {
                Ok(extra) => {
                    info!(
                        fd = extra.as_raw_fd(),
                        "ignoring second debugger; accepting and dropping"
                    );
                }
                Err(err) => {
                    // The daemon most likely went away; the next read on
                    // the debugger socket will notice.
                    debug!(error = %err, "control channel activity without a descriptor");
                }
            }
        }

        if is_ready(Role::Client) {
            let Some(client_fd) = client else {
                continue;
            };
            if session.buffer_tail().is_empty() {
                let declared =
                    PacketHeader::parse(session.buffer()).map(|h| h.length).unwrap_or(0);
                error!(
                    declared,
                    capacity = INPUT_BUFFER_CAPACITY,
                    "packet cannot fit the input buffer"
                );
                session.close_client();
                return Err(TransportError::PacketTooLarge {
                    declared,
                    capacity: INPUT_BUFFER_CAPACITY,
                });
            }
            let read = {
                let tail = session.buffer_tail();
                fdio::read_once(client_fd, tail)
            };
            match read {
                Ok(count) => return Ok(count),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    session.close_client();
                    return Err(TransportError::Io(err));
                }
            }
        }
    }
}

/// Hand one complete unit to its consumer: the handshake while it is
/// outstanding, the external command handler afterwards — exactly one
/// packet's worth of bytes per invocation.
fn dispatch(session: &mut Session, handler: &mut dyn PacketHandler) -> TransportResult<()> {
    if session.awaiting_handshake {
        return handshake::finish_handshake(session);
    }

    let consumed = {
        let packet = match Packet::parse(session.buffer()) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, "malformed packet from debugger");
                session.close_client();
                return Err(err.into());
            }
        };
        let reply = ReplyWriter::new(&session.shared);
        if let Err(err) = handler.handle_packet(packet, &reply) {
            session.close_client();
            return Err(TransportError::Handler(err));
        }
        packet.header().length as usize
    };
    session.consume_bytes(consumed);
    Ok(())
}
