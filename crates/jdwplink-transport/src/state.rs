// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session state: descriptors, the input buffer, and the cross-thread core.
//!
//! # Thread-safety
//!
//! A session is touched by exactly two roles: the **worker** thread drives
//! `accept`/`pump` and owns the [`Session`] (and with it the input buffer)
//! by value; the **owner** thread keeps only a [`ShutdownHandle`] and may
//! request shutdown at any time. Everything the owner can reach lives in
//! [`Shared`]:
//!
//! - `shutting_down`: best-effort flag, re-checked by the worker at every
//!   loop and retry boundary. Relaxed ordering suffices because each
//!   blocking wait is also woken through descriptor shutdown or the wake
//!   pipe.
//! - `fds`: the descriptor table behind a `Mutex`. The lock is never held
//!   across a blocking syscall; workers snapshot raw fds, release the lock,
//!   then block. Shutdown *parks* descriptors (bidirectional shutdown, close
//!   deferred to teardown) so a snapshot can never name a reused fd number.
//! - `client_write`: serializes all writes to the debugger socket so the
//!   handshake echo and outbound packets never interleave.
//!
//! Lock order: `client_write` before `fds`. Teardown is `Drop` of the last
//! `Shared` owner; the worker holds one such owner inside `Session`, so no
//! descriptor can close while the worker still runs.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::io;

use tracing::debug;

use crate::acceptor;
use crate::endpoint::ControlEndpoint;
use crate::error::{TransportError, TransportResult};
use crate::fdio;
use crate::multiplexer;
use crate::shutdown::ShutdownHandle;
use crate::{PacketHandler, TransportConfig};

/// Capacity of the buffered input window. A framed packet larger than this
/// cannot be processed and fails the session.
pub const INPUT_BUFFER_CAPACITY: usize = 8192;

/// All descriptors of one session. `parked` holds descriptors that shutdown
/// has cleared: already shut down, kept open until teardown.
pub(crate) struct FdTable {
    pub(crate) control: Option<OwnedFd>,
    pub(crate) client: Option<OwnedFd>,
    pub(crate) wake_rx: Option<OwnedFd>,
    pub(crate) wake_tx: Option<OwnedFd>,
    parked: Vec<OwnedFd>,
}

impl FdTable {
    fn new(wake_rx: OwnedFd, wake_tx: OwnedFd) -> Self {
        Self {
            control: None,
            client: None,
            wake_rx: Some(wake_rx),
            wake_tx: Some(wake_tx),
            parked: Vec::new(),
        }
    }

    pub(crate) fn control_raw(&self) -> Option<RawFd> {
        self.control.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn client_raw(&self) -> Option<RawFd> {
        self.client.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn wake_rx_raw(&self) -> Option<RawFd> {
        self.wake_rx.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn wake_tx_raw(&self) -> Option<RawFd> {
        self.wake_tx.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn park_client(&mut self) {
        if let Some(fd) = self.client.take() {
            fdio::shutdown_both(fd.as_raw_fd());
            self.parked.push(fd);
        }
    }

    pub(crate) fn park_control(&mut self) {
        if let Some(fd) = self.control.take() {
            fdio::shutdown_both(fd.as_raw_fd());
            self.parked.push(fd);
        }
    }

    /// Close the control descriptor, but only if it is still the one the
    /// caller snapshotted. Shutdown may have parked it in the meantime.
    pub(crate) fn drop_control_if(&mut self, raw: RawFd) {
        if self.control_raw() == Some(raw) {
            self.control = None;
        }
    }
}

/// The cross-thread core of a session.
pub(crate) struct Shared {
    pub(crate) shutting_down: AtomicBool,
    pub(crate) fds: Mutex<FdTable>,
    client_write: Mutex<()>,
}

impl Shared {
    pub(crate) fn shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Write `parts` to the debugger socket as one uninterrupted byte run.
    pub(crate) fn write_client(&self, parts: &[&[u8]]) -> io::Result<()> {
        let _serial = self.client_write.lock().unwrap();
        let fd = self
            .fds
            .lock()
            .unwrap()
            .client_raw()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no debugger connection"))?;
        for part in parts {
            fdio::write_all(fd, part)?;
        }
        Ok(())
    }
}

/// One logical debugger session reached through the relay daemon.
///
/// Produced by [`crate::DaemonTransport::start`] together with its
/// [`ShutdownHandle`]. The worker thread calls [`Session::accept`] to obtain
/// a debugger connection and then [`Session::pump`] until the session ends;
/// [`Session::run`] packages that loop.
pub struct Session {
    pub(crate) shared: Arc<Shared>,
    pub(crate) endpoint: ControlEndpoint,
    pub(crate) config: TransportConfig,
    input_buffer: Box<[u8; INPUT_BUFFER_CAPACITY]>,
    pub(crate) input_len: usize,
    pub(crate) awaiting_handshake: bool,
}

impl Session {
    pub(crate) fn new(config: TransportConfig) -> TransportResult<(Self, ShutdownHandle)> {
        let endpoint = ControlEndpoint::new(&config.endpoint_name)?;
        let (wake_rx, wake_tx) = fdio::create_wake_pipe().map_err(TransportError::Resource)?;
        let shared = Arc::new(Shared {
            shutting_down: AtomicBool::new(false),
            fds: Mutex::new(FdTable::new(wake_rx, wake_tx)),
            client_write: Mutex::new(()),
        });
        let handle = ShutdownHandle::new(Arc::clone(&shared));
        let session = Self {
            shared,
            endpoint,
            config,
            input_buffer: Box::new([0u8; INPUT_BUFFER_CAPACITY]),
            input_len: 0,
            awaiting_handshake: false,
        };
        Ok((session, handle))
    }

    /// Block until the relay daemon hands over a debugger connection.
    ///
    /// Callable repeatedly; each successful call starts one session. Fails
    /// with [`TransportError::ShuttingDown`] once shutdown was requested and
    /// with [`TransportError::RetriesExceeded`] after too many consecutive
    /// descriptor-receive failures.
    pub fn accept(&mut self) -> TransportResult<()> {
        acceptor::accept(self)
    }

    /// Block until more input is buffered or one packet was dispatched.
    ///
    /// Returns `Ok(true)` while the session stays alive, `Ok(false)` on
    /// orderly debugger departure, and an error for every other terminal
    /// condition.
    pub fn pump(&mut self, handler: &mut dyn PacketHandler) -> TransportResult<bool> {
        multiplexer::pump(self, handler)
    }

    /// Accept-and-pump until shutdown. Session-local failures (protocol
    /// violations, peer departure) start a fresh accept cycle; everything
    /// else propagates. Returns `Ok(())` on requested shutdown.
    pub fn run(&mut self, handler: &mut dyn PacketHandler) -> TransportResult<()> {
        loop {
            match self.accept() {
                Ok(()) => {}
                Err(TransportError::ShuttingDown) => return Ok(()),
                Err(err) => return Err(err),
            }
            loop {
                match self.pump(handler) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(TransportError::ShuttingDown) => return Ok(()),
                    Err(err) if err.ends_session_only() => {
                        debug!(error = %err, "debugger session ended; awaiting next connection");
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.fds.lock().unwrap().client.is_some()
    }

    /// True from connection acceptance until the handshake literal has been
    /// validated and echoed.
    pub fn awaiting_handshake(&self) -> bool {
        self.awaiting_handshake
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.input_len
    }

    pub fn shutting_down(&self) -> bool {
        self.shared.shutting_down()
    }

    pub(crate) fn buffer(&self) -> &[u8] {
        &self.input_buffer[..self.input_len]
    }

    pub(crate) fn buffer_tail(&mut self) -> &mut [u8] {
        &mut self.input_buffer[self.input_len..]
    }

    pub(crate) fn advance(&mut self, count: usize) {
        debug_assert!(self.input_len + count <= INPUT_BUFFER_CAPACITY);
        self.input_len += count;
    }

    /// Remove the first `count` buffered bytes, shifting any remainder to
    /// the front.
    pub(crate) fn consume_bytes(&mut self, count: usize) {
        debug_assert!(count <= self.input_len);
        self.input_buffer.copy_within(count..self.input_len, 0);
        self.input_len -= count;
    }

    /// Whether dispatch has a complete unit to work on. While the handshake
    /// is outstanding that unit is the raw 14-byte literal, not a framed
    /// packet.
    pub(crate) fn have_full_packet(&self) -> bool {
        if self.awaiting_handshake {
            self.input_len >= jdwplink_proto::HANDSHAKE.len()
        } else {
            jdwplink_proto::have_full_packet(self.buffer())
        }
    }

    /// Install a freshly received debugger descriptor and reset per-session
    /// input state.
    pub(crate) fn begin_client_session(&mut self, fd: OwnedFd) {
        let mut fds = self.shared.fds.lock().unwrap();
        debug_assert!(fds.client.is_none());
        fds.client = Some(fd);
        drop(fds);
        self.input_len = 0;
        self.awaiting_handshake = true;
    }

    /// Drop the debugger connection. Safe against concurrent shutdown: if
    /// the descriptor was already parked there is nothing left to take.
    pub(crate) fn close_client(&self) {
        drop(self.shared.fds.lock().unwrap().client.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jdwplink_proto::HANDSHAKE;

    fn test_session() -> (Session, ShutdownHandle) {
        Session::new(TransportConfig::builder().endpoint_name("jdwplink-state-test").build())
            .unwrap()
    }

    fn feed(session: &mut Session, bytes: &[u8]) {
        session.buffer_tail()[..bytes.len()].copy_from_slice(bytes);
        session.advance(bytes.len());
    }

    #[test]
    fn consume_shifts_remainder_to_front() {
        let (mut session, _handle) = test_session();
        feed(&mut session, b"abcdefgh");
        session.consume_bytes(3);
        assert_eq!(session.buffer(), b"defgh");
        session.consume_bytes(5);
        assert_eq!(session.buffered(), 0);
    }

    #[test]
    fn tail_never_exceeds_capacity() {
        let (mut session, _handle) = test_session();
        assert_eq!(session.buffer_tail().len(), INPUT_BUFFER_CAPACITY);
        feed(&mut session, &[0u8; 100]);
        assert_eq!(session.buffer_tail().len(), INPUT_BUFFER_CAPACITY - 100);
    }

    #[test]
    fn full_packet_predicate_tracks_handshake_phase() {
        let (mut session, _handle) = test_session();
        session.awaiting_handshake = true;
        feed(&mut session, &HANDSHAKE[..13]);
        assert!(!session.have_full_packet());
        feed(&mut session, &HANDSHAKE[13..]);
        assert!(session.have_full_packet());

        // The same bytes are nowhere near a full framed packet: the first
        // four bytes of the literal decode to a huge length field.
        session.awaiting_handshake = false;
        assert!(!session.have_full_packet());
    }

    #[test]
    fn close_client_is_idempotent() {
        let (session, _handle) = test_session();
        session.close_client();
        session.close_client();
        assert!(!session.is_connected());
    }
}
