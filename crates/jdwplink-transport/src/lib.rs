// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon-mediated debugger transport.
//!
//! Instead of listening on a TCP port of its own, the in-process debugging
//! server reaches its debugger through a trusted relay daemon: the daemon
//! owns the externally visible endpoint, and this transport connects to the
//! daemon's control socket, registers the local process id, and receives
//! ready-to-use debugger connections as passed file descriptors.
//!
//! The transport is deliberately a blocking state machine over OS
//! primitives. An owner thread creates the session and keeps its
//! [`ShutdownHandle`]; a worker thread consumes the [`Session`] and drives
//! it:
//!
//! ```no_run
//! use jdwplink_transport::{DaemonTransport, Packet, PacketHandler, ReplyWriter, TransportConfig};
//!
//! struct Discard;
//! impl PacketHandler for Discard {
//!     fn handle_packet(
//!         &mut self,
//!         _packet: Packet<'_>,
//!         _reply: &ReplyWriter<'_>,
//!     ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!         Ok(())
//!     }
//! }
//!
//! let transport = DaemonTransport::new(TransportConfig::builder().build());
//! let (mut session, shutdown) = transport.start().unwrap();
//! let worker = std::thread::spawn(move || session.run(&mut Discard));
//! // ... later, from any thread:
//! shutdown.request_shutdown();
//! worker.join().unwrap().unwrap();
//! ```
//!
//! Command and event semantics stay out of scope: every complete packet is
//! forwarded to the embedder's [`PacketHandler`], and outbound packets go
//! through the serialized [`ReplyWriter`].

use std::fmt;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

mod acceptor;
mod control;
mod endpoint;
pub mod error;
mod fdio;
mod handshake;
mod multiplexer;
mod shutdown;
mod state;

pub use error::{TransportError, TransportResult};
pub use shutdown::ShutdownHandle;
pub use state::{Session, INPUT_BUFFER_CAPACITY};

// Wire-level types embedders need for handler implementations.
pub use jdwplink_proto::{Packet, PacketHeader, PacketKind, HANDSHAKE, HEADER_LEN};

/// The relay daemon's default rendezvous name in the abstract socket
/// namespace.
pub const DEFAULT_ENDPOINT: &str = "jdwp-control";

/// Optional trust check over a freshly connected control socket.
///
/// When configured, a rejected peer fails the transport non-retryably.
/// Absent a verifier every peer is trusted.
pub trait PeerVerifier: Send + Sync {
    fn verify(&self, peer: BorrowedFd<'_>) -> bool;
}

impl<F> PeerVerifier for F
where
    F: Fn(BorrowedFd<'_>) -> bool + Send + Sync,
{
    fn verify(&self, peer: BorrowedFd<'_>) -> bool {
        self(peer)
    }
}

/// Consumer of complete inbound packets.
///
/// Invoked with exactly one packet's worth of bytes per call; the packet's
/// bytes are released from the input buffer when the call returns. Replies
/// and any other outbound packets must go through the provided
/// [`ReplyWriter`]. An error ends the current debugger session.
pub trait PacketHandler {
    fn handle_packet(
        &mut self,
        packet: Packet<'_>,
        reply: &ReplyWriter<'_>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Serialized write access to the debugger socket.
///
/// All writes share one lock so concurrent senders (the handshake echo, the
/// command layer, event posters) never interleave their byte streams.
pub struct ReplyWriter<'a> {
    shared: &'a state::Shared,
}

impl<'a> ReplyWriter<'a> {
    pub(crate) fn new(shared: &'a state::Shared) -> Self {
        Self { shared }
    }

    /// Write one fully framed packet.
    pub fn write_packet(&self, packet: &[u8]) -> std::io::Result<()> {
        self.shared.write_client(&[packet])
    }

    /// Write one packet from separate header and payload buffers without
    /// another sender's bytes landing in between.
    pub fn write_packet_parts(&self, header: &[u8], payload: &[u8]) -> std::io::Result<()> {
        self.shared.write_client(&[header, payload])
    }
}

/// Configuration for the daemon transport.
///
/// The defaults reproduce production behavior; the overrides exist for
/// embedders with their own daemon deployment and for tests.
#[derive(Clone)]
pub struct TransportConfig {
    pub(crate) endpoint_name: String,
    pub(crate) peer_verifier: Option<Arc<dyn PeerVerifier>>,
    pub(crate) registration_pid: Option<u32>,
    pub(crate) receive_retry_limit: u32,
    pub(crate) backoff_initial: Duration,
    pub(crate) backoff_cap: Duration,
}

impl TransportConfig {
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder {
            endpoint_name: DEFAULT_ENDPOINT.to_string(),
            peer_verifier: None,
            registration_pid: None,
            receive_retry_limit: 5,
            backoff_initial: Duration::from_millis(500),
            backoff_cap: Duration::from_millis(2000),
        }
    }

    pub(crate) fn effective_pid(&self) -> u32 {
        self.registration_pid.unwrap_or_else(std::process::id)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("endpoint_name", &self.endpoint_name)
            .field("peer_verifier", &self.peer_verifier.as_ref().map(|_| "<configured>"))
            .field("registration_pid", &self.registration_pid)
            .field("receive_retry_limit", &self.receive_retry_limit)
            .field("backoff_initial", &self.backoff_initial)
            .field("backoff_cap", &self.backoff_cap)
            .finish()
    }
}

/// Builder for [`TransportConfig`].
pub struct TransportConfigBuilder {
    endpoint_name: String,
    peer_verifier: Option<Arc<dyn PeerVerifier>>,
    registration_pid: Option<u32>,
    receive_retry_limit: u32,
    backoff_initial: Duration,
    backoff_cap: Duration,
}

impl TransportConfigBuilder {
    /// Override the abstract-namespace name of the relay daemon's control
    /// socket.
    pub fn endpoint_name(mut self, name: impl Into<String>) -> Self {
        self.endpoint_name = name.into();
        self
    }

    /// Install a trust check invoked against every freshly connected
    /// control socket.
    pub fn peer_verifier(mut self, verifier: impl PeerVerifier + 'static) -> Self {
        self.peer_verifier = Some(Arc::new(verifier));
        self
    }

    /// Register under this process id instead of the real one.
    pub fn registration_pid(mut self, pid: u32) -> Self {
        self.registration_pid = Some(pid);
        self
    }

    /// Consecutive descriptor-receive failures tolerated before an accept
    /// call fails permanently.
    pub fn receive_retry_limit(mut self, limit: u32) -> Self {
        self.receive_retry_limit = limit.max(1);
        self
    }

    /// Tune the connect-retry backoff window.
    pub fn backoff(mut self, initial: Duration, cap: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_cap = cap;
        self
    }

    pub fn build(self) -> TransportConfig {
        TransportConfig {
            endpoint_name: self.endpoint_name,
            peer_verifier: self.peer_verifier,
            registration_pid: self.registration_pid,
            receive_retry_limit: self.receive_retry_limit,
            backoff_initial: self.backoff_initial,
            backoff_cap: self.backoff_cap,
        }
    }
}

/// Entry point: builds sessions against the relay daemon.
pub struct DaemonTransport {
    config: TransportConfig,
}

impl DaemonTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(TransportConfig::default())
    }

    /// Prepare one session and its shutdown handle.
    ///
    /// Runs in the owner thread before the worker starts, so it does
    /// nothing that could block: local resources (the wake pipe) are
    /// created here and their failure is fatal to startup.
    pub fn start(&self) -> TransportResult<(Session, ShutdownHandle)> {
        Session::new(self.config.clone())
    }

    /// Connecting out to a listening debugger is the direct-socket
    /// transport's business; the daemon transport never initiates
    /// connections.
    pub fn connect_out(&self) -> TransportResult<Session> {
        Err(TransportError::Unsupported)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_production_values() {
        let config = TransportConfig::default();
        assert_eq!(config.endpoint_name, DEFAULT_ENDPOINT);
        assert_eq!(config.receive_retry_limit, 5);
        assert_eq!(config.backoff_initial, Duration::from_millis(500));
        assert_eq!(config.backoff_cap, Duration::from_millis(2000));
        assert!(config.peer_verifier.is_none());
    }

    #[test]
    fn connect_out_is_not_supported() {
        let transport = DaemonTransport::with_defaults();
        assert!(matches!(
            transport.connect_out(),
            Err(TransportError::Unsupported)
        ));
    }
}
