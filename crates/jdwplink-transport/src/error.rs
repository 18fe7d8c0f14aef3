// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the daemon transport.

use std::io;

use jdwplink_proto::HeaderError;

/// Transport error type.
///
/// Two failure scopes exist: errors that end only the current debugger
/// session (the acceptor can immediately begin a fresh cycle on the same
/// control channel) and errors that end the transport as a whole. Use
/// [`TransportError::ends_session_only`] to tell them apart.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// Shutdown was requested from another thread. Always wins over any
    /// concurrent failure.
    #[error("shutdown requested")]
    ShuttingDown,
    /// The connected relay daemon failed the injected trust check.
    #[error("relay daemon peer failed the trust check")]
    PeerRejected,
    /// The daemon accepted the control connection but the registration
    /// send failed.
    #[error("failed to register with the relay daemon: {0}")]
    RegistrationFailed(#[source] io::Error),
    /// Too many consecutive descriptor-receive failures.
    #[error("relay connection max retries exceeded after {attempts} attempts")]
    RetriesExceeded { attempts: u32 },
    /// Every descriptor is gone; the session has no means of activity.
    #[error("no descriptors left to wait on")]
    NoDescriptors,
    /// The first bytes from the debugger were not the handshake literal.
    #[error("bad handshake from debugger")]
    BadHandshake,
    /// The handshake echo could not be written back in full.
    #[error("failed to echo handshake: {0}")]
    HandshakeEchoFailed(#[source] io::Error),
    #[error("malformed packet header: {0}")]
    MalformedPacket(#[from] HeaderError),
    /// A packet declared a length that can never fit the input buffer.
    #[error("packet of {declared} bytes exceeds the {capacity}-byte input buffer")]
    PacketTooLarge { declared: u32, capacity: usize },
    #[error("packet handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The requested operation is not provided by the daemon transport.
    #[error("operation not supported by the daemon transport")]
    Unsupported,
    /// A local resource (socket, wake pipe) could not be created.
    #[error("transport resource unavailable: {0}")]
    Resource(#[source] io::Error),
    #[error("invalid control endpoint name: {0}")]
    InvalidEndpoint(String),
    #[error("i/o failure on debugger connection: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// True when the failure ends only the current debugger session and a
    /// fresh accept cycle may follow on the same control channel.
    pub fn ends_session_only(&self) -> bool {
        matches!(
            self,
            Self::BadHandshake
                | Self::HandshakeEchoFailed(_)
                | Self::MalformedPacket(_)
                | Self::PacketTooLarge { .. }
                | Self::Handler(_)
                | Self::NoDescriptors
                | Self::Io(_)
        )
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
