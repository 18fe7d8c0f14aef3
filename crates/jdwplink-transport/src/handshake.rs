// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The one-time handshake exchange.
//!
//! The debugger opens every session by sending a fixed 14-byte literal and
//! expects the identical bytes echoed back before any framed packet flows.
//! The exchange happens exactly once per session, always initiated by the
//! debugger.

use jdwplink_proto::HANDSHAKE;
use tracing::{debug, error, warn};

use crate::error::{TransportError, TransportResult};
use crate::state::Session;

/// Validate and echo the handshake literal. Invoked only while the session
/// awaits its handshake and at least the literal's length is buffered.
pub(crate) fn finish_handshake(session: &mut Session) -> TransportResult<()> {
    debug_assert!(session.awaiting_handshake);
    debug_assert!(session.buffered() >= HANDSHAKE.len());

    let received = &session.buffer()[..HANDSHAKE.len()];
    if received != &HANDSHAKE[..] {
        error!(
            received = %String::from_utf8_lossy(received),
            "bad handshake from debugger"
        );
        session.close_client();
        return Err(TransportError::BadHandshake);
    }

    // Echo the request back exactly as it was sent, serialized against any
    // outbound packet writes.
    if let Err(err) = session.shared.write_client(&[&HANDSHAKE[..]]) {
        warn!(error = %err, "failed to write handshake echo");
        session.close_client();
        return Err(TransportError::HandshakeEchoFailed(err));
    }

    session.consume_bytes(HANDSHAKE.len());
    session.awaiting_handshake = false;
    debug!("handshake complete");
    Ok(())
}
