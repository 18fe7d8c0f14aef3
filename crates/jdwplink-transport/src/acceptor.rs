// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bounded-retry "obtain one debugger connection" orchestration.

use std::os::fd::AsRawFd;

use tracing::{debug, warn};

use crate::control;
use crate::error::{TransportError, TransportResult};
use crate::state::Session;

/// Accept progresses through these phases; `ShuttingDown` is reachable from
/// every one of them and terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AcceptPhase {
    Idle,
    ControlConnecting,
    Registered,
    AwaitingFd,
    Connected,
    ShuttingDown,
}

/// Block until the daemon passes a debugger descriptor.
///
/// Transient receive failures restart from `ControlConnecting` (the failed
/// receive already dropped the control channel); after
/// `receive_retry_limit` consecutive failures the call fails permanently,
/// shutdown state notwithstanding.
pub(crate) fn accept(session: &mut Session) -> TransportResult<()> {
    let mut phase = AcceptPhase::Idle;
    let mut failures = 0u32;

    loop {
        if session.shutting_down() {
            phase = AcceptPhase::ShuttingDown;
        }

        phase = match phase {
            AcceptPhase::Idle => AcceptPhase::ControlConnecting,

            AcceptPhase::ControlConnecting => {
                control::connect_and_register(session)?;
                AcceptPhase::Registered
            }

            AcceptPhase::Registered => AcceptPhase::AwaitingFd,

            AcceptPhase::AwaitingFd => match control::receive_fd(&session.shared) {
                Ok(fd) => {
                    if session.shutting_down() {
                        // Suppress further activity; the descriptor drops
                        // unused.
                        AcceptPhase::ShuttingDown
                    } else {
                        debug!(
                            fd = fd.as_raw_fd(),
                            "received debugger descriptor from relay daemon"
                        );
                        session.begin_client_session(fd);
                        AcceptPhase::Connected
                    }
                }
                Err(err) => {
                    failures += 1;
                    if failures >= session.config.receive_retry_limit {
                        warn!(attempts = failures, "relay connection max retries exceeded");
                        return Err(TransportError::RetriesExceeded { attempts: failures });
                    }
                    debug!(
                        error = %err,
                        attempt = failures,
                        "descriptor receive failed; reconnecting to relay daemon"
                    );
                    AcceptPhase::ControlConnecting
                }
            },

            AcceptPhase::Connected => return Ok(()),

            AcceptPhase::ShuttingDown => return Err(TransportError::ShuttingDown),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Session;
    use crate::TransportConfig;

    #[test]
    fn accept_fails_immediately_once_shutdown_was_requested() {
        // No daemon listens on this name; the shutdown check must win
        // before any connect attempt.
        let (mut session, handle) = Session::new(
            TransportConfig::builder().endpoint_name("jdwplink-acceptor-test").build(),
        )
        .unwrap();
        handle.request_shutdown();
        assert!(matches!(
            session.accept(),
            Err(TransportError::ShuttingDown)
        ));
        // And it stays that way on repeated calls.
        assert!(matches!(
            session.accept(),
            Err(TransportError::ShuttingDown)
        ));
    }
}
