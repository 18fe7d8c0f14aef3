// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Cross-thread cancellation.
//!
//! Closing a descriptor does not wake a thread parked in `poll`, so shutdown
//! uses three cooperating signals: the `shutting_down` flag (observed at
//! loop boundaries), bidirectional descriptor shutdown (unblocks reads and
//! receives), and one byte down the wake pipe (the only mechanism guaranteed
//! to wake the readiness wait itself).

use std::sync::Arc;

use tracing::debug;

use crate::fdio;
use crate::state::Shared;

/// Owner-thread handle to a running session.
///
/// Cheap to clone, callable from any thread, idempotent. The handle only
/// ever narrows capability: it shuts descriptors down, never reopens them.
/// Actual closing happens at teardown, when the last owner of the session
/// core (this handle or the worker's `Session`) is dropped — which the
/// surrounding lifecycle must delay until the worker thread has been joined.
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Request shutdown and wake the worker out of any blocking wait.
    pub fn request_shutdown(&self) {
        self.shared
            .shutting_down
            .store(true, std::sync::atomic::Ordering::Relaxed);

        let mut fds = self.shared.fds.lock().unwrap();
        fds.park_client();
        fds.park_control();
        if let Some(wake_tx) = fds.wake_tx_raw() {
            debug!("waking the readiness wait for shutdown");
            let _ = fdio::write_all(wake_tx, &[0u8]);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down()
    }
}

#[cfg(test)]
mod tests {
    use crate::state::Session;
    use crate::TransportConfig;

    #[test]
    fn shutdown_is_idempotent_and_visible() {
        let (session, handle) = Session::new(
            TransportConfig::builder().endpoint_name("jdwplink-shutdown-test").build(),
        )
        .unwrap();
        assert!(!handle.is_shutting_down());

        handle.request_shutdown();
        handle.request_shutdown();
        assert!(handle.is_shutting_down());
        assert!(session.shutting_down());

        // The wake pipe carries the wake-up bytes (one per request).
        let wake_rx = session.shared.fds.lock().unwrap().wake_rx_raw().unwrap();
        let mut buf = [0u8; 8];
        let n = crate::fdio::read_once(wake_rx, &mut buf).unwrap();
        assert!(n >= 1);
    }

    #[test]
    fn shutdown_parks_live_descriptors_once() {
        let (session, handle) = Session::new(
            TransportConfig::builder().endpoint_name("jdwplink-shutdown-park").build(),
        )
        .unwrap();
        let (a, _b) = crate::test_support::socketpair();
        session.shared.fds.lock().unwrap().client = Some(a);
        assert!(session.is_connected());

        handle.request_shutdown();
        assert!(!session.is_connected());
        // A second request finds nothing left to park and must not panic.
        handle.request_shutdown();
    }
}
