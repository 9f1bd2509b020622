//! In-process gateway used by tests and the smoke runner.
//!
//! A connection with a stored session opens immediately; a connection
//! without one asks for pairing until [`LoopbackController::complete_pairing`]
//! is called. The controller can also inject disconnects, probe failures and
//! connect failures.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use relink_core::{DisconnectReason, GatewayEvent, Session};
use tokio::sync::mpsc;
use tracing::debug;

use crate::gateway::{
    ConnectRequest, GatewayConnection, GatewayConnector, GatewayError, GatewayHandle,
};

const EVENT_BUFFER: usize = 64;

#[derive(Default)]
struct LoopbackState {
    connection_id: u64,
    live: Option<mpsc::Sender<GatewayEvent>>,
    connects: usize,
    last_request: Option<ConnectRequest>,
    failing_connects: u32,
    probes_failing: bool,
    closes: u32,
    logouts: u32,
}

#[derive(Clone, Default)]
struct Shared {
    state: Arc<Mutex<LoopbackState>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        // A poisoned lock only means a test panicked mid-update.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Connector half handed to the runtime.
#[derive(Clone, Default)]
pub struct LoopbackGateway {
    shared: Shared,
}

/// Test-side remote control for a [`LoopbackGateway`].
#[derive(Clone)]
pub struct LoopbackController {
    shared: Shared,
}

impl LoopbackGateway {
    pub fn new() -> (Self, LoopbackController) {
        let gateway = Self::default();
        let controller = LoopbackController {
            shared: gateway.shared.clone(),
        };
        (gateway, controller)
    }
}

#[async_trait]
impl GatewayConnector for LoopbackGateway {
    async fn connect(&self, request: ConnectRequest) -> Result<GatewayConnection, GatewayError> {
        let mut state = self.shared.lock();
        state.connects += 1;
        state.last_request = Some(request.clone());
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(GatewayError::ConnectFailed("loopback refused".to_owned()));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let first = if request.session.is_some() {
            GatewayEvent::Open
        } else {
            GatewayEvent::PairingRequired
        };
        tx.try_send(first)
            .map_err(|err| GatewayError::ConnectFailed(err.to_string()))?;

        state.connection_id += 1;
        state.live = Some(tx);
        debug!(connection_id = state.connection_id, "loopback connection opened");
        Ok(GatewayConnection {
            events: rx,
            handle: Arc::new(LoopbackHandle {
                shared: self.shared.clone(),
                connection_id: state.connection_id,
            }),
        })
    }
}

struct LoopbackHandle {
    shared: Shared,
    connection_id: u64,
}

impl LoopbackHandle {
    fn drop_if_live(&self, state: &mut LoopbackState) {
        if state.connection_id == self.connection_id {
            state.live = None;
        }
    }
}

#[async_trait]
impl GatewayHandle for LoopbackHandle {
    async fn probe(&self) -> Result<(), GatewayError> {
        let state = self.shared.lock();
        if state.connection_id != self.connection_id || state.live.is_none() {
            return Err(GatewayError::Closed);
        }
        if state.probes_failing {
            return Err(GatewayError::ProbeFailed("no pong".to_owned()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), GatewayError> {
        let mut state = self.shared.lock();
        state.closes += 1;
        self.drop_if_live(&mut state);
        Ok(())
    }

    async fn logout(&self) -> Result<(), GatewayError> {
        let mut state = self.shared.lock();
        state.logouts += 1;
        self.drop_if_live(&mut state);
        Ok(())
    }
}

impl LoopbackController {
    fn send(&self, event: GatewayEvent) -> bool {
        self.shared
            .lock()
            .live
            .as_ref()
            .is_some_and(|tx| tx.try_send(event).is_ok())
    }

    /// Approve the pending pairing: credentials arrive, then the session opens.
    pub fn complete_pairing(&self, credential_blob: Vec<u8>, device_fingerprint: &str) -> bool {
        self.send(GatewayEvent::CredentialsUpdated {
            credential_blob,
            device_fingerprint: device_fingerprint.to_owned(),
        }) && self.send(GatewayEvent::Open)
    }

    /// Rotate credentials on the live connection.
    pub fn rotate_credentials(&self, credential_blob: Vec<u8>, device_fingerprint: &str) -> bool {
        self.send(GatewayEvent::CredentialsUpdated {
            credential_blob,
            device_fingerprint: device_fingerprint.to_owned(),
        })
    }

    /// Close the live connection from the remote side.
    pub fn disconnect(&self, reason: DisconnectReason) -> bool {
        let sent = self.send(GatewayEvent::Closed { reason });
        self.shared.lock().live = None;
        sent
    }

    /// End the event stream without a close event.
    pub fn drop_connection(&self) {
        self.shared.lock().live = None;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.shared.lock().failing_connects = count;
    }

    pub fn set_probes_failing(&self, failing: bool) {
        self.shared.lock().probes_failing = failing;
    }

    pub fn connect_count(&self) -> usize {
        self.shared.lock().connects
    }

    /// Session carried by the most recent connect request.
    pub fn last_session(&self) -> Option<Session> {
        self.shared
            .lock()
            .last_request
            .as_ref()
            .and_then(|request| request.session.clone())
    }

    pub fn close_count(&self) -> u32 {
        self.shared.lock().closes
    }

    pub fn logout_count(&self) -> u32 {
        self.shared.lock().logouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(session: Option<Session>) -> ConnectRequest {
        ConnectRequest {
            session,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn new_device_must_pair_before_open() {
        let (gateway, controller) = LoopbackGateway::new();
        let mut conn = gateway.connect(request(None)).await.expect("connect");

        assert_eq!(conn.events.recv().await, Some(GatewayEvent::PairingRequired));
        assert!(controller.complete_pairing(vec![9; 4], "fp"));
        assert!(matches!(
            conn.events.recv().await,
            Some(GatewayEvent::CredentialsUpdated { .. })
        ));
        assert_eq!(conn.events.recv().await, Some(GatewayEvent::Open));
    }

    #[tokio::test]
    async fn stored_session_opens_immediately() {
        let (gateway, controller) = LoopbackGateway::new();
        let session = Session::new(vec![1], "fp", 0);
        let mut conn = gateway
            .connect(request(Some(session.clone())))
            .await
            .expect("connect");

        assert_eq!(conn.events.recv().await, Some(GatewayEvent::Open));
        assert_eq!(controller.last_session(), Some(session));
    }

    #[tokio::test]
    async fn disconnect_delivers_reason_then_ends_stream() {
        let (gateway, controller) = LoopbackGateway::new();
        let mut conn = gateway
            .connect(request(Some(Session::new(vec![1], "fp", 0))))
            .await
            .expect("connect");
        conn.events.recv().await;

        assert!(controller.disconnect(DisconnectReason::RestartRequired));
        assert_eq!(
            conn.events.recv().await,
            Some(GatewayEvent::Closed {
                reason: DisconnectReason::RestartRequired
            })
        );
        assert_eq!(conn.events.recv().await, None);
    }

    #[tokio::test]
    async fn injected_failures_and_probe_state() {
        let (gateway, controller) = LoopbackGateway::new();
        controller.fail_next_connects(1);
        assert!(gateway.connect(request(None)).await.is_err());

        let conn = gateway.connect(request(None)).await.expect("second connect");
        conn.handle.probe().await.expect("healthy probe");

        controller.set_probes_failing(true);
        assert!(conn.handle.probe().await.is_err());

        conn.handle.close().await.expect("close");
        assert_eq!(conn.handle.probe().await, Err(GatewayError::Closed));
        assert_eq!(controller.connect_count(), 2);
        assert_eq!(controller.close_count(), 1);
    }

    #[tokio::test]
    async fn tracks_only_the_latest_request() {
        let (gateway, controller) = LoopbackGateway::new();
        controller.fail_next_connects(50);
        for _ in 0..50 {
            assert!(gateway.connect(request(None)).await.is_err());
        }
        assert_eq!(controller.last_session(), None);

        let session = Session::new(vec![7], "fp", 0);
        gateway
            .connect(request(Some(session.clone())))
            .await
            .expect("connect");
        assert_eq!(controller.connect_count(), 51);
        assert_eq!(controller.last_session(), Some(session));
    }
}
