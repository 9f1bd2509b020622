//! Capabilities consumed from the gateway client library.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use relink_core::{GatewayEvent, Session};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway connect failed: {0}")]
    ConnectFailed(String),
    #[error("gateway call timed out")]
    Timeout,
    #[error("gateway probe failed: {0}")]
    ProbeFailed(String),
    #[error("gateway connection already closed")]
    Closed,
}

/// Input to one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Stored session to resume; `None` asks the gateway for a new pairing.
    pub session: Option<Session>,
    /// Reconnect attempts since the last successful open.
    pub attempt: u32,
}

/// Control surface of one live gateway connection.
#[async_trait]
pub trait GatewayHandle: Send + Sync {
    /// Lightweight liveness call used by the health monitor.
    async fn probe(&self) -> Result<(), GatewayError>;

    /// Close the transport without revoking credentials.
    async fn close(&self) -> Result<(), GatewayError>;

    /// Revoke the session remotely.
    async fn logout(&self) -> Result<(), GatewayError>;
}

/// Opened connection: its event stream plus the handle controlling it.
pub struct GatewayConnection {
    pub events: mpsc::Receiver<GatewayEvent>,
    pub handle: Arc<dyn GatewayHandle>,
}

impl fmt::Debug for GatewayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConnection").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait GatewayConnector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<GatewayConnection, GatewayError>;
}
