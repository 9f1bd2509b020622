use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DisconnectReason;

/// Connection lifecycle state reported to presentation layers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Runtime has not been started, or was stopped/logged out.
    Idle,
    /// A gateway connection attempt is in flight.
    Connecting,
    /// Gateway asked for a fresh pairing; a challenge is published.
    AwaitingPairing,
    /// Gateway session is open and authenticated.
    Connected,
    /// Waiting for the backoff timer before the next attempt.
    Reconnecting,
    /// Parked: either passing through a credential wipe or out of retries.
    Terminated,
}

impl ConnectionState {
    /// Stable lowercase name used in logs and status output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingPairing => "awaiting_pairing",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Terminated => "terminated",
        }
    }
}

/// Durable authenticated material needed to reconnect without pairing again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Locally generated session identifier.
    pub id: String,
    /// Opaque credential bytes handed out by the gateway client.
    pub credential_blob: Vec<u8>,
    /// Device fingerprint reported alongside the credentials.
    pub device_fingerprint: String,
    /// Creation time in milliseconds since Unix epoch.
    pub created_at_ms: u64,
    /// Last credential update in milliseconds since Unix epoch.
    pub last_updated_at_ms: u64,
}

impl Session {
    /// Create a brand new session from the first credential-bearing event.
    pub fn new(
        credential_blob: Vec<u8>,
        device_fingerprint: impl Into<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            credential_blob,
            device_fingerprint: device_fingerprint.into(),
            created_at_ms: now_ms,
            last_updated_at_ms: now_ms,
        }
    }

    /// Replace credential material while keeping identity and creation time.
    pub fn with_credentials(
        mut self,
        credential_blob: Vec<u8>,
        device_fingerprint: impl Into<String>,
        now_ms: u64,
    ) -> Self {
        self.credential_blob = credential_blob;
        self.device_fingerprint = device_fingerprint.into();
        self.last_updated_at_ms = now_ms.max(self.created_at_ms);
        self
    }
}

/// Metadata for one verified backup replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupRecord {
    /// Write time in milliseconds since Unix epoch; strictly increasing per location.
    pub timestamp_ms: u64,
    /// Absolute path of the replica file.
    pub location: PathBuf,
    /// Hex SHA-256 of the sealed session payload.
    pub checksum: String,
    /// Session the replica was taken from.
    pub source_session_id: String,
}

/// Short-lived, single-use token shown to a human to authorize a new session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingChallenge {
    pub token: String,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
    pub consumed: bool,
}

impl PairingChallenge {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Neither consumed nor expired.
    pub fn is_live(&self, now_ms: u64) -> bool {
        !self.consumed && !self.is_expired(now_ms)
    }
}

/// One liveness probe outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthSample {
    pub timestamp_ms: u64,
    pub success: bool,
    pub latency_ms: Option<u64>,
}

/// Events produced by the gateway client library.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Remote side needs a new pairing before it will open a session.
    PairingRequired,
    /// Session is open.
    Open,
    /// Connection closed with the given reason.
    Closed {
        /// Remote-side disconnect reason.
        reason: DisconnectReason,
    },
    /// Gateway rotated or issued credential material.
    CredentialsUpdated {
        /// Opaque credential bytes.
        credential_blob: Vec<u8>,
        /// Device fingerprint bound to the credentials.
        device_fingerprint: String,
    },
}

/// Operator commands accepted by the lifecycle runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuntimeCommand {
    /// Leave `Idle` and bring the session up.
    Start,
    /// Log out remotely, archive the session and park in `Idle`.
    Logout,
}

/// Point-in-time status for `getStatus()` style consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Reconnect attempts since the last successful open.
    pub retry_count: u32,
    /// Time spent in `Connected`, when connected.
    pub uptime_ms: Option<u64>,
    /// Timestamp of the last transition in milliseconds since Unix epoch.
    pub since_ms: u64,
    /// Stable code of the most recent fatal error, if any.
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            retry_count: 0,
            uptime_ms: None,
            since_ms: 0,
            last_error: None,
        }
    }
}

/// Event channel output emitted by the lifecycle runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// Lifecycle transition.
    StateChanged {
        /// New lifecycle state.
        state: ConnectionState,
        /// Retry counter after the transition.
        retry_count: u32,
    },
    /// A new pairing challenge must be shown to the operator.
    PairingChallenge(PairingChallenge),
    /// Reconnect timer armed.
    ReconnectScheduled {
        /// 0-based attempt the delay was computed for.
        attempt: u32,
        /// Delay until the next attempt.
        delay_ms: u64,
    },
    /// Credentials were revoked remotely and wiped locally.
    SessionRevoked {
        /// Id of the wiped session when one was known.
        session_id: Option<String>,
        /// Stable disconnect reason code.
        reason: String,
    },
    /// Snapshot written and verified in at least one location.
    BackupCompleted {
        /// Records created by this snapshot.
        records: Vec<BackupRecord>,
    },
    /// Snapshot skipped or failed for this cycle.
    BackupFailed {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// Probe failures observed but below the escalation threshold.
    HealthDegraded {
        /// Consecutive failures so far.
        consecutive_failures: u32,
    },
    /// Credential store read/write failed; lifecycle continues.
    StorageError {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// Operator-visible error.
    FatalError {
        /// Stable error code.
        code: String,
        /// Human-readable error message.
        message: String,
        /// Indicates whether retrying may recover.
        recoverable: bool,
    },
}
