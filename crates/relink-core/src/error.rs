use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for operator handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network blip, server restart or rate limit; retried with backoff.
    Transient,
    /// Credentials revoked or session replaced; wiped and re-paired.
    Terminal,
    /// Persisted credentials failed structural or checksum validation.
    CorruptData,
    /// Local persistence failure.
    Io,
    /// Bounded retry budget used up.
    ExhaustedRetries,
    /// Invalid configuration or unsupported request.
    Config,
    /// Invariant break inside the runtime.
    Internal,
}

/// Stable lifecycle error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct LifecycleError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl LifecycleError {
    /// Construct a new lifecycle error.
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while connection is {}", current.as_str()),
        )
    }

    /// Build the fatal error surfaced when bounded retries are used up.
    pub fn exhausted_retries(attempts: u32, last_reason: &DisconnectReason) -> Self {
        Self::new(
            ErrorCategory::ExhaustedRetries,
            "retries_exhausted",
            format!(
                "gave up after {attempts} reconnect attempts; last disconnect: {}",
                last_reason.code()
            ),
        )
    }

    /// Build a configuration validation error.
    pub fn invalid_config(key: &str, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::Config,
            "invalid_config",
            format!("invalid {key}: {}", reason.into()),
        )
    }

    /// Whether an automatic retry may recover from this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category, ErrorCategory::Transient | ErrorCategory::Io)
    }
}

/// Outcome of disconnect classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DisconnectClass {
    /// Retry with backoff, keep credentials.
    Transient,
    /// Wipe credentials and start a fresh pairing.
    Terminal,
}

/// Typed disconnect reason reported by the gateway client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Remote closed the socket without a more specific reason.
    ConnectionClosed,
    /// Transport dropped.
    ConnectionLost,
    /// Open or handshake did not complete in time.
    TimedOut,
    /// Remote asked for a reconnect (for example after a server restart).
    RestartRequired,
    /// Remote service temporarily unavailable.
    ServiceUnavailable,
    /// Rate limited, optionally with a server-provided wait.
    RateLimited {
        /// Server retry hint in milliseconds.
        retry_after_ms: Option<u64>,
    },
    /// Remote rejected the session state; retried with the same credentials.
    BadSession,
    /// Remote reported a device/protocol mismatch.
    DeviceMismatch,
    /// Local health probes escalated; the gateway itself reported nothing.
    HealthProbeFailed,
    /// Credentials explicitly revoked by the remote party.
    LoggedOut,
    /// Remote refused the credentials.
    Forbidden,
    /// Another client instance took over this session.
    ConnectionReplaced,
    /// Status code outside the known table.
    Unrecognized {
        /// Raw remote status code.
        status: u16,
    },
}

impl DisconnectReason {
    /// Map a raw gateway status code to a typed reason.
    pub fn from_status_code(status: u16) -> Self {
        match status {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::ConnectionLost,
            411 => Self::DeviceMismatch,
            428 => Self::ConnectionClosed,
            429 => Self::RateLimited {
                retry_after_ms: None,
            },
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::ServiceUnavailable,
            515 => Self::RestartRequired,
            status => Self::Unrecognized { status },
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionLost => "connection_lost",
            Self::TimedOut => "timed_out",
            Self::RestartRequired => "restart_required",
            Self::ServiceUnavailable => "service_unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::BadSession => "bad_session",
            Self::DeviceMismatch => "device_mismatch",
            Self::HealthProbeFailed => "health_probe_failed",
            Self::LoggedOut => "logged_out",
            Self::Forbidden => "forbidden",
            Self::ConnectionReplaced => "connection_replaced",
            Self::Unrecognized { .. } => "unrecognized_status",
        }
    }

    /// Server-provided wait hint, when present.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}

/// Classify a disconnect reason.
///
/// Only explicit revocation and session takeover are terminal; anything
/// unrecognized is retried rather than wiping credentials.
pub fn classify_disconnect(reason: &DisconnectReason) -> DisconnectClass {
    match reason {
        DisconnectReason::LoggedOut
        | DisconnectReason::Forbidden
        | DisconnectReason::ConnectionReplaced => DisconnectClass::Terminal,
        DisconnectReason::ConnectionClosed
        | DisconnectReason::ConnectionLost
        | DisconnectReason::TimedOut
        | DisconnectReason::RestartRequired
        | DisconnectReason::ServiceUnavailable
        | DisconnectReason::RateLimited { .. }
        | DisconnectReason::BadSession
        | DisconnectReason::DeviceMismatch
        | DisconnectReason::HealthProbeFailed
        | DisconnectReason::Unrecognized { .. } => DisconnectClass::Transient,
    }
}
