//! Core connection lifecycle contract.
//!
//! This crate holds the pieces that never touch the network or disk: protocol
//! types, disconnect classification, backoff, pairing challenges, health
//! windows and the pure lifecycle state machine.

/// Async command/event channel primitives.
pub mod channel;
/// Lifecycle configuration with defaults and validation.
pub mod config;
/// Stable error types and the disconnect classification table.
pub mod error;
/// Probe sample window and escalation verdicts.
pub mod health;
/// Single-use pairing challenge tracking.
pub mod pairing;
/// Reconnect backoff policy.
pub mod retry;
/// Connection lifecycle state machine.
pub mod state_machine;
/// Presentation-facing protocol types (commands, events, records).
pub mod types;

pub use channel::{ChannelError, EventStream, RuntimeChannels};
pub use config::LifecycleConfig;
pub use error::{
    DisconnectClass, DisconnectReason, ErrorCategory, LifecycleError, classify_disconnect,
};
pub use health::{HealthVerdict, HealthWindow};
pub use pairing::PairingHandler;
pub use retry::BackoffPolicy;
pub use state_machine::{ConnectionStateMachine, LifecycleEffect, LifecycleEvent};
pub use types::{
    BackupRecord, ConnectionState, ConnectionStatus, GatewayEvent, HealthSample,
    PairingChallenge, RuntimeCommand, RuntimeEvent, Session,
};
