//! Async lifecycle runtime.
//!
//! [`spawn_runtime`] starts an actor that owns the state machine, the gateway
//! connection, timers, the health monitor and persistence. Presentation code
//! talks to it only through [`RuntimeHandle`].

pub mod clock;
pub mod gateway;
mod health;
pub mod loopback;
mod runtime;
mod task;
mod timer;

pub use clock::RuntimeClock;
pub use gateway::{
    ConnectRequest, GatewayConnection, GatewayConnector, GatewayError, GatewayHandle,
};
pub use loopback::{LoopbackController, LoopbackGateway};
pub use runtime::{RuntimeDeps, RuntimeHandle, spawn_runtime};
