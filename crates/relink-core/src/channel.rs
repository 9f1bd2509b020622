use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{RuntimeCommand, RuntimeEvent};

/// Lifecycle events as seen by one subscriber: state changes, pairing
/// challenges, backup and storage outcomes.
pub type EventStream = broadcast::Receiver<RuntimeEvent>;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The runtime actor has exited and dropped its command queue.
    #[error("lifecycle runtime has stopped")]
    RuntimeStopped,
}

/// Start/logout requests flow in over a bounded queue; lifecycle events
/// fan out to every subscriber.
#[derive(Clone, Debug)]
pub struct RuntimeChannels {
    command_tx: mpsc::Sender<RuntimeCommand>,
    event_tx: broadcast::Sender<RuntimeEvent>,
}

impl RuntimeChannels {
    /// Returns the shared half plus the command queue the runtime drains.
    /// Buffers of zero are bumped to one.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<RuntimeCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Queue a command, waiting for space when the runtime is busy.
    pub async fn send_command(&self, command: RuntimeCommand) -> Result<(), ChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ChannelError::RuntimeStopped)
    }

    /// Publish a lifecycle event. Never blocks the runtime: events with no
    /// subscriber are dropped and a subscriber that falls behind sees
    /// `Lagged` on its next receive.
    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.event_tx.send(event);
    }
}
