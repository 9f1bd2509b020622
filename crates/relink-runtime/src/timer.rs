use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::task::RunningTask;

/// At most one armed one-shot timer.
///
/// Arming replaces whatever was armed before. Each arm gets a sequence
/// number so a message from a replaced timer that was already queued can be
/// recognized and dropped.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    armed: Option<(u64, RunningTask)>,
    sequence: u64,
}

impl TimerSlot {
    /// Arm the timer, cancelling any previous one. Returns the new sequence.
    ///
    /// `make_message` receives the sequence and builds what is sent on expiry.
    pub(crate) fn arm<M, F>(
        &mut self,
        parent: &CancellationToken,
        delay: Duration,
        sender: mpsc::UnboundedSender<M>,
        make_message: F,
    ) -> u64
    where
        M: Send + 'static,
        F: FnOnce(u64) -> M + Send + 'static,
    {
        self.cancel();
        self.sequence = self.sequence.wrapping_add(1);
        let sequence = self.sequence;
        let task = RunningTask::spawn(parent, move |stop| async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = sender.send(make_message(sequence));
                }
            }
        });
        self.armed = Some((sequence, task));
        sequence
    }

    /// Disarm. Returns whether a timer was pending.
    pub(crate) fn cancel(&mut self) -> bool {
        self.armed
            .take()
            .is_some_and(|(_, task)| !task.is_finished())
    }

    /// Accept an expiry message: `true` only for the currently armed timer.
    pub(crate) fn take_fired(&mut self, sequence: u64) -> bool {
        match &self.armed {
            Some((armed, _)) if *armed == sequence => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}
