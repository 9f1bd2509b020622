use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Background task paired with the token that stops it.
///
/// Dropping the value cancels the task.
#[derive(Debug)]
pub(crate) struct RunningTask {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RunningTask {
    /// Spawn `body` with a child token of `parent`.
    pub(crate) fn spawn<F, Fut>(parent: &CancellationToken, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = parent.child_token();
        let task = tokio::spawn(body(stop.clone()));
        Self {
            stop,
            task: Some(task),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancel and wait for the task to wind down.
    pub(crate) async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
