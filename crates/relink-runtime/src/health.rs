use std::{sync::Arc, time::Duration};

use relink_core::{HealthSample, HealthVerdict, HealthWindow};
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{clock::RuntimeClock, gateway::GatewayHandle, task::RunningTask};

#[derive(Debug, Clone, Copy)]
pub(crate) struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub window_size: usize,
}

/// Probe outcome forwarded to the runtime; only non-healthy verdicts are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProbeReport {
    pub generation: u64,
    pub verdict: HealthVerdict,
}

/// Periodically probe `handle` until stopped or escalated.
///
/// The first probe runs one full interval after start. The task exits right
/// after reporting an escalation.
pub(crate) fn spawn_health_monitor(
    parent: &CancellationToken,
    handle: Arc<dyn GatewayHandle>,
    generation: u64,
    settings: ProbeSettings,
    clock: RuntimeClock,
    reports: mpsc::UnboundedSender<ProbeReport>,
) -> RunningTask {
    RunningTask::spawn(parent, move |stop| async move {
        let mut window = HealthWindow::new(settings.window_size, settings.failure_threshold);
        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = stop.cancelled() => break,
                outcome = tokio::time::timeout(settings.timeout, handle.probe()) => outcome,
            };
            let success = matches!(outcome, Ok(Ok(())));
            match &outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(generation, error = %err, "health probe failed"),
                Err(_) => debug!(generation, "health probe timed out"),
            }

            let verdict = window.record(HealthSample {
                timestamp_ms: clock.now_ms(),
                success,
                latency_ms: success.then(|| started.elapsed().as_millis() as u64),
            });
            if verdict == HealthVerdict::Healthy {
                continue;
            }
            if let HealthVerdict::Escalate {
                consecutive_failures,
            } = verdict
            {
                warn!(generation, consecutive_failures, "health probes escalated");
            }
            if reports.send(ProbeReport { generation, verdict }).is_err()
                || matches!(verdict, HealthVerdict::Escalate { .. })
            {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::gateway::GatewayError;

    #[derive(Default)]
    struct ScriptedHandle {
        unhealthy: AtomicBool,
        probes: AtomicU32,
    }

    #[async_trait]
    impl GatewayHandle for ScriptedHandle {
        async fn probe(&self) -> Result<(), GatewayError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.unhealthy.load(Ordering::SeqCst) {
                Err(GatewayError::ProbeFailed("no pong".into()))
            } else {
                Ok(())
            }
        }

        async fn close(&self) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn logout(&self) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    fn settings() -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(200),
            failure_threshold: 3,
            window_size: 8,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reports_degradation_then_escalation() {
        let root = CancellationToken::new();
        let handle = Arc::new(ScriptedHandle::default());
        handle.unhealthy.store(true, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = spawn_health_monitor(
            &root,
            handle.clone(),
            7,
            settings(),
            RuntimeClock::new(),
            tx,
        );

        let mut verdicts = Vec::new();
        while let Some(report) = rx.recv().await {
            assert_eq!(report.generation, 7);
            verdicts.push(report.verdict);
        }
        assert_eq!(
            verdicts,
            vec![
                HealthVerdict::Degraded {
                    consecutive_failures: 1
                },
                HealthVerdict::Degraded {
                    consecutive_failures: 2
                },
                HealthVerdict::Escalate {
                    consecutive_failures: 3
                },
            ]
        );
        assert_eq!(handle.probes.load(Ordering::SeqCst), 3);
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_probes_send_nothing_and_stop_on_cancel() {
        let root = CancellationToken::new();
        let handle = Arc::new(ScriptedHandle::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = spawn_health_monitor(
            &root,
            handle.clone(),
            1,
            settings(),
            RuntimeClock::new(),
            tx,
        );
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(handle.probes.load(Ordering::SeqCst), 5);
        assert!(rx.try_recv().is_err());

        task.stop().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.probes.load(Ordering::SeqCst), 5);
    }
}
