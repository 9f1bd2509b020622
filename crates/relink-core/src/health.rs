use std::collections::VecDeque;

use crate::types::HealthSample;

/// Result of recording one probe sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Degraded { consecutive_failures: u32 },
    /// Threshold reached; the connection should be treated as dead.
    Escalate { consecutive_failures: u32 },
}

/// Bounded ring buffer of probe samples with consecutive-failure tracking.
#[derive(Debug, Clone)]
pub struct HealthWindow {
    samples: VecDeque<HealthSample>,
    capacity: usize,
    failure_threshold: u32,
    consecutive_failures: u32,
}

impl HealthWindow {
    pub fn new(capacity: usize, failure_threshold: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn record(&mut self, sample: HealthSample) -> HealthVerdict {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        if sample.success {
            self.consecutive_failures = 0;
            return HealthVerdict::Healthy;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.failure_threshold {
            HealthVerdict::Escalate {
                consecutive_failures: self.consecutive_failures,
            }
        } else {
            HealthVerdict::Degraded {
                consecutive_failures: self.consecutive_failures,
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn samples(&self) -> impl Iterator<Item = &HealthSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
