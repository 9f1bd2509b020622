use crate::{
    error::{DisconnectClass, DisconnectReason, LifecycleError, classify_disconnect},
    types::{ConnectionState, GatewayEvent},
};

/// Inputs the state machine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Operator asked to bring the connection up.
    Start,
    /// Event from the current gateway connection.
    Gateway(GatewayEvent),
    /// The armed reconnect timer fired.
    ReconnectTimerFired,
    /// The live pairing challenge timed out.
    ChallengeExpired,
    /// Health probes crossed the failure threshold.
    HealthEscalated,
    /// Operator asked for a remote logout.
    Logout,
    /// Process is stopping.
    Shutdown,
}

impl LifecycleEvent {
    fn action(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Gateway(GatewayEvent::PairingRequired) => "pairing_required",
            Self::Gateway(GatewayEvent::Open) => "open",
            Self::Gateway(GatewayEvent::Closed { .. }) => "closed",
            Self::Gateway(GatewayEvent::CredentialsUpdated { .. }) => "credentials_updated",
            Self::ReconnectTimerFired => "reconnect_timer",
            Self::ChallengeExpired => "challenge_expired",
            Self::HealthEscalated => "health_escalated",
            Self::Logout => "logout",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Side effects requested by a transition, executed in order by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEffect {
    /// Marker for a state change; subscribers are notified at this point.
    EnterState(ConnectionState),
    LoadSession,
    OpenGateway,
    CloseGateway,
    LogoutGateway,
    /// Publish the live challenge, issuing one only if none is live.
    EnsureChallenge,
    /// Issue a new challenge, superseding any previous one.
    IssueChallenge,
    ConsumeChallenge,
    InvalidateChallenge,
    StartHealthMonitor,
    StopHealthMonitor,
    TriggerBackup,
    ScheduleReconnect {
        attempt: u32,
        retry_after_ms: Option<u64>,
    },
    CancelReconnect,
    PersistCredentials {
        credential_blob: Vec<u8>,
        device_fingerprint: String,
    },
    /// Wipe the stored session after a terminal disconnect.
    ClearCredentials { reason: DisconnectReason },
    ArchiveSession,
    ReportFatal(LifecycleError),
}

/// Pure connection lifecycle state machine.
///
/// `apply` never performs I/O. It mutates the state and returns the effects
/// the caller must run, so every transition can be tested without a gateway.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    retry_count: u32,
    max_retries: Option<u32>,
    entered_at_ms: u64,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ConnectionStateMachine {
    /// `max_retries: None` retries forever.
    pub fn new(max_retries: Option<u32>) -> Self {
        Self {
            state: ConnectionState::Idle,
            retry_count: 0,
            max_retries,
            entered_at_ms: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Timestamp of the last state change.
    pub fn entered_at_ms(&self) -> u64 {
        self.entered_at_ms
    }

    pub fn apply(
        &mut self,
        event: &LifecycleEvent,
        now_ms: u64,
    ) -> Result<Vec<LifecycleEffect>, LifecycleError> {
        use ConnectionState::*;
        use LifecycleEffect as E;

        let effects = match (self.state, event) {
            (Idle | Terminated, LifecycleEvent::Start) => {
                self.retry_count = 0;
                vec![E::EnterState(Connecting), E::LoadSession, E::OpenGateway]
            }

            (Connecting, LifecycleEvent::Gateway(GatewayEvent::PairingRequired)) => {
                vec![E::EnterState(AwaitingPairing), E::EnsureChallenge]
            }
            (AwaitingPairing, LifecycleEvent::Gateway(GatewayEvent::PairingRequired)) => {
                vec![E::EnsureChallenge]
            }

            (Connecting, LifecycleEvent::Gateway(GatewayEvent::Open)) => vec![
                E::EnterState(Connected),
                E::CancelReconnect,
                E::InvalidateChallenge,
                E::StartHealthMonitor,
                E::TriggerBackup,
            ],
            (AwaitingPairing, LifecycleEvent::Gateway(GatewayEvent::Open)) => vec![
                E::EnterState(Connected),
                E::ConsumeChallenge,
                E::StartHealthMonitor,
                E::TriggerBackup,
            ],
            (Connected, LifecycleEvent::Gateway(GatewayEvent::Open)) => Vec::new(),

            (
                Connecting | AwaitingPairing | Connected,
                LifecycleEvent::Gateway(GatewayEvent::Closed { reason }),
            ) => self.on_disconnect(reason),
            // Late close from a connection we already gave up on.
            (_, LifecycleEvent::Gateway(GatewayEvent::Closed { .. })) => Vec::new(),

            (
                Connecting | AwaitingPairing | Connected,
                LifecycleEvent::Gateway(GatewayEvent::CredentialsUpdated {
                    credential_blob,
                    device_fingerprint,
                }),
            ) => vec![E::PersistCredentials {
                credential_blob: credential_blob.clone(),
                device_fingerprint: device_fingerprint.clone(),
            }],

            (Reconnecting, LifecycleEvent::ReconnectTimerFired) => {
                self.retry_count = self.retry_count.saturating_add(1);
                vec![E::EnterState(Connecting), E::OpenGateway]
            }
            (_, LifecycleEvent::ReconnectTimerFired) => Vec::new(),

            (AwaitingPairing, LifecycleEvent::ChallengeExpired) => vec![E::IssueChallenge],
            (_, LifecycleEvent::ChallengeExpired) => vec![E::InvalidateChallenge],

            (Connected, LifecycleEvent::HealthEscalated) => {
                self.on_disconnect(&DisconnectReason::HealthProbeFailed)
            }
            (_, LifecycleEvent::HealthEscalated) => Vec::new(),

            (Idle, LifecycleEvent::Shutdown) => Vec::new(),
            (_, LifecycleEvent::Shutdown) => vec![
                E::StopHealthMonitor,
                E::CancelReconnect,
                E::InvalidateChallenge,
                E::CloseGateway,
                E::TriggerBackup,
                E::EnterState(Idle),
            ],

            (Idle, LifecycleEvent::Logout) => {
                return Err(LifecycleError::invalid_state(self.state, "logout"));
            }
            (_, LifecycleEvent::Logout) => {
                self.retry_count = 0;
                vec![
                    E::StopHealthMonitor,
                    E::CancelReconnect,
                    E::InvalidateChallenge,
                    E::LogoutGateway,
                    E::ArchiveSession,
                    E::EnterState(Idle),
                ]
            }

            (state, event) => {
                return Err(LifecycleError::invalid_state(state, event.action()));
            }
        };

        for effect in &effects {
            if let LifecycleEffect::EnterState(next) = effect {
                self.enter(*next, now_ms);
            }
        }
        Ok(effects)
    }

    fn on_disconnect(&mut self, reason: &DisconnectReason) -> Vec<LifecycleEffect> {
        use ConnectionState::*;
        use LifecycleEffect as E;

        match classify_disconnect(reason) {
            DisconnectClass::Transient => {
                let mut effects = vec![E::StopHealthMonitor, E::CloseGateway];
                if let Some(max) = self.max_retries
                    && self.retry_count >= max
                {
                    effects.extend([
                        E::InvalidateChallenge,
                        E::EnterState(Terminated),
                        E::ReportFatal(LifecycleError::exhausted_retries(self.retry_count, reason)),
                    ]);
                    return effects;
                }
                effects.extend([
                    E::EnterState(Reconnecting),
                    E::ScheduleReconnect {
                        attempt: self.retry_count,
                        retry_after_ms: reason.retry_after_ms(),
                    },
                ]);
                effects
            }
            DisconnectClass::Terminal => {
                self.retry_count = 0;
                vec![
                    E::StopHealthMonitor,
                    E::CancelReconnect,
                    E::CloseGateway,
                    E::EnterState(Terminated),
                    E::ClearCredentials {
                        reason: reason.clone(),
                    },
                    E::IssueChallenge,
                    E::EnterState(Connecting),
                    E::OpenGateway,
                ]
            }
        }
    }

    fn enter(&mut self, next: ConnectionState, now_ms: u64) {
        if next == ConnectionState::Connected {
            self.retry_count = 0;
        }
        self.state = next;
        self.entered_at_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(reason: DisconnectReason) -> LifecycleEvent {
        LifecycleEvent::Gateway(GatewayEvent::Closed { reason })
    }

    fn connected(sm: &mut ConnectionStateMachine) {
        sm.apply(&LifecycleEvent::Start, 0).expect("start from idle");
        sm.apply(&LifecycleEvent::Gateway(GatewayEvent::Open), 1)
            .expect("open while connecting");
        assert_eq!(sm.state(), ConnectionState::Connected);
    }

    fn states(effects: &[LifecycleEffect]) -> Vec<ConnectionState> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                LifecycleEffect::EnterState(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn start_loads_session_and_opens_gateway() {
        let mut sm = ConnectionStateMachine::default();
        let effects = sm.apply(&LifecycleEvent::Start, 5).expect("start from idle");

        assert_eq!(
            effects,
            vec![
                LifecycleEffect::EnterState(ConnectionState::Connecting),
                LifecycleEffect::LoadSession,
                LifecycleEffect::OpenGateway,
            ]
        );
        assert_eq!(sm.entered_at_ms(), 5);
    }

    #[test]
    fn rejects_start_when_not_idle() {
        let mut sm = ConnectionStateMachine::default();
        connected(&mut sm);

        let err = sm
            .apply(&LifecycleEvent::Start, 2)
            .expect_err("start while connected must fail");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(sm.state(), ConnectionState::Connected);
    }

    #[test]
    fn pairing_flow_consumes_challenge_on_open() {
        let mut sm = ConnectionStateMachine::default();
        sm.apply(&LifecycleEvent::Start, 0).expect("start");

        let effects = sm
            .apply(&LifecycleEvent::Gateway(GatewayEvent::PairingRequired), 1)
            .expect("pairing required while connecting");
        assert_eq!(sm.state(), ConnectionState::AwaitingPairing);
        assert!(effects.contains(&LifecycleEffect::EnsureChallenge));

        let effects = sm
            .apply(&LifecycleEvent::Gateway(GatewayEvent::Open), 2)
            .expect("open after pairing");
        assert_eq!(sm.state(), ConnectionState::Connected);
        assert!(effects.contains(&LifecycleEffect::ConsumeChallenge));
        assert!(effects.contains(&LifecycleEffect::StartHealthMonitor));
        assert!(effects.contains(&LifecycleEffect::TriggerBackup));
    }

    #[test]
    fn transient_disconnect_schedules_reconnect() {
        let mut sm = ConnectionStateMachine::default();
        connected(&mut sm);

        let effects = sm
            .apply(&closed(DisconnectReason::ConnectionLost), 10)
            .expect("closed while connected");
        assert_eq!(sm.state(), ConnectionState::Reconnecting);
        assert!(effects.contains(&LifecycleEffect::ScheduleReconnect {
            attempt: 0,
            retry_after_ms: None,
        }));

        let effects = sm
            .apply(&LifecycleEvent::ReconnectTimerFired, 2_500)
            .expect("timer fires while reconnecting");
        assert_eq!(sm.state(), ConnectionState::Connecting);
        assert_eq!(sm.retry_count(), 1);
        assert!(effects.contains(&LifecycleEffect::OpenGateway));
    }

    #[test]
    fn rate_limit_hint_is_forwarded_to_scheduler() {
        let mut sm = ConnectionStateMachine::default();
        connected(&mut sm);

        let effects = sm
            .apply(
                &closed(DisconnectReason::RateLimited {
                    retry_after_ms: Some(15_000),
                }),
                10,
            )
            .expect("rate limited close");
        assert!(effects.contains(&LifecycleEffect::ScheduleReconnect {
            attempt: 0,
            retry_after_ms: Some(15_000),
        }));
    }

    #[test]
    fn terminal_disconnect_wipes_credentials_before_reopening() {
        let mut sm = ConnectionStateMachine::default();
        sm.apply(&LifecycleEvent::Start, 0).expect("start");
        sm.apply(&closed(DisconnectReason::ConnectionLost), 1)
            .expect("first failure");
        sm.apply(&LifecycleEvent::ReconnectTimerFired, 2)
            .expect("retry");
        sm.apply(&LifecycleEvent::Gateway(GatewayEvent::Open), 3)
            .expect("open");

        let effects = sm
            .apply(&closed(DisconnectReason::LoggedOut), 4)
            .expect("terminal close");

        let clears = effects
            .iter()
            .filter(|effect| matches!(effect, LifecycleEffect::ClearCredentials { .. }))
            .count();
        assert_eq!(clears, 1);

        let clear_at = effects
            .iter()
            .position(|effect| matches!(effect, LifecycleEffect::ClearCredentials { .. }))
            .expect("clear effect present");
        let issue_at = effects
            .iter()
            .position(|effect| *effect == LifecycleEffect::IssueChallenge)
            .expect("challenge issued in the same transition");
        let open_at = effects
            .iter()
            .position(|effect| *effect == LifecycleEffect::OpenGateway)
            .expect("gateway reopened");
        assert!(clear_at < issue_at && issue_at < open_at);

        assert_eq!(
            states(&effects),
            vec![ConnectionState::Terminated, ConnectionState::Connecting]
        );
        assert_eq!(sm.state(), ConnectionState::Connecting);
        assert_eq!(sm.retry_count(), 0);
    }

    #[test]
    fn bounded_retries_park_in_terminated_with_fatal_error() {
        let mut sm = ConnectionStateMachine::new(Some(2));
        sm.apply(&LifecycleEvent::Start, 0).expect("start");

        for attempt in 0..2 {
            let effects = sm
                .apply(&closed(DisconnectReason::ServiceUnavailable), 1)
                .expect("transient close");
            assert!(effects.contains(&LifecycleEffect::ScheduleReconnect {
                attempt,
                retry_after_ms: None,
            }));
            sm.apply(&LifecycleEvent::ReconnectTimerFired, 2)
                .expect("timer");
        }

        let effects = sm
            .apply(&closed(DisconnectReason::ServiceUnavailable), 3)
            .expect("final close");
        assert_eq!(sm.state(), ConnectionState::Terminated);
        let fatal = effects.iter().find_map(|effect| match effect {
            LifecycleEffect::ReportFatal(err) => Some(err),
            _ => None,
        });
        assert_eq!(
            fatal.map(|err| err.code.as_str()),
            Some("retries_exhausted")
        );
        assert!(
            !effects
                .iter()
                .any(|effect| matches!(effect, LifecycleEffect::ScheduleReconnect { .. }))
        );

        // Parked: timers and late closes do nothing.
        assert!(
            sm.apply(&LifecycleEvent::ReconnectTimerFired, 4)
                .expect("ignored")
                .is_empty()
        );
        assert!(
            sm.apply(&closed(DisconnectReason::ConnectionLost), 5)
                .expect("ignored")
                .is_empty()
        );
        assert_eq!(sm.state(), ConnectionState::Terminated);
    }

    #[test]
    fn operator_can_restart_after_exhaustion() {
        let mut sm = ConnectionStateMachine::new(Some(0));
        sm.apply(&LifecycleEvent::Start, 0).expect("start");
        sm.apply(&closed(DisconnectReason::ConnectionLost), 1)
            .expect("close");
        assert_eq!(sm.state(), ConnectionState::Terminated);

        sm.apply(&LifecycleEvent::Start, 2)
            .expect("manual restart from terminated");
        assert_eq!(sm.state(), ConnectionState::Connecting);
        assert_eq!(sm.retry_count(), 0);
    }

    #[test]
    fn retry_count_resets_on_connected() {
        let mut sm = ConnectionStateMachine::default();
        sm.apply(&LifecycleEvent::Start, 0).expect("start");
        for _ in 0..3 {
            sm.apply(&closed(DisconnectReason::TimedOut), 1)
                .expect("close");
            sm.apply(&LifecycleEvent::ReconnectTimerFired, 2)
                .expect("timer");
        }
        assert_eq!(sm.retry_count(), 3);

        sm.apply(&LifecycleEvent::Gateway(GatewayEvent::Open), 3)
            .expect("open");
        assert_eq!(sm.retry_count(), 0);
    }

    #[test]
    fn challenge_expiry_reissues_only_while_awaiting_pairing() {
        let mut sm = ConnectionStateMachine::default();
        sm.apply(&LifecycleEvent::Start, 0).expect("start");
        sm.apply(&LifecycleEvent::Gateway(GatewayEvent::PairingRequired), 1)
            .expect("pairing required");

        let effects = sm
            .apply(&LifecycleEvent::ChallengeExpired, 30_001)
            .expect("expiry");
        assert_eq!(effects, vec![LifecycleEffect::IssueChallenge]);
        assert_eq!(sm.state(), ConnectionState::AwaitingPairing);

        sm.apply(&LifecycleEvent::Gateway(GatewayEvent::Open), 30_002)
            .expect("open");
        let effects = sm
            .apply(&LifecycleEvent::ChallengeExpired, 60_000)
            .expect("late expiry");
        assert_eq!(effects, vec![LifecycleEffect::InvalidateChallenge]);
    }

    #[test]
    fn health_escalation_is_a_transient_disconnect() {
        let mut sm = ConnectionStateMachine::default();
        connected(&mut sm);

        let effects = sm
            .apply(&LifecycleEvent::HealthEscalated, 10)
            .expect("escalation while connected");
        assert_eq!(sm.state(), ConnectionState::Reconnecting);
        assert!(!effects
            .iter()
            .any(|effect| matches!(effect, LifecycleEffect::ClearCredentials { .. })));

        assert!(
            sm.apply(&LifecycleEvent::HealthEscalated, 11)
                .expect("ignored outside connected")
                .is_empty()
        );
    }

    #[test]
    fn credentials_update_outside_a_connection_is_rejected() {
        let mut sm = ConnectionStateMachine::default();
        let err = sm
            .apply(
                &LifecycleEvent::Gateway(GatewayEvent::CredentialsUpdated {
                    credential_blob: vec![1],
                    device_fingerprint: "fp".into(),
                }),
                0,
            )
            .expect_err("no connection while idle");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn logout_archives_and_returns_to_idle() {
        let mut sm = ConnectionStateMachine::default();
        connected(&mut sm);

        let effects = sm.apply(&LifecycleEvent::Logout, 9).expect("logout");
        assert!(effects.contains(&LifecycleEffect::LogoutGateway));
        assert!(effects.contains(&LifecycleEffect::ArchiveSession));
        assert!(!effects
            .iter()
            .any(|effect| matches!(effect, LifecycleEffect::ClearCredentials { .. })));
        assert_eq!(sm.state(), ConnectionState::Idle);

        let err = sm
            .apply(&LifecycleEvent::Logout, 10)
            .expect_err("nothing to log out from");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn shutdown_takes_final_backup() {
        let mut sm = ConnectionStateMachine::default();
        connected(&mut sm);

        let effects = sm.apply(&LifecycleEvent::Shutdown, 9).expect("shutdown");
        assert!(effects.contains(&LifecycleEffect::TriggerBackup));
        assert_eq!(sm.state(), ConnectionState::Idle);
        assert!(
            sm.apply(&LifecycleEvent::Shutdown, 10)
                .expect("idle shutdown")
                .is_empty()
        );
    }
}
