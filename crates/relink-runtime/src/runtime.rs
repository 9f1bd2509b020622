use std::sync::Arc;

use rand::{SeedableRng, rngs::StdRng};
use relink_core::{
    BackoffPolicy, ChannelError, ConnectionState, ConnectionStateMachine, ConnectionStatus,
    DisconnectReason, ErrorCategory, EventStream, GatewayEvent, HealthVerdict, LifecycleConfig,
    LifecycleEffect, LifecycleError, LifecycleEvent, PairingChallenge, PairingHandler,
    RuntimeChannels, RuntimeCommand, RuntimeEvent, Session,
};
use relink_platform::{
    BackupError, BackupManager, CredentialStore, CredentialStoreError, FileCredentialStore,
    LeaseGuard, SealedSession, SessionLease,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clock::RuntimeClock,
    gateway::{ConnectRequest, GatewayConnector, GatewayError, GatewayHandle},
    health::{ProbeReport, ProbeSettings, spawn_health_monitor},
    task::RunningTask,
    timer::TimerSlot,
};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 512;

/// Collaborators the runtime drives.
pub struct RuntimeDeps {
    pub connector: Arc<dyn GatewayConnector>,
    pub store: Arc<dyn CredentialStore>,
    pub backups: Arc<BackupManager>,
    pub lease: Arc<dyn SessionLease>,
}

impl RuntimeDeps {
    /// File-backed store and backups at the configured locations.
    ///
    /// Runtimes pointed at the same auth storage must be given the same
    /// `lease`, otherwise nothing stops both from opening one session.
    pub fn file_backed(
        config: &LifecycleConfig,
        connector: Arc<dyn GatewayConnector>,
        lease: Arc<dyn SessionLease>,
    ) -> Self {
        Self {
            connector,
            store: Arc::new(FileCredentialStore::new(&config.auth_storage_location)),
            backups: Arc::new(BackupManager::new(
                config.backup_locations.clone(),
                config.backup_retention_count,
            )),
            lease,
        }
    }
}

/// Presentation-side handle: commands in, events and status out.
#[derive(Clone)]
pub struct RuntimeHandle {
    channels: RuntimeChannels,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: CancellationToken,
    clock: RuntimeClock,
}

impl RuntimeHandle {
    pub async fn send(&self, command: RuntimeCommand) -> Result<(), ChannelError> {
        self.channels.send_command(command).await
    }

    pub async fn start(&self) -> Result<(), ChannelError> {
        self.send(RuntimeCommand::Start).await
    }

    pub async fn logout(&self) -> Result<(), ChannelError> {
        self.send(RuntimeCommand::Logout).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Current status, with uptime filled in while connected.
    pub fn status(&self) -> ConnectionStatus {
        let mut status = self.status.borrow().clone();
        if status.state == ConnectionState::Connected {
            status.uptime_ms = Some(self.clock.now_ms().saturating_sub(status.since_ms));
        }
        status
    }

    /// Change notifications for status consumers.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Ask the runtime to stop. Await the join handle to wait for the final
    /// snapshot and gateway close.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Validate `config` and spawn the lifecycle runtime on the current tokio runtime.
pub fn spawn_runtime(
    config: LifecycleConfig,
    deps: RuntimeDeps,
) -> Result<(RuntimeHandle, JoinHandle<()>), LifecycleError> {
    config.validate()?;
    let (channels, command_rx) = RuntimeChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
    let shutdown = CancellationToken::new();
    let clock = RuntimeClock::new();

    let runtime = LifecycleRuntime::new(
        config,
        deps,
        channels.clone(),
        command_rx,
        status_tx,
        shutdown.clone(),
        clock,
    );
    let join = tokio::spawn(runtime.run());

    Ok((
        RuntimeHandle {
            channels,
            status: status_rx,
            shutdown,
            clock,
        },
        join,
    ))
}

enum Signal {
    Attached {
        generation: u64,
        handle: Arc<dyn GatewayHandle>,
    },
    ConnectFailed {
        generation: u64,
        error: GatewayError,
    },
    Gateway {
        generation: u64,
        event: GatewayEvent,
    },
    StreamEnded {
        generation: u64,
    },
    ReconnectDue {
        sequence: u64,
    },
    ChallengeExpired {
        sequence: u64,
        token: String,
    },
    BackupDue,
}

struct LifecycleRuntime {
    config: LifecycleConfig,
    deps: RuntimeDeps,
    channels: RuntimeChannels,
    command_rx: mpsc::Receiver<RuntimeCommand>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: mpsc::UnboundedReceiver<Signal>,
    probe_tx: mpsc::UnboundedSender<ProbeReport>,
    probe_rx: mpsc::UnboundedReceiver<ProbeReport>,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown: CancellationToken,
    clock: RuntimeClock,
    instance_id: String,

    machine: ConnectionStateMachine,
    pairing: PairingHandler,
    backoff: BackoffPolicy,
    rng: StdRng,
    session: Option<SealedSession>,
    save_pending: bool,
    last_error: Option<String>,

    /// Bumped on every open and close; signals tagged with an older value are stale.
    generation: u64,
    connection: Option<RunningTask>,
    gateway: Option<Arc<dyn GatewayHandle>>,
    health: Option<RunningTask>,
    backup_ticker: Option<RunningTask>,
    reconnect_timer: TimerSlot,
    pairing_timer: TimerSlot,
    lease: Option<LeaseGuard>,
}

impl LifecycleRuntime {
    fn new(
        config: LifecycleConfig,
        deps: RuntimeDeps,
        channels: RuntimeChannels,
        command_rx: mpsc::Receiver<RuntimeCommand>,
        status_tx: watch::Sender<ConnectionStatus>,
        shutdown: CancellationToken,
        clock: RuntimeClock,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        Self {
            machine: ConnectionStateMachine::new(config.max_retries),
            pairing: PairingHandler::new(config.pairing_timeout()),
            backoff: config.backoff_policy(),
            rng: StdRng::from_entropy(),
            config,
            deps,
            channels,
            command_rx,
            signal_tx,
            signal_rx,
            probe_tx,
            probe_rx,
            status_tx,
            shutdown,
            clock,
            instance_id: Uuid::new_v4().to_string(),
            session: None,
            save_pending: false,
            last_error: None,
            generation: 0,
            connection: None,
            gateway: None,
            health: None,
            backup_ticker: None,
            reconnect_timer: TimerSlot::default(),
            pairing_timer: TimerSlot::default(),
            lease: None,
        }
    }

    async fn run(mut self) {
        info!(
            instance = %self.instance_id,
            store = %self.deps.store.describe(),
            "lifecycle runtime ready"
        );
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(command) = self.command_rx.recv() => self.handle_command(command).await,
                Some(signal) = self.signal_rx.recv() => self.handle_signal(signal).await,
                Some(report) = self.probe_rx.recv() => self.handle_probe_report(report).await,
                else => break,
            }
        }
        self.shut_down().await;
    }

    async fn shut_down(&mut self) {
        info!(state = self.machine.state().as_str(), "lifecycle runtime shutting down");
        if let Err(err) = self.dispatch(LifecycleEvent::Shutdown).await {
            warn!(code = %err.code, error = %err.message, "shutdown transition failed");
        }
        self.backup_ticker = None;
        self.lease = None;
    }

    async fn handle_command(&mut self, command: RuntimeCommand) {
        debug!(?command, "runtime command");
        let result = match command {
            RuntimeCommand::Start => self.handle_start().await,
            RuntimeCommand::Logout => self.dispatch(LifecycleEvent::Logout).await,
        };
        if let Err(err) = result {
            self.report_error(err);
        }
    }

    async fn handle_start(&mut self) -> Result<(), LifecycleError> {
        let state = self.machine.state();
        if !matches!(state, ConnectionState::Idle | ConnectionState::Terminated) {
            return Err(LifecycleError::invalid_state(state, "start"));
        }
        if self.lease.is_none() {
            let key = self.deps.store.describe();
            let guard = self
                .deps
                .lease
                .acquire(&key, &self.instance_id)
                .map_err(|err| {
                    LifecycleError::new(ErrorCategory::Internal, "session_locked", err.to_string())
                })?;
            self.lease = Some(guard);
        }
        self.dispatch(LifecycleEvent::Start).await?;
        self.start_backup_ticker();
        Ok(())
    }

    async fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Attached { generation, handle } => {
                if generation != self.generation {
                    debug!(generation, "closing connection from superseded attempt");
                    tokio::spawn(close_with_timeout(handle, self.config.close_timeout()));
                    return;
                }
                self.gateway = Some(handle);
            }
            Signal::ConnectFailed { generation, error } => {
                if generation != self.generation {
                    return;
                }
                warn!(generation, error = %error, "gateway connect failed");
                let reason = match error {
                    GatewayError::Timeout => DisconnectReason::TimedOut,
                    _ => DisconnectReason::ConnectionLost,
                };
                self.dispatch_gateway(GatewayEvent::Closed { reason }).await;
            }
            Signal::Gateway { generation, event } => {
                if generation != self.generation {
                    debug!(generation, ?event, "ignoring event from superseded connection");
                    return;
                }
                self.dispatch_gateway(event).await;
            }
            Signal::StreamEnded { generation } => {
                if generation != self.generation {
                    return;
                }
                debug!(generation, "gateway event stream ended");
                self.dispatch_gateway(GatewayEvent::Closed {
                    reason: DisconnectReason::ConnectionLost,
                })
                .await;
            }
            Signal::ReconnectDue { sequence } => {
                if self.reconnect_timer.take_fired(sequence)
                    && let Err(err) = self.dispatch(LifecycleEvent::ReconnectTimerFired).await
                {
                    warn!(code = %err.code, "reconnect timer rejected");
                }
            }
            Signal::ChallengeExpired { sequence, token } => {
                if !self.pairing_timer.take_fired(sequence) || !self.pairing.expire(&token) {
                    return;
                }
                info!("pairing challenge expired");
                if let Err(err) = self.dispatch(LifecycleEvent::ChallengeExpired).await {
                    warn!(code = %err.code, "challenge expiry rejected");
                }
            }
            Signal::BackupDue => {
                if self.machine.state() != ConnectionState::Idle {
                    self.run_backup();
                }
            }
        }
    }

    async fn handle_probe_report(&mut self, report: ProbeReport) {
        if report.generation != self.generation
            || self.machine.state() != ConnectionState::Connected
        {
            return;
        }
        match report.verdict {
            HealthVerdict::Healthy => {}
            HealthVerdict::Degraded {
                consecutive_failures,
            } => {
                warn!(consecutive_failures, "gateway health degraded");
                self.channels.emit(RuntimeEvent::HealthDegraded {
                    consecutive_failures,
                });
            }
            HealthVerdict::Escalate { .. } => {
                self.health = None;
                if let Err(err) = self.dispatch(LifecycleEvent::HealthEscalated).await {
                    warn!(code = %err.code, "health escalation rejected");
                }
            }
        }
    }

    async fn dispatch_gateway(&mut self, event: GatewayEvent) {
        if let Err(err) = self.dispatch(LifecycleEvent::Gateway(event)).await {
            warn!(code = %err.code, error = %err.message, "gateway event rejected");
        }
    }

    async fn dispatch(&mut self, event: LifecycleEvent) -> Result<(), LifecycleError> {
        let effects = self.machine.apply(&event, self.clock.now_ms())?;
        for effect in effects {
            self.run_effect(effect).await;
        }
        Ok(())
    }

    async fn run_effect(&mut self, effect: LifecycleEffect) {
        match effect {
            LifecycleEffect::EnterState(state) => self.enter_state(state),
            LifecycleEffect::LoadSession => self.load_session(),
            LifecycleEffect::OpenGateway => self.open_gateway(),
            LifecycleEffect::CloseGateway => self.close_gateway().await,
            LifecycleEffect::LogoutGateway => self.logout_gateway().await,
            LifecycleEffect::EnsureChallenge => {
                let (challenge, issued) = self.pairing.current_or_issue(self.clock.now_ms());
                if issued {
                    self.publish_challenge(challenge);
                } else {
                    debug!("reusing live pairing challenge");
                }
            }
            LifecycleEffect::IssueChallenge => {
                let challenge = self.pairing.issue_challenge(self.clock.now_ms());
                self.publish_challenge(challenge);
            }
            LifecycleEffect::ConsumeChallenge => self.consume_challenge(),
            LifecycleEffect::InvalidateChallenge => {
                self.pairing_timer.cancel();
                if self.pairing.invalidate().is_some() {
                    debug!("pairing challenge invalidated");
                }
            }
            LifecycleEffect::StartHealthMonitor => self.start_health_monitor(),
            LifecycleEffect::StopHealthMonitor => self.health = None,
            LifecycleEffect::TriggerBackup => self.run_backup(),
            LifecycleEffect::ScheduleReconnect {
                attempt,
                retry_after_ms,
            } => self.schedule_reconnect(attempt, retry_after_ms),
            LifecycleEffect::CancelReconnect => {
                if self.reconnect_timer.cancel() {
                    debug!("pending reconnect cancelled");
                }
            }
            LifecycleEffect::PersistCredentials {
                credential_blob,
                device_fingerprint,
            } => self.persist_credentials(credential_blob, device_fingerprint),
            LifecycleEffect::ClearCredentials { reason } => self.clear_credentials(&reason),
            LifecycleEffect::ArchiveSession => self.archive_session(),
            LifecycleEffect::ReportFatal(err) => self.report_error(err),
        }
    }

    fn enter_state(&mut self, state: ConnectionState) {
        let retry_count = self.machine.retry_count();
        info!(state = state.as_str(), retry_count, "connection state changed");
        self.status_tx.send_replace(ConnectionStatus {
            state,
            retry_count,
            uptime_ms: None,
            since_ms: self.machine.entered_at_ms(),
            last_error: self.last_error.clone(),
        });
        self.channels
            .emit(RuntimeEvent::StateChanged { state, retry_count });

        if state == ConnectionState::Idle {
            self.backup_ticker = None;
            self.lease = None;
        }
    }

    fn report_error(&mut self, err: LifecycleError) {
        error!(code = %err.code, category = ?err.category, error = %err.message, "lifecycle error");
        self.last_error = Some(err.code.clone());
        self.status_tx.send_modify(|status| {
            status.last_error = Some(err.code.clone());
        });
        self.channels.emit(RuntimeEvent::FatalError {
            recoverable: err.is_recoverable(),
            code: err.code,
            message: err.message,
        });
    }

    fn emit_storage_error(&self, err: &CredentialStoreError) {
        self.channels.emit(RuntimeEvent::StorageError {
            code: err.code().to_owned(),
            message: err.to_string(),
        });
    }

    fn load_session(&mut self) {
        if self.session.is_some() {
            return;
        }
        match self.deps.store.load_sealed() {
            Ok(Some(sealed)) => {
                info!(session_id = %sealed.session.id, "loaded stored session");
                self.session = Some(sealed);
            }
            Ok(None) => {
                debug!("no stored session; checking backups");
                self.restore_from_backup();
            }
            Err(err @ CredentialStoreError::CorruptData(_)) => {
                warn!(error = %err, "stored session is corrupt; restoring from backup");
                self.emit_storage_error(&err);
                self.restore_from_backup();
            }
            Err(err) => {
                warn!(error = %err, "failed reading stored session");
                self.emit_storage_error(&err);
            }
        }
    }

    fn restore_from_backup(&mut self) {
        match self.deps.backups.restore_latest() {
            Ok((sealed, record)) => {
                info!(
                    session_id = %sealed.session.id,
                    backup = %record.location.display(),
                    "session restored from backup"
                );
                self.session = Some(sealed);
                self.save_session();
            }
            Err(BackupError::NotFound) => debug!("no usable backup; pairing will be required"),
            Err(err) => warn!(error = %err, "backup restore failed"),
        }
    }

    fn save_session(&mut self) {
        let Some(sealed) = &self.session else {
            return;
        };
        match self.deps.store.save(sealed) {
            Ok(()) => self.save_pending = false,
            Err(err) => {
                warn!(error = %err, "failed saving session; will retry");
                self.emit_storage_error(&err);
                self.save_pending = true;
            }
        }
    }

    fn persist_credentials(&mut self, credential_blob: Vec<u8>, device_fingerprint: String) {
        let now = self.clock.now_ms();
        let session = match &self.session {
            Some(sealed) => {
                sealed
                    .session
                    .clone()
                    .with_credentials(credential_blob, device_fingerprint, now)
            }
            None => Session::new(credential_blob, device_fingerprint, now),
        };
        match SealedSession::seal(session, now) {
            Ok(sealed) => {
                debug!(session_id = %sealed.session.id, "credentials updated");
                self.session = Some(sealed);
                self.save_session();
            }
            Err(err) => {
                error!(error = %err, "failed sealing updated credentials");
                self.emit_storage_error(&CredentialStoreError::from(err));
            }
        }
    }

    fn clear_credentials(&mut self, reason: &DisconnectReason) {
        let revoked = self.session.take().map(|sealed| sealed.session.id);
        self.save_pending = false;
        if let Err(err) = self.deps.store.clear() {
            error!(error = %err, "failed clearing revoked session");
            self.emit_storage_error(&err);
        }
        if let Some(session_id) = &revoked
            && let Err(err) = self.deps.backups.purge_session(session_id)
        {
            warn!(error = %err, "failed purging backups of revoked session");
        }
        warn!(
            reason = reason.code(),
            session_id = revoked.as_deref().unwrap_or("none"),
            "session revoked; credentials wiped"
        );
        self.channels.emit(RuntimeEvent::SessionRevoked {
            session_id: revoked,
            reason: reason.code().to_owned(),
        });
    }

    fn archive_session(&mut self) {
        let archived = self.session.take().map(|sealed| sealed.session.id);
        self.save_pending = false;
        match self.deps.store.archive(self.clock.now_ms()) {
            Ok(true) => info!("session archived after logout"),
            Ok(false) => debug!("no stored session to archive"),
            Err(err) => {
                warn!(error = %err, "failed archiving session");
                self.emit_storage_error(&err);
            }
        }
        if let Some(session_id) = &archived
            && let Err(err) = self.deps.backups.purge_session(session_id)
        {
            warn!(error = %err, "failed purging backups of logged-out session");
        }
    }

    fn run_backup(&mut self) {
        if self.save_pending {
            self.save_session();
        }
        let Some(sealed) = &self.session else {
            debug!("no session to back up");
            return;
        };
        match self.deps.backups.snapshot(sealed, self.clock.now_ms()) {
            Ok(records) => self
                .channels
                .emit(RuntimeEvent::BackupCompleted { records }),
            Err(err) => {
                warn!(error = %err, "backup snapshot failed; retrying next cycle");
                self.channels.emit(RuntimeEvent::BackupFailed {
                    code: err.code().to_owned(),
                    message: err.to_string(),
                });
            }
        }
    }

    fn start_backup_ticker(&mut self) {
        if self.backup_ticker.is_some() {
            return;
        }
        let interval = self.config.backup_interval();
        let signals = self.signal_tx.clone();
        self.backup_ticker = Some(RunningTask::spawn(&self.shutdown, move |stop| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if signals.send(Signal::BackupDue).is_err() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    fn open_gateway(&mut self) {
        self.connection = None;
        if let Some(handle) = self.gateway.take() {
            tokio::spawn(close_with_timeout(handle, self.config.close_timeout()));
        }
        self.generation += 1;
        let generation = self.generation;
        let request = ConnectRequest {
            session: self.session.as_ref().map(|sealed| sealed.session.clone()),
            attempt: self.machine.retry_count(),
        };
        debug!(
            generation,
            resume = request.session.is_some(),
            attempt = request.attempt,
            "opening gateway connection"
        );

        let connector = Arc::clone(&self.deps.connector);
        let signals = self.signal_tx.clone();
        let connect_timeout = self.config.connect_timeout();
        self.connection = Some(RunningTask::spawn(&self.shutdown, move |stop| async move {
            let attempt = tokio::time::timeout(connect_timeout, connector.connect(request));
            let connected = tokio::select! {
                _ = stop.cancelled() => return,
                result = attempt => result,
            };
            let mut connection = match connected {
                Ok(Ok(connection)) => connection,
                Ok(Err(error)) => {
                    let _ = signals.send(Signal::ConnectFailed { generation, error });
                    return;
                }
                Err(_) => {
                    let _ = signals.send(Signal::ConnectFailed {
                        generation,
                        error: GatewayError::Timeout,
                    });
                    return;
                }
            };

            let handle = Arc::clone(&connection.handle);
            if signals.send(Signal::Attached { generation, handle }).is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = connection.events.recv() => {
                        let signal = match event {
                            Some(event) => Signal::Gateway { generation, event },
                            None => Signal::StreamEnded { generation },
                        };
                        let ended = matches!(signal, Signal::StreamEnded { .. });
                        if signals.send(signal).is_err() || ended {
                            break;
                        }
                    }
                }
            }
        }));
    }

    async fn close_gateway(&mut self) {
        self.generation += 1;
        self.connection = None;
        let Some(handle) = self.gateway.take() else {
            return;
        };
        let timeout = self.config.close_timeout();
        if self.shutdown.is_cancelled() {
            close_with_timeout(handle, timeout).await;
        } else {
            tokio::spawn(close_with_timeout(handle, timeout));
        }
    }

    async fn logout_gateway(&mut self) {
        self.generation += 1;
        self.connection = None;
        let Some(handle) = self.gateway.take() else {
            debug!("no live connection to log out");
            return;
        };
        match tokio::time::timeout(self.config.close_timeout(), handle.logout()).await {
            Ok(Ok(())) => info!("gateway logout completed"),
            Ok(Err(err)) => warn!(error = %err, "gateway logout failed"),
            Err(_) => warn!("gateway logout timed out"),
        }
    }

    fn publish_challenge(&mut self, challenge: PairingChallenge) {
        let delay = challenge
            .expires_at_ms
            .saturating_sub(self.clock.now_ms());
        let token = challenge.token.clone();
        self.pairing_timer.arm(
            &self.shutdown,
            std::time::Duration::from_millis(delay),
            self.signal_tx.clone(),
            move |sequence| Signal::ChallengeExpired { sequence, token },
        );
        info!(expires_at_ms = challenge.expires_at_ms, "pairing challenge issued");
        self.channels.emit(RuntimeEvent::PairingChallenge(challenge));
    }

    fn consume_challenge(&mut self) {
        self.pairing_timer.cancel();
        let Some(token) = self.pairing.current().map(|challenge| challenge.token.clone()) else {
            debug!("session opened without an outstanding challenge");
            return;
        };
        if self.pairing.consume(&token, self.clock.now_ms()) {
            info!("pairing challenge consumed");
        } else {
            warn!("session opened after the pairing challenge lapsed");
        }
    }

    fn start_health_monitor(&mut self) {
        let Some(handle) = self.gateway.clone() else {
            warn!("connected without a gateway handle; health monitor not started");
            return;
        };
        let settings = ProbeSettings {
            interval: self.config.health_probe_interval(),
            timeout: self.config.probe_timeout(),
            failure_threshold: self.config.health_failure_threshold,
            window_size: self.config.health_window_size,
        };
        self.health = Some(spawn_health_monitor(
            &self.shutdown,
            handle,
            self.generation,
            settings,
            self.clock,
            self.probe_tx.clone(),
        ));
    }

    fn schedule_reconnect(&mut self, attempt: u32, retry_after_ms: Option<u64>) {
        let delay = self
            .backoff
            .delay_for_attempt(attempt, retry_after_ms, &mut self.rng);
        let delay_ms = delay.as_millis() as u64;
        self.reconnect_timer.arm(
            &self.shutdown,
            delay,
            self.signal_tx.clone(),
            |sequence| Signal::ReconnectDue { sequence },
        );
        info!(attempt, delay_ms, "reconnect scheduled");
        self.channels
            .emit(RuntimeEvent::ReconnectScheduled { attempt, delay_ms });
    }
}

async fn close_with_timeout(handle: Arc<dyn GatewayHandle>, timeout: std::time::Duration) {
    match tokio::time::timeout(timeout, handle.close()).await {
        Ok(Ok(())) => debug!("gateway connection closed"),
        Ok(Err(err)) => debug!(error = %err, "gateway close failed"),
        Err(_) => warn!("gateway close timed out"),
    }
}
