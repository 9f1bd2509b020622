mod config;
mod logging;

use std::{process::ExitCode, sync::Arc, time::Duration};

use config::SmokeConfig;
use relink_core::{PairingChallenge, RuntimeEvent};
use relink_platform::InProcessLease;
use relink_runtime::{LoopbackController, LoopbackGateway, RuntimeDeps, spawn_runtime};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let (gateway, controller) = LoopbackGateway::new();
    let deps = RuntimeDeps::file_backed(
        &config.lifecycle,
        Arc::new(gateway),
        Arc::new(InProcessLease::default()),
    );
    let (handle, join) = match spawn_runtime(config.lifecycle.clone(), deps) {
        Ok(spawned) => spawned,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut events = handle.subscribe();
    if let Err(err) = handle.start().await {
        error!(error = %err, "runtime rejected start");
        return ExitCode::FAILURE;
    }
    println!(
        "relink smoke runner started; session at {}",
        config.lifecycle.auth_storage_location.display()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => report(&event, &controller, config.auto_pair_after_ms),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown();
    if let Err(err) = join.await {
        error!(error = %err, "runtime task failed");
        return ExitCode::FAILURE;
    }
    let status = handle.status();
    println!("stopped in state {}", status.state.as_str());
    ExitCode::SUCCESS
}

fn report(event: &RuntimeEvent, controller: &LoopbackController, auto_pair_after_ms: Option<u64>) {
    match event {
        RuntimeEvent::StateChanged { state, retry_count } => {
            println!("state: {} (retries {retry_count})", state.as_str());
        }
        RuntimeEvent::PairingChallenge(challenge) => {
            print_challenge(challenge);
            if let Some(delay_ms) = auto_pair_after_ms {
                schedule_auto_pair(controller.clone(), delay_ms);
            }
        }
        RuntimeEvent::ReconnectScheduled { attempt, delay_ms } => {
            println!("reconnect attempt {attempt} in {delay_ms} ms");
        }
        RuntimeEvent::SessionRevoked { reason, .. } => {
            println!("session revoked ({reason}); pairing again");
        }
        RuntimeEvent::BackupCompleted { records } => {
            println!("backup written to {} location(s)", records.len());
        }
        RuntimeEvent::FatalError {
            code,
            message,
            recoverable,
        } => {
            eprintln!("error {code}: {message} (recoverable: {recoverable})");
        }
        other => println!("{other:?}"),
    }
}

fn print_challenge(challenge: &PairingChallenge) {
    let ttl_ms = challenge
        .expires_at_ms
        .saturating_sub(challenge.issued_at_ms);
    println!("pair this device with token {} (valid {ttl_ms} ms)", challenge.token);
}

fn schedule_auto_pair(controller: LoopbackController, delay_ms: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        let credentials = Uuid::new_v4().as_bytes().to_vec();
        let fingerprint = format!("smoke-{}", Uuid::new_v4().simple());
        if controller.complete_pairing(credentials, &fingerprint) {
            info!(%fingerprint, "loopback pairing approved");
        } else {
            warn!("no live loopback connection to approve");
        }
    });
}
