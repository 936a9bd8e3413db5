//! Daemon assembly: wire the state actor, ingestion pipeline and the three
//! IPC surfaces together, then hold until shutdown.
//!
//! Shutdown is single-flight: signals and `POST /api/shutdown` all resolve
//! to one `watch` flip, and every surface drains against the same grace
//! deadline. A second trigger just awaits the first teardown.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::backend::VideodbBackend;
use crate::bridge::EventBridge;
use crate::config::DaemonConfig;
use crate::config::IndexingConfig;
use crate::control::ControlFacade;
use crate::error::DaemonError;
use crate::http_api;
use crate::http_api::ApiState;
use crate::ingest::IndexingSettings;
use crate::ingest::IngestPipeline;
use crate::mcp;
use crate::snapshot::SnapshotWriter;
use crate::state::spawn_state_actor;

/// Idempotent shutdown switch shared by every trigger path.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub fn trigger(&self) {
        self.tx.send_if_modified(|flag| {
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Run the daemon until a shutdown trigger fires. `with_mcp` additionally
/// serves the stdio tool protocol; the daemon exits when that stream ends.
pub async fn run_daemon(config: DaemonConfig, with_mcp: bool) -> Result<(), DaemonError> {
    std::fs::create_dir_all(&config.state_dir)
        .map_err(|err| DaemonError::StateDir(err.to_string()))?;

    let snapshot = SnapshotWriter::new(config.snapshot_dir());
    let (state, state_task) = spawn_state_actor(config.buffer_capacity, snapshot);

    let indexing = Arc::new(IndexingSettings::new(IndexingConfig::load(
        &config.config_path(),
    )));
    let backend = Arc::new(
        VideodbBackend::new(
            config.backend_url.clone(),
            config.api_key.clone(),
            config.rest_timeout,
        )
        .map_err(|err| DaemonError::BackendInit(err.to_string()))?,
    );
    let ingest = Arc::new(IngestPipeline::new(
        backend.clone(),
        state.clone(),
        indexing.clone(),
    ));
    let control = ControlFacade::new(
        backend,
        state.clone(),
        ingest,
        indexing,
        config.config_path(),
    );

    let (shutdown, shutdown_rx) = ShutdownTrigger::new();

    let api_state = Arc::new(ApiState {
        control,
        shutdown: shutdown.clone(),
    });
    let api_task = tokio::spawn(http_api::serve(
        api_state,
        config.api_port,
        shutdown_rx.clone(),
    ));

    let bridge = EventBridge::new(state.clone(), config.state_dir.join("bridge.sock"));
    let bridge_task = tokio::spawn(bridge.serve(shutdown_rx.clone()));

    let mcp_task = if with_mcp {
        let api = screenpilot_ipc::ApiClient::with_base_url(format!(
            "http://127.0.0.1:{}",
            config.api_port
        ))
        .map_err(|err| DaemonError::ApiBind(err.to_string()))?;
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            mcp::run_stdio(api).await;
            // The harness closed our stdin; the daemon goes with it.
            shutdown.trigger();
        }))
    } else {
        None
    };

    spawn_signal_triggers(shutdown.clone())?;

    let mut shutdown_wait = shutdown_rx;
    if shutdown_wait.changed().await.is_err() {
        warn!("Shutdown channel closed unexpectedly");
    }
    info!("Shutting down");

    let drain = async {
        match api_task.await {
            Ok(Err(err)) => error!(error = %err, "Control API ended with error"),
            Err(err) => error!(error = %err, "Control API task failed"),
            Ok(Ok(())) => {}
        }
        match bridge_task.await {
            Ok(Err(err)) => error!(error = %err, "Event bridge ended with error"),
            Err(err) => error!(error = %err, "Event bridge task failed"),
            Ok(Ok(())) => {}
        }
        if let Some(task) = mcp_task {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(config.shutdown_grace, drain)
        .await
        .is_err()
    {
        warn!(
            grace_ms = config.shutdown_grace.as_millis(),
            "Shutdown grace period elapsed, abandoning cleanup"
        );
    }

    drop(state);
    let _ = state_task.await;
    info!("Daemon stopped");
    Ok(())
}

fn spawn_signal_triggers(shutdown: ShutdownTrigger) -> Result<(), DaemonError> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(|err| DaemonError::SignalSetup(err.to_string()))?;
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(error = %err, "Failed to listen for SIGINT");
                    return;
                }
                info!("Received SIGINT");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM");
            }
        }
        shutdown.trigger();
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_is_idempotent() {
        let (trigger, mut rx) = ShutdownTrigger::new();
        trigger.trigger();
        trigger.trigger();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        // No second change is pending.
        assert!(!rx.has_changed().unwrap());
    }
}
