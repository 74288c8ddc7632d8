//! AutoAV service wiring: the FMS hub client feeding the engine

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::fms::FmsHub;

use super::engine::{AutoAvEngine, EngineDeps, EngineOptions};
use super::{AutoAvCommand, AutoAvStatus};

struct Running {
    cmd_tx: mpsc::Sender<AutoAvCommand>,
    cancel: CancellationToken,
    hub: JoinHandle<()>,
    engine: JoinHandle<()>,
}

/// Owns the hub connection and the engine task
pub struct AutoAvService {
    hub_url: String,
    options: EngineOptions,
    deps: EngineDeps,
    status_tx: broadcast::Sender<AutoAvStatus>,
    running: Option<Running>,
}

impl AutoAvService {
    pub fn new(hub_url: impl Into<String>, options: EngineOptions, deps: EngineDeps) -> Self {
        let (status_tx, _) = broadcast::channel(64);
        Self {
            hub_url: hub_url.into(),
            options,
            deps,
            status_tx,
            running: None,
        }
    }

    /// Subscribe to phase changes and operator notices
    pub fn subscribe(&self) -> broadcast::Receiver<AutoAvStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Connect to FMS and start reacting to match state
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            bail!("AutoAV service is already running");
        }

        info!("Starting AutoAV service (hub {})", self.hub_url);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (hub_tx, hub_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let hub = FmsHub::new(self.hub_url.clone()).spawn(hub_tx, cancel.child_token());

        let mut engine = AutoAvEngine::new(
            self.options.clone(),
            self.deps.clone(),
            cmd_rx,
            hub_rx,
            self.status_tx.clone(),
        );
        let engine = tokio::spawn(async move { engine.run().await });

        self.running = Some(Running {
            cmd_tx,
            cancel,
            hub,
            engine,
        });
        Ok(())
    }

    /// Send an operator command to the running engine
    pub async fn send(&self, cmd: AutoAvCommand) -> Result<()> {
        let running = self
            .running
            .as_ref()
            .context("AutoAV service is not running")?;
        running
            .cmd_tx
            .send(cmd)
            .await
            .context("AutoAV engine is no longer running")
    }

    /// Disconnect from FMS and stop the engine, dropping any scheduled stop
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            debug!("AutoAV service not running");
            return;
        };

        info!("Stopping AutoAV service");
        running.cancel.cancel();
        let _ = running.cmd_tx.send(AutoAvCommand::Shutdown).await;

        if let Err(e) = running.engine.await {
            error!("AutoAV engine task failed: {}", e);
        }
        if let Err(e) = running.hub.await {
            error!("FMS hub task failed: {}", e);
        }
    }
}
