//! Cart hardware reachability monitor
//!
//! Pings the cart's network switch, mixer and both PTZ cameras on a fixed
//! interval and broadcasts the device state whenever a device comes or goes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use anyhow::{Context, Result};

/// Network prefix of the AV cart LAN
const CART_SUBNET: &str = "192.168.25";

/// Devices on an AV cart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Switch,
    Mixer,
    Camera1,
    Camera2,
}

impl Device {
    pub const ALL: [Device; 4] = [Self::Switch, Self::Mixer, Self::Camera1, Self::Camera2];

    /// Address of this device on the given cart
    pub fn address(self, cart: u8) -> String {
        match self {
            Self::Switch => format!("{CART_SUBNET}.10{cart}"),
            Self::Mixer => format!("{CART_SUBNET}.{cart}2"),
            Self::Camera1 => format!("{CART_SUBNET}.{cart}3"),
            Self::Camera2 => format!("{CART_SUBNET}.{cart}4"),
        }
    }
}

/// Reachability of the cart hardware
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareStatus {
    pub switch: bool,
    pub mixer: bool,
    pub camera1: bool,
    pub camera2: bool,
    /// Probe failures from the last poll
    pub errors: Vec<String>,
}

impl HardwareStatus {
    fn slot(&mut self, device: Device) -> &mut bool {
        match device {
            Device::Switch => &mut self.switch,
            Device::Mixer => &mut self.mixer,
            Device::Camera1 => &mut self.camera1,
            Device::Camera2 => &mut self.camera2,
        }
    }
}

/// Answers whether a host responds
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<bool>;
}

/// Probes with the operating system's `ping` utility
pub struct SystemPing;

impl SystemPing {
    fn args(address: &str, timeout: Duration) -> Vec<String> {
        let (count_flag, wait_flag, wait) = if cfg!(target_os = "windows") {
            ("-n", "-w", timeout.as_millis().to_string())
        } else if cfg!(target_os = "macos") {
            ("-c", "-W", timeout.as_millis().to_string())
        } else {
            ("-c", "-W", timeout.as_secs().max(1).to_string())
        };
        vec![
            count_flag.to_string(),
            "1".to_string(),
            wait_flag.to_string(),
            wait,
            address.to_string(),
        ]
    }
}

#[async_trait]
impl Reachability for SystemPing {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<bool> {
        let run = Command::new("ping")
            .args(Self::args(address, timeout))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        // Grace period on top of ping's own timeout
        match tokio::time::timeout(timeout + Duration::from_secs(1), run).await {
            Ok(status) => Ok(status
                .with_context(|| format!("Failed to run ping for {address}"))?
                .success()),
            Err(_) => Ok(false),
        }
    }
}

/// Periodically probes the cart hardware
pub struct HardwareMonitor {
    prober: Arc<dyn Reachability>,
    cart: u8,
    interval: Duration,
    probe_timeout: Duration,
    state: HardwareStatus,
    status_tx: broadcast::Sender<HardwareStatus>,
}

impl HardwareMonitor {
    pub fn new(
        prober: Arc<dyn Reachability>,
        cart: u8,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(16);
        Self {
            prober,
            cart,
            interval,
            probe_timeout,
            state: HardwareStatus::default(),
            status_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HardwareStatus> {
        self.status_tx.subscribe()
    }

    /// Probe every device once; returns true when reachability changed
    pub async fn poll_once(&mut self) -> bool {
        let probes = Device::ALL.map(|device| {
            let prober = self.prober.clone();
            let address = device.address(self.cart);
            let timeout = self.probe_timeout;
            async move {
                let result = prober.probe(&address, timeout).await;
                (device, address, result)
            }
        });
        let results = futures::future::join_all(probes).await;

        let mut changed = false;
        let mut errors = Vec::new();
        for (device, address, result) in results {
            match result {
                Ok(alive) => {
                    let slot = self.state.slot(device);
                    if *slot != alive {
                        debug!("{:?} at {} is now {}", device, address, if alive { "up" } else { "down" });
                        *slot = alive;
                        changed = true;
                    }
                }
                Err(e) => errors.push(format!("{address}: {e:#}")),
            }
        }
        self.state.errors = errors;

        if changed {
            info!(
                "Hardware changed: switch={} mixer={} camera1={} camera2={}",
                self.state.switch, self.state.mixer, self.state.camera1, self.state.camera2
            );
            let _ = self.status_tx.send(self.state.clone());
        }
        changed
    }

    /// Poll until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Hardware monitor started for cart {}", self.cart);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                    for error in &self.state.errors {
                        warn!("Hardware probe failed: {}", error);
                    }
                }
            }
        }
        info!("Hardware monitor stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
