//! AutoAV Agent
//!
//! Records each FRC match on the AV cart: listens to the field-management
//! system, drives vMix recording around every match and files the result
//! under its event and match name.

mod autoav;
mod config;
mod console;
mod equipment_log;
mod error;
mod events;
mod fms;
mod hardware;
mod logging;
mod vmix;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use autoav::{AutoAvService, AutoAvStatus, EngineDeps};
use config::Config;
use console::ConsoleCommand;
use equipment_log::HttpEquipmentLog;
use events::HttpEventDirectory;
use fms::FmsSettings;
use hardware::{HardwareMonitor, HardwareStatus, SystemPing};
use vmix::{RecordingBackend, VmixClient};

fn main() -> Result<()> {
    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config_override = config_path_arg(&args)?;

    let _log_guard = logging::init_logging()?;
    info!("AutoAV Agent starting...");
    if let Ok(dir) = logging::get_log_dir() {
        info!("Logging to {:?}", dir);
    }

    // Load configuration
    let config = match &config_override {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded from {:?}", config.config_path()?);

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    // Set up Ctrl+C handler that triggers shutdown
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let _ = shutdown_tx.try_send(());
    })?;

    let result = runtime.block_on(async move {
        let timeout = config.autoav.request_timeout();
        let vmix = Arc::new(VmixClient::new(config.vmix.clone(), timeout)?);
        let deps = EngineDeps {
            backend: vmix.clone(),
            settings: Arc::new(FmsSettings::new(config.fms.base_url.clone(), timeout)?),
            events: Arc::new(HttpEventDirectory::new(config.events.url.clone(), timeout)?),
            equipment_log: Arc::new(HttpEquipmentLog::new(
                config.equipment_log.url.clone(),
                config.equipment_log.api_key.clone(),
                timeout,
            )?),
        };

        let mut service = AutoAvService::new(
            config.fms.hub_url.clone(),
            config.autoav.engine_options(),
            deps,
        );
        let notices = tokio::spawn(log_notices(service.subscribe()));
        service.start()?;

        let cancel = CancellationToken::new();
        let hardware = if config.hardware.enabled {
            let monitor = HardwareMonitor::new(
                Arc::new(SystemPing),
                config.hardware.cart_number,
                Duration::from_secs(config.hardware.poll_interval_secs),
                Duration::from_secs(config.hardware.probe_timeout_secs),
            );
            tokio::spawn(log_hardware(monitor.subscribe()));
            Some(monitor.spawn(cancel.clone()))
        } else {
            info!("Hardware monitor disabled");
            None
        };

        let (console_tx, mut console_rx) = mpsc::channel::<ConsoleCommand>(8);
        tokio::spawn(console::read_commands(console_tx));

        info!("Type 'help' for commands, Ctrl+C to exit...");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                Some(command) = console_rx.recv() => {
                    if !handle_console(command, &service, &vmix).await {
                        break;
                    }
                }
            }
        }

        service.stop().await;
        cancel.cancel();
        if let Some(handle) = hardware {
            if let Err(e) = handle.await {
                error!("Hardware monitor task failed: {}", e);
            }
        }
        drop(service);
        let _ = notices.await;

        anyhow::Ok(())
    });
    // The console reader may still be parked on stdin
    runtime.shutdown_background();
    result?;

    info!("Shutdown complete");
    Ok(())
}

/// Value of `--config <path>` or `--config=<path>`
fn config_path_arg(args: &[String]) -> Result<Option<PathBuf>> {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            let path = iter.next().context("--config requires a path")?;
            return Ok(Some(PathBuf::from(path)));
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Ok(Some(PathBuf::from(path)));
        }
    }
    Ok(None)
}

/// Run one console command; returns false when the operator asked to quit
async fn handle_console(
    command: ConsoleCommand,
    service: &AutoAvService,
    vmix: &VmixClient,
) -> bool {
    let result = match command {
        ConsoleCommand::Recorder(cmd) => service.send(cmd).await,
        ConsoleCommand::StartStreaming(slot) => {
            vmix.start_streaming(slot).await.map_err(Into::into)
        }
        ConsoleCommand::StopStreaming(slot) => vmix.stop_streaming(slot).await.map_err(Into::into),
        ConsoleCommand::SetStream(stream) => {
            vmix.set_stream_info(&[stream]).await.map_err(Into::into)
        }
        ConsoleCommand::Status => {
            let state = if service.is_running() { "running" } else { "stopped" };
            println!("AutoAV service {state}; vMix at {}", vmix.location());
            Ok(())
        }
        ConsoleCommand::Help => {
            println!("{}", console::HELP);
            Ok(())
        }
        ConsoleCommand::Quit => return false,
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
    }
    true
}

/// Operator notices go to the log until a UI subscribes
async fn log_notices(mut rx: broadcast::Receiver<AutoAvStatus>) {
    loop {
        match rx.recv().await {
            Ok(AutoAvStatus::Info(message)) => info!("[AutoAV] {}", message),
            Ok(AutoAvStatus::Phase(phase)) => info!("[AutoAV] phase: {:?}", phase),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {} AutoAV notices", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn log_hardware(mut rx: broadcast::Receiver<HardwareStatus>) {
    while let Ok(status) = rx.recv().await {
        info!(
            "[HW] switch={} mixer={} camera1={} camera2={}",
            status.switch, status.mixer, status.camera1, status.camera2
        );
    }
}

fn print_help() {
    println!("AutoAV Agent - Automatic match recording for the AV cart");
    println!();
    println!("USAGE:");
    println!("    autoav-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help           Print this help message");
    println!("    -c, --config <PATH>  Use this config file instead of the default");
    println!();
    println!("While running, type 'help' for operator commands.");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG             Set log level (e.g., debug, info, warn)");
    println!("    AUTOAV_LOG_PATH      Directory for log files");
}
