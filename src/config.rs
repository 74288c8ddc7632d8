//! Configuration management for the AutoAV agent

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::autoav::{EngineOptions, NamingPreference, SettleDelays};
use crate::vmix::VmixSettings;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Field-management system endpoints
    #[serde(default)]
    pub fms: FmsConfig,

    /// vMix Web API connection
    #[serde(default)]
    pub vmix: VmixSettings,

    /// Recording behavior
    #[serde(default)]
    pub autoav: AutoAvConfig,

    /// Active-event lookup
    #[serde(default)]
    pub events: EventsConfig,

    /// Cart hardware monitoring
    #[serde(default)]
    pub hardware: HardwareConfig,

    /// Central equipment log
    #[serde(default)]
    pub equipment_log: EquipmentLogConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FmsConfig {
    /// SignalR hub URL
    #[serde(default = "default_hub_url")]
    pub hub_url: String,

    /// Base URL of the FMS REST API (settings reads)
    #[serde(default = "default_fms_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoAvConfig {
    /// `auto`, `in-season` or `off-season`
    #[serde(default)]
    pub naming: NamingPreference,

    /// Directory vMix records into; used to find captures whose path was never reported
    #[serde(default)]
    pub recording_directory: Option<PathBuf>,

    /// Event name to use instead of the lookup
    #[serde(default)]
    pub event_name: Option<String>,

    #[serde(default = "default_aborted_delay")]
    pub aborted_delay_secs: u64,

    #[serde(default = "default_skipped_results_delay")]
    pub skipped_results_delay_secs: u64,

    #[serde(default = "default_results_posted_delay")]
    pub results_posted_delay_secs: u64,

    #[serde(default = "default_path_probe_delay")]
    pub path_probe_delay_secs: u64,

    #[serde(default = "default_event_lookup_timeout")]
    pub event_lookup_timeout_secs: u64,

    /// Timeout for vMix and FMS HTTP requests
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Endpoint returning the event list as JSON; lookups are skipped when unset
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EquipmentLogConfig {
    /// Endpoint accepting log entries as JSON; entries are dropped when unset
    #[serde(default)]
    pub url: Option<String>,

    /// Sent as a bearer token
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Cart number, selects the device addresses
    #[serde(default = "default_cart_number")]
    pub cart_number: u8,

    #[serde(default = "default_hw_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

// Default value functions
fn default_hub_url() -> String {
    "http://10.0.100.5/infrastructureHub".to_string()
}

fn default_fms_base_url() -> String {
    "http://10.0.100.5".to_string()
}

fn default_aborted_delay() -> u64 {
    10
}

fn default_skipped_results_delay() -> u64 {
    10
}

fn default_results_posted_delay() -> u64 {
    16
}

fn default_path_probe_delay() -> u64 {
    3
}

fn default_event_lookup_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    5
}

fn default_cart_number() -> u8 {
    1
}

fn default_hw_poll_interval() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    3
}

impl Default for FmsConfig {
    fn default() -> Self {
        Self {
            hub_url: default_hub_url(),
            base_url: default_fms_base_url(),
        }
    }
}

impl Default for AutoAvConfig {
    fn default() -> Self {
        Self {
            naming: NamingPreference::default(),
            recording_directory: None,
            event_name: None,
            aborted_delay_secs: default_aborted_delay(),
            skipped_results_delay_secs: default_skipped_results_delay(),
            results_posted_delay_secs: default_results_posted_delay(),
            path_probe_delay_secs: default_path_probe_delay(),
            event_lookup_timeout_secs: default_event_lookup_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cart_number: default_cart_number(),
            poll_interval_secs: default_hw_poll_interval(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl AutoAvConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Engine tunables derived from this section
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            delays: SettleDelays {
                aborted: Duration::from_secs(self.aborted_delay_secs),
                skipped_results: Duration::from_secs(self.skipped_results_delay_secs),
                results_posted: Duration::from_secs(self.results_posted_delay_secs),
            },
            path_probe_delay: Duration::from_secs(self.path_probe_delay_secs),
            event_lookup_timeout: Duration::from_secs(self.event_lookup_timeout_secs),
            naming: self.naming,
            recording_dir: self.recording_directory.clone(),
            event_name: self.event_name.clone(),
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_config_path()?)
    }

    /// Load configuration from `config_path`, writing defaults there if it is missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let contents = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path.to_path_buf());
            Ok(config)
        } else {
            // Create default config
            let config = Config {
                config_path: Some(config_path.to_path_buf()),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("org", "autoav", "agent")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}
