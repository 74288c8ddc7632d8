//! FMS system configuration reads

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use anyhow::{Context, Result};

/// Read access to FMS system config values
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Fetch the raw value of a config key
    ///
    /// The value is returned exactly as FMS serves it; string values keep
    /// their JSON quotes.
    async fn get(&self, key: &str) -> Result<String>;
}

/// Settings source backed by the FMS REST API
#[derive(Clone)]
pub struct FmsSettings {
    client: Client,
    base_url: String,
}

impl FmsSettings {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build FMS settings HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!(
            "{}/api/v1.0/settings/get/get_{}",
            self.base_url.trim_end_matches('/'),
            key
        )
    }
}

#[async_trait]
impl SettingsSource for FmsSettings {
    async fn get(&self, key: &str) -> Result<String> {
        let url = self.url_for(key);
        self.client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to request FMS setting {key}"))?
            .error_for_status()
            .with_context(|| format!("FMS setting {key} returned error status"))?
            .text()
            .await
            .with_context(|| format!("Failed to read FMS setting {key}"))
    }
}
