//! Equipment log: cart activity reported to the central infrastructure service

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogSeverity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    AutoavRecording,
    AutoavFms,
}

/// One equipment log line
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub message: String,
    pub severity: LogSeverity,
    pub category: LogCategory,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(severity: LogSeverity, category: LogCategory, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity,
            category,
            timestamp: Utc::now(),
        }
    }
}

/// Sink for equipment log entries
#[async_trait]
pub trait EquipmentLog: Send + Sync {
    async fn write(&self, entry: &LogEntry) -> Result<()>;
}

/// Posts entries as JSON to the infrastructure service
#[derive(Clone)]
pub struct HttpEquipmentLog {
    client: Client,
    url: Option<String>,
    api_key: Option<String>,
}

impl HttpEquipmentLog {
    pub fn new(url: Option<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build equipment log HTTP client")?;
        Ok(Self {
            client,
            url,
            api_key,
        })
    }
}

#[async_trait]
impl EquipmentLog for HttpEquipmentLog {
    async fn write(&self, entry: &LogEntry) -> Result<()> {
        let Some(url) = &self.url else {
            trace!("Equipment log URL not configured, dropping: {}", entry.message);
            return Ok(());
        };

        let mut request = self.client.post(url).json(entry);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        request
            .send()
            .await
            .context("Failed to send equipment log entry")?
            .error_for_status()
            .context("Equipment log returned error status")?;
        Ok(())
    }
}
