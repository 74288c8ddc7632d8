//! vMix Web API client
//!
//! vMix exposes a function-style API: every command is a GET with a
//! `Function` query parameter, and `GET <base>` returns the full XML state.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::RecordingBackend;
use crate::error::{AutoAvError, AutoAvResult};

/// Number of streaming destinations vMix supports
const SUPPORTED_STREAMS: u8 = 3;

/// Connection settings for the vMix Web API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmixSettings {
    /// API endpoint, e.g. `http://127.0.0.1:8088/api`
    pub base_url: String,
    pub username: String,
    pub password: String,
}

impl Default for VmixSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8088/api".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// RTMP destination for one stream slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub index: u8,
    pub rtmp_url: String,
    pub rtmp_key: String,
}

#[derive(Debug, Default, Deserialize)]
struct VmixState {
    #[serde(default)]
    recording: Option<RecordingElement>,
}

/// `<recording filename1="C:\...\capture.mp4">True</recording>`
#[derive(Debug, Default, Deserialize)]
struct RecordingElement {
    #[serde(default)]
    filename1: Option<String>,
    #[serde(rename = "$value", default)]
    active: Option<String>,
}

impl RecordingElement {
    fn is_active(&self) -> bool {
        self.active.as_deref().map(str::trim) == Some("True")
    }
}

#[derive(Clone)]
pub struct VmixClient {
    client: Client,
    settings: VmixSettings,
}

impl VmixClient {
    pub fn new(settings: VmixSettings, timeout: Duration) -> AutoAvResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AutoAvError::backend("client setup", e))?;
        Ok(Self { client, settings })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if !self.settings.username.is_empty() && !self.settings.password.is_empty() {
            request.basic_auth(&self.settings.username, Some(&self.settings.password))
        } else {
            request
        }
    }

    /// Invoke a vMix function
    async fn call(
        &self,
        operation: &'static str,
        function: &str,
        value: Option<&str>,
    ) -> AutoAvResult<()> {
        let mut request = self
            .client
            .get(&self.settings.base_url)
            .query(&[("Function", function)]);
        if let Some(value) = value {
            request = request.query(&[("Value", value)]);
        }

        self.authorize(request)
            .send()
            .await
            .map_err(|e| AutoAvError::backend(operation, e))?
            .error_for_status()
            .map_err(|e| AutoAvError::backend(operation, e))?;

        debug!("vMix {} ok", function);
        Ok(())
    }

    async fn state(&self, operation: &'static str) -> AutoAvResult<VmixState> {
        let xml = self
            .authorize(self.client.get(&self.settings.base_url))
            .send()
            .await
            .map_err(|e| AutoAvError::backend(operation, e))?
            .error_for_status()
            .map_err(|e| AutoAvError::backend(operation, e))?
            .text()
            .await
            .map_err(|e| AutoAvError::backend(operation, e))?;

        serde_xml_rs::from_str(&xml).map_err(|e| AutoAvError::backend(operation, e))
    }

    pub async fn start_streaming(&self, stream: Option<u8>) -> AutoAvResult<()> {
        let value = stream.map(|s| s.to_string()).unwrap_or_default();
        self.call("start streaming", "StartStreaming", Some(&value)).await
    }

    pub async fn stop_streaming(&self, stream: Option<u8>) -> AutoAvResult<()> {
        let value = stream.map(|s| s.to_string()).unwrap_or_default();
        self.call("stop streaming", "StopStreaming", Some(&value)).await
    }

    /// Configure every stream slot, blanking the ones not given
    pub async fn set_stream_info(&self, streams: &[StreamInfo]) -> AutoAvResult<()> {
        let streams = fill_stream_slots(streams);
        info!("Setting {} streams in vMix", streams.len());

        for stream in &streams {
            self.call(
                "set stream url",
                "StreamingSetURL",
                Some(&format!("{},{}", stream.index, stream.rtmp_url)),
            )
            .await?;
            self.call(
                "set stream key",
                "StreamingSetKey",
                Some(&format!("{},{}", stream.index, stream.rtmp_key)),
            )
            .await?;
        }
        Ok(())
    }
}

/// Drop incomplete entries and add blank ones for every unused slot
fn fill_stream_slots(streams: &[StreamInfo]) -> Vec<StreamInfo> {
    let mut filled: Vec<StreamInfo> = streams
        .iter()
        .filter(|s| !s.rtmp_url.is_empty() && !s.rtmp_key.is_empty())
        .cloned()
        .collect();

    for index in 0..SUPPORTED_STREAMS {
        if !filled.iter().any(|s| s.index == index) {
            filled.push(StreamInfo {
                index,
                ..Default::default()
            });
        }
    }
    filled.sort_by_key(|s| s.index);
    filled
}

#[async_trait]
impl RecordingBackend for VmixClient {
    async fn start_recording(&self) -> AutoAvResult<()> {
        self.call("start recording", "StartRecording", None).await
    }

    async fn stop_recording(&self) -> AutoAvResult<()> {
        self.call("stop recording", "StopRecording", None).await
    }

    async fn is_recording(&self) -> AutoAvResult<bool> {
        let state = self.state("recording status").await?;
        Ok(state.recording.is_some_and(|r| r.is_active()))
    }

    async fn current_recording_path(&self) -> AutoAvResult<Option<String>> {
        let state = self.state("recording path").await?;
        Ok(state
            .recording
            .and_then(|r| r.filename1)
            .filter(|p| !p.is_empty()))
    }

    fn location(&self) -> String {
        self.settings.base_url.clone()
    }
}
