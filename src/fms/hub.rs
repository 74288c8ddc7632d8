//! FMS infrastructure hub client
//!
//! Speaks just enough of the SignalR JSON hub protocol to receive
//! notifications: negotiate, open the WebSocket, handshake, then read
//! record-separated JSON frames while sending keep-alive pings. Lost
//! connections are retried with a growing delay.

use anyhow::{bail, Context, Result};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message as WsMessage, Error as WsError},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::MatchStatus;

/// Record separator terminating every hub protocol frame
const RECORD_SEPARATOR: char = '\u{1e}';

const HANDSHAKE: &str = "{\"protocol\":\"json\",\"version\":1}\u{1e}";
const PING_FRAME: &str = "{\"type\":6}\u{1e}";

/// Matches the FMS audience display client settings
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const SERVER_TIMEOUT: Duration = Duration::from_secs(30);

const RECONNECT_STEP: Duration = Duration::from_secs(2);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(120);

/// Wait before retrying when the hub was never reached at all
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(120);

const MATCH_STATUS_CHANGED: &str = "matchstatusinfochanged";
const CONFIG_VALUE_CHANGED: &str = "systemconfigvaluechanged";

/// Notifications FMS broadcasts that AutoAV has no use for
const IGNORED_TARGETS: &[&str] = &[
    "fieldnetworkstatus",
    "matchtimerchanged",
    "plc_io_status_changed",
    "plc_match_status_changed",
    "plc_connection_status_changed",
    "robotversiondatachanged",
    "azuresyncprogress",
    "azuresyncstatuschanged",
];

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Events delivered by the hub client
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// `MatchStatusInfoChanged`
    MatchStatusChanged(MatchStatus),
    /// `SystemConfigValueChanged`, carrying the key that changed
    ConfigValueChanged(String),
    /// Connection (re-)established
    Connected,
    /// Connection lost; another attempt follows after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Connection closed or could not be opened
    Closed { reason: Option<String> },
}

/// A decoded hub protocol frame
#[derive(Debug, Clone, PartialEq)]
enum HubFrame {
    Invocation { target: String, arguments: Vec<Value> },
    Ping,
    Close { error: Option<String> },
    Other(u8),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Split a WebSocket text message into hub frames, skipping undecodable ones
fn parse_frames(text: &str) -> Vec<HubFrame> {
    text.split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
        .filter_map(|record| match serde_json::from_str::<RawFrame>(record) {
            Ok(raw) => Some(match raw.kind {
                1 => HubFrame::Invocation {
                    target: raw.target.unwrap_or_default(),
                    arguments: raw.arguments,
                },
                6 => HubFrame::Ping,
                7 => HubFrame::Close { error: raw.error },
                other => HubFrame::Other(other),
            }),
            Err(e) => {
                warn!("Dropping undecodable hub frame: {}", e);
                None
            }
        })
        .collect()
}

/// Outcome of routing an invocation
#[derive(Debug, PartialEq)]
enum Dispatch {
    Event(HubEvent),
    Ignored,
    Unknown,
}

/// Route an invocation by target name (case-insensitive, as SignalR does)
fn dispatch(target: &str, mut arguments: Vec<Value>) -> Dispatch {
    let target = target.to_ascii_lowercase();
    let first = if arguments.is_empty() {
        Value::Null
    } else {
        arguments.swap_remove(0)
    };

    match target.as_str() {
        MATCH_STATUS_CHANGED => match serde_json::from_value::<MatchStatus>(first) {
            Ok(status) => Dispatch::Event(HubEvent::MatchStatusChanged(status)),
            Err(e) => {
                warn!("Malformed match status payload: {}", e);
                Dispatch::Ignored
            }
        },
        CONFIG_VALUE_CHANGED => match first {
            Value::String(key) => Dispatch::Event(HubEvent::ConfigValueChanged(key)),
            other => Dispatch::Event(HubEvent::ConfigValueChanged(other.to_string())),
        },
        t if IGNORED_TARGETS.contains(&t) => Dispatch::Ignored,
        _ => Dispatch::Unknown,
    }
}

/// Delay before reconnect attempt `attempt` (0-based)
fn reconnect_delay(attempt: u32) -> Duration {
    RECONNECT_STEP
        .checked_mul(attempt)
        .unwrap_or(MAX_RECONNECT_DELAY)
        .min(MAX_RECONNECT_DELAY)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    #[serde(default)]
    connection_token: Option<String>,
    #[serde(default)]
    connection_id: Option<String>,
}

#[derive(Debug)]
enum SessionEnd {
    /// Shutdown requested or nobody is listening any more
    Cancelled,
    /// The hub closed the connection
    Closed(Option<String>),
}

/// Client for the FMS `infrastructureHub`
pub struct FmsHub {
    hub_url: String,
    http: reqwest::Client,
}

impl FmsHub {
    pub fn new(hub_url: impl Into<String>) -> Self {
        Self {
            hub_url: hub_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Run the connection loop in the background until `cancel` fires
    pub fn spawn(
        self,
        events: mpsc::Sender<HubEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(events, cancel).await })
    }

    async fn run(&self, events: mpsc::Sender<HubEvent>, cancel: CancellationToken) {
        let mut ever_connected = false;
        let mut attempt: u32 = 0;

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                connected = self.connect() => connected,
            };

            let delay = match outcome {
                Ok((ws, pending)) => {
                    info!("FMS connection established to {}", self.hub_url);
                    ever_connected = true;
                    attempt = 0;
                    if events.send(HubEvent::Connected).await.is_err() {
                        break;
                    }

                    match self.session(ws, pending, &events, &cancel).await {
                        Ok(SessionEnd::Cancelled) => break,
                        Ok(SessionEnd::Closed(reason)) => {
                            warn!("FMS connection closed by hub: {:?}", reason);
                        }
                        Err(e) => {
                            warn!("FMS connection lost: {:#}", e);
                        }
                    }
                    reconnect_delay(attempt)
                }
                Err(e) if ever_connected => {
                    warn!("FMS reconnect attempt {} failed: {:#}", attempt + 1, e);
                    attempt = attempt.saturating_add(1);
                    reconnect_delay(attempt)
                }
                Err(e) => {
                    warn!("FMS connection failed: {:#}", e);
                    if events
                        .send(HubEvent::Closed {
                            reason: Some(format!("{e:#}")),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    INITIAL_RETRY_DELAY
                }
            };

            if ever_connected {
                info!("Retrying FMS connection in {:?}", delay);
                let notice = HubEvent::Reconnecting { attempt, delay };
                if events.send(notice).await.is_err() {
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("FMS hub client stopped");
        let _ = events.send(HubEvent::Closed { reason: None }).await;
    }

    /// Negotiate, open the socket and complete the protocol handshake
    async fn connect(&self) -> Result<(WsStream, Vec<HubFrame>)> {
        let base = self.hub_url.trim_end_matches('/');
        let negotiate: NegotiateResponse = self
            .http
            .post(format!("{base}/negotiate?negotiateVersion=1"))
            .send()
            .await
            .context("Failed to negotiate with FMS hub")?
            .error_for_status()
            .context("FMS hub negotiate returned error status")?
            .json()
            .await
            .context("Failed to parse FMS hub negotiate response")?;

        let id = negotiate
            .connection_token
            .or(negotiate.connection_id)
            .context("FMS hub negotiate response carried no connection id")?;

        let ws_url = format!("{}?id={}", websocket_url(base), id);
        debug!("Connecting to FMS hub socket {}", ws_url);

        let (mut ws, _) = connect_async(ws_url.as_str())
            .await
            .context("Failed to open FMS hub socket")?;

        ws.send(WsMessage::Text(HANDSHAKE.to_string().into()))
            .await
            .context("Failed to send hub handshake")?;

        let reply = tokio::time::timeout(SERVER_TIMEOUT, ws.next())
            .await
            .context("Timed out waiting for hub handshake")?;

        let text = match reply {
            Some(Ok(WsMessage::Text(text))) => text.as_str().to_owned(),
            Some(Ok(other)) => bail!("Unexpected handshake reply: {other:?}"),
            Some(Err(e)) => return Err(e).context("Hub socket error during handshake"),
            None => bail!("Hub closed the socket during handshake"),
        };

        let mut records = text.split(RECORD_SEPARATOR);
        let handshake: Value = serde_json::from_str(records.next().unwrap_or("{}"))
            .context("Failed to parse hub handshake reply")?;
        if let Some(error) = handshake.get("error").and_then(Value::as_str) {
            bail!("Hub rejected handshake: {error}");
        }

        let rest: Vec<&str> = records.collect();
        let pending = parse_frames(&rest.join("\u{1e}"));
        Ok((ws, pending))
    }

    async fn session(
        &self,
        ws: WsStream,
        pending: Vec<HubFrame>,
        events: &mpsc::Sender<HubEvent>,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd> {
        let (write, read) = ws.split();
        pump(write, read, pending, events, cancel).await
    }
}

/// Forward frames until the connection ends, pinging the hub meanwhile
///
/// Fails once nothing has been heard from the hub for [`SERVER_TIMEOUT`].
async fn pump<W, R>(
    mut write: W,
    mut read: R,
    pending: Vec<HubFrame>,
    events: &mpsc::Sender<HubEvent>,
    cancel: &CancellationToken,
) -> Result<SessionEnd>
where
    W: Sink<WsMessage, Error = WsError> + Unpin,
    R: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    for frame in pending {
        if let Some(end) = forward(frame, events).await {
            return Ok(end);
        }
    }

    let mut keep_alive =
        tokio::time::interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return Ok(SessionEnd::Cancelled);
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_seen = Instant::now();
                        for frame in parse_frames(&text) {
                            if let Some(end) = forward(frame, events).await {
                                return Ok(end);
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        return Ok(SessionEnd::Closed(frame.map(|f| f.reason.as_str().to_owned())));
                    }
                    Some(Ok(_)) => {
                        last_seen = Instant::now();
                    }
                    Some(Err(e)) => return Err(e).context("FMS hub socket error"),
                    None => return Ok(SessionEnd::Closed(None)),
                }
            }

            _ = tokio::time::sleep_until(last_seen + SERVER_TIMEOUT) => {
                bail!("No message from FMS hub for {:?}", SERVER_TIMEOUT);
            }

            _ = keep_alive.tick() => {
                write
                    .send(WsMessage::Text(PING_FRAME.to_string().into()))
                    .await
                    .context("Failed to send hub keep-alive")?;
            }
        }
    }
}

/// Deliver one frame; returns how the session ends if it should
async fn forward(frame: HubFrame, events: &mpsc::Sender<HubEvent>) -> Option<SessionEnd> {
    match frame {
        HubFrame::Invocation { target, arguments } => match dispatch(&target, arguments) {
            Dispatch::Event(event) => {
                if events.send(event).await.is_err() {
                    return Some(SessionEnd::Cancelled);
                }
            }
            Dispatch::Ignored => trace!("Ignoring hub notification {}", target),
            Dispatch::Unknown => debug!("Unhandled hub notification {}", target),
        },
        HubFrame::Close { error } => return Some(SessionEnd::Closed(error)),
        HubFrame::Ping | HubFrame::Other(_) => {}
    }
    None
}

fn websocket_url(http_url: &str) -> String {
    if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_url.to_string()
    }
}
