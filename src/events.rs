//! Event reference data and active-event lookup

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Placeholder used whenever no event can be resolved
pub const UNKNOWN_EVENT: &str = "Unknown Event";

/// An event as listed by the event directory
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_official: bool,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

impl Event {
    /// An ad-hoc event carrying only a name, used for operator overrides
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            code: None,
            name: name.into(),
            is_official: false,
            start_time: None,
            end_time: None,
        }
    }

    /// Whether `now` falls inside the event's `[start, end)` window
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        let (Some(start), Some(end)) = (
            self.start_time.as_deref().and_then(parse_timestamp),
            self.end_time.as_deref().and_then(parse_timestamp),
        ) else {
            return false;
        };
        start <= now && now < end
    }
}

/// Pick the event whose window contains `now`
pub fn current_event(events: &[Event], now: DateTime<Utc>) -> Option<&Event> {
    events.iter().find(|e| e.is_active_at(now))
}

/// Event timestamps come either with an offset or as venue-local wall time
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Source of the currently active event
#[async_trait]
pub trait EventDirectory: Send + Sync {
    /// Resolve the event running now, if any
    async fn current_event(&self) -> Result<Option<Event>>;
}

/// Event directory backed by an HTTP endpoint returning a JSON array
#[derive(Clone)]
pub struct HttpEventDirectory {
    client: Client,
    url: Option<String>,
}

impl HttpEventDirectory {
    pub fn new(url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build event directory HTTP client")?;
        Ok(Self { client, url })
    }

    pub async fn list_events(&self) -> Result<Vec<Event>> {
        let url = self.url.as_ref().context("Events URL not configured")?;

        let events: Vec<Event> = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to request event list")?
            .error_for_status()
            .context("Event list returned error status")?
            .json()
            .await
            .context("Failed to parse event list")?;

        debug!("Fetched {} events", events.len());
        Ok(events)
    }
}

#[async_trait]
impl EventDirectory for HttpEventDirectory {
    async fn current_event(&self) -> Result<Option<Event>> {
        if self.url.is_none() {
            debug!("No events URL configured, skipping lookup");
            return Ok(None);
        }
        let events = self.list_events().await?;
        Ok(current_event(&events, Utc::now()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event(name: &str, start: &str, end: &str) -> Event {
        Event {
            id: name.to_lowercase(),
            code: None,
            name: name.to_string(),
            is_official: true,
            start_time: Some(start.to_string()),
            end_time: Some(end.to_string()),
        }
    }

    #[test]
    fn test_current_event_window() {
        let events = vec![
            event("Past", "2024-03-01T08:00:00Z", "2024-03-03T18:00:00Z"),
            event("Now", "2024-03-08T08:00:00Z", "2024-03-10T18:00:00Z"),
        ];
        let now = DateTime::parse_from_rfc3339("2024-03-09T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(current_event(&events, now).unwrap().name, "Now");

        let end = DateTime::parse_from_rfc3339("2024-03-10T18:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(current_event(&events, end).is_none());
    }

    #[test]
    fn test_event_without_window_never_active() {
        let e = Event::named("Scrimmage");
        assert!(!e.is_active_at(Utc::now()));
    }

    #[tokio::test]
    async fn test_http_directory_selects_active_event() {
        let server = MockServer::start().await;
        let now = Utc::now();
        let body = serde_json::json!([
            {
                "id": "a",
                "code": "OLD",
                "name": "Old Event",
                "isOfficial": true,
                "startTime": (now - chrono::Duration::days(10)).to_rfc3339(),
                "endTime": (now - chrono::Duration::days(8)).to_rfc3339()
            },
            {
                "id": "b",
                "code": "TE24",
                "name": "Test Event",
                "isOfficial": true,
                "startTime": (now - chrono::Duration::hours(2)).to_rfc3339(),
                "endTime": (now + chrono::Duration::hours(2)).to_rfc3339(),
                "timeZone": "Eastern Standard Time",
                "status": "Active"
            }
        ]);

        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let directory = HttpEventDirectory::new(
            Some(format!("{}/events", server.uri())),
            Duration::from_secs(5),
        )
        .unwrap();

        let current = directory.current_event().await.unwrap().unwrap();
        assert_eq!(current.code.as_deref(), Some("TE24"));
        assert!(current.is_official);
    }

    #[tokio::test]
    async fn test_http_directory_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let directory =
            HttpEventDirectory::new(Some(server.uri()), Duration::from_secs(5)).unwrap();
        assert!(directory.current_event().await.is_err());
    }
}
