//! Recording lifecycle controller
//!
//! Owns the recording session and every timer. Backend calls, settings
//! fetches and the stop routine run as spawned tasks whose outcomes are fed
//! back into the loop, so hub notifications keep being serviced while a
//! call is in flight.

use chrono::{DateTime, Datelike, Local};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::equipment_log::{EquipmentLog, LogCategory, LogEntry, LogSeverity};
use crate::error::{AutoAvError, AutoAvResult};
use crate::events::{Event, EventDirectory};
use crate::fms::{HubEvent, MatchState, MatchStatus, SettingsSource, TournamentLevel};
use crate::vmix::RecordingBackend;

use super::naming::{self, NamingPreference};
use super::tracker::{Intent, MatchStateTracker, SettleDelays, StopReason, VIDEO_SWITCH_OPTION};
use super::{AutoAvCommand, AutoAvStatus, RecorderPhase};

/// External collaborators of the engine
#[derive(Clone)]
pub struct EngineDeps {
    pub backend: Arc<dyn RecordingBackend>,
    pub settings: Arc<dyn SettingsSource>,
    pub events: Arc<dyn EventDirectory>,
    pub equipment_log: Arc<dyn EquipmentLog>,
}

/// Tunables of the engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub delays: SettleDelays,
    /// How long after a start to ask the backend for the file it is writing
    pub path_probe_delay: Duration,
    pub event_lookup_timeout: Duration,
    pub naming: NamingPreference,
    /// Where vMix writes captures; used when no path was reported
    pub recording_dir: Option<PathBuf>,
    /// Initial event name override
    pub event_name: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            delays: SettleDelays::default(),
            path_probe_delay: Duration::from_secs(3),
            event_lookup_timeout: Duration::from_secs(5),
            naming: NamingPreference::Auto,
            recording_dir: None,
            event_name: None,
        }
    }
}

/// The live recording
#[derive(Debug, Clone)]
struct RecordingSession {
    id: Uuid,
    started_at: DateTime<Local>,
    match_at_start: MatchStatus,
    discovered_path: Option<PathBuf>,
}

#[derive(Debug)]
struct PendingStop {
    deadline: Instant,
    reason: StopReason,
}

/// Result of a spawned task, fed back into the loop
enum TaskOutcome {
    Started {
        status: MatchStatus,
        result: AutoAvResult<()>,
    },
    PathProbed {
        session: Uuid,
        result: AutoAvResult<Option<String>>,
    },
    SettingFetched {
        key: String,
        result: anyhow::Result<String>,
    },
    Stopped(StopReport),
    Logged(anyhow::Result<()>),
}

#[derive(Debug)]
enum StopReport {
    NotRecording,
    Failed(AutoAvError),
    Stopped {
        event_name: Option<String>,
        filed: FileOutcome,
    },
}

#[derive(Debug)]
enum FileOutcome {
    Filed(PathBuf),
    Skipped(&'static str),
    Failed(AutoAvError),
}

/// Everything the stop routine needs, detached from the engine
struct StopJob {
    backend: Arc<dyn RecordingBackend>,
    events: Arc<dyn EventDirectory>,
    session: Option<RecordingSession>,
    event_override: Option<String>,
    naming: NamingPreference,
    recording_dir: Option<PathBuf>,
    lookup_timeout: Duration,
}

impl StopJob {
    async fn run(self) -> StopReport {
        match self.backend.is_recording().await {
            Ok(true) => {}
            Ok(false) => return StopReport::NotRecording,
            Err(e) => return StopReport::Failed(e),
        }

        if let Err(e) = self.backend.stop_recording().await {
            return StopReport::Failed(e);
        }
        info!("Stopped Recording");

        let Some(session) = self.session.as_ref() else {
            return StopReport::Stopped {
                event_name: None,
                filed: FileOutcome::Skipped("no session was started by AutoAV"),
            };
        };

        let event = self.resolve_event().await;
        let filed = self.file_recording(session, event.as_ref());
        StopReport::Stopped {
            event_name: Some(naming::event_name(event.as_ref()).to_string()),
            filed,
        }
    }

    async fn resolve_event(&self) -> Option<Event> {
        if let Some(name) = &self.event_override {
            return Some(Event::named(name.clone()));
        }

        match tokio::time::timeout(self.lookup_timeout, self.events.current_event()).await {
            Ok(Ok(Some(event))) => Some(event),
            Ok(Ok(None)) => {
                info!("No active event, using placeholder name");
                None
            }
            Ok(Err(e)) => {
                warn!("{}", AutoAvError::EventLookupFailed(format!("{e:#}")));
                None
            }
            Err(_) => {
                warn!(
                    "{}",
                    AutoAvError::EventLookupFailed(format!(
                        "timed out after {:?}",
                        self.lookup_timeout
                    ))
                );
                None
            }
        }
    }

    fn file_recording(&self, session: &RecordingSession, event: Option<&Event>) -> FileOutcome {
        let source = match (&session.discovered_path, &self.recording_dir) {
            (Some(path), _) => path.clone(),
            (None, Some(dir)) => match naming::find_recording_near(dir, session.started_at) {
                Ok(path) => {
                    info!("Found recording by capture time: {:?}", path);
                    path
                }
                Err(e) => return FileOutcome::Failed(e),
            },
            (None, None) => {
                return FileOutcome::Skipped("recording path unknown and no recording directory set")
            }
        };

        let year = Local::now().year();
        let mode = self.naming.resolve(event);
        let filename = naming::recording_filename(event, &session.match_at_start, mode, year);
        let folder = naming::event_folder_name(event, year);

        match naming::move_recording(Some(&source), &folder, &filename) {
            Ok(path) => FileOutcome::Filed(path),
            Err(e) => FileOutcome::Failed(e),
        }
    }
}

/// The AutoAV engine drives recording from match state
pub struct AutoAvEngine {
    options: EngineOptions,
    deps: EngineDeps,
    /// Command receiver
    cmd_rx: mpsc::Receiver<AutoAvCommand>,
    /// Hub events from the FMS client
    hub_rx: mpsc::Receiver<HubEvent>,
    /// Status broadcaster
    status_tx: broadcast::Sender<AutoAvStatus>,
    tracker: MatchStateTracker,
    session: Option<RecordingSession>,
    /// A start call is in flight
    starting: bool,
    /// The stop routine is running
    stopping: bool,
    pending_stop: Option<PendingStop>,
    path_probe: Option<(Instant, Uuid)>,
    event_override: Option<String>,
    /// Last match a recording was started for; seeds manual starts
    last_started: Option<MatchStatus>,
    shutting_down: bool,
    tasks: JoinSet<TaskOutcome>,
}

impl AutoAvEngine {
    pub fn new(
        options: EngineOptions,
        deps: EngineDeps,
        cmd_rx: mpsc::Receiver<AutoAvCommand>,
        hub_rx: mpsc::Receiver<HubEvent>,
        status_tx: broadcast::Sender<AutoAvStatus>,
    ) -> Self {
        let tracker = MatchStateTracker::new(options.delays);
        let event_override = options.event_name.clone();
        Self {
            options,
            deps,
            cmd_rx,
            hub_rx,
            status_tx,
            tracker,
            session: None,
            starting: false,
            stopping: false,
            pending_stop: None,
            path_probe: None,
            event_override,
            last_started: None,
            shutting_down: false,
            tasks: JoinSet::new(),
        }
    }

    /// Run the engine main loop until shutdown
    pub async fn run(&mut self) {
        info!("AutoAV engine starting");
        self.notify("AutoAV Service Started");
        self.set_phase(RecorderPhase::Idle);

        loop {
            // A due stop waits for an in-flight start to resolve
            let stop_deadline = self
                .pending_stop
                .as_ref()
                .filter(|_| !self.starting)
                .map(|p| p.deadline);
            let probe_deadline = self.path_probe.map(|(deadline, _)| deadline);

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(AutoAvCommand::Shutdown) => {
                            info!("Shutdown command received");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            debug!("Command channel closed");
                            break;
                        }
                    }
                }

                Some(event) = self.hub_rx.recv() => {
                    self.handle_hub_event(event);
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.handle_joined(joined);
                }

                _ = async {
                    match stop_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.begin_stop();
                }

                _ = async {
                    match probe_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.probe_path();
                }
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        self.shutting_down = true;
        if let Some(pending) = self.pending_stop.take() {
            info!("Dropping pending stop ({}) on shutdown", pending.reason);
        }
        self.path_probe = None;

        if !self.tasks.is_empty() {
            info!("Waiting for {} in-flight call(s)", self.tasks.len());
        }
        while let Some(joined) = self.tasks.join_next().await {
            self.handle_joined(joined);
        }

        self.notify("AutoAV Service Stopped");
        info!("AutoAV engine stopped");
    }

    fn handle_command(&mut self, cmd: AutoAvCommand) {
        match cmd {
            AutoAvCommand::StartRecording(status) => {
                let status = status.unwrap_or_else(|| self.next_manual_match());
                info!("Manual start requested for {}", status);
                self.request_start(status);
            }
            AutoAvCommand::StopRecording => {
                info!("Manual stop requested");
                self.request_immediate_stop();
            }
            AutoAvCommand::CancelPendingStop => match self.pending_stop.take() {
                Some(pending) => {
                    info!("Cancelled pending stop ({})", pending.reason);
                    self.notify("Pending stop cancelled");
                    self.set_phase(self.settled_phase());
                }
                None => debug!("No pending stop to cancel"),
            },
            AutoAvCommand::SetEventName(name) => {
                let name = name
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty());
                match &name {
                    Some(n) => info!("Event name override set: {}", n),
                    None => info!("Event name override cleared"),
                }
                self.event_override = name;
            }
            AutoAvCommand::Shutdown => {}
        }
    }

    fn handle_hub_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::MatchStatusChanged(status) => {
                let stop_pending = self.stop_pending();
                if let Some(intent) = self.tracker.observe(status, stop_pending) {
                    self.apply(intent);
                }
            }
            HubEvent::ConfigValueChanged(key) => {
                info!("Got a config value change: {}", key);
                if key == VIDEO_SWITCH_OPTION {
                    let settings = self.deps.settings.clone();
                    self.tasks.spawn(async move {
                        let result = settings.get(&key).await;
                        TaskOutcome::SettingFetched { key, result }
                    });
                }
            }
            HubEvent::Connected => {
                info!(connection = "established", "FMS connection established");
                self.notify("FMS Connection Established");
                self.equipment_log(LogSeverity::Info, LogCategory::AutoavFms, "FMS connected!");
            }
            HubEvent::Reconnecting { attempt, delay } => {
                warn!(
                    connection = "reconnecting",
                    "FMS connection lost, reconnect attempt {} in {:?}", attempt, delay
                );
                self.notify(format!("FMS Connection Lost, Reconnecting (attempt {attempt})"));
                self.equipment_log(LogSeverity::Warn, LogCategory::AutoavFms, "Reconnecting to FMS");
            }
            HubEvent::Closed { reason } => {
                warn!(
                    connection = "closed",
                    "FMS connection closed: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.notify("FMS Connection Closed");
                match reason {
                    Some(reason) => self.equipment_log(
                        LogSeverity::Error,
                        LogCategory::AutoavFms,
                        format!("FMS connection failed! {reason}"),
                    ),
                    None => self.equipment_log(
                        LogSeverity::Warn,
                        LogCategory::AutoavFms,
                        "Lost connection to FMS",
                    ),
                }
            }
        }
    }

    fn apply(&mut self, intent: Intent) {
        match intent {
            Intent::Start(status) => self.request_start(status),
            Intent::Stop { reason, delay } => self.request_stop(reason, delay),
        }
    }

    fn request_start(&mut self, status: MatchStatus) {
        if self.shutting_down {
            return;
        }
        if self.session.is_some() || self.starting {
            debug!("Already recording, ignoring start for {}", status);
            return;
        }

        info!("Starting recording for {}", status);
        self.starting = true;
        self.set_phase(RecorderPhase::Starting);

        let backend = self.deps.backend.clone();
        self.tasks.spawn(async move {
            let result = backend.start_recording().await;
            TaskOutcome::Started { status, result }
        });
    }

    fn request_stop(&mut self, reason: StopReason, delay: Duration) {
        if self.shutting_down {
            return;
        }
        if self.stop_pending() {
            debug!("Stop already pending, ignoring stop ({})", reason);
            return;
        }
        if self.session.is_none() && !self.starting {
            debug!("Not recording, ignoring stop ({})", reason);
            return;
        }

        info!("Stopping recording in {:?} ({})", delay, reason);
        self.notify(format!(
            "Stopping recording in {} seconds ({reason})",
            delay.as_secs()
        ));
        self.pending_stop = Some(PendingStop {
            deadline: Instant::now() + delay,
            reason,
        });
        self.set_phase(RecorderPhase::StopScheduled { reason, delay });
    }

    /// Operator stop; runs the routine on the next loop turn even without a session
    fn request_immediate_stop(&mut self) {
        if self.stopping {
            debug!("Stop already running");
            return;
        }
        self.pending_stop = Some(PendingStop {
            deadline: Instant::now(),
            reason: StopReason::Manual,
        });
        self.set_phase(RecorderPhase::StopScheduled {
            reason: StopReason::Manual,
            delay: Duration::ZERO,
        });
    }

    fn begin_stop(&mut self) {
        let Some(pending) = self.pending_stop.take() else {
            return;
        };
        if self.session.is_none() && pending.reason != StopReason::Manual {
            debug!("No recording was started, dropping stop ({})", pending.reason);
            self.set_phase(self.settled_phase());
            return;
        }

        info!("Running stop routine ({})", pending.reason);
        self.equipment_log(LogSeverity::Info, LogCategory::AutoavRecording, "Stopping recording");
        self.stopping = true;
        self.path_probe = None;
        self.set_phase(RecorderPhase::Stopping);

        let job = StopJob {
            backend: self.deps.backend.clone(),
            events: self.deps.events.clone(),
            session: self.session.clone(),
            event_override: self.event_override.clone(),
            naming: self.options.naming,
            recording_dir: self.options.recording_dir.clone(),
            lookup_timeout: self.options.event_lookup_timeout,
        };
        self.tasks
            .spawn(async move { TaskOutcome::Stopped(job.run().await) });
    }

    fn probe_path(&mut self) {
        let Some((_, session)) = self.path_probe.take() else {
            return;
        };
        let backend = self.deps.backend.clone();
        self.tasks.spawn(async move {
            let result = backend.current_recording_path().await;
            TaskOutcome::PathProbed { session, result }
        });
    }

    fn handle_joined(&mut self, joined: Result<TaskOutcome, JoinError>) {
        match joined {
            Ok(outcome) => self.handle_outcome(outcome),
            Err(e) => {
                error!("Background call failed: {}", e);
                if self.starting {
                    self.starting = false;
                    self.drop_orphaned_stop();
                }
                if self.stopping {
                    self.finish_stop();
                }
            }
        }
    }

    fn handle_outcome(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Started { status, result } => {
                self.starting = false;
                match result {
                    Ok(()) => self.on_started(status),
                    Err(e) => {
                        error!("Error starting recording: {}", e);
                        let location = self.deps.backend.location();
                        self.notify(format!("Error Starting Recording. Is vMix at {location}?"));
                        self.equipment_log(
                            LogSeverity::Error,
                            LogCategory::AutoavRecording,
                            format!(
                                "Failed to start recording. Unable to talk to vMix? Configured URL: {location}"
                            ),
                        );
                        self.drop_orphaned_stop();
                        self.set_phase(self.settled_phase());
                    }
                }
            }
            TaskOutcome::PathProbed { session, result } => {
                let Some(current) = self.session.as_mut().filter(|s| s.id == session) else {
                    debug!("Discarding path probe for finished session {}", session);
                    return;
                };
                match result {
                    Ok(Some(path)) if !path.is_empty() => {
                        info!("Recording to {}", path);
                        current.discovered_path = Some(PathBuf::from(path));
                    }
                    Ok(_) => warn!("vMix did not report a recording path"),
                    Err(e) => warn!("Failed to read recording path: {}", e),
                }
            }
            TaskOutcome::SettingFetched { key, result } => match result {
                Ok(value) => {
                    info!("Got {}: {}", key, value);
                    if let Some(intent) = self.tracker.observe_config_value(&key, &value) {
                        self.apply(intent);
                    }
                }
                Err(e) => warn!("Failed to fetch {}: {:#}", key, e),
            },
            TaskOutcome::Stopped(report) => {
                self.on_stopped(report);
                self.finish_stop();
            }
            TaskOutcome::Logged(result) => {
                if let Err(e) = result {
                    warn!("Failed to write equipment log: {:#}", e);
                }
            }
        }
    }

    /// A stop scheduled while the start was in flight has nothing to stop
    fn drop_orphaned_stop(&mut self) {
        if self.session.is_some() {
            return;
        }
        if let Some(pending) = &self.pending_stop {
            if pending.reason != StopReason::Manual {
                info!("Start failed, dropping pending stop ({})", pending.reason);
                self.pending_stop = None;
            }
        }
    }

    fn on_started(&mut self, status: MatchStatus) {
        let session = RecordingSession {
            id: Uuid::new_v4(),
            started_at: Local::now(),
            match_at_start: status.clone(),
            discovered_path: None,
        };
        info!("Started Recording (session {}) for {}", session.id, status);
        self.notify(format!(
            "Started Recording {} Match #{}-{}",
            status.level_label(),
            status.match_number_label(),
            status.play_number_label()
        ));
        self.equipment_log(
            LogSeverity::Info,
            LogCategory::AutoavRecording,
            format!(
                "Starting recording of {} {} (play {})",
                status.level_label(),
                status.match_number_label(),
                status.play_number_label()
            ),
        );

        self.path_probe = Some((Instant::now() + self.options.path_probe_delay, session.id));
        self.last_started = Some(status.clone());
        self.session = Some(session);

        // A stop may have been scheduled while the start was in flight
        if self.pending_stop.is_none() {
            self.set_phase(RecorderPhase::Recording {
                match_status: status,
            });
        }
    }

    fn on_stopped(&mut self, report: StopReport) {
        let session = self
            .session
            .as_ref()
            .map(|s| s.id.to_string())
            .unwrap_or_else(|| "none".to_string());

        match report {
            StopReport::NotRecording => {
                warn!("Stop requested but {} (session {})", AutoAvError::NotRecording, session);
                self.notify("vMix is not recording, nothing to stop");
            }
            StopReport::Failed(e) => {
                error!("Error stopping recording (session {}): {}", session, e);
                self.notify(format!(
                    "Error Stopping Recording. Is vMix at {}?",
                    self.deps.backend.location()
                ));
            }
            StopReport::Stopped { event_name, filed } => {
                if let Some(name) = event_name {
                    info!("Filing recording (session {}) under event {}", session, name);
                }
                match filed {
                    FileOutcome::Filed(path) => {
                        info!("Renamed recording to {:?}", path);
                        self.notify(format!("Recording saved as {}", path.display()));
                    }
                    FileOutcome::Skipped(why) => {
                        info!("Not renaming recording: {}", why);
                        self.notify(format!("Recording stopped, not renamed: {why}"));
                    }
                    FileOutcome::Failed(e) => {
                        error!("{}", e);
                        self.notify(format!("Recording stopped but could not be renamed: {e}"));
                    }
                }
            }
        }
    }

    fn finish_stop(&mut self) {
        self.stopping = false;
        self.session = None;
        self.path_probe = None;
        self.set_phase(self.settled_phase());
    }

    fn stop_pending(&self) -> bool {
        self.pending_stop.is_some() || self.stopping
    }

    /// Phase implied by the current state, ignoring scheduled stops
    fn settled_phase(&self) -> RecorderPhase {
        if self.stopping {
            RecorderPhase::Stopping
        } else if let Some(session) = &self.session {
            RecorderPhase::Recording {
                match_status: session.match_at_start.clone(),
            }
        } else if self.starting {
            RecorderPhase::Starting
        } else {
            RecorderPhase::Idle
        }
    }

    fn next_manual_match(&self) -> MatchStatus {
        let number = self
            .last_started
            .as_ref()
            .and_then(|s| s.match_number)
            .map_or(1, |n| n + 1);
        MatchStatus::new(
            MatchState::GameSpecificData,
            TournamentLevel::Qualification,
            number,
            1,
        )
    }

    fn equipment_log(
        &mut self,
        severity: LogSeverity,
        category: LogCategory,
        message: impl Into<String>,
    ) {
        let sink = self.deps.equipment_log.clone();
        let entry = LogEntry::new(severity, category, message);
        self.tasks
            .spawn(async move { TaskOutcome::Logged(sink.write(&entry).await) });
    }

    fn set_phase(&self, phase: RecorderPhase) {
        let _ = self.status_tx.send(AutoAvStatus::Phase(phase));
    }

    fn notify(&self, message: impl Into<String>) {
        let _ = self.status_tx.send(AutoAvStatus::Info(message.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::broadcast::error::RecvError;
    use tokio::task::JoinHandle;

    const LOCATION: &str = "http://vmix.test:8088/api";

    #[derive(Default)]
    struct FakeBackend {
        recording: AtomicBool,
        fail_start: AtomicBool,
        fail_stop: AtomicBool,
        start_delay: Mutex<Duration>,
        path: Mutex<Option<String>>,
        starts: AtomicUsize,
        stops: AtomicUsize,
        status_checks: AtomicUsize,
    }

    impl FakeBackend {
        fn set_path(&self, path: &Path) {
            *self.path.lock().unwrap() = Some(path.to_string_lossy().into_owned());
        }
    }

    #[async_trait]
    impl RecordingBackend for FakeBackend {
        async fn start_recording(&self) -> AutoAvResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let delay = *self.start_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(AutoAvError::backend("StartRecording", "connection refused"));
            }
            self.recording.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_recording(&self) -> AutoAvResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop.load(Ordering::SeqCst) {
                return Err(AutoAvError::backend("StopRecording", "connection reset"));
            }
            self.recording.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn is_recording(&self) -> AutoAvResult<bool> {
            self.status_checks.fetch_add(1, Ordering::SeqCst);
            Ok(self.recording.load(Ordering::SeqCst))
        }

        async fn current_recording_path(&self) -> AutoAvResult<Option<String>> {
            Ok(self.path.lock().unwrap().clone())
        }

        fn location(&self) -> String {
            LOCATION.to_string()
        }
    }

    struct FakeSettings(&'static str);

    #[async_trait]
    impl SettingsSource for FakeSettings {
        async fn get(&self, _key: &str) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FakeEvents(Option<Event>);

    #[async_trait]
    impl EventDirectory for FakeEvents {
        async fn current_event(&self) -> anyhow::Result<Option<Event>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct FakeLog(Mutex<Vec<LogEntry>>);

    #[async_trait]
    impl EquipmentLog for FakeLog {
        async fn write(&self, entry: &LogEntry) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        log: Arc<FakeLog>,
        cmd_tx: mpsc::Sender<AutoAvCommand>,
        hub_tx: mpsc::Sender<HubEvent>,
        status_rx: broadcast::Receiver<AutoAvStatus>,
        handle: JoinHandle<()>,
    }

    impl Harness {
        fn spawn(event: Option<Event>, options: EngineOptions) -> Self {
            let backend = Arc::new(FakeBackend::default());
            let log = Arc::new(FakeLog::default());
            let deps = EngineDeps {
                backend: backend.clone(),
                settings: Arc::new(FakeSettings("\"MatchResult\"")),
                events: Arc::new(FakeEvents(event)),
                equipment_log: log.clone(),
            };
            let (cmd_tx, cmd_rx) = mpsc::channel(32);
            let (hub_tx, hub_rx) = mpsc::channel(16);
            let (status_tx, status_rx) = broadcast::channel(64);
            let mut engine = AutoAvEngine::new(options, deps, cmd_rx, hub_rx, status_tx);
            let handle = tokio::spawn(async move { engine.run().await });
            Self {
                backend,
                log,
                cmd_tx,
                hub_tx,
                status_rx,
                handle,
            }
        }

        async fn hub(&self, event: HubEvent) {
            self.hub_tx.send(event).await.unwrap();
        }

        async fn match_state(&self, state: MatchState) {
            self.hub(HubEvent::MatchStatusChanged(qual(state, 12))).await;
        }

        async fn command(&self, cmd: AutoAvCommand) {
            self.cmd_tx.send(cmd).await.unwrap();
        }

        async fn wait_for(&mut self, want: impl Fn(&AutoAvStatus) -> bool) -> AutoAvStatus {
            let wait = async {
                loop {
                    match self.status_rx.recv().await {
                        Ok(status) if want(&status) => return status,
                        Ok(_) | Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => panic!("engine stopped"),
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(120), wait)
                .await
                .expect("status not seen")
        }

        async fn wait_for_phase(&mut self, want: impl Fn(&RecorderPhase) -> bool) {
            self.wait_for(|s| matches!(s, AutoAvStatus::Phase(p) if want(p)))
                .await;
        }

        async fn wait_for_idle(&mut self) {
            self.wait_for_phase(|p| *p == RecorderPhase::Idle).await;
        }

        async fn wait_for_recording(&mut self) {
            self.wait_for_phase(|p| matches!(p, RecorderPhase::Recording { .. }))
                .await;
        }

        async fn wait_for_info(&mut self, needle: &str) -> String {
            match self
                .wait_for(|s| matches!(s, AutoAvStatus::Info(m) if m.contains(needle)))
                .await
            {
                AutoAvStatus::Info(m) => m,
                other => panic!("unexpected status {other:?}"),
            }
        }

        fn starts(&self) -> usize {
            self.backend.starts.load(Ordering::SeqCst)
        }

        fn stops(&self) -> usize {
            self.backend.stops.load(Ordering::SeqCst)
        }

        fn status_checks(&self) -> usize {
            self.backend.status_checks.load(Ordering::SeqCst)
        }

        fn logged(&self) -> Vec<String> {
            self.log.0.lock().unwrap().iter().map(|e| e.message.clone()).collect()
        }
    }

    fn qual(state: MatchState, number: u32) -> MatchStatus {
        MatchStatus::new(state, TournamentLevel::Qualification, number, 1)
    }

    fn test_event() -> Event {
        Event {
            id: "1".to_string(),
            code: Some("TE24".to_string()),
            name: "Test Event".to_string(),
            is_official: true,
            start_time: None,
            end_time: None,
        }
    }

    /// Write a capture into `<dir>/rec`, the way vMix keeps its recordings
    fn capture_file(dir: &Path, name: &str) -> PathBuf {
        let captures = dir.join("rec");
        std::fs::create_dir_all(&captures).unwrap();
        let path = captures.join(name);
        std::fs::write(&path, b"video").unwrap();
        path
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_start_per_match() {
        let mut h = Harness::spawn(None, EngineOptions::default());

        h.match_state(MatchState::GameSpecificData).await;
        h.wait_for_recording().await;
        assert_eq!(h.starts(), 1);

        h.match_state(MatchState::GameSpecificData).await;
        h.match_state(MatchState::MatchAuto).await;
        h.match_state(MatchState::GameSpecificData).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_stays_idle_and_names_backend() {
        let mut h = Harness::spawn(None, EngineOptions::default());
        h.backend.fail_start.store(true, Ordering::SeqCst);

        h.match_state(MatchState::GameSpecificData).await;
        let notice = h.wait_for_info("Error Starting Recording").await;
        assert!(notice.contains(LOCATION));
        h.wait_for_idle().await;

        // No retry, and stops are ignored with nothing live
        h.match_state(MatchState::MatchCancelled).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.starts(), 1);
        assert_eq!(h.status_checks(), 0);
        assert!(h.logged()[0].contains(LOCATION));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_failed_start_is_dropped() {
        let mut h = Harness::spawn(None, EngineOptions::default());
        h.backend.fail_start.store(true, Ordering::SeqCst);
        *h.backend.start_delay.lock().unwrap() = Duration::from_secs(2);
        // vMix recording on its own, e.g. started by hand
        h.backend.recording.store(true, Ordering::SeqCst);

        h.match_state(MatchState::GameSpecificData).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.match_state(MatchState::MatchCancelled).await;
        h.wait_for_phase(|p| matches!(p, RecorderPhase::StopScheduled { .. }))
            .await;

        h.wait_for_info("Error Starting Recording").await;
        h.wait_for_idle().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.status_checks(), 0);
        assert_eq!(h.stops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_due_during_slow_start_runs_after_it() {
        let mut h = Harness::spawn(None, EngineOptions::default());
        *h.backend.start_delay.lock().unwrap() = Duration::from_secs(15);
        let began = Instant::now();

        h.match_state(MatchState::GameSpecificData).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.match_state(MatchState::MatchCancelled).await;

        h.wait_for_phase(|p| *p == RecorderPhase::Stopping).await;
        assert!(began.elapsed() >= Duration::from_secs(15));
        h.wait_for_idle().await;
        assert_eq!(h.starts(), 1);
        assert_eq!(h.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_failure_clears_session() {
        let mut h = Harness::spawn(None, EngineOptions::default());
        h.backend.fail_stop.store(true, Ordering::SeqCst);

        h.match_state(MatchState::GameSpecificData).await;
        h.wait_for_recording().await;
        h.match_state(MatchState::MatchCancelled).await;
        let notice = h.wait_for_info("Error Stopping Recording").await;
        assert!(notice.contains(LOCATION));
        h.wait_for_idle().await;
        assert_eq!(h.stops(), 1);

        // No retry, and the next match records again
        h.backend.fail_stop.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.stops(), 1);
        h.hub(HubEvent::MatchStatusChanged(qual(MatchState::GameSpecificData, 13)))
            .await;
        h.wait_for_recording().await;
        assert_eq!(h.starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_results_stops_after_settle() {
        let mut h = Harness::spawn(None, EngineOptions::default());

        h.match_state(MatchState::GameSpecificData).await;
        h.wait_for_recording().await;
        h.match_state(MatchState::MatchTeleop).await;

        h.match_state(MatchState::WaitingForPrestart).await;
        let prestart_at = Instant::now();
        h.wait_for_phase(|p| {
            matches!(
                p,
                RecorderPhase::StopScheduled {
                    reason: StopReason::SkippedResults,
                    ..
                }
            )
        })
        .await;
        h.match_state(MatchState::Prestarting).await;

        h.wait_for_phase(|p| *p == RecorderPhase::Stopping).await;
        let elapsed = prestart_at.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
        h.wait_for_idle().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.status_checks(), 1);
        assert_eq!(h.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equipment_log_entries() {
        let mut h = Harness::spawn(None, EngineOptions::default());

        h.hub(HubEvent::Connected).await;
        h.wait_for_info("Connection Established").await;
        h.match_state(MatchState::GameSpecificData).await;
        h.wait_for_recording().await;
        h.match_state(MatchState::MatchCancelled).await;
        h.wait_for_idle().await;
        h.hub(HubEvent::Closed { reason: None }).await;
        h.wait_for_info("Connection Closed").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            h.logged(),
            vec![
                "FMS connected!",
                "Starting recording of Qualification 12 (play 1)",
                "Stopping recording",
                "Lost connection to FMS",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_posted_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_file(dir.path(), "cap1.mp4");
        let mut h = Harness::spawn(Some(test_event()), EngineOptions::default());

        h.match_state(MatchState::GameSpecificData).await;
        h.wait_for_recording().await;
        h.backend.set_path(&capture);
        tokio::time::sleep(Duration::from_secs(4)).await;

        h.hub(HubEvent::ConfigValueChanged(VIDEO_SWITCH_OPTION.to_string()))
            .await;
        let posted_at = Instant::now();
        h.wait_for_phase(|p| {
            matches!(
                p,
                RecorderPhase::StopScheduled {
                    reason: StopReason::ResultsPosted,
                    ..
                }
            )
        })
        .await;
        h.wait_for_idle().await;

        assert!(posted_at.elapsed() >= Duration::from_secs(16));
        assert_eq!(h.status_checks(), 1);
        assert_eq!(h.stops(), 1);

        let year = Local::now().year();
        let filed = dir
            .path()
            .join(format!("{year} Test Event"))
            .join("QM12_TE24.mp4");
        assert!(filed.is_file());
        assert!(!capture.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_suppresses_second_stop() {
        let mut h = Harness::spawn(None, EngineOptions::default());

        h.match_state(MatchState::GameSpecificData).await;
        h.wait_for_recording().await;

        h.match_state(MatchState::MatchCancelled).await;
        let cancelled_at = Instant::now();
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.match_state(MatchState::WaitingForPrestart).await;

        h.wait_for_phase(|p| *p == RecorderPhase::Stopping).await;
        let elapsed = cancelled_at.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(12));
        h.wait_for_idle().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.status_checks(), 1);
        assert_eq!(h.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_recording_skips_stop_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_file(dir.path(), "cap1.mp4");
        let mut h = Harness::spawn(Some(test_event()), EngineOptions::default());

        h.match_state(MatchState::GameSpecificData).await;
        h.wait_for_recording().await;
        h.backend.set_path(&capture);
        // Operator stopped vMix by hand
        h.backend.recording.store(false, Ordering::SeqCst);

        h.match_state(MatchState::MatchCancelled).await;
        h.wait_for_info("not recording").await;
        h.wait_for_idle().await;

        assert_eq!(h.status_checks(), 1);
        assert_eq!(h.stops(), 0);
        assert!(capture.is_file());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_failure_returns_to_idle() {
        let mut h = Harness::spawn(Some(test_event()), EngineOptions::default());

        h.match_state(MatchState::GameSpecificData).await;
        h.wait_for_recording().await;
        *h.backend.path.lock().unwrap() = Some("/nonexistent/autoav/cap1.mp4".to_string());
        tokio::time::sleep(Duration::from_secs(4)).await;

        h.match_state(MatchState::MatchCancelled).await;
        h.wait_for_info("could not be renamed").await;
        h.wait_for_idle().await;
        assert_eq!(h.stops(), 1);

        // Still healthy
        h.hub(HubEvent::MatchStatusChanged(qual(MatchState::GameSpecificData, 13)))
            .await;
        h.wait_for_recording().await;
        assert_eq!(h.starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovers_recording_by_capture_time() {
        let dir = tempfile::tempdir().unwrap();
        let name = format!(
            "Capture - {}.mp4",
            Local::now().format("%d %B %Y - %I-%M-%S %p")
        );
        let capture = capture_file(dir.path(), &name);
        let options = EngineOptions {
            recording_dir: capture.parent().map(Path::to_path_buf),
            naming: NamingPreference::OffSeason,
            ..EngineOptions::default()
        };
        let mut h = Harness::spawn(Some(test_event()), options);

        h.match_state(MatchState::GameSpecificData).await;
        h.wait_for_recording().await;
        h.match_state(MatchState::MatchCancelled).await;
        h.wait_for_idle().await;

        let year = Local::now().year();
        let folder = dir.path().join(format!("{year} Test Event"));
        assert!(folder
            .join(format!("{year} Test Event - Qualification Match 12.mp4"))
            .is_file());
        assert!(!capture.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_path_no_directory_skips_rename() {
        let mut h = Harness::spawn(Some(test_event()), EngineOptions::default());

        h.match_state(MatchState::GameSpecificData).await;
        h.wait_for_recording().await;
        h.match_state(MatchState::MatchCancelled).await;
        h.wait_for_info("not renamed").await;
        h.wait_for_idle().await;
        assert_eq!(h.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stop_is_immediate_and_uses_override() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_file(dir.path(), "cap1.mp4");
        let mut h = Harness::spawn(None, EngineOptions::default());

        h.command(AutoAvCommand::SetEventName(Some(" Scrimmage ".to_string())))
            .await;
        h.command(AutoAvCommand::StartRecording(None)).await;
        h.wait_for_recording().await;
        h.backend.set_path(&capture);
        tokio::time::sleep(Duration::from_secs(4)).await;

        let requested_at = Instant::now();
        h.command(AutoAvCommand::StopRecording).await;
        h.wait_for_idle().await;
        assert!(requested_at.elapsed() < Duration::from_secs(1));
        assert_eq!(h.stops(), 1);

        let year = Local::now().year();
        assert!(dir
            .path()
            .join(format!("{year} Scrimmage"))
            .join(format!("{year} Scrimmage - Qualification Match 1.mp4"))
            .is_file());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_stop() {
        let mut h = Harness::spawn(None, EngineOptions::default());

        h.match_state(MatchState::GameSpecificData).await;
        h.wait_for_recording().await;
        h.match_state(MatchState::MatchCancelled).await;
        h.wait_for_phase(|p| matches!(p, RecorderPhase::StopScheduled { .. }))
            .await;

        h.command(AutoAvCommand::CancelPendingStop).await;
        h.wait_for_recording().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.status_checks(), 0);
        assert_eq!(h.stops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_stop() {
        let mut h = Harness::spawn(None, EngineOptions::default());

        h.match_state(MatchState::GameSpecificData).await;
        h.wait_for_recording().await;
        h.match_state(MatchState::MatchCancelled).await;
        h.wait_for_phase(|p| matches!(p, RecorderPhase::StopScheduled { .. }))
            .await;

        h.command(AutoAvCommand::Shutdown).await;
        h.wait_for_info("Service Stopped").await;
        (&mut h.handle).await.unwrap();
        assert_eq!(h.stops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lifecycle_notices() {
        let mut h = Harness::spawn(None, EngineOptions::default());

        h.hub(HubEvent::Connected).await;
        h.wait_for_info("Connection Established").await;
        h.hub(HubEvent::Reconnecting {
            attempt: 2,
            delay: Duration::from_secs(4),
        })
        .await;
        h.wait_for_info("attempt 2").await;
    }
}
