//! Recording filenames and filing
//!
//! Two cataloguing conventions exist. Official (in-season) events use short
//! level codes that sort the way the video archive expects:
//!
//! ```text
//! QM12_TE24.mp4        qualification 12
//! SF5M1_TE24.mp4       playoff 5 (double-elimination bracket)
//! F1M2_P2_TE24.mp4     finals match 2, second play
//! zz_PR3_TE24.mp4      practice 3
//! ```
//!
//! Off-season events use a descriptive form:
//!
//! ```text
//! 2024 Test Event - Qualification Match 12 (Play #2).mp4
//! ```

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{AutoAvError, AutoAvResult};
use crate::events::{Event, UNKNOWN_EVENT};
use crate::fms::{MatchStatus, TournamentLevel};

/// Event code used when an event has neither a code nor a name
const UNKNOWN_EVENT_CODE: &str = "Unknown_Event";

/// First playoff match number that belongs to the finals
const FIRST_FINALS_MATCH: u32 = 14;

/// How far a vMix capture timestamp may drift from the session start
const DISCOVERY_TOLERANCE_SECS: i64 = 5;

/// Filename convention applied to a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingMode {
    InSeason,
    OffSeason,
}

/// Configured naming preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NamingPreference {
    /// Follow the event's official flag
    #[default]
    Auto,
    InSeason,
    OffSeason,
}

impl NamingPreference {
    pub fn resolve(self, event: Option<&Event>) -> NamingMode {
        match self {
            Self::InSeason => NamingMode::InSeason,
            Self::OffSeason => NamingMode::OffSeason,
            Self::Auto => match event {
                Some(e) if e.is_official => NamingMode::InSeason,
                _ => NamingMode::OffSeason,
            },
        }
    }
}

/// Display name of an event, or the placeholder
pub fn event_name(event: Option<&Event>) -> &str {
    match event {
        Some(e) if !e.name.is_empty() => &e.name,
        _ => UNKNOWN_EVENT,
    }
}

fn event_code(event: Option<&Event>) -> &str {
    let Some(event) = event else {
        return UNKNOWN_EVENT_CODE;
    };
    match event.code.as_deref() {
        Some(code) if !code.is_empty() => code,
        _ if !event.name.is_empty() => &event.name,
        _ => UNKNOWN_EVENT_CODE,
    }
}

/// Short match code used by the in-season convention
fn in_season_match_code(status: &MatchStatus) -> String {
    let number = status.match_number_label();
    match status.level.as_ref() {
        Some(TournamentLevel::Qualification) => format!("QM{number}"),
        Some(TournamentLevel::Playoff) => match status.match_number {
            Some(n) if n >= FIRST_FINALS_MATCH => format!("F1M{}", n - (FIRST_FINALS_MATCH - 1)),
            _ => format!("SF{number}M1"),
        },
        Some(TournamentLevel::Practice) => format!("zz_PR{number}"),
        Some(TournamentLevel::MatchTest) => format!("zz_TM{number}"),
        _ => format!("zz_{} {number}", status.level_label()),
    }
}

pub fn in_season_filename(event: Option<&Event>, status: &MatchStatus) -> String {
    let mut name = in_season_match_code(status);
    if status.is_replay() {
        name.push_str(&format!("_P{}", status.play_number_label()));
    }
    format!("{name}_{}.mp4", event_code(event))
}

pub fn off_season_filename(event: Option<&Event>, status: &MatchStatus, year: i32) -> String {
    let play = if status.is_replay() {
        format!(" (Play #{})", status.play_number_label())
    } else {
        String::new()
    };
    format!(
        "{} - {} Match {}{play}.mp4",
        event_folder_name(event, year),
        status.level_label(),
        status.match_number_label()
    )
}

pub fn recording_filename(
    event: Option<&Event>,
    status: &MatchStatus,
    mode: NamingMode,
    year: i32,
) -> String {
    match mode {
        NamingMode::InSeason => in_season_filename(event, status),
        NamingMode::OffSeason => off_season_filename(event, status, year),
    }
}

/// Folder that collects an event's recordings, e.g. `2024 Test Event`
pub fn event_folder_name(event: Option<&Event>, year: i32) -> String {
    format!("{year} {}", event_name(event))
}

/// Move a finished recording into its event folder under `filename`
///
/// The event folder is a sibling of the recording's directory and is
/// created if it does not exist yet. Returns the absolute path of the filed
/// recording.
pub fn move_recording(
    source: Option<&Path>,
    folder_name: &str,
    filename: &str,
) -> AutoAvResult<PathBuf> {
    let source = source.ok_or_else(|| AutoAvError::rename(None, "no recording path known"))?;

    if !source.is_file() {
        return Err(AutoAvError::rename(
            Some(source.to_path_buf()),
            "recording does not exist",
        ));
    }

    let parent = source.parent().unwrap_or_else(|| Path::new("."));
    let base = parent
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(parent);
    let folder = base.join(folder_name);
    std::fs::create_dir_all(&folder).map_err(|e| {
        AutoAvError::rename(
            Some(source.to_path_buf()),
            format!("failed to create {}: {e}", folder.display()),
        )
    })?;

    let destination = folder.join(filename);
    std::fs::rename(source, &destination).map_err(|e| {
        AutoAvError::rename(
            Some(source.to_path_buf()),
            format!("failed to move to {}: {e}", destination.display()),
        )
    })?;

    debug!("Moved {:?} -> {:?}", source, destination);
    Ok(std::path::absolute(&destination).unwrap_or(destination))
}

/// Find the vMix capture in `dir` that started within a few seconds of `started_at`
///
/// Used when vMix never reported the in-progress filename.
pub fn find_recording_near(dir: &Path, started_at: DateTime<Local>) -> AutoAvResult<PathBuf> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        AutoAvError::rename(
            Some(dir.to_path_buf()),
            format!("recording directory unreadable: {e}"),
        )
    })?;

    let mut best: Option<(i64, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(captured_at) = vmix_capture_time(name) else {
            continue;
        };
        let drift = (captured_at - started_at).num_seconds().abs();
        if drift <= DISCOVERY_TOLERANCE_SECS && best.as_ref().map_or(true, |(d, _)| drift < *d) {
            best = Some((drift, path));
        }
    }

    best.map(|(_, path)| path).ok_or_else(|| {
        AutoAvError::rename(
            Some(dir.to_path_buf()),
            "could not find a matching recording",
        )
    })
}

/// Parse the start time vMix embeds in capture names,
/// e.g. `capture - 23 September 2023 - 08-35-04 AM.mp4`
fn vmix_capture_time(filename: &str) -> Option<DateTime<Local>> {
    let stem = Path::new(filename).file_stem()?.to_str()?;
    let mut parts = stem.rsplitn(3, " - ");
    let time = parts.next()?;
    let date = parts.next()?;
    parts.next()?;

    let naive =
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%d %B %Y %I-%M-%S %p").ok()?;
    Local.from_local_datetime(&naive).earliest()
}
