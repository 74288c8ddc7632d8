//! Match status payloads from the FMS hub
//!
//! The hub has shipped two shapes for the same notification over the years:
//! named fields (`MatchState`, `MatchNumber`, `PlayNumber`, `Level`) and the
//! positional `p1`..`p4` form. Both are normalised into [`MatchStatus`] here
//! so nothing downstream cares which one arrived.

use serde::Deserialize;
use std::fmt;

/// Phase of the match as reported by the field-management system
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum MatchState {
    NoCurrentlyActiveEvent,
    NoCurrentlyActiveTournamentLevel,
    WaitingForPrestart,
    WaitingForPrestartTO,
    Prestarting,
    PrestartingTO,
    WaitingForSetAudience,
    WaitingForSetAudienceTO,
    WaitingForMatchReady,
    WaitingForMatchStart,
    GameSpecificData,
    MatchAuto,
    MatchTransition,
    MatchTeleop,
    WaitingForCommit,
    WaitingForPostResults,
    TournamentLevelComplete,
    MatchCancelled,
    WaitingForMatchPreview,
    WaitingForMatchPreviewTO,
    /// A label this build does not know about
    Other(String),
}

impl MatchState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NoCurrentlyActiveEvent => "NoCurrentlyActiveEvent",
            Self::NoCurrentlyActiveTournamentLevel => "NoCurrentlyActiveTournamentLevel",
            Self::WaitingForPrestart => "WaitingForPrestart",
            Self::WaitingForPrestartTO => "WaitingForPrestartTO",
            Self::Prestarting => "Prestarting",
            Self::PrestartingTO => "PrestartingTO",
            Self::WaitingForSetAudience => "WaitingForSetAudience",
            Self::WaitingForSetAudienceTO => "WaitingForSetAudienceTO",
            Self::WaitingForMatchReady => "WaitingForMatchReady",
            Self::WaitingForMatchStart => "WaitingForMatchStart",
            Self::GameSpecificData => "GameSpecificData",
            Self::MatchAuto => "MatchAuto",
            Self::MatchTransition => "MatchTransition",
            Self::MatchTeleop => "MatchTeleop",
            Self::WaitingForCommit => "WaitingForCommit",
            Self::WaitingForPostResults => "WaitingForPostResults",
            Self::TournamentLevelComplete => "TournamentLevelComplete",
            Self::MatchCancelled => "MatchCancelled",
            Self::WaitingForMatchPreview => "WaitingForMatchPreview",
            Self::WaitingForMatchPreviewTO => "WaitingForMatchPreviewTO",
            Self::Other(label) => label,
        }
    }

    /// The states FMS cycles through while waiting for the next match
    pub fn is_waiting_for_prestart(&self) -> bool {
        matches!(
            self,
            Self::WaitingForPrestart
                | Self::WaitingForPrestartTO
                | Self::Prestarting
                | Self::PrestartingTO
        )
    }
}

impl From<String> for MatchState {
    fn from(label: String) -> Self {
        match label.as_str() {
            "NoCurrentlyActiveEvent" => Self::NoCurrentlyActiveEvent,
            "NoCurrentlyActiveTournamentLevel" => Self::NoCurrentlyActiveTournamentLevel,
            "WaitingForPrestart" => Self::WaitingForPrestart,
            "WaitingForPrestartTO" => Self::WaitingForPrestartTO,
            "Prestarting" => Self::Prestarting,
            "PrestartingTO" => Self::PrestartingTO,
            "WaitingForSetAudience" => Self::WaitingForSetAudience,
            "WaitingForSetAudienceTO" => Self::WaitingForSetAudienceTO,
            "WaitingForMatchReady" => Self::WaitingForMatchReady,
            "WaitingForMatchStart" => Self::WaitingForMatchStart,
            "GameSpecificData" => Self::GameSpecificData,
            "MatchAuto" => Self::MatchAuto,
            "MatchTransition" => Self::MatchTransition,
            "MatchTeleop" => Self::MatchTeleop,
            "WaitingForCommit" => Self::WaitingForCommit,
            "WaitingForPostResults" => Self::WaitingForPostResults,
            "TournamentLevelComplete" => Self::TournamentLevelComplete,
            "MatchCancelled" => Self::MatchCancelled,
            "WaitingForMatchPreview" => Self::WaitingForMatchPreview,
            "WaitingForMatchPreviewTO" => Self::WaitingForMatchPreviewTO,
            _ => Self::Other(label),
        }
    }
}

impl fmt::Display for MatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tournament level the match belongs to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum TournamentLevel {
    Practice,
    Qualification,
    Playoff,
    MatchTest,
    Other(String),
}

impl TournamentLevel {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Practice => "Practice",
            Self::Qualification => "Qualification",
            Self::Playoff => "Playoff",
            Self::MatchTest => "Match Test",
            Self::Other(label) => label,
        }
    }
}

impl From<String> for TournamentLevel {
    fn from(label: String) -> Self {
        match label.as_str() {
            "Practice" => Self::Practice,
            "Qualification" => Self::Qualification,
            "Playoff" => Self::Playoff,
            "Match Test" => Self::MatchTest,
            _ => Self::Other(label),
        }
    }
}

impl fmt::Display for TournamentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalised `MatchStatusInfoChanged` payload
///
/// Fields are optional because upstream is trusted but not guaranteed;
/// formatting renders anything missing as `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawMatchStatus")]
pub struct MatchStatus {
    pub state: Option<MatchState>,
    pub match_number: Option<u32>,
    pub play_number: Option<u32>,
    pub level: Option<TournamentLevel>,
}

/// Wire shape accepting both the named and the positional field layout
#[derive(Debug, Deserialize)]
struct RawMatchStatus {
    #[serde(rename = "MatchState", alias = "matchState", alias = "p1", default)]
    state: Option<MatchState>,
    #[serde(rename = "MatchNumber", alias = "matchNumber", alias = "p2", default)]
    match_number: Option<u32>,
    #[serde(rename = "PlayNumber", alias = "playNumber", alias = "p3", default)]
    play_number: Option<u32>,
    #[serde(rename = "Level", alias = "level", alias = "p4", default)]
    level: Option<TournamentLevel>,
}

impl From<RawMatchStatus> for MatchStatus {
    fn from(raw: RawMatchStatus) -> Self {
        Self {
            state: raw.state,
            match_number: raw.match_number,
            play_number: raw.play_number,
            level: raw.level,
        }
    }
}

impl MatchStatus {
    pub fn new(
        state: MatchState,
        level: TournamentLevel,
        match_number: u32,
        play_number: u32,
    ) -> Self {
        Self {
            state: Some(state),
            match_number: Some(match_number),
            play_number: Some(play_number),
            level: Some(level),
        }
    }

    pub fn state_label(&self) -> &str {
        self.state.as_ref().map(MatchState::as_str).unwrap_or("Unknown")
    }

    pub fn level_label(&self) -> &str {
        self.level
            .as_ref()
            .map(TournamentLevel::as_str)
            .unwrap_or("Unknown")
    }

    pub fn match_number_label(&self) -> String {
        label_or_unknown(self.match_number)
    }

    pub fn play_number_label(&self) -> String {
        label_or_unknown(self.play_number)
    }

    /// True for replays of a match (play number above one)
    pub fn is_replay(&self) -> bool {
        self.play_number.is_some_and(|p| p > 1)
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Match {} (Play #{})",
            self.level_label(),
            self.match_number_label(),
            self.play_number_label()
        )
    }
}

fn label_or_unknown(value: Option<u32>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}
