//! Match state tracking and intent classification

use std::fmt;
use std::time::Duration;
use tracing::info;

use crate::fms::{MatchState, MatchStatus};

/// Config key FMS changes when the audience display switches
pub const VIDEO_SWITCH_OPTION: &str = "VideoSwitchOption";

/// Video switch value meaning the match results are on screen
const MATCH_RESULT: &str = "MatchResult";

/// Numeric form of [`MATCH_RESULT`] served by older FMS builds
const MATCH_RESULT_LEGACY: &str = "4";

/// Why a recording is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The match was cancelled (e-stop)
    Aborted,
    /// FMS moved on to the next match without posting results
    SkippedResults,
    /// Results were posted to the audience display
    ResultsPosted,
    /// Operator asked for it
    Manual,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Aborted => "match cancelled",
            Self::SkippedResults => "results skipped",
            Self::ResultsPosted => "results posted",
            Self::Manual => "operator request",
        };
        f.write_str(s)
    }
}

/// What the controller should do in response to a notification
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Start(MatchStatus),
    Stop { reason: StopReason, delay: Duration },
}

/// Settle windows applied before stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleDelays {
    pub aborted: Duration,
    pub skipped_results: Duration,
    pub results_posted: Duration,
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            aborted: Duration::from_secs(10),
            skipped_results: Duration::from_secs(10),
            // Results show up on the audience display about 11 s after the switch
            results_posted: Duration::from_secs(16),
        }
    }
}

/// Keeps the last match status and classifies new ones
#[derive(Debug, Default)]
pub struct MatchStateTracker {
    last: Option<MatchStatus>,
    delays: SettleDelays,
}

impl MatchStateTracker {
    pub fn new(delays: SettleDelays) -> Self {
        Self { last: None, delays }
    }

    /// Record a match status update and classify it
    ///
    /// `stop_pending` suppresses the skipped-results heuristic while a stop
    /// is already on its way.
    pub fn observe(&mut self, status: MatchStatus, stop_pending: bool) -> Option<Intent> {
        info!(
            "Match Status Changed: {} -> {} for {}",
            self.last
                .as_ref()
                .map(MatchStatus::state_label)
                .unwrap_or("Unknown"),
            status.state_label(),
            status
        );

        let intent = match status.state.as_ref() {
            Some(MatchState::GameSpecificData) => Some(Intent::Start(status.clone())),
            Some(MatchState::MatchCancelled) => Some(Intent::Stop {
                reason: StopReason::Aborted,
                delay: self.delays.aborted,
            }),
            // Heuristic: back in prestart means results were never shown
            Some(state) if state.is_waiting_for_prestart() && !stop_pending => {
                Some(Intent::Stop {
                    reason: StopReason::SkippedResults,
                    delay: self.delays.skipped_results,
                })
            }
            _ => None,
        };

        self.last = Some(status);
        intent
    }

    /// Classify a freshly fetched config value
    pub fn observe_config_value(&self, key: &str, value: &str) -> Option<Intent> {
        if key != VIDEO_SWITCH_OPTION {
            return None;
        }

        let value = value.trim().trim_matches('"');
        if value == MATCH_RESULT || value == MATCH_RESULT_LEGACY {
            Some(Intent::Stop {
                reason: StopReason::ResultsPosted,
                delay: self.delays.results_posted,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fms::TournamentLevel;

    fn status(state: MatchState) -> MatchStatus {
        MatchStatus::new(state, TournamentLevel::Qualification, 12, 1)
    }

    #[test]
    fn test_game_data_starts() {
        let mut tracker = MatchStateTracker::default();
        let s = status(MatchState::GameSpecificData);
        assert_eq!(tracker.observe(s.clone(), false), Some(Intent::Start(s)));
    }

    #[test]
    fn test_cancel_stops_after_settle() {
        let mut tracker = MatchStateTracker::default();
        let intent = tracker.observe(status(MatchState::MatchCancelled), true);
        assert_eq!(
            intent,
            Some(Intent::Stop {
                reason: StopReason::Aborted,
                delay: Duration::from_secs(10)
            })
        );
    }

    #[test]
    fn test_prestart_family_only_without_pending_stop() {
        let mut tracker = MatchStateTracker::default();
        for state in [
            MatchState::WaitingForPrestart,
            MatchState::WaitingForPrestartTO,
            MatchState::Prestarting,
            MatchState::PrestartingTO,
        ] {
            assert!(matches!(
                tracker.observe(status(state.clone()), false),
                Some(Intent::Stop {
                    reason: StopReason::SkippedResults,
                    ..
                })
            ));
            assert_eq!(tracker.observe(status(state), true), None);
        }
    }

    #[test]
    fn test_other_states_only_update_last() {
        let mut tracker = MatchStateTracker::default();
        for state in [
            MatchState::MatchAuto,
            MatchState::MatchTeleop,
            MatchState::WaitingForPostResults,
            MatchState::Other("Mystery".to_string()),
        ] {
            assert_eq!(tracker.observe(status(state.clone()), false), None);
            assert_eq!(tracker.last.as_ref().unwrap().state, Some(state));
        }
    }

    #[test]
    fn test_results_posted_value() {
        let tracker = MatchStateTracker::default();
        assert_eq!(
            tracker.observe_config_value(VIDEO_SWITCH_OPTION, "\"MatchResult\""),
            Some(Intent::Stop {
                reason: StopReason::ResultsPosted,
                delay: Duration::from_secs(16)
            })
        );
        assert!(tracker
            .observe_config_value(VIDEO_SWITCH_OPTION, "4")
            .is_some());
        assert_eq!(
            tracker.observe_config_value(VIDEO_SWITCH_OPTION, "\"MatchPreview\""),
            None
        );
        assert_eq!(tracker.observe_config_value("SomethingElse", "\"MatchResult\""), None);
    }
}
