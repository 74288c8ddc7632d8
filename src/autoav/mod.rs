//! AutoAV - match-driven recording
//!
//! Watches FMS match state, starts and stops vMix recording around each
//! match, and files the finished recording under its event and match name.

mod engine;
pub mod naming;
mod service;
mod tracker;

pub use engine::{EngineDeps, EngineOptions};
pub use naming::NamingPreference;
pub use service::AutoAvService;
pub use tracker::{SettleDelays, StopReason};

use std::time::Duration;

use crate::fms::MatchStatus;

/// Commands that can be sent to the AutoAV engine
#[derive(Debug, Clone, PartialEq)]
pub enum AutoAvCommand {
    /// Start recording now; without a match, the next qualification match is assumed
    StartRecording(Option<MatchStatus>),
    /// Stop recording now, skipping any settle window
    StopRecording,
    /// Drop a scheduled stop
    CancelPendingStop,
    /// Use this event name instead of looking up the active event
    SetEventName(Option<String>),
    /// Shutdown the engine
    Shutdown,
}

/// Lifecycle phase of the recorder
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderPhase {
    Idle,
    /// Start call in flight
    Starting,
    Recording { match_status: MatchStatus },
    StopScheduled { reason: StopReason, delay: Duration },
    /// Stop routine running (status check, stop, rename)
    Stopping,
}

/// Status updates from the engine
#[derive(Debug, Clone, PartialEq)]
pub enum AutoAvStatus {
    Phase(RecorderPhase),
    /// Operator-facing message; advisory only
    Info(String),
}
