//! Operational errors raised by the AutoAV pipeline
//!
//! None of these escape the controller; each is logged and turned into an
//! operator notice.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutoAvError {
    /// The recording backend could not be reached or answered with a failure
    #[error("recording backend unreachable during {operation}: {reason}")]
    BackendUnreachable {
        operation: &'static str,
        reason: String,
    },

    /// A stop was requested but the backend is not recording
    #[error("backend is not recording")]
    NotRecording,

    /// The finished recording could not be moved into its event folder
    #[error("failed to rename recording {}: {reason}", display_path(.path))]
    RenameFailed {
        path: Option<PathBuf>,
        reason: String,
    },

    /// The active event could not be resolved
    #[error("event lookup failed: {0}")]
    EventLookupFailed(String),
}

impl AutoAvError {
    pub fn backend(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::BackendUnreachable {
            operation,
            reason: err.to_string(),
        }
    }

    pub fn rename(path: Option<PathBuf>, reason: impl Into<String>) -> Self {
        Self::RenameFailed {
            path,
            reason: reason.into(),
        }
    }
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => p.display().to_string(),
        None => "<no path>".to_string(),
    }
}

pub type AutoAvResult<T> = std::result::Result<T, AutoAvError>;
