//! Recording backend abstraction and the vMix HTTP client

mod client;

pub use client::{StreamInfo, VmixClient, VmixSettings};

use async_trait::async_trait;

use crate::error::AutoAvResult;

/// Production tool that records the program output
///
/// Every call maps transport failures and non-success responses to
/// [`AutoAvError::BackendUnreachable`](crate::error::AutoAvError::BackendUnreachable).
#[async_trait]
pub trait RecordingBackend: Send + Sync {
    async fn start_recording(&self) -> AutoAvResult<()>;

    async fn stop_recording(&self) -> AutoAvResult<()>;

    async fn is_recording(&self) -> AutoAvResult<bool>;

    /// Path of the file currently being written, if the backend reports one
    async fn current_recording_path(&self) -> AutoAvResult<Option<String>>;

    /// Where the backend lives, for operator-facing messages
    fn location(&self) -> String;
}
