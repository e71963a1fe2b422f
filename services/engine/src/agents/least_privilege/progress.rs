//! Progress reporting
//!
//! Stage updates are pushed to a [`ProgressSink`]. Transports that
//! forward them to a client live outside this crate.

use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Loading,
    Completed,
    Failed,
}

/// A single stage update
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub stage: &'static str,
    pub status: ProgressStatus,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ProgressEvent {
    pub fn new(stage: &'static str, status: ProgressStatus, message: impl Into<String>) -> Self {
        Self {
            stage,
            status,
            message: message.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Receiver for pipeline stage updates
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);

    fn loading(&self, stage: &'static str, message: &str) {
        self.emit(ProgressEvent::new(stage, ProgressStatus::Loading, message));
    }

    fn completed(&self, stage: &'static str, message: &str) {
        self.emit(ProgressEvent::new(stage, ProgressStatus::Completed, message));
    }

    fn failed(&self, stage: &'static str, message: &str) {
        self.emit(ProgressEvent::new(stage, ProgressStatus::Failed, message));
    }
}

/// Default sink: writes stage updates to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn emit(&self, event: ProgressEvent) {
        info!(
            stage = event.stage,
            status = ?event.status,
            "{}",
            event.message
        );
    }
}
