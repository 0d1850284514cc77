//! Test fixtures for run-tracking scenarios.
//!
//! Provides a small job-run payload and the configuration and policies the
//! scenario tests use.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracksync_core::{
    ChannelConfig, ClientFields, PollConfig, Policies, ResourceId, ResourceSnapshot, SyncConfig,
};

/// Status of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Waiting for a worker.
    Queued,
    /// Being processed.
    Processing,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Failed,
}

impl RunStatus {
    /// Returns true for statuses that never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::Failed)
    }
}

/// Payload of a tracked job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPayload {
    /// Current status.
    pub status: RunStatus,
    /// Progress percentage.
    pub progress: u8,
}

impl RunPayload {
    /// Creates a payload.
    pub fn new(status: RunStatus, progress: u8) -> Self {
        Self { status, progress }
    }

    /// A run waiting for a worker.
    pub fn queued() -> Self {
        Self::new(RunStatus::Queued, 0)
    }

    /// A run in progress.
    pub fn processing(progress: u8) -> Self {
        Self::new(RunStatus::Processing, progress)
    }

    /// A finished run.
    pub fn complete() -> Self {
        Self::new(RunStatus::Complete, 100)
    }

    /// A failed run.
    pub fn failed() -> Self {
        Self::new(RunStatus::Failed, 0)
    }
}

/// Classifier for [`RunPayload`].
pub fn is_run_terminal(run: &RunPayload) -> bool {
    run.status.is_terminal()
}

/// Policies for tracking a run, with a `project` client field.
pub fn run_policies() -> Policies<RunPayload> {
    Policies::new(is_run_terminal)
        .with_client_fields(ClientFields::new().with("project", "atlas"))
}

/// Identifier of the run used throughout the scenarios.
pub fn run_id() -> ResourceId {
    ResourceId::new("run-1")
}

/// A poll snapshot of [`run_id`].
pub fn run_snapshot(version: u64, payload: RunPayload) -> ResourceSnapshot<RunPayload> {
    ResourceSnapshot::poll(run_id(), version, payload)
}

/// The default run-tracking configuration: 3 s active polling, 30 s once
/// terminal, 2 s reconnect backoff, 2 s terminal drain.
pub fn run_config() -> SyncConfig {
    SyncConfig::new()
        .with_poll(
            PollConfig::new()
                .with_active_interval(Duration::from_secs(3))
                .with_terminal_interval(Duration::from_secs(30)),
        )
        .with_channel(ChannelConfig::new().with_reconnect_backoff(Duration::from_secs(2)))
        .with_terminal_drain(Duration::from_secs(2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(is_run_terminal(&RunPayload::complete()));
        assert!(is_run_terminal(&RunPayload::failed()));
        assert!(!is_run_terminal(&RunPayload::queued()));
        assert!(!is_run_terminal(&RunPayload::processing(40)));
    }

    #[test]
    fn payload_serializes_lowercase_status() {
        let json = serde_json::to_string(&RunPayload::processing(40)).unwrap();
        assert_eq!(json, r#"{"status":"processing","progress":40}"#);
    }
}
