pub mod api_helpers;
pub mod checkpoint;
pub mod dashboard;
pub mod directory;
pub mod lease;
pub mod payload;
pub mod rate_limit;
pub mod syncer;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::date_util::TimestampStyle;
use crate::error::Error;

pub use checkpoint::CheckpointTracker;
pub use lease::{Lease, ScopeLocks};

/// What happens to the checkpoint when a record in the batch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Advance only through the records before the first failure.
    #[default]
    Stall,
    /// Advance past failures; failed records are not fetched again.
    Skip,
}

impl CheckpointPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointPolicy::Stall => "stall",
            CheckpointPolicy::Skip => "skip",
        }
    }
}

impl fmt::Display for CheckpointPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stall" => Ok(CheckpointPolicy::Stall),
            "skip" => Ok(CheckpointPolicy::Skip),
            other => Err(Error::Config(format!(
                "unknown checkpoint policy '{other}' (expected 'stall' or 'skip')"
            ))),
        }
    }
}

/// Options controlling a sync operation.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub policy: CheckpointPolicy,
    /// Restrict the pass to one registered project.
    pub project: Option<String>,
    pub timestamp_style: TimestampStyle,
    pub max_parallel_projects: usize,
    /// Source tasks database.
    pub tasks_db: String,
    /// Source time-tracking database.
    pub times_db: String,
    pub employees_db: String,
    pub projects_db: String,
}

/// Report returned after a sync pass completes.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub scope: String,
    pub status: SyncStatus,
    pub items_synced: u64,
    pub items_failed: u64,
    pub checkpoint_before: i64,
    pub checkpoint_after: i64,
    pub error: Option<String>,
}

impl SyncReport {
    /// Create a SyncReport with the appropriate status derived from counts.
    pub fn from_counts(
        scope: String,
        items_synced: u64,
        items_failed: u64,
        checkpoint_before: i64,
        checkpoint_after: i64,
    ) -> Self {
        let status = if items_failed == 0 {
            SyncStatus::Success
        } else if items_synced > 0 {
            SyncStatus::PartialFailure
        } else {
            SyncStatus::Failed
        };
        let error = if items_failed > 0 {
            Some(format!("{items_failed} records failed"))
        } else {
            None
        };
        Self {
            scope,
            status,
            items_synced,
            items_failed,
            checkpoint_before,
            checkpoint_after,
            error,
        }
    }

    /// Report for a pass that aborted before processing records.
    pub fn failed(scope: String, checkpoint: i64, error: String) -> Self {
        Self {
            scope,
            status: SyncStatus::Failed,
            items_synced: 0,
            items_failed: 0,
            checkpoint_before: checkpoint,
            checkpoint_after: checkpoint,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
}

impl SyncStatus {
    /// Value stored in `sync_jobs.status`.
    pub fn as_job_status(&self) -> &'static str {
        match self {
            SyncStatus::Success => "completed",
            SyncStatus::PartialFailure => "partial_failure",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Callbacks for reporting pass progress to a UI.
pub trait SyncProgress: Send + Sync {
    fn on_scope_start(&self, _scope: &str) {}
    fn on_records_fetched(&self, _scope: &str, _count: usize) {}
    fn on_record_failed(&self, _scope: &str, _record_id: &str, _error: &str) {}
    fn on_scope_complete(&self, _report: &SyncReport) {}
}

/// Progress sink that ignores everything.
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}
