//! Resume checkpoint written on interruption and consumed on resume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version of the resume checkpoint file.
pub const CHECKPOINT_VERSION: u32 = 1;

/// How a run applies host-side mutations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Normal run: plan actions are executed against the host.
    Review,
    /// Actions are ledgered as skipped without touching the host.
    DryRun,
}

/// Lightweight summary of an interrupted run.
///
/// Created when a run stops before finishing the fleet, consumed by the
/// next `--resume` invocation, and deleted on clean completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ResumeCheckpoint {
    /// Checkpoint schema version.
    pub version: u32,
    /// When the checkpoint was written.
    pub timestamp: DateTime<Utc>,
    /// Identifier of the interrupted run.
    pub run_id: String,
    /// Mode the interrupted run was started in.
    pub mode: RunMode,
    /// Fleet size at interruption.
    pub repos_total: usize,
    /// Repos with a recorded terminal outcome.
    pub repos_completed: usize,
    /// Repos still awaiting a session.
    pub repos_pending: usize,
    /// Names of completed repos.
    pub completed_repos: Vec<String>,
    /// Names of pending repos.
    pub pending_repos: Vec<String>,
}

impl ResumeCheckpoint {
    /// Construct a checkpoint from the completed/pending split.
    #[must_use]
    pub fn new(
        run_id: String,
        mode: RunMode,
        completed_repos: Vec<String>,
        pending_repos: Vec<String>,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            timestamp: Utc::now(),
            run_id,
            mode,
            repos_total: completed_repos.len() + pending_repos.len(),
            repos_completed: completed_repos.len(),
            repos_pending: pending_repos.len(),
            completed_repos,
            pending_repos,
        }
    }
}
