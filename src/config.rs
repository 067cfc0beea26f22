//! Global configuration parsing, validation, and environment overrides.

use std::env;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Environment variable overriding the configured target parallelism.
pub const PARALLELISM_ENV_VAR: &str = "FLEET_REVIEW_PARALLELISM";

/// Admission-control tuning for the governor.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GovernorConfig {
    /// Operator-configured parallelism ceiling.
    #[serde(default = "default_target_parallelism")]
    pub target_parallelism: usize,
    /// Interval between telemetry refreshes.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
    /// Rolling error-window length for the circuit breaker.
    #[serde(default = "default_error_window")]
    pub error_window_seconds: u64,
    /// How long a detected model rate-limit keeps the fleet throttled.
    #[serde(default = "default_model_backoff")]
    pub model_backoff_seconds: u64,
}

fn default_target_parallelism() -> usize {
    4
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_error_window() -> u64 {
    300
}

fn default_model_backoff() -> u64 {
    300
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            target_parallelism: default_target_parallelism(),
            refresh_interval_seconds: default_refresh_interval(),
            error_window_seconds: default_error_window(),
            model_backoff_seconds: default_model_backoff(),
        }
    }
}

/// Session-monitor classification thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MonitorConfig {
    /// Seconds without output change before a session is a stall candidate.
    #[serde(default = "default_quiet_period")]
    pub quiet_period_seconds: u64,
    /// Consecutive matching observations required to confirm a
    /// non-terminal state.
    #[serde(default = "default_hysteresis_window")]
    pub hysteresis_window: usize,
    /// Interval between classification polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Characters per poll interval above which output counts as active
    /// generation.
    #[serde(default = "default_velocity_threshold")]
    pub velocity_threshold: usize,
    /// Per-session output tail retained for classification, in bytes.
    #[serde(default = "default_output_tail_bytes")]
    pub output_tail_bytes: usize,
}

fn default_quiet_period() -> u64 {
    90
}

fn default_hysteresis_window() -> usize {
    3
}

fn default_poll_interval() -> u64 {
    5
}

fn default_velocity_threshold() -> usize {
    80
}

fn default_output_tail_bytes() -> usize {
    64 * 1024
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            quiet_period_seconds: default_quiet_period(),
            hysteresis_window: default_hysteresis_window(),
            poll_interval_seconds: default_poll_interval(),
            velocity_threshold: default_velocity_threshold(),
            output_tail_bytes: default_output_tail_bytes(),
        }
    }
}

/// Configurable timeout values (seconds).
///
/// The lock timeout is deliberately much shorter than the session
/// timeout: a stuck lock must surface quickly and must never be
/// mistaken for a stuck agent.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Hard per-session ceiling before the orchestrator forces termination.
    #[serde(default = "default_session_seconds")]
    pub session_seconds: u64,
    /// State-document lock acquisition timeout.
    #[serde(default = "default_lock_seconds")]
    pub lock_seconds: u64,
}

fn default_session_seconds() -> u64 {
    3600
}

fn default_lock_seconds() -> u64 {
    10
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            session_seconds: default_session_seconds(),
            lock_seconds: default_lock_seconds(),
        }
    }
}

fn default_host_cli() -> String {
    "gh".into()
}

fn default_plan_filename() -> String {
    ".fleet-review/plan.json".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding the state document, resume checkpoint, and ledger.
    pub state_dir: PathBuf,
    /// Root under which each repo's working copy is checked out.
    pub workspace_root: PathBuf,
    /// Repositories in the fleet, `owner/name` form.
    pub repos: Vec<String>,
    /// Agent CLI binary driving a review session.
    pub agent_cli: String,
    /// Default arguments for the agent CLI.
    #[serde(default)]
    pub agent_cli_args: Vec<String>,
    /// Host CLI binary for source-host mutations (e.g., `gh`).
    #[serde(default = "default_host_cli")]
    pub host_cli: String,
    /// Path of the per-repo action plan, relative to the working copy.
    #[serde(default = "default_plan_filename")]
    pub plan_filename: String,
    /// Skip repos reviewed within this many days; 0 disables the check.
    #[serde(default)]
    pub skip_recent_days: u32,
    /// Admission-control tuning.
    #[serde(default)]
    pub governor: GovernorConfig,
    /// Session-monitor thresholds.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from TOML text, applying
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the TOML is invalid or a validation
    /// rule fails.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-variable overrides on top of the file values.
    ///
    /// `FLEET_REVIEW_PARALLELISM` replaces `governor.target_parallelism`;
    /// an unparseable value is ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var(PARALLELISM_ENV_VAR) {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => self.governor.target_parallelism = n,
                _ => warn!(
                    value = raw,
                    "ignoring unparseable {PARALLELISM_ENV_VAR} override"
                ),
            }
        }
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when a constraint is violated.
    pub fn validate(&self) -> Result<()> {
        if self.repos.is_empty() {
            return Err(AppError::Config("repos list must not be empty".into()));
        }
        if self.agent_cli.is_empty() {
            return Err(AppError::Config("agent_cli must not be empty".into()));
        }
        if self.governor.target_parallelism == 0 {
            return Err(AppError::Config(
                "governor.target_parallelism must be at least 1".into(),
            ));
        }
        if self.monitor.hysteresis_window < 2 {
            return Err(AppError::Config(
                "monitor.hysteresis_window must be at least 2".into(),
            ));
        }
        if self.timeouts.lock_seconds >= self.timeouts.session_seconds {
            return Err(AppError::Config(
                "timeouts.lock_seconds must be shorter than timeouts.session_seconds".into(),
            ));
        }
        Ok(())
    }

    /// Absolute path of a repo's working copy under the workspace root.
    ///
    /// The `owner/name` separator maps to a nested directory.
    #[must_use]
    pub fn working_copy(&self, repo: &str) -> PathBuf {
        self.workspace_root.join(repo)
    }

    /// Path of the run-state document.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    /// Path of the resume checkpoint file.
    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join("checkpoint.json")
    }

    /// Path of the action ledger file.
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("ledger.jsonl")
    }
}
