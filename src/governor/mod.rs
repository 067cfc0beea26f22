//! Admission control for the review fleet.
//!
//! A single [`Governor`] instance owns the process-wide throttle state:
//! host-API quota telemetry, a model-backoff flag, and a circuit
//! breaker tripped by error storms. Parallelism shrinks *before* the
//! fleet hits a hard rate-limit wall, and drops to zero automatically
//! under sustained errors.
//!
//! Workers consult [`can_start_new_session`](Governor::can_start_new_session),
//! a cheap snapshot read; the expensive signal gathering runs on its
//! own periodic task ([`spawn_refresh_task`]).

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GovernorConfig;
use crate::host::HostApi;
use crate::monitor::SessionMonitor;

/// Errors inside one window that trip the circuit breaker.
const ERROR_THRESHOLD: u32 = 5;

/// Quota floor below which the fleet drops to a single session.
const QUOTA_CRITICAL: i64 = 500;

/// Quota level below which the fleet runs at half the target.
const QUOTA_LOW: i64 = 1000;

/// How far back session output is scanned for model-exhaustion signals.
const BACKOFF_SCAN_WINDOW: Duration = Duration::from_secs(300);

#[allow(clippy::unwrap_used)] // Pattern is a literal; cannot fail to compile.
fn backoff_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)(\b429\b|rate.?limit|overloaded|too many requests)").unwrap())
}

/// Read-only snapshot of the governor for observability output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GovernorStatus {
    /// Last known remaining host-API quota.
    pub github_remaining: i64,
    /// Epoch second at which the quota window resets.
    pub github_reset: i64,
    /// Whether the model provider is presently rate-limiting.
    pub model_in_backoff: bool,
    /// Epoch second at which the model backoff expires.
    pub model_backoff_until: i64,
    /// Derived admission ceiling.
    pub effective_parallelism: usize,
    /// Operator-configured ceiling.
    pub target_parallelism: usize,
    /// Whether the error-storm breaker has tripped.
    pub circuit_breaker_open: bool,
    /// Errors observed in the current window.
    pub error_count: u32,
}

/// Mutable throttle state, guarded by the governor's mutex.
#[derive(Debug)]
struct GovernorState {
    github_remaining: i64,
    github_reset: i64,
    model_in_backoff: bool,
    model_backoff_until: i64,
    effective_parallelism: usize,
    circuit_breaker_open: bool,
    error_count_window: u32,
    window_start: DateTime<Utc>,
}

/// Process-wide admission controller.
///
/// Single-writer through the internal mutex; every public method takes
/// `&self` and is safe to call from any worker.
#[derive(Debug)]
pub struct Governor {
    target_parallelism: usize,
    error_window_seconds: u64,
    model_backoff_seconds: u64,
    refresh_interval: Duration,
    state: Mutex<GovernorState>,
}

impl Governor {
    /// Construct a governor from its config section.
    ///
    /// Until the first refresh the quota is assumed healthy, so the
    /// fleet starts at the target parallelism.
    #[must_use]
    pub fn new(config: &GovernorConfig) -> Self {
        Self {
            target_parallelism: config.target_parallelism,
            error_window_seconds: config.error_window_seconds,
            model_backoff_seconds: config.model_backoff_seconds,
            refresh_interval: Duration::from_secs(config.refresh_interval_seconds),
            state: Mutex::new(GovernorState {
                github_remaining: QUOTA_LOW * 5,
                github_reset: 0,
                model_in_backoff: false,
                model_backoff_until: 0,
                effective_parallelism: config.target_parallelism,
                circuit_breaker_open: false,
                error_count_window: 0,
                window_start: Utc::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The operator-configured parallelism ceiling.
    #[must_use]
    pub fn target_parallelism(&self) -> usize {
        self.target_parallelism
    }

    /// Gather throttle signals: host quota and model-exhaustion
    /// patterns in recent session output.
    ///
    /// Telemetry failures are swallowed — the previous snapshot stays
    /// in force. Always ends by recomputing effective parallelism.
    pub async fn refresh(&self, host: &dyn HostApi, monitor: &SessionMonitor) {
        match host.query_rate_limit().await {
            Ok(limit) => {
                let mut state = self.lock();
                state.github_remaining = limit.remaining;
                state.github_reset = limit.reset_at;
                debug!(remaining = limit.remaining, "host quota refreshed");
            }
            Err(err) => {
                warn!(%err, "quota query failed; keeping previous snapshot");
            }
        }

        let recent = monitor.recent_output(BACKOFF_SCAN_WINDOW);
        let now = Utc::now().timestamp();
        {
            let mut state = self.lock();
            if backoff_pattern().is_match(&recent) {
                let until = now + i64::try_from(self.model_backoff_seconds).unwrap_or(0);
                if !state.model_in_backoff {
                    info!(until, "model exhaustion signal detected; entering backoff");
                }
                state.model_in_backoff = true;
                state.model_backoff_until = until;
            } else if state.model_in_backoff && now >= state.model_backoff_until {
                info!("model backoff expired");
                state.model_in_backoff = false;
            }
        }

        self.adjust_parallelism();
    }

    /// Recompute the effective parallelism from the current signals.
    ///
    /// The breaker overrides everything; model backoff and a critical
    /// quota each pin the fleet to one session; a low quota halves the
    /// target (floor, minimum 1).
    pub fn adjust_parallelism(&self) {
        let mut state = self.lock();
        Self::roll_window(&mut state, self.error_window_seconds);
        if state.error_count_window >= ERROR_THRESHOLD && !state.circuit_breaker_open {
            warn!(
                errors = state.error_count_window,
                "error threshold exceeded; circuit breaker open"
            );
            state.circuit_breaker_open = true;
        }

        let effective = if state.circuit_breaker_open {
            0
        } else if state.model_in_backoff {
            1
        } else if state.github_remaining < QUOTA_CRITICAL {
            1
        } else if state.github_remaining < QUOTA_LOW {
            (self.target_parallelism / 2).max(1)
        } else {
            self.target_parallelism
        };

        if effective != state.effective_parallelism {
            info!(
                from = state.effective_parallelism,
                to = effective,
                "effective parallelism adjusted"
            );
        }
        state.effective_parallelism = effective;
    }

    /// Whether a new session may start given `active` running sessions.
    ///
    /// A non-blocking read of the last-refreshed snapshot; the boundary
    /// `active == effective` is a refusal.
    #[must_use]
    pub fn can_start_new_session(&self, active: usize) -> bool {
        let state = self.lock();
        active < state.effective_parallelism
            && !state.circuit_breaker_open
            && !state.model_in_backoff
    }

    /// Count one session-level error toward the breaker window.
    pub fn record_error(&self) {
        {
            let mut state = self.lock();
            Self::roll_window(&mut state, self.error_window_seconds);
            state.error_count_window += 1;
            debug!(errors = state.error_count_window, "session error recorded");
        }
        self.adjust_parallelism();
    }

    /// Read-only snapshot for observability.
    #[must_use]
    pub fn status(&self) -> GovernorStatus {
        let state = self.lock();
        GovernorStatus {
            github_remaining: state.github_remaining,
            github_reset: state.github_reset,
            model_in_backoff: state.model_in_backoff,
            model_backoff_until: state.model_backoff_until,
            effective_parallelism: state.effective_parallelism,
            target_parallelism: self.target_parallelism,
            circuit_breaker_open: state.circuit_breaker_open,
            error_count: state.error_count_window,
        }
    }

    /// Reset the error window when it has aged out.
    ///
    /// An open breaker stays open; only the counter and window restart.
    fn roll_window(state: &mut GovernorState, window_seconds: u64) {
        let age_ms = (Utc::now() - state.window_start).num_milliseconds();
        let window_ms = i64::try_from(window_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        if age_ms > window_ms {
            state.error_count_window = 0;
            state.window_start = Utc::now();
        }
    }
}

/// Spawn the periodic governor refresh task.
///
/// Runs until the cancellation token fires. Workers never wait on this
/// task; admission checks read the last snapshot.
#[must_use]
pub fn spawn_refresh_task(
    governor: Arc<Governor>,
    host: Arc<dyn HostApi>,
    monitor: Arc<SessionMonitor>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(governor.refresh_interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("governor refresh task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    governor.refresh(host.as_ref(), monitor.as_ref()).await;
                }
            }
        }
    })
}
