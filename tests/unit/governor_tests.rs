//! Unit tests for the admission-control governor.
//!
//! Validates the quota ladder, the circuit breaker, model backoff,
//! window expiry, and the telemetry availability-over-correctness
//! rule.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use fleet_review::config::{GovernorConfig, MonitorConfig};
use fleet_review::governor::Governor;
use fleet_review::host::{HostApi, RateLimit};
use fleet_review::models::plan::GhAction;
use fleet_review::monitor::SessionMonitor;
use fleet_review::{AppError, Result};

/// Host stub returning a fixed quota.
struct StubHost {
    remaining: i64,
    fail: bool,
}

impl StubHost {
    fn with_quota(remaining: i64) -> Self {
        Self {
            remaining,
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            remaining: 0,
            fail: true,
        }
    }
}

impl HostApi for StubHost {
    fn execute(
        &self,
        _repo: &str,
        _action: &GhAction,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async { Err(AppError::Host("not used in these tests".into())) })
    }

    fn query_rate_limit(&self) -> Pin<Box<dyn Future<Output = Result<RateLimit>> + Send + '_>> {
        let remaining = self.remaining;
        let fail = self.fail;
        Box::pin(async move {
            if fail {
                return Err(AppError::Host("quota endpoint down".into()));
            }
            Ok(RateLimit {
                remaining,
                reset_at: 1_700_000_000,
            })
        })
    }
}

fn governor(target: usize, error_window_seconds: u64) -> Governor {
    Governor::new(&GovernorConfig {
        target_parallelism: target,
        refresh_interval_seconds: 60,
        error_window_seconds,
        model_backoff_seconds: 300,
    })
}

fn empty_monitor() -> SessionMonitor {
    SessionMonitor::new(MonitorConfig::default())
}

#[tokio::test]
async fn healthy_quota_runs_at_target() {
    let gov = governor(4, 300);
    gov.refresh(&StubHost::with_quota(5000), &empty_monitor()).await;
    assert_eq!(gov.status().effective_parallelism, 4);
    assert_eq!(gov.status().github_remaining, 5000);
}

#[tokio::test]
async fn quota_at_threshold_boundaries() {
    let gov = governor(4, 300);

    gov.refresh(&StubHost::with_quota(1000), &empty_monitor()).await;
    assert_eq!(gov.status().effective_parallelism, 4, "1000 is still healthy");

    gov.refresh(&StubHost::with_quota(999), &empty_monitor()).await;
    assert_eq!(gov.status().effective_parallelism, 2, "low quota halves the target");

    gov.refresh(&StubHost::with_quota(500), &empty_monitor()).await;
    assert_eq!(gov.status().effective_parallelism, 2, "500 is in the halved band");

    gov.refresh(&StubHost::with_quota(499), &empty_monitor()).await;
    assert_eq!(gov.status().effective_parallelism, 1, "critical quota pins to one");
}

#[tokio::test]
async fn halving_never_drops_below_one() {
    let gov = governor(1, 300);
    gov.refresh(&StubHost::with_quota(999), &empty_monitor()).await;
    assert_eq!(gov.status().effective_parallelism, 1);
}

#[test]
fn can_start_refuses_at_the_boundary() {
    let gov = governor(4, 300);
    gov.adjust_parallelism();
    assert!(gov.can_start_new_session(3));
    assert!(
        !gov.can_start_new_session(4),
        "active == effective must be a refusal"
    );
    assert!(!gov.can_start_new_session(5));
}

#[test]
fn five_errors_trip_the_breaker() {
    let gov = governor(4, 300);
    for _ in 0..4 {
        gov.record_error();
    }
    assert!(
        !gov.status().circuit_breaker_open,
        "four errors stay under the threshold"
    );

    gov.record_error();
    let status = gov.status();
    assert!(status.circuit_breaker_open);
    assert_eq!(
        status.effective_parallelism, 0,
        "an open breaker overrides the quota ladder"
    );
    assert!(!gov.can_start_new_session(0));
}

#[tokio::test]
async fn breaker_overrides_healthy_quota() {
    let gov = governor(4, 300);
    gov.refresh(&StubHost::with_quota(5000), &empty_monitor()).await;
    for _ in 0..5 {
        gov.record_error();
    }
    assert_eq!(gov.status().effective_parallelism, 0);
}

#[test]
fn stale_error_window_resets_the_count() {
    let gov = governor(4, 1);
    for _ in 0..4 {
        gov.record_error();
    }
    assert_eq!(gov.status().error_count, 4);

    std::thread::sleep(Duration::from_millis(1200));
    gov.record_error();
    let status = gov.status();
    assert_eq!(status.error_count, 1, "aged-out window restarts the count");
    assert!(!status.circuit_breaker_open);
}

#[tokio::test]
async fn telemetry_failure_keeps_previous_snapshot() {
    let gov = governor(4, 300);
    gov.refresh(&StubHost::with_quota(499), &empty_monitor()).await;
    assert_eq!(gov.status().effective_parallelism, 1);

    gov.refresh(&StubHost::failing(), &empty_monitor()).await;
    let status = gov.status();
    assert_eq!(status.github_remaining, 499, "failed query must not clobber state");
    assert_eq!(status.effective_parallelism, 1);
}

#[tokio::test]
async fn model_exhaustion_signal_enters_backoff() {
    let gov = governor(4, 300);
    let monitor = empty_monitor();
    monitor.register("s1", "acme/widgets");
    monitor.observe_output("s1", "upstream replied: HTTP 429 rate limit exceeded\n");

    gov.refresh(&StubHost::with_quota(5000), &monitor).await;
    let status = gov.status();
    assert!(status.model_in_backoff);
    assert_eq!(
        status.effective_parallelism, 1,
        "backoff throttles the fleet to one session"
    );
    assert!(
        !gov.can_start_new_session(0),
        "no new sessions start while the model is backing off"
    );
}

#[test]
fn target_parallelism_reports_configured_ceiling() {
    let gov = governor(7, 300);
    assert_eq!(gov.target_parallelism(), 7);
}
