//! Unit tests for hysteresis-confirmed state transitions.

use fleet_review::config::MonitorConfig;
use fleet_review::monitor::{SessionMonitor, SessionState};
use fleet_review::AppError;

fn monitor() -> SessionMonitor {
    SessionMonitor::new(MonitorConfig {
        hysteresis_window: 3,
        ..MonitorConfig::default()
    })
}

#[test]
fn terminal_states_confirm_on_a_single_observation() {
    let m = monitor();
    m.register("s1", "acme/a");
    let confirmed = m.apply_hysteresis("s1", SessionState::Complete).expect("apply");
    assert_eq!(confirmed, SessionState::Complete);

    m.register("s2", "acme/b");
    let confirmed = m.apply_hysteresis("s2", SessionState::Error).expect("apply");
    assert_eq!(confirmed, SessionState::Error);
}

#[test]
fn terminal_states_are_absorbing() {
    let m = monitor();
    m.register("s1", "acme/a");
    m.apply_hysteresis("s1", SessionState::Complete).expect("apply");

    // No observation moves a completed session.
    for raw in [
        SessionState::Generating,
        SessionState::Stalled,
        SessionState::Error,
    ] {
        let confirmed = m.apply_hysteresis("s1", raw).expect("apply");
        assert_eq!(confirmed, SessionState::Complete);
    }
    assert_eq!(
        m.confirmed_state("s1").expect("state"),
        SessionState::Complete
    );
}

#[test]
fn non_terminal_state_requires_full_window() {
    let m = monitor();
    m.register("s1", "acme/a");

    for _ in 0..2 {
        let confirmed = m.apply_hysteresis("s1", SessionState::Generating).expect("apply");
        assert_eq!(
            confirmed,
            SessionState::Idle,
            "confirmed state must hold until the window fills"
        );
    }
    let confirmed = m.apply_hysteresis("s1", SessionState::Generating).expect("apply");
    assert_eq!(confirmed, SessionState::Generating);
}

#[test]
fn flapping_sequence_never_converges() {
    let m = monitor();
    m.register("s1", "acme/a");

    for i in 0..20 {
        let raw = if i % 2 == 0 {
            SessionState::Generating
        } else {
            SessionState::Thinking
        };
        let confirmed = m.apply_hysteresis("s1", raw).expect("apply");
        assert_eq!(
            confirmed,
            SessionState::Idle,
            "alternating observations must never confirm"
        );
    }
}

#[test]
fn confirmed_stall_is_reported_but_never_stored() {
    let m = monitor();
    m.register("s1", "acme/a");

    for _ in 0..2 {
        m.apply_hysteresis("s1", SessionState::Stalled).expect("apply");
    }
    let reported = m.apply_hysteresis("s1", SessionState::Stalled).expect("apply");
    assert_eq!(reported, SessionState::Stalled);
    assert_eq!(
        m.confirmed_state("s1").expect("state"),
        SessionState::Idle,
        "stalled must not replace the stored confirmed state"
    );
}

#[test]
fn unknown_session_is_not_found() {
    let m = monitor();
    let err = m
        .apply_hysteresis("ghost", SessionState::Idle)
        .expect_err("unknown session must error");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[test]
fn deregistered_session_is_dropped() {
    let m = monitor();
    m.register("s1", "acme/a");
    m.deregister("s1");
    assert!(m.confirmed_state("s1").is_err());
}
