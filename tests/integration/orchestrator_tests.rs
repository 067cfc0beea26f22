//! End-to-end orchestrator runs over scripted fakes.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleet_review::governor::Governor;
use fleet_review::ledger::{ActionLedger, ActionStatus};
use fleet_review::models::checkpoint::RunMode;
use fleet_review::models::state::RepoOutcome;
use fleet_review::monitor::SessionMonitor;
use fleet_review::orchestrator::Orchestrator;
use fleet_review::store::{FileStateStore, StateStore};
use fleet_review::GlobalConfig;

use super::test_helpers::{config_toml, write_plan, RecordingHost, ScriptedDriver};

const RESULT_MARKER: &str = "{\"type\":\"result\",\"ok\":true}\n";

fn build(
    config: Arc<GlobalConfig>,
    driver: Arc<ScriptedDriver>,
    host: Arc<RecordingHost>,
    resume: bool,
) -> Orchestrator {
    let lock_timeout = Duration::from_secs(config.timeouts.lock_seconds);
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(
        config.state_path(),
        config.checkpoint_path(),
        lock_timeout,
    ));
    let ledger = Arc::new(ActionLedger::new(config.ledger_path(), lock_timeout));
    let governor = Arc::new(Governor::new(&config.governor));
    let monitor = Arc::new(SessionMonitor::new(config.monitor.clone()));
    Orchestrator::new(
        config,
        governor,
        monitor,
        store,
        ledger,
        driver,
        host,
        RunMode::Review,
        resume,
    )
}

fn store_for(config: &GlobalConfig) -> FileStateStore {
    FileStateStore::new(
        config.state_path(),
        config.checkpoint_path(),
        Duration::from_secs(config.timeouts.lock_seconds),
    )
}

const PLAN_WITH_ACTIONS: &str = r#"{
  "schema_version": 1,
  "repo": "acme/widgets",
  "items": [
    {"type": "issue", "number": 7, "outcome": "fixed", "notes": "patched"},
    {"type": "issue", "number": 9, "outcome": "skipped", "notes": "stale"}
  ],
  "gh_actions": [
    {"op": "comment", "target": "issue#7", "body": "Fixed in review."},
    {"op": "close", "target": "issue#9"}
  ],
  "git": {}
}"#;

#[tokio::test]
async fn completed_session_records_outcome_and_applies_actions() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state_dir = temp.path().join("state");
    let workspace = temp.path().join("work");
    write_plan(&workspace, "acme/widgets", PLAN_WITH_ACTIONS);

    let toml = config_toml(&state_dir, &workspace, &["acme/widgets"], 60);
    let config = Arc::new(GlobalConfig::from_toml_str(&toml).expect("config"));
    let driver = Arc::new(ScriptedDriver::new(vec![(
        "acme/widgets",
        vec!["Reviewing open issues...\n", RESULT_MARKER],
    )]));
    let host = Arc::new(RecordingHost::new(5000));

    let orchestrator = build(Arc::clone(&config), Arc::clone(&driver), Arc::clone(&host), false);
    let summary = orchestrator
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.completed, 1, "one repo must complete");
    assert_eq!(summary.errors, 0);
    assert!(!summary.interrupted);
    assert!(!summary.is_failure());

    // Outcome written through the store.
    let doc = store_for(&config).load().expect("state document");
    let record = doc.repos.get("acme/widgets").expect("repo record");
    assert_eq!(record.outcome, RepoOutcome::Completed);
    assert_eq!(record.items_fixed, 1);
    assert_eq!(record.items_skipped, 1);

    // Item records keyed by the documented encoding.
    assert!(doc.items.contains_key("acme/widgets#issue-7"));
    assert!(doc.items.contains_key("acme/widgets#issue-9"));

    // Both actions executed exactly once.
    assert_eq!(host.call_count(), 2);

    // No resume checkpoint after a clean run.
    assert!(store_for(&config).load_checkpoint().expect("load").is_none());
}

#[tokio::test]
async fn second_run_is_idempotent_for_host_actions() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state_dir = temp.path().join("state");
    let workspace = temp.path().join("work");
    write_plan(&workspace, "acme/widgets", PLAN_WITH_ACTIONS);

    let toml = config_toml(&state_dir, &workspace, &["acme/widgets"], 60);
    let config = Arc::new(GlobalConfig::from_toml_str(&toml).expect("config"));
    let host = Arc::new(RecordingHost::new(5000));

    for _ in 0..2 {
        let driver = Arc::new(ScriptedDriver::new(vec![(
            "acme/widgets",
            vec!["Reviewing...\n", RESULT_MARKER],
        )]));
        let orchestrator =
            build(Arc::clone(&config), driver, Arc::clone(&host), false);
        orchestrator
            .run(CancellationToken::new())
            .await
            .expect("run");
    }

    // The host saw each action exactly once across both runs.
    assert_eq!(
        host.call_count(),
        2,
        "re-running an identical plan must not repeat side effects"
    );

    // The second run ledgered the repeats as skipped, never as ok.
    let lock_timeout = Duration::from_secs(config.timeouts.lock_seconds);
    let ledger = ActionLedger::new(config.ledger_path(), lock_timeout);
    let entries = ledger.read_entries().expect("entries");
    let ok_count = entries
        .iter()
        .filter(|e| e.status == ActionStatus::Ok)
        .count();
    let skipped_count = entries
        .iter()
        .filter(|e| e.status == ActionStatus::Skipped)
        .count();
    assert_eq!(ok_count, 2, "each action has exactly one ok entry");
    assert_eq!(skipped_count, 2, "second run records skips");
}

#[tokio::test]
async fn error_output_marks_repo_error_and_counts_toward_breaker() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state_dir = temp.path().join("state");
    let workspace = temp.path().join("work");

    let toml = config_toml(&state_dir, &workspace, &["acme/broken"], 60);
    let config = Arc::new(GlobalConfig::from_toml_str(&toml).expect("config"));
    let driver = Arc::new(ScriptedDriver::new(vec![(
        "acme/broken",
        vec!["error: session exploded\n"],
    )]));
    let host = Arc::new(RecordingHost::new(5000));

    let orchestrator = build(Arc::clone(&config), driver, host, false);
    let summary = orchestrator
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.errors, 1);
    assert!(summary.is_failure());

    let doc = store_for(&config).load().expect("state document");
    assert_eq!(
        doc.repos.get("acme/broken").expect("record").outcome,
        RepoOutcome::Error
    );
}

#[tokio::test]
async fn silent_session_hits_hard_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state_dir = temp.path().join("state");
    let workspace = temp.path().join("work");

    // Hard timeout of 3 s, quiet period long enough that the stall
    // ladder never fires first.
    let toml = config_toml(&state_dir, &workspace, &["acme/silent"], 3);
    let config = Arc::new(GlobalConfig::from_toml_str(&toml).expect("config"));
    let driver = Arc::new(ScriptedDriver::new(vec![("acme/silent", vec![])]));
    let host = Arc::new(RecordingHost::new(5000));

    let orchestrator = build(Arc::clone(&config), Arc::clone(&driver), host, false);
    let summary = orchestrator
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.timeouts, 1);
    assert!(summary.is_failure());

    let doc = store_for(&config).load().expect("state document");
    assert_eq!(
        doc.repos.get("acme/silent").expect("record").outcome,
        RepoOutcome::Timeout
    );
    assert_eq!(
        driver.stopped.lock().unwrap().len(),
        1,
        "timed-out session must be stopped"
    );
}
