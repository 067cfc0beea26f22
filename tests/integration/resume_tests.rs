//! Interruption and resume behavior.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleet_review::governor::Governor;
use fleet_review::ledger::ActionLedger;
use fleet_review::models::checkpoint::RunMode;
use fleet_review::models::state::RepoOutcome;
use fleet_review::monitor::SessionMonitor;
use fleet_review::orchestrator::Orchestrator;
use fleet_review::store::{FileStateStore, StateStore};
use fleet_review::GlobalConfig;

use super::test_helpers::{config_toml, RecordingHost, ScriptedDriver};

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

#[tokio::test]
async fn interrupted_run_writes_checkpoint_and_resume_drains_it() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state_dir = temp.path().join("state");
    let workspace = temp.path().join("work");

    let toml = config_toml(&state_dir, &workspace, &["acme/slow"], 120);
    let config = Arc::new(GlobalConfig::from_toml_str(&toml).expect("config"));
    let host = Arc::new(RecordingHost::new(5000));

    // First run: the session never finishes; cancel mid-flight.
    let driver = Arc::new(ScriptedDriver::new(vec![("acme/slow", vec![])]));
    let orchestrator = build(Arc::clone(&config), driver, Arc::clone(&host), false);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        trigger.cancel();
    });
    let summary = orchestrator.run(cancel).await.expect("first run");

    assert!(summary.interrupted, "cancelled run must report interruption");
    assert!(summary.is_failure());

    let checkpoint = store_for(&config)
        .load_checkpoint()
        .expect("load")
        .expect("checkpoint must exist after interruption");
    assert_eq!(checkpoint.pending_repos, vec!["acme/slow".to_owned()]);
    assert_eq!(checkpoint.repos_completed, 0);

    // Second run resumes the pending repo and completes it.
    let driver = Arc::new(ScriptedDriver::new(vec![(
        "acme/slow",
        vec!["Reviewing...\n", RESULT_MARKER],
    )]));
    let orchestrator = build(Arc::clone(&config), driver, host, true);
    let summary = orchestrator
        .run(CancellationToken::new())
        .await
        .expect("resumed run");

    assert_eq!(summary.completed, 1);
    assert!(!summary.interrupted);

    let doc = store_for(&config).load().expect("state document");
    assert_eq!(
        doc.repos.get("acme/slow").expect("record").outcome,
        RepoOutcome::Completed
    );

    // Clean completion consumes the checkpoint.
    assert!(store_for(&config).load_checkpoint().expect("load").is_none());
}
