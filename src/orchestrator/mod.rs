//! Orchestrator loop — the thin glue over governor, monitor, store,
//! and ledger.
//!
//! One worker task drives one repo's session end-to-end: admission,
//! spawn, poll/confirm/escalate, terminal write-through, idempotent
//! action application. Workers share nothing in memory except the
//! governor; everything else flows through the flock-disciplined
//! files.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::driver::SessionDriver;
use crate::governor::{spawn_refresh_task, Governor};
use crate::host::HostApi;
use crate::ledger::ActionLedger;
use crate::models::checkpoint::{ResumeCheckpoint, RunMode};
use crate::models::plan::Plan;
use crate::models::state::{ItemKey, ItemOutcome, RepoOutcome};
use crate::monitor::{SessionMonitor, SessionState, StallAction};
use crate::store::StateStore;
use crate::Result;

/// Instruction sent when the escalation ladder reaches compaction.
const COMPACT_COMMAND: &str = "/compact";

/// Dispatcher idle tick while waiting for an admission slot.
const DISPATCH_TICK: Duration = Duration::from_secs(1);

/// Aggregate result of one run, printed by the binary as JSON.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunSummary {
    /// Repos that finished with a result.
    pub completed: usize,
    /// Repos whose session ended in error.
    pub errors: usize,
    /// Repos force-terminated at the hard session timeout.
    pub timeouts: usize,
    /// Repos skipped as recently reviewed.
    pub skipped: usize,
    /// Repos whose plan had at least one failed host action.
    pub action_failures: usize,
    /// Whether the run stopped before draining the fleet.
    pub interrupted: bool,
}

impl RunSummary {
    /// Whether the run should exit non-zero.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.errors > 0 || self.timeouts > 0 || self.action_failures > 0 || self.interrupted
    }
}

/// Outcome of one worker task.
struct WorkerResult {
    repo: String,
    /// `None` when the worker was cancelled before reaching a terminal
    /// state; the repo stays pending for the next run.
    outcome: Option<RepoOutcome>,
    actions_failed: bool,
}

/// Drives the whole fleet for one run.
pub struct Orchestrator {
    config: Arc<GlobalConfig>,
    governor: Arc<Governor>,
    monitor: Arc<SessionMonitor>,
    store: Arc<dyn StateStore>,
    ledger: Arc<ActionLedger>,
    driver: Arc<dyn SessionDriver>,
    host: Arc<dyn HostApi>,
    mode: RunMode,
    resume: bool,
}

impl Orchestrator {
    /// Assemble an orchestrator from its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)] // Construction-time wiring; called once from main.
    pub fn new(
        config: Arc<GlobalConfig>,
        governor: Arc<Governor>,
        monitor: Arc<SessionMonitor>,
        store: Arc<dyn StateStore>,
        ledger: Arc<ActionLedger>,
        driver: Arc<dyn SessionDriver>,
        host: Arc<dyn HostApi>,
        mode: RunMode,
        resume: bool,
    ) -> Self {
        Self {
            config,
            governor,
            monitor,
            store,
            ledger,
            driver,
            host,
            mode,
            resume,
        }
    }

    /// Run the fleet until it drains, the breaker trips, or `cancel`
    /// fires.
    ///
    /// # Errors
    ///
    /// Returns an error when the state store cannot be initialized or
    /// consulted; per-repo failures are isolated into the summary.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        self.store.init(&run_id)?;

        let mut summary = RunSummary::default();
        let mut completed: Vec<String> = Vec::new();
        let pending = self.pending_repos(&mut completed)?;

        info!(
            run_id,
            pending = pending.len(),
            target = self.governor.target_parallelism(),
            "run starting"
        );

        let mut queue: VecDeque<String> = VecDeque::new();
        for repo in pending {
            if self.config.skip_recent_days > 0
                && self
                    .store
                    .is_recently_reviewed(&repo, self.config.skip_recent_days)?
            {
                info!(repo, "recently reviewed; skipping");
                summary.skipped += 1;
                completed.push(repo);
                continue;
            }
            queue.push_back(repo);
        }

        let refresh_cancel = CancellationToken::new();
        let refresh_handle = spawn_refresh_task(
            Arc::clone(&self.governor),
            Arc::clone(&self.host),
            Arc::clone(&self.monitor),
            refresh_cancel.clone(),
        );

        let mut join_set: JoinSet<WorkerResult> = JoinSet::new();
        let mut unfinished: Vec<String> = Vec::new();

        loop {
            let breaker_open = self.governor.status().circuit_breaker_open;
            let admitting = !cancel.is_cancelled() && !breaker_open;

            if join_set.is_empty() && (queue.is_empty() || !admitting) {
                break;
            }

            if admitting {
                while !queue.is_empty() && self.governor.can_start_new_session(join_set.len()) {
                    if let Some(repo) = queue.pop_front() {
                        join_set.spawn(review_repo(
                            Arc::clone(&self.config),
                            Arc::clone(&self.governor),
                            Arc::clone(&self.monitor),
                            Arc::clone(&self.store),
                            Arc::clone(&self.ledger),
                            Arc::clone(&self.driver),
                            Arc::clone(&self.host),
                            self.mode,
                            repo,
                            cancel.clone(),
                        ));
                    }
                }
            }

            tokio::select! {
                joined = join_set.join_next(), if !join_set.is_empty() => {
                    match joined {
                        Some(Ok(result)) => {
                            Self::absorb(&mut summary, &mut completed, &mut unfinished, result);
                        }
                        Some(Err(err)) => {
                            error!(%err, "worker task panicked");
                            summary.errors += 1;
                        }
                        None => {}
                    }
                }
                () = tokio::time::sleep(DISPATCH_TICK) => {}
            }
        }

        refresh_cancel.cancel();
        let _ = refresh_handle.await;

        let mut remaining: Vec<String> = queue.into_iter().collect();
        remaining.extend(unfinished);

        if remaining.is_empty() {
            self.store.clear_checkpoint()?;
            info!(run_id, "run complete");
        } else {
            summary.interrupted = true;
            let checkpoint =
                ResumeCheckpoint::new(run_id.clone(), self.mode, completed, remaining);
            self.store.save_checkpoint(&checkpoint)?;
            warn!(
                run_id,
                pending = checkpoint.repos_pending,
                "run interrupted; resume checkpoint written"
            );
        }

        Ok(summary)
    }

    /// The repo list for this run: the configured fleet, or the
    /// checkpointed pending set when resuming.
    fn pending_repos(&self, completed: &mut Vec<String>) -> Result<Vec<String>> {
        if self.resume {
            if let Some(checkpoint) = self.store.load_checkpoint()? {
                info!(
                    run_id = checkpoint.run_id,
                    pending = checkpoint.repos_pending,
                    "resuming interrupted run"
                );
                completed.extend(checkpoint.completed_repos);
                return Ok(checkpoint.pending_repos);
            }
            debug!("no resume checkpoint; starting a fresh run");
        }
        Ok(self.config.repos.clone())
    }

    fn absorb(
        summary: &mut RunSummary,
        completed: &mut Vec<String>,
        unfinished: &mut Vec<String>,
        result: WorkerResult,
    ) {
        if result.actions_failed {
            summary.action_failures += 1;
        }
        match result.outcome {
            Some(RepoOutcome::Completed) => {
                summary.completed += 1;
                completed.push(result.repo);
            }
            Some(RepoOutcome::Error) => {
                summary.errors += 1;
                completed.push(result.repo);
            }
            Some(RepoOutcome::Timeout) => {
                summary.timeouts += 1;
                completed.push(result.repo);
            }
            Some(RepoOutcome::Skipped) => {
                summary.skipped += 1;
                completed.push(result.repo);
            }
            None => unfinished.push(result.repo),
        }
    }
}

/// Drive one repo's session from admission to write-through.
#[allow(clippy::too_many_arguments)] // Worker wiring mirrors the orchestrator fields.
async fn review_repo(
    config: Arc<GlobalConfig>,
    governor: Arc<Governor>,
    monitor: Arc<SessionMonitor>,
    store: Arc<dyn StateStore>,
    ledger: Arc<ActionLedger>,
    driver: Arc<dyn SessionDriver>,
    host: Arc<dyn HostApi>,
    mode: RunMode,
    repo: String,
    cancel: CancellationToken,
) -> WorkerResult {
    let started = Instant::now();
    let working_copy = config.working_copy(&repo);

    let session_id = match driver.start(&repo, &working_copy).await {
        Ok(id) => id,
        Err(err) => {
            error!(repo, %err, "session failed to start");
            governor.record_error();
            record_outcome(store.as_ref(), &repo, RepoOutcome::Error, 0, 0, 0);
            return WorkerResult {
                repo,
                outcome: Some(RepoOutcome::Error),
                actions_failed: false,
            };
        }
    };
    monitor.register(&session_id, &repo);

    let poll = Duration::from_secs(config.monitor.poll_interval_seconds);
    let hard_timeout = Duration::from_secs(config.timeouts.session_seconds);

    let outcome = loop {
        let cancelled = tokio::select! {
            () = cancel.cancelled() => true,
            () = tokio::time::sleep(poll) => false,
        };
        if cancelled {
            info!(repo, session_id, "worker cancelled");
            break None;
        }

        match driver.read_output(&session_id).await {
            Ok(chunk) => monitor.observe_output(&session_id, &chunk),
            Err(err) => debug!(repo, session_id, %err, "output read failed"),
        }

        let raw = match monitor.classify_raw(&session_id) {
            Ok(state) => state,
            Err(err) => {
                error!(repo, session_id, %err, "classification failed");
                break Some(RepoOutcome::Error);
            }
        };
        let state = match monitor.apply_hysteresis(&session_id, raw) {
            Ok(state) => state,
            Err(err) => {
                error!(repo, session_id, %err, "hysteresis failed");
                break Some(RepoOutcome::Error);
            }
        };

        match state {
            SessionState::Complete => break Some(RepoOutcome::Completed),
            SessionState::Error => break Some(RepoOutcome::Error),
            SessionState::Stalled => {
                let escalation = match monitor.handle_stalled(&session_id) {
                    Ok(action) => action,
                    Err(err) => {
                        error!(repo, session_id, %err, "stall handling failed");
                        break Some(RepoOutcome::Error);
                    }
                };
                let delivery = match escalation {
                    StallAction::SoftInterrupt => driver.interrupt(&session_id).await,
                    StallAction::CompactContext => driver.send(&session_id, COMPACT_COMMAND).await,
                };
                if let Err(err) = delivery {
                    // Recovery itself failed; isolate the session.
                    error!(repo, session_id, %err, "stall recovery delivery failed");
                    break Some(RepoOutcome::Error);
                }
            }
            SessionState::Idle | SessionState::Thinking | SessionState::Generating => {}
        }

        if started.elapsed() >= hard_timeout {
            warn!(repo, session_id, "hard session timeout; forcing termination");
            break Some(RepoOutcome::Timeout);
        }
    };

    if let Err(err) = driver.stop(&session_id).await {
        warn!(repo, session_id, %err, "session stop failed");
    }
    monitor.deregister(&session_id);

    let Some(outcome) = outcome else {
        return WorkerResult {
            repo,
            outcome: None,
            actions_failed: false,
        };
    };

    let duration = started.elapsed().as_secs();
    let plan = if outcome == RepoOutcome::Completed {
        load_plan(&working_copy, &config.plan_filename, &repo)
    } else {
        None
    };

    let (items_fixed, items_skipped) = plan.as_ref().map_or((0, 0), |plan| {
        let fixed = plan
            .items
            .iter()
            .filter(|item| item.outcome == ItemOutcome::Fixed)
            .count();
        let skipped = plan
            .items
            .iter()
            .filter(|item| item.outcome == ItemOutcome::Skipped)
            .count();
        (
            u32::try_from(fixed).unwrap_or(u32::MAX),
            u32::try_from(skipped).unwrap_or(u32::MAX),
        )
    });

    record_outcome(
        store.as_ref(),
        &repo,
        outcome,
        duration,
        items_fixed,
        items_skipped,
    );

    if let Some(plan) = &plan {
        for item in &plan.items {
            let key = ItemKey::new(repo.clone(), item.kind, item.number);
            if let Err(err) = store.record_item_outcome(&key, item.outcome, &item.notes) {
                error!(repo, key = %key, %err, "item outcome write failed");
            }
        }
    }

    if matches!(outcome, RepoOutcome::Error | RepoOutcome::Timeout) {
        governor.record_error();
    }

    let mut actions_failed = false;
    if let Some(plan) = &plan {
        if !plan.gh_actions.is_empty() {
            let dry_run = mode == RunMode::DryRun;
            if let Err(err) = ledger
                .execute_all(&repo, &plan.gh_actions, host.as_ref(), dry_run)
                .await
            {
                warn!(repo, %err, "plan actions reported failure");
                actions_failed = true;
            }
        }
    }

    WorkerResult {
        repo,
        outcome: Some(outcome),
        actions_failed,
    }
}

/// Read and parse the repo's plan file, if the session left one.
fn load_plan(working_copy: &Path, plan_filename: &str, repo: &str) -> Option<Plan> {
    let path = working_copy.join(plan_filename);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(repo, "no plan file; nothing to apply");
            return None;
        }
        Err(err) => {
            warn!(repo, path = %path.display(), %err, "plan file unreadable");
            return None;
        }
    };
    match Plan::from_json_str(&text) {
        Ok(plan) => Some(plan),
        Err(err) => {
            warn!(repo, path = %path.display(), %err, "plan file unparseable");
            None
        }
    }
}

/// Write a repo outcome, logging (not masking) store failures.
fn record_outcome(
    store: &dyn StateStore,
    repo: &str,
    outcome: RepoOutcome,
    duration: u64,
    items_fixed: u32,
    items_skipped: u32,
) {
    if let Err(err) =
        store.record_repo_outcome(repo, outcome, duration, items_fixed, items_skipped)
    {
        error!(repo, ?outcome, %err, "repo outcome write failed");
    }
}
