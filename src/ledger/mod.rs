//! Append-only idempotency ledger for externally-executed actions.
//!
//! Every host mutation a run performs is recorded as one JSONL line
//! keyed by `(repo, canonical action)`. Re-running a plan — after a
//! crash, a resume, or an operator retry — consults the ledger first,
//! so an action that already succeeded is never executed twice.
//! `failed` entries do not block retry.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::host::HostApi;
use crate::models::plan::GhAction;
use crate::store::lock::FileLock;
use crate::{AppError, Result};

/// Outcome of one ledgered action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// The host accepted the mutation.
    Ok,
    /// The host rejected the mutation; retry is allowed.
    Failed,
    /// The action was not sent (already executed, or a dry run).
    Skipped,
}

/// One executed-action record, one JSONL line in the ledger file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    /// When the action was attempted.
    pub ts: DateTime<Utc>,
    /// Repository the action targets, `owner/name` form.
    pub repo: String,
    /// The action in canonical JSON form.
    pub action: serde_json::Value,
    /// Attempt outcome.
    pub status: ActionStatus,
    /// Host client message or skip reason.
    pub message: String,
}

/// Produce a stable serialization of a JSON value: object keys sorted
/// recursively, compact whitespace. Semantically identical actions
/// canonicalize to the same string regardless of field order.
#[must_use]
pub fn canonicalize(value: &serde_json::Value) -> String {
    fn emit(value: &serde_json::Value, out: &mut String) {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                    out.push(':');
                    if let Some(child) = map.get(*key) {
                        emit(child, out);
                    }
                }
                out.push('}');
            }
            serde_json::Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    emit(item, out);
                }
                out.push(']');
            }
            leaf => out.push_str(&leaf.to_string()),
        }
    }

    let mut out = String::new();
    emit(value, &mut out);
    out
}

/// File-backed append-only action ledger.
///
/// Appends serialize through the same advisory-lock discipline the
/// state store uses; reads tolerate a torn trailing line (a write that
/// never completed was never an executed action).
#[derive(Debug)]
pub struct ActionLedger {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl ActionLedger {
    /// Construct a ledger at `path`.
    #[must_use]
    pub fn new(path: PathBuf, lock_timeout: Duration) -> Self {
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            lock_timeout,
        }
    }

    /// Path of the ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an `ok` entry exists for `(repo, canonical action)`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Ledger`] if the ledger file cannot be read.
    pub fn already_executed(&self, repo: &str, action: &serde_json::Value) -> Result<bool> {
        let canonical = canonicalize(action);
        let entries = self.read_entries()?;
        Ok(entries.iter().any(|entry| {
            entry.status == ActionStatus::Ok
                && entry.repo == repo
                && canonicalize(&entry.action) == canonical
        }))
    }

    /// Append one entry. Prior lines are never mutated.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::LockTimeout`] if the append lock cannot be
    /// acquired, or [`AppError::Ledger`] on write failure.
    pub fn record(
        &self,
        repo: &str,
        action: &serde_json::Value,
        status: ActionStatus,
        message: &str,
    ) -> Result<()> {
        let canonical: serde_json::Value = serde_json::from_str(&canonicalize(action))
            .map_err(|err| AppError::Ledger(format!("cannot canonicalize action: {err}")))?;
        let entry = LedgerEntry {
            ts: Utc::now(),
            repo: repo.to_owned(),
            action: canonical,
            status,
            message: message.to_owned(),
        };
        let line = serde_json::to_string(&entry)
            .map_err(|err| AppError::Ledger(format!("cannot serialize ledger entry: {err}")))?;

        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                AppError::Ledger(format!("cannot create {}: {err}", parent.display()))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| {
                AppError::Ledger(format!("cannot open ledger {}: {err}", self.path.display()))
            })?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{line}")
            .map_err(|err| AppError::Ledger(format!("ledger append failed: {err}")))?;
        writer
            .flush()
            .map_err(|err| AppError::Ledger(format!("ledger flush failed: {err}")))?;
        Ok(())
    }

    /// All parseable entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Ledger`] if the file exists but cannot be read.
    pub fn read_entries(&self) -> Result<Vec<LedgerEntry>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::Ledger(format!(
                    "cannot read ledger {}: {err}",
                    self.path.display()
                )));
            }
        };
        let mut entries = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    // A torn trailing line from an interrupted append is
                    // treated as never-executed, which is the safe side.
                    warn!(%err, "skipping unparseable ledger line");
                }
            }
        }
        Ok(entries)
    }

    /// Execute a repo's plan actions idempotently.
    ///
    /// Per action: skip (ledgered as `skipped`) when an `ok` entry
    /// already exists or when `dry_run` is set; otherwise invoke the
    /// host client and ledger `ok` or `failed` with its message. Every
    /// action is attempted regardless of earlier failures in the batch.
    ///
    /// Idempotency across workers relies on each repo's actions being
    /// applied by the single worker that owns the repo, plus the
    /// `(repo, canonical)` check here for re-runs and resumes.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Host`] if any action failed after all were
    /// attempted, or a ledger error if recording itself broke down.
    pub async fn execute_all(
        &self,
        repo: &str,
        actions: &[GhAction],
        host: &dyn HostApi,
        dry_run: bool,
    ) -> Result<()> {
        let mut failed = 0_usize;
        for action in actions {
            let value = action.to_value();
            if self.already_executed(repo, &value)? {
                info!(repo, target = %action.target, "action already executed; skipping");
                self.record(repo, &value, ActionStatus::Skipped, "already executed")?;
                continue;
            }
            if dry_run {
                info!(repo, target = %action.target, "dry run; not executing");
                self.record(repo, &value, ActionStatus::Skipped, "dry run")?;
                continue;
            }
            match host.execute(repo, action).await {
                Ok(message) => {
                    info!(repo, target = %action.target, "action executed");
                    self.record(repo, &value, ActionStatus::Ok, &message)?;
                }
                Err(err) => {
                    warn!(repo, target = %action.target, %err, "action failed");
                    self.record(repo, &value, ActionStatus::Failed, &err.to_string())?;
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(AppError::Host(format!(
                "{failed} of {} actions failed for {repo}",
                actions.len()
            )));
        }
        Ok(())
    }
}
