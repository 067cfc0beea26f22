//! Crash-safe persistence of run progress.
//!
//! The [`StateStore`] trait hides the locking primitive behind an
//! interface whose [`update`](StateStore::update) serializes writers:
//! lock, load, transform, atomic-replace, unlock. The file-backed
//! implementation, [`FileStateStore`], uses an advisory `flock` sidecar
//! and `tempfile::NamedTempFile::persist` so every observer sees either
//! the pre- or post-update document, never a partial write.

pub mod lock;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::models::checkpoint::ResumeCheckpoint;
use crate::models::state::{
    ItemKey, ItemOutcome, ItemRecord, RepoOutcome, RepoRecord, ReviewState,
};
use crate::{AppError, Result};

use lock::FileLock;

/// Durable, lock-disciplined store for the run-state document and the
/// resume checkpoint.
pub trait StateStore: Send + Sync {
    /// Create the state document iff it does not already exist.
    ///
    /// Never overwrites pre-existing state; calling on an initialized
    /// store is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be created.
    fn init(&self, run_id: &str) -> Result<()>;

    /// Load the current document.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if [`init`](Self::init) has not
    /// run, or [`AppError::State`] if the document exists but does not
    /// parse — a hard fault requiring operator attention, never a
    /// silent reset.
    fn load(&self) -> Result<ReviewState>;

    /// Apply `transform` to the latest committed document under the
    /// writer lock and atomically replace the live file.
    ///
    /// Returns the post-update document.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::LockTimeout`] if the lock cannot be acquired
    /// in time — the caller must not proceed as if the update happened.
    fn update(&self, transform: &mut dyn FnMut(&mut ReviewState)) -> Result<ReviewState>;

    /// Persist a resume checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be written.
    fn save_checkpoint(&self, checkpoint: &ResumeCheckpoint) -> Result<()>;

    /// Load the resume checkpoint, if one exists.
    ///
    /// Absence means the previous run completed cleanly and is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::State`] if a checkpoint exists but does not
    /// parse.
    fn load_checkpoint(&self) -> Result<Option<ResumeCheckpoint>>;

    /// Delete the resume checkpoint.
    ///
    /// Idempotent: a missing file is success, and the containing state
    /// directory is left intact.
    ///
    /// # Errors
    ///
    /// Returns an error only on unexpected filesystem failures.
    fn clear_checkpoint(&self) -> Result<()>;

    /// Record a repo's terminal outcome, stamping the review time.
    ///
    /// # Errors
    ///
    /// Propagates [`update`](Self::update) failures.
    fn record_repo_outcome(
        &self,
        repo: &str,
        outcome: RepoOutcome,
        duration_seconds: u64,
        items_fixed: u32,
        items_skipped: u32,
    ) -> Result<()> {
        self.update(&mut |doc| {
            doc.repos.insert(
                repo.to_owned(),
                RepoRecord {
                    outcome,
                    duration_seconds,
                    items_fixed,
                    items_skipped,
                    last_review: Utc::now(),
                },
            );
        })?;
        Ok(())
    }

    /// Record a single item's outcome.
    ///
    /// # Errors
    ///
    /// Propagates [`update`](Self::update) failures.
    fn record_item_outcome(&self, key: &ItemKey, outcome: ItemOutcome, notes: &str) -> Result<()> {
        let encoded = key.encode();
        let record = ItemRecord {
            kind: key.kind,
            outcome,
            notes: notes.to_owned(),
        };
        self.update(&mut |doc| {
            doc.items.insert(encoded.clone(), record.clone());
        })?;
        Ok(())
    }

    /// Whether `repo` was reviewed within the last `days` days.
    ///
    /// Unknown repos — and a store that has never been initialized —
    /// return false.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::State`] on a corrupt document.
    fn is_recently_reviewed(&self, repo: &str, days: u32) -> Result<bool> {
        let doc = match self.load() {
            Ok(doc) => doc,
            Err(AppError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        let Some(record) = doc.repos.get(repo) else {
            return Ok(false);
        };
        let age = Utc::now() - record.last_review;
        Ok(age < chrono::Duration::days(i64::from(days)))
    }
}

/// File-backed [`StateStore`] rooted in a state directory.
#[derive(Debug)]
pub struct FileStateStore {
    state_path: PathBuf,
    checkpoint_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl FileStateStore {
    /// Construct a store for the given document and checkpoint paths.
    #[must_use]
    pub fn new(state_path: PathBuf, checkpoint_path: PathBuf, lock_timeout: Duration) -> Self {
        let lock_path = state_path.with_extension("lock");
        Self {
            state_path,
            checkpoint_path,
            lock_path,
            lock_timeout,
        }
    }

    /// Path of the live state document.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    fn read_document(path: &Path) -> Result<ReviewState> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(format!(
                    "state document {} does not exist",
                    path.display()
                )));
            }
            Err(err) => {
                return Err(AppError::State(format!(
                    "cannot read state document {}: {err}",
                    path.display()
                )));
            }
        };
        serde_json::from_str(&text).map_err(|err| {
            AppError::State(format!(
                "state document {} is corrupt ({err}); refusing to reset it",
                path.display()
            ))
        })
    }

    fn write_atomic(path: &Path, text: &str) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| AppError::State(format!("{} has no parent", path.display())))?;
        std::fs::create_dir_all(parent).map_err(|err| {
            AppError::State(format!("cannot create {}: {err}", parent.display()))
        })?;
        let tmp = NamedTempFile::new_in(parent)
            .map_err(|err| AppError::State(format!("cannot create temp file: {err}")))?;
        std::fs::write(tmp.path(), text)
            .map_err(|err| AppError::State(format!("cannot write temp file: {err}")))?;
        tmp.persist(path).map_err(|err| {
            AppError::State(format!("cannot persist {}: {err}", path.display()))
        })?;
        Ok(())
    }

    fn serialize(doc: &ReviewState) -> Result<String> {
        serde_json::to_string_pretty(doc)
            .map_err(|err| AppError::State(format!("cannot serialize state document: {err}")))
    }
}

impl StateStore for FileStateStore {
    fn init(&self, run_id: &str) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout)?;
        if self.state_path.exists() {
            debug!(run_id, path = %self.state_path.display(), "state document already exists");
            return Ok(());
        }
        let doc = ReviewState::new();
        Self::write_atomic(&self.state_path, &Self::serialize(&doc)?)?;
        info!(run_id, path = %self.state_path.display(), "state document created");
        Ok(())
    }

    fn load(&self) -> Result<ReviewState> {
        Self::read_document(&self.state_path)
    }

    fn update(&self, transform: &mut dyn FnMut(&mut ReviewState)) -> Result<ReviewState> {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout)?;
        let mut doc = Self::read_document(&self.state_path)?;
        transform(&mut doc);
        Self::write_atomic(&self.state_path, &Self::serialize(&doc)?)?;
        Ok(doc)
    }

    fn save_checkpoint(&self, checkpoint: &ResumeCheckpoint) -> Result<()> {
        let text = serde_json::to_string_pretty(checkpoint)
            .map_err(|err| AppError::State(format!("cannot serialize checkpoint: {err}")))?;
        Self::write_atomic(&self.checkpoint_path, &text)?;
        info!(
            run_id = checkpoint.run_id,
            pending = checkpoint.repos_pending,
            "resume checkpoint saved"
        );
        Ok(())
    }

    fn load_checkpoint(&self) -> Result<Option<ResumeCheckpoint>> {
        let text = match std::fs::read_to_string(&self.checkpoint_path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(AppError::State(format!(
                    "cannot read checkpoint {}: {err}",
                    self.checkpoint_path.display()
                )));
            }
        };
        let checkpoint = serde_json::from_str(&text).map_err(|err| {
            AppError::State(format!(
                "checkpoint {} is corrupt: {err}",
                self.checkpoint_path.display()
            ))
        })?;
        Ok(Some(checkpoint))
    }

    fn clear_checkpoint(&self) -> Result<()> {
        match std::fs::remove_file(&self.checkpoint_path) {
            Ok(()) => {
                debug!(path = %self.checkpoint_path.display(), "resume checkpoint cleared");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::State(format!(
                "cannot remove checkpoint {}: {err}",
                self.checkpoint_path.display()
            ))),
        }
    }
}
