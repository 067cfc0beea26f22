//! Run-state document: per-repo and per-item review outcomes.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AppError;

/// Current schema version of the state document.
pub const SCHEMA_VERSION: u32 = 2;

/// Terminal outcome of a repo's review session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepoOutcome {
    /// Session finished and produced a result.
    Completed,
    /// Session ended in an error state.
    Error,
    /// Session exceeded the hard per-session timeout.
    Timeout,
    /// Repo was skipped (recently reviewed or filtered out).
    Skipped,
}

/// Outcome of a single reviewed item (issue or pull request).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Item was addressed by the session.
    Fixed,
    /// Item was deliberately left alone.
    Skipped,
    /// Item was attempted but could not be resolved.
    Failed,
}

/// Kind of source-host item a review touches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// An issue.
    Issue,
    /// A pull request.
    Pr,
}

impl Display for ItemKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Issue => write!(f, "issue"),
            Self::Pr => write!(f, "pr"),
        }
    }
}

impl FromStr for ItemKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issue" => Ok(Self::Issue),
            "pr" => Ok(Self::Pr),
            other => Err(AppError::Plan(format!("unknown item kind: {other}"))),
        }
    }
}

/// Structured key for an item record.
///
/// Stored in the document as its string encoding `repo#kind-number`;
/// the structured form is used everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ItemKey {
    /// Repository the item belongs to, `owner/name` form.
    pub repo: String,
    /// Item kind.
    pub kind: ItemKind,
    /// Item number on the source host.
    pub number: u64,
}

impl ItemKey {
    /// Construct a key.
    #[must_use]
    pub fn new(repo: impl Into<String>, kind: ItemKind, number: u64) -> Self {
        Self {
            repo: repo.into(),
            kind,
            number,
        }
    }

    /// String encoding used as the document map key.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}#{}-{}", self.repo, self.kind, self.number)
    }
}

impl Display for ItemKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Per-repo review record in the state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RepoRecord {
    /// Terminal outcome of the session.
    pub outcome: RepoOutcome,
    /// Wall-clock session duration.
    pub duration_seconds: u64,
    /// Items the session fixed.
    pub items_fixed: u32,
    /// Items the session skipped.
    pub items_skipped: u32,
    /// When the review finished.
    pub last_review: DateTime<Utc>,
}

/// Per-item review record in the state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ItemRecord {
    /// Item kind.
    #[serde(rename = "type")]
    pub kind: ItemKind,
    /// Item outcome.
    pub outcome: ItemOutcome,
    /// Free-form notes from the session.
    pub notes: String,
}

/// The run-state document persisted by the state store.
///
/// Keys are append/overwrite-only for the lifetime of a run; records
/// are never deleted while a run is in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReviewState {
    /// Schema version; bumped on incompatible layout changes.
    pub version: u32,
    /// Per-repo outcomes, keyed by `owner/name`.
    pub repos: BTreeMap<String, RepoRecord>,
    /// Per-item outcomes, keyed by the [`ItemKey`] string encoding.
    pub items: BTreeMap<String, ItemRecord>,
}

impl ReviewState {
    /// Construct an empty document at the current schema version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: SCHEMA_VERSION,
            repos: BTreeMap::new(),
            items: BTreeMap::new(),
        }
    }
}

impl Default for ReviewState {
    fn default() -> Self {
        Self::new()
    }
}
