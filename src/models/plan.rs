//! Action plan produced upstream by a review session.
//!
//! A session leaves a plan file in its working copy describing the
//! host-side mutations it wants applied. The orchestrator parses the
//! plan after the session completes and hands the actions to the
//! ledger for idempotent execution.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::state::{ItemKind, ItemOutcome};
use crate::AppError;

/// Mutating operation kinds a plan may request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionOp {
    /// Post a comment on the target.
    Comment,
    /// Close the target.
    Close,
    /// Apply a label to the target.
    Label,
}

/// Target of a host action: an issue or pull request by number.
///
/// Serialized as `issue#<n>` or `pr#<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionTarget {
    /// Target kind.
    pub kind: ItemKind,
    /// Item number on the source host.
    pub number: u64,
}

#[allow(clippy::unwrap_used)] // Pattern is a literal; cannot fail to compile.
fn target_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(issue|pr)#([0-9]+)$").unwrap())
}

impl Display for ActionTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.number)
    }
}

impl FromStr for ActionTarget {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = target_pattern()
            .captures(s)
            .ok_or_else(|| AppError::Plan(format!("invalid action target: {s}")))?;
        let kind = caps[1].parse::<ItemKind>()?;
        let number = caps[2]
            .parse::<u64>()
            .map_err(|err| AppError::Plan(format!("invalid target number in {s}: {err}")))?;
        Ok(Self { kind, number })
    }
}

impl Serialize for ActionTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ActionTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// A single host mutation requested by a plan.
///
/// Operation-specific fields (comment body, label name, …) ride along
/// untyped; the host client interprets them per operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GhAction {
    /// Operation kind.
    pub op: ActionOp,
    /// Issue or pull-request target.
    pub target: ActionTarget,
    /// Operation-specific arguments.
    #[serde(flatten)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl GhAction {
    /// The action as a JSON value, the form the ledger canonicalizes.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// One reviewed item reported by a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanItem {
    /// Item kind.
    #[serde(rename = "type")]
    pub kind: ItemKind,
    /// Item number on the source host.
    pub number: u64,
    /// What the session did with the item.
    pub outcome: ItemOutcome,
    /// Free-form notes from the session.
    #[serde(default)]
    pub notes: String,
}

/// Plan document left in a working copy by a completed session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    /// Plan schema version.
    pub schema_version: u32,
    /// Repository the plan belongs to.
    pub repo: String,
    /// Items the session reviewed.
    #[serde(default)]
    pub items: Vec<PlanItem>,
    /// Host mutations to apply.
    #[serde(default)]
    pub gh_actions: Vec<GhAction>,
    /// Git follow-up metadata, opaque to the orchestrator.
    #[serde(default)]
    pub git: serde_json::Value,
}

impl Plan {
    /// Parse a plan from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Plan` on malformed JSON or schema mismatch.
    pub fn from_json_str(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|err| AppError::Plan(format!("invalid plan: {err}")))
    }
}
