//! Per-session lifecycle state machine.
//!
//! The monitor consumes each session's raw output stream and produces
//! a hysteresis-confirmed lifecycle state: terminal observations
//! (`complete`, `error`) confirm immediately, everything else must
//! repeat for a configurable number of consecutive polls before the
//! confirmed state moves. Confirmed stalls feed an escalation ladder —
//! soft interrupts first, a context-compaction command once interrupts
//! stop helping.

pub mod classifier;

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::MonitorConfig;
use crate::{AppError, Result};

use classifier::OutputClassifier;

/// Bytes at the end of the tail scanned for transient indicators.
const RECENT_WINDOW_BYTES: usize = 512;

/// Lifecycle state of a review session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No recent activity, not yet long enough to count as a stall.
    Idle,
    /// Output shows an active thinking indicator.
    Thinking,
    /// Output is arriving at generation velocity.
    Generating,
    /// No observable progress past the quiet period.
    Stalled,
    /// Session produced its structured result.
    Complete,
    /// Session output matched a failure pattern.
    Error,
}

impl SessionState {
    /// Whether the state is absorbing.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Recovery step chosen by the escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallAction {
    /// Non-destructive interrupt asking the agent to reconsider.
    SoftInterrupt,
    /// Context-compaction command for a session interrupts did not move.
    CompactContext,
}

/// Per-session observation state, dropped when the session ends.
#[derive(Debug)]
struct SessionRecord {
    repo: String,
    history: VecDeque<SessionState>,
    confirmed: SessionState,
    stall_count: u32,
    tail: String,
    last_change: DateTime<Utc>,
    pending_chars: usize,
}

/// State machine over every active session's output stream.
pub struct SessionMonitor {
    config: MonitorConfig,
    classifier: OutputClassifier,
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl std::fmt::Debug for SessionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionMonitor {
    /// Construct a monitor with the given thresholds.
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            classifier: OutputClassifier::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionRecord>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin tracking a session.
    pub fn register(&self, session_id: &str, repo: &str) {
        let mut sessions = self.lock();
        sessions.insert(
            session_id.to_owned(),
            SessionRecord {
                repo: repo.to_owned(),
                history: VecDeque::with_capacity(self.config.hysteresis_window),
                confirmed: SessionState::Idle,
                stall_count: 0,
                tail: String::new(),
                last_change: Utc::now(),
                pending_chars: 0,
            },
        );
        debug!(session_id, repo, "session registered");
    }

    /// Stop tracking a session and drop its record.
    pub fn deregister(&self, session_id: &str) {
        self.lock().remove(session_id);
        debug!(session_id, "session deregistered");
    }

    /// Feed a chunk of driver output into the session's tail buffer.
    ///
    /// Empty chunks do not count as progress.
    pub fn observe_output(&self, session_id: &str, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let mut sessions = self.lock();
        let Some(record) = sessions.get_mut(session_id) else {
            return;
        };
        record.tail.push_str(chunk);
        if record.tail.len() > self.config.output_tail_bytes {
            let excess = record.tail.len() - self.config.output_tail_bytes;
            let cut = record
                .tail
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= excess)
                .unwrap_or(record.tail.len());
            record.tail.drain(..cut);
        }
        record.pending_chars += chunk.len();
        record.last_change = Utc::now();
    }

    /// Classify the session's current raw state.
    ///
    /// Terminal markers run first and short-circuit; then generation
    /// velocity, thinking indicators, and the quiet period, in that
    /// order. Each call consumes the velocity counter.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown session.
    pub fn classify_raw(&self, session_id: &str) -> Result<SessionState> {
        let mut sessions = self.lock();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not tracked")))?;

        if record.confirmed.is_terminal() {
            return Ok(record.confirmed);
        }

        let arrived = std::mem::take(&mut record.pending_chars);

        if self.classifier.is_complete(&record.tail) {
            return Ok(SessionState::Complete);
        }
        if self.classifier.is_error(&record.tail) {
            return Ok(SessionState::Error);
        }
        if arrived >= self.config.velocity_threshold {
            return Ok(SessionState::Generating);
        }
        let recent_start = record.tail.len().saturating_sub(RECENT_WINDOW_BYTES);
        let recent = record
            .tail
            .get(recent_start..)
            .unwrap_or(record.tail.as_str());
        if arrived > 0 && self.classifier.is_thinking(recent) {
            return Ok(SessionState::Thinking);
        }
        let quiet_secs = (Utc::now() - record.last_change).num_seconds();
        if u64::try_from(quiet_secs).is_ok_and(|q| q >= self.config.quiet_period_seconds) {
            return Ok(SessionState::Stalled);
        }
        Ok(SessionState::Idle)
    }

    /// Fold a raw observation into the session's confirmed state.
    ///
    /// `complete`/`error` confirm on a single observation and are
    /// absorbing. Other states require the full hysteresis window of
    /// identical observations; until then the previous confirmed state
    /// is reported. A confirmed `stalled` is returned to the caller for
    /// recovery but never replaces the stored confirmed state.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown session.
    pub fn apply_hysteresis(&self, session_id: &str, raw: SessionState) -> Result<SessionState> {
        let mut sessions = self.lock();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not tracked")))?;

        if record.confirmed.is_terminal() {
            return Ok(record.confirmed);
        }

        if raw.is_terminal() {
            info!(session_id, repo = record.repo, ?raw, "terminal state confirmed");
            record.confirmed = raw;
            return Ok(raw);
        }

        record.history.push_front(raw);
        record.history.truncate(self.config.hysteresis_window);

        if raw != SessionState::Stalled && record.stall_count > 0 {
            debug!(session_id, "activity observed; stall count reset");
            record.stall_count = 0;
        }

        let window_full = record.history.len() == self.config.hysteresis_window;
        let consistent = window_full && record.history.iter().all(|&s| s == raw);
        if !consistent {
            return Ok(record.confirmed);
        }

        if raw == SessionState::Stalled {
            // Reported for recovery; the stored state keeps its last
            // non-terminal value.
            return Ok(SessionState::Stalled);
        }

        if record.confirmed != raw {
            debug!(session_id, from = ?record.confirmed, to = ?raw, "state confirmed");
            record.confirmed = raw;
        }
        Ok(record.confirmed)
    }

    /// Pick the next recovery step for a confirmed stall.
    ///
    /// Counts 1–2 ask for a soft interrupt; from the third consecutive
    /// stall onward the ladder switches to context compaction.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown session.
    pub fn handle_stalled(&self, session_id: &str) -> Result<StallAction> {
        let mut sessions = self.lock();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not tracked")))?;

        record.stall_count += 1;
        let action = if record.stall_count <= 2 {
            StallAction::SoftInterrupt
        } else {
            StallAction::CompactContext
        };
        info!(
            session_id,
            repo = record.repo,
            stall_count = record.stall_count,
            ?action,
            "stall escalation step"
        );
        Ok(action)
    }

    /// The session's current confirmed state.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown session.
    pub fn confirmed_state(&self, session_id: &str) -> Result<SessionState> {
        let sessions = self.lock();
        sessions
            .get(session_id)
            .map(|record| record.confirmed)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not tracked")))
    }

    /// Output of every session whose stream changed within `window`,
    /// concatenated for pattern scans.
    #[must_use]
    pub fn recent_output(&self, window: Duration) -> String {
        let now = Utc::now();
        let sessions = self.lock();
        let mut out = String::new();
        for record in sessions.values() {
            let age = (now - record.last_change).num_seconds();
            if u64::try_from(age).is_ok_and(|a| a <= window.as_secs()) {
                out.push_str(&record.tail);
                out.push('\n');
            }
        }
        out
    }
}
