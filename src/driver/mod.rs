//! Protocol-agnostic session driver abstraction.
//!
//! The [`SessionDriver`] trait decouples the orchestration core from
//! how an agent session is actually run. The shipped implementation
//! spawns a local agent CLI per repo; tests substitute scripted fakes.

pub mod process;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::Result;

/// Interface between the orchestrator and one review session backend.
///
/// Implementations are chosen at construction time; nothing in the
/// core dispatches on backend names.
pub trait SessionDriver: Send + Sync {
    /// Start a session for `repo` in its working copy.
    ///
    /// Returns the new session's identifier.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) if the
    /// session cannot be started.
    fn start(
        &self,
        repo: &str,
        working_copy: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;

    /// Send a text instruction to the session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`](crate::AppError::NotFound) if
    /// `session_id` is unknown, or
    /// [`AppError::Driver`](crate::AppError::Driver) if delivery fails.
    fn send(
        &self,
        session_id: &str,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Deliver a soft, non-destructive interrupt asking the agent to
    /// reconsider its current approach.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`](crate::AppError::NotFound) if
    /// `session_id` is unknown, or
    /// [`AppError::Driver`](crate::AppError::Driver) if delivery fails.
    fn interrupt(&self, session_id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Terminate the session.
    ///
    /// Idempotent: stopping an already-terminated or unknown session
    /// returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) only on
    /// unexpected process failures.
    fn stop(&self, session_id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Drain output produced since the previous call.
    ///
    /// Returns an empty string when the session produced nothing new.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`](crate::AppError::NotFound) if
    /// `session_id` is unknown.
    fn read_output(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;
}
