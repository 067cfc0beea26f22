//! Source-host API client abstraction.
//!
//! The [`HostApi`] trait decouples the orchestration core from the
//! host transport. The shipped implementation shells out to the host
//! CLI; tests substitute in-memory fakes.

pub mod gh_cli;

use std::future::Future;
use std::pin::Pin;

use crate::models::plan::GhAction;
use crate::Result;

/// Remaining API quota and its reset time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Requests remaining in the current window.
    pub remaining: i64,
    /// Epoch second at which the window resets.
    pub reset_at: i64,
}

/// Interface the core requires of a source-host client.
pub trait HostApi: Send + Sync {
    /// Perform one mutating action against `repo`.
    ///
    /// Returns the host's message on success.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Host`](crate::AppError::Host) with the
    /// host's message when the mutation is rejected, or
    /// [`AppError::Plan`](crate::AppError::Plan) when the action is
    /// missing a required argument.
    fn execute(
        &self,
        repo: &str,
        action: &GhAction,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;

    /// Query the remaining API quota.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Host`](crate::AppError::Host) if the quota
    /// endpoint is unreachable or unparseable.
    fn query_rate_limit(&self) -> Pin<Box<dyn Future<Output = Result<RateLimit>> + Send + '_>>;
}

pub use gh_cli::GhCliHost;
