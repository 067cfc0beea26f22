//! Host client shelling out to the `gh` CLI.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info_span, Instrument};

use super::{HostApi, RateLimit};
use crate::models::plan::{ActionOp, GhAction};
use crate::models::state::ItemKind;
use crate::{AppError, Result};

/// [`HostApi`] implementation invoking the host CLI binary per call.
///
/// Authentication is the CLI's own concern; no token ever passes
/// through this process.
#[derive(Debug, Clone)]
pub struct GhCliHost {
    binary: String,
}

impl GhCliHost {
    /// Construct a client around the given binary (normally `gh`).
    #[must_use]
    pub fn new(binary: String) -> Self {
        Self { binary }
    }

    /// Build the CLI argument vector for one action.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Plan`] when a required argument (comment
    /// body, label name) is absent.
    fn action_args(repo: &str, action: &GhAction) -> Result<Vec<String>> {
        let noun = match action.target.kind {
            ItemKind::Issue => "issue",
            ItemKind::Pr => "pr",
        };
        let number = action.target.number.to_string();
        let args = match action.op {
            ActionOp::Comment => {
                let body = action
                    .args
                    .get("body")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| {
                        AppError::Plan(format!("comment on {} has no body", action.target))
                    })?;
                vec![
                    noun.to_owned(),
                    "comment".to_owned(),
                    number,
                    "--repo".to_owned(),
                    repo.to_owned(),
                    "--body".to_owned(),
                    body.to_owned(),
                ]
            }
            ActionOp::Close => vec![
                noun.to_owned(),
                "close".to_owned(),
                number,
                "--repo".to_owned(),
                repo.to_owned(),
            ],
            ActionOp::Label => {
                let label = action
                    .args
                    .get("label")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| {
                        AppError::Plan(format!("label on {} has no label name", action.target))
                    })?;
                vec![
                    noun.to_owned(),
                    "edit".to_owned(),
                    number,
                    "--repo".to_owned(),
                    repo.to_owned(),
                    "--add-label".to_owned(),
                    label.to_owned(),
                ]
            }
        };
        Ok(args)
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| AppError::Host(format!("failed to run {}: {err}", self.binary)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if output.status.success() {
            debug!(binary = self.binary, "host cli call succeeded");
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            Err(AppError::Host(format!(
                "{} exited with {}: {stderr}",
                self.binary, output.status
            )))
        }
    }
}

impl HostApi for GhCliHost {
    fn execute(
        &self,
        repo: &str,
        action: &GhAction,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        let repo = repo.to_owned();
        let action = action.clone();
        let span = info_span!("host_execute", repo = %repo, target = %action.target);
        Box::pin(
            async move {
                let args = Self::action_args(&repo, &action)?;
                self.run(&args).await
            }
            .instrument(span),
        )
    }

    fn query_rate_limit(&self) -> Pin<Box<dyn Future<Output = Result<RateLimit>> + Send + '_>> {
        Box::pin(async move {
            let raw = self
                .run(&["api".to_owned(), "rate_limit".to_owned()])
                .await?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|err| AppError::Host(format!("unparseable rate_limit payload: {err}")))?;
            let core = &value["resources"]["core"];
            let remaining = core["remaining"]
                .as_i64()
                .ok_or_else(|| AppError::Host("rate_limit payload missing remaining".into()))?;
            let reset_at = core["reset"]
                .as_i64()
                .ok_or_else(|| AppError::Host("rate_limit payload missing reset".into()))?;
            Ok(RateLimit {
                remaining,
                reset_at,
            })
        })
    }
}
