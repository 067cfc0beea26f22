//! Local process driver.
//!
//! Spawns the agent CLI once per repo with `kill_on_drop(true)` for
//! safety, pumps stdout and stderr into a per-session buffer, and
//! writes instructions to the agent's stdin. Interrupts and compaction
//! are delivered in-band as instruction lines.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::SessionDriver;
use crate::{AppError, Result};

/// Instruction sent on a soft interrupt.
const INTERRUPT_MESSAGE: &str =
    "You appear to be stuck. Step back, reassess your current approach, and continue.";

/// Grace period before a stopping session is force-killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// One running agent process.
struct SessionHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    buffer: Arc<StdMutex<String>>,
}

/// [`SessionDriver`] backed by local agent CLI processes.
pub struct ProcessDriver {
    agent_cli: String,
    agent_cli_args: Vec<String>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl std::fmt::Debug for ProcessDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessDriver")
            .field("agent_cli", &self.agent_cli)
            .finish_non_exhaustive()
    }
}

impl ProcessDriver {
    /// Construct a driver around the given agent CLI.
    #[must_use]
    pub fn new(agent_cli: String, agent_cli_args: Vec<String>) -> Self {
        Self {
            agent_cli,
            agent_cli_args,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Pump one output stream into the shared buffer, line by line.
    fn pump<R>(reader: R, buffer: Arc<StdMutex<String>>)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut guard = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                guard.push_str(&line);
                guard.push('\n');
            }
        });
    }
}

impl SessionDriver for ProcessDriver {
    fn start(
        &self,
        repo: &str,
        working_copy: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        let repo = repo.to_owned();
        let working_copy = working_copy.to_path_buf();
        Box::pin(async move {
            let session_id = Uuid::new_v4().to_string();

            let mut cmd = Command::new(&self.agent_cli);
            cmd.args(&self.agent_cli_args)
                .env("FLEET_REVIEW_REPO", &repo)
                .env("FLEET_REVIEW_SESSION_ID", &session_id)
                .current_dir(&working_copy)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd.spawn().map_err(|err| {
                AppError::Driver(format!("failed to spawn {}: {err}", self.agent_cli))
            })?;

            let buffer = Arc::new(StdMutex::new(String::new()));
            if let Some(stdout) = child.stdout.take() {
                Self::pump(stdout, Arc::clone(&buffer));
            }
            if let Some(stderr) = child.stderr.take() {
                Self::pump(stderr, Arc::clone(&buffer));
            }
            let stdin = child.stdin.take();

            info!(
                session_id,
                repo,
                pid = child.id().unwrap_or(0),
                agent_cli = self.agent_cli,
                "agent process spawned"
            );

            let mut sessions = self.sessions.lock().await;
            sessions.insert(
                session_id.clone(),
                SessionHandle {
                    child,
                    stdin,
                    buffer,
                },
            );
            Ok(session_id)
        })
    }

    fn send(
        &self,
        session_id: &str,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let session_id = session_id.to_owned();
        let line = format!("{text}\n");
        Box::pin(async move {
            let mut sessions = self.sessions.lock().await;
            let handle = sessions
                .get_mut(&session_id)
                .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
            let stdin = handle
                .stdin
                .as_mut()
                .ok_or_else(|| AppError::Driver(format!("session {session_id} has no stdin")))?;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|err| AppError::Driver(format!("stdin write failed: {err}")))?;
            stdin
                .flush()
                .await
                .map_err(|err| AppError::Driver(format!("stdin flush failed: {err}")))?;
            Ok(())
        })
    }

    fn interrupt(&self, session_id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.send(session_id, INTERRUPT_MESSAGE)
    }

    fn stop(&self, session_id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            let mut sessions = self.sessions.lock().await;
            let Some(mut handle) = sessions.remove(&session_id) else {
                return Ok(());
            };
            drop(sessions);

            // Close stdin first so the agent sees EOF and can exit on
            // its own within the grace period.
            drop(handle.stdin.take());

            match tokio::time::timeout(STOP_GRACE, handle.child.wait()).await {
                Ok(Ok(exit)) => {
                    info!(session_id, ?exit, "agent process exited gracefully");
                }
                Ok(Err(err)) => {
                    warn!(session_id, %err, "error waiting for agent process");
                }
                Err(_) => {
                    warn!(session_id, "agent process outlived grace period; killing");
                    if let Err(err) = handle.child.kill().await {
                        warn!(session_id, %err, "failed to kill agent process");
                    }
                }
            }
            Ok(())
        })
    }

    fn read_output(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            let sessions = self.sessions.lock().await;
            let handle = sessions
                .get(&session_id)
                .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
            let mut guard = handle.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(std::mem::take(&mut *guard))
        })
    }
}
