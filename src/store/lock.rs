//! Advisory file lock with bounded, polled acquisition.
//!
//! Writers to the state document and the action ledger serialize
//! through an exclusive `flock` on a sidecar lock file. The lock is
//! held by an RAII guard and released by the OS when the descriptor
//! closes, so a crashed holder never leaves the file locked.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::{AppError, Result};

/// Poll interval while waiting for a contended lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An exclusively-held advisory lock on `path`.
///
/// Dropping the guard releases the lock.
pub struct FileLock {
    #[cfg(unix)]
    _guard: nix::fcntl::Flock<std::fs::File>,
    #[cfg(not(unix))]
    _file: std::fs::File,
    path: PathBuf,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileLock {
    /// Acquire the lock, polling until `timeout` elapses.
    ///
    /// Creates the lock file (and its parent directory) if absent.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::LockTimeout`] if the lock is still held by
    /// another process when the timeout expires, or [`AppError::Io`] on
    /// unexpected filesystem failures.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                AppError::Io(format!(
                    "cannot create lock directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            match Self::try_acquire(path)? {
                Some(lock) => {
                    debug!(path = %path.display(), "lock acquired");
                    return Ok(lock);
                }
                None if Instant::now() >= deadline => {
                    return Err(AppError::LockTimeout(format!(
                        "could not acquire {} within {}ms",
                        path.display(),
                        timeout.as_millis()
                    )));
                }
                None => std::thread::sleep(LOCK_POLL_INTERVAL),
            }
        }
    }

    /// One non-blocking acquisition attempt.
    ///
    /// Returns `Ok(None)` when another process holds the lock.
    fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|err| {
                AppError::Io(format!("cannot open lock file {}: {err}", path.display()))
            })?;

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::fcntl::{Flock, FlockArg};

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(guard) => Ok(Some(Self {
                    _guard: guard,
                    path: path.to_path_buf(),
                })),
                Err((_, Errno::EWOULDBLOCK | Errno::EAGAIN)) => Ok(None),
                Err((_, errno)) => Err(AppError::Io(format!(
                    "flock on {} failed: {errno}",
                    path.display()
                ))),
            }
        }

        #[cfg(not(unix))]
        {
            // No advisory locking available; exclusive access is best-effort.
            Ok(Some(Self {
                _file: file,
                path: path.to_path_buf(),
            }))
        }
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
