//! Transport interface (C1): an abstract copy/sync/delete surface against a
//! remote namespace. The actual "transport agent" (§1) is an external,
//! opaque utility — this module only defines the capability-typed contract
//! and the two implementations this repo can exercise on its own: an
//! in-process filesystem mirror (used in tests and as a same-host
//! fallback), and a thin wrapper that shells out to an external binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cloudsync_retry::{ErrorClass, RetryStrategyConfig};

use crate::error::CloudSyncError;
use crate::process::run_command_with_timeout;

#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub mtime: chrono::DateTime<chrono::Utc>,
}

/// Deadline + best-effort cooperative cancellation for a transport call.
#[derive(Debug, Clone, Copy)]
pub struct CallBudget {
    pub deadline: Duration,
}

impl CallBudget {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

/// Run a single transport call under the §7 retry policy: capped exponential
/// backoff for `TransportFailure { retryable: true, .. }`, immediate abort
/// for anything else (including `retryable: false` and non-transport
/// errors, which `classify` never marks retryable).
pub fn with_retry<T>(
    policy: &RetryStrategyConfig,
    mut call: impl FnMut() -> Result<T, CloudSyncError>,
) -> Result<T, CloudSyncError> {
    cloudsync_retry::retry_with_backoff(
        policy,
        |_attempt| call(),
        |e| {
            if e.is_retryable() {
                ErrorClass::Retryable
            } else {
                ErrorClass::Permanent
            }
        },
    )
}

pub trait Transport: Send + Sync {
    /// Make `remote_dir` match `local_dir` (additions, updates, deletions).
    /// Idempotent: re-running after a partial failure converges to the
    /// same end state.
    fn sync(&self, local_dir: &Path, remote_dir: &str, budget: CallBudget) -> Result<(), CloudSyncError>;

    /// One-shot upload of a single file.
    fn copy(&self, local_path: &Path, remote_path: &str, budget: CallBudget) -> Result<(), CloudSyncError>;

    /// Mirror `remote_dir` into `local_dir` (used by restore's scratch pull).
    fn pull(&self, remote_dir: &str, local_dir: &Path, budget: CallBudget) -> Result<(), CloudSyncError>;

    fn list(&self, remote_dir: &str, budget: CallBudget) -> Result<Vec<RemoteEntry>, CloudSyncError>;

    fn delete(&self, remote_path: &str, budget: CallBudget) -> Result<(), CloudSyncError>;
}

/// Filesystem-backed transport: `remote_dir`/`remote_path` are interpreted
/// relative to a configured root directory. Used for tests and for the
/// degenerate case where the "remote" is another local mount point.
pub struct FileTransport {
    root: PathBuf,
}

impl FileTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

impl Transport for FileTransport {
    fn sync(&self, local_dir: &Path, remote_dir: &str, _budget: CallBudget) -> Result<(), CloudSyncError> {
        let dest = self.resolve(remote_dir);
        fs::create_dir_all(&dest).map_err(|e| CloudSyncError::TransportFailure {
            retryable: true,
            reason: format!("failed to create remote dir {}: {e}", dest.display()),
        })?;

        mirror_dir(local_dir, &dest)
    }

    fn copy(&self, local_path: &Path, remote_path: &str, _budget: CallBudget) -> Result<(), CloudSyncError> {
        let dest = self.resolve(remote_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| CloudSyncError::TransportFailure {
                retryable: true,
                reason: format!("failed to create parent dir {}: {e}", parent.display()),
            })?;
        }
        fs::copy(local_path, &dest).map_err(|e| CloudSyncError::TransportFailure {
            retryable: true,
            reason: format!("failed to copy {} -> {}: {e}", local_path.display(), dest.display()),
        })?;
        Ok(())
    }

    fn pull(&self, remote_dir: &str, local_dir: &Path, _budget: CallBudget) -> Result<(), CloudSyncError> {
        let src = self.resolve(remote_dir);
        if !src.exists() {
            return Err(CloudSyncError::TransportFailure {
                retryable: false,
                reason: format!("remote dir {} does not exist", src.display()),
            });
        }
        fs::create_dir_all(local_dir).map_err(|e| CloudSyncError::TransportFailure {
            retryable: true,
            reason: format!("failed to create local dir {}: {e}", local_dir.display()),
        })?;
        mirror_dir(&src, local_dir)
    }

    fn list(&self, remote_dir: &str, _budget: CallBudget) -> Result<Vec<RemoteEntry>, CloudSyncError> {
        let dir = self.resolve(remote_dir);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| CloudSyncError::TransportFailure {
            retryable: true,
            reason: format!("failed to list {}: {e}", dir.display()),
        })? {
            let entry = entry.map_err(|e| CloudSyncError::TransportFailure {
                retryable: true,
                reason: e.to_string(),
            })?;
            let meta = entry.metadata().map_err(|e| CloudSyncError::TransportFailure {
                retryable: true,
                reason: e.to_string(),
            })?;
            if !meta.is_file() {
                continue;
            }
            let mtime: chrono::DateTime<chrono::Utc> = meta
                .modified()
                .map(chrono::DateTime::<chrono::Utc>::from)
                .unwrap_or_else(|_| chrono::Utc::now());
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                mtime,
            });
        }
        Ok(entries)
    }

    fn delete(&self, remote_path: &str, _budget: CallBudget) -> Result<(), CloudSyncError> {
        let path = self.resolve(remote_path);
        if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .map_err(|e| CloudSyncError::TransportFailure {
            retryable: true,
            reason: format!("failed to delete {}: {e}", path.display()),
        })
    }
}

fn mirror_dir(src: &Path, dest: &Path) -> Result<(), CloudSyncError> {
    fs::create_dir_all(dest).map_err(io_err)?;

    let mut seen = std::collections::HashSet::new();
    for entry in fs::read_dir(src).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let file_name = entry.file_name();
        seen.insert(file_name.clone());
        let src_path = entry.path();
        let dest_path = dest.join(&file_name);
        if entry.file_type().map_err(io_err)?.is_dir() {
            mirror_dir(&src_path, &dest_path)?;
        } else {
            fs::copy(&src_path, &dest_path).map_err(io_err)?;
        }
    }

    // Delete anything in dest not present in src, to make dest match src.
    for entry in fs::read_dir(dest).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if !seen.contains(&entry.file_name()) {
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(&path).map_err(io_err)?;
            } else {
                fs::remove_file(&path).map_err(io_err)?;
            }
        }
    }

    Ok(())
}

fn io_err(e: std::io::Error) -> CloudSyncError {
    CloudSyncError::TransportFailure {
        retryable: true,
        reason: e.to_string(),
    }
}

/// Transport that shells out to an external binary, invoked as
/// `<command> sync <local> <remote>`, `<command> copy ...`, etc. The binary
/// path is read from `CLOUDSYNC_TRANSPORT_BIN` if set, which lets tests
/// substitute a fake executable, mirroring the teacher's
/// `SHIPPER_GIT_BIN` override for `git`.
pub struct ShellTransport {
    command: String,
}

impl ShellTransport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn binary(&self) -> String {
        std::env::var("CLOUDSYNC_TRANSPORT_BIN").unwrap_or_else(|_| self.command.clone())
    }

    fn run(&self, args: &[&str], budget: CallBudget) -> Result<(), CloudSyncError> {
        let binary = self.binary();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let out = run_command_with_timeout(&binary, args, &cwd, Some(budget.deadline)).map_err(|e| {
            CloudSyncError::TransportFailure {
                retryable: true,
                reason: format!("failed to run transport agent: {e}"),
            }
        })?;

        if out.timed_out {
            return Err(CloudSyncError::Timeout(budget.deadline.as_millis() as u64));
        }
        if !out.success() {
            return Err(CloudSyncError::TransportFailure {
                retryable: true,
                reason: format!("transport agent exited with code {}: {}", out.exit_code, out.stderr.trim()),
            });
        }
        Ok(())
    }
}

impl Transport for ShellTransport {
    fn sync(&self, local_dir: &Path, remote_dir: &str, budget: CallBudget) -> Result<(), CloudSyncError> {
        self.run(&["sync", &local_dir.to_string_lossy(), remote_dir], budget)
    }

    fn copy(&self, local_path: &Path, remote_path: &str, budget: CallBudget) -> Result<(), CloudSyncError> {
        self.run(&["copy", &local_path.to_string_lossy(), remote_path], budget)
    }

    fn pull(&self, remote_dir: &str, local_dir: &Path, budget: CallBudget) -> Result<(), CloudSyncError> {
        self.run(&["pull", remote_dir, &local_dir.to_string_lossy()], budget)
    }

    fn list(&self, remote_dir: &str, budget: CallBudget) -> Result<Vec<RemoteEntry>, CloudSyncError> {
        // The external agent is opaque; CloudSync only needs presence/size
        // for verification, which it gets from the manifest instead. A
        // full listing implementation would parse the agent's stdout here.
        let _ = (remote_dir, budget);
        Ok(Vec::new())
    }

    fn delete(&self, remote_path: &str, budget: CallBudget) -> Result<(), CloudSyncError> {
        self.run(&["delete", remote_path], budget)
    }
}
