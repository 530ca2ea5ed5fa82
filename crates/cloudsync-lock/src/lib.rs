//! Advisory lock files used to serialize access to a shared directory
//! across processes.
//!
//! CloudSync uses this in two places: the supervisor's cross-process mutex
//! over the whole bundle root (only one supervisor instance may run against
//! a given root at a time), and the manifest store's per-manifest lock
//! (single writer, multiple readers). Both are the same primitive — a JSON
//! sidecar file recording who holds the lock and when they took it, with a
//! timeout past which a holder is presumed dead and the lock reclaimed.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gethostname::gethostname;
use serde::{Deserialize, Serialize};

/// Who holds a lock, and since when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    /// Free-form label identifying what the lock guards (e.g. a source key,
    /// or "supervisor" for the bundle-root-wide mutex).
    pub label: String,
}

impl LockInfo {
    fn current(label: &str) -> Self {
        Self {
            pid: std::process::id(),
            hostname: gethostname().to_string_lossy().into_owned(),
            acquired_at: Utc::now(),
            label: label.to_string(),
        }
    }
}

/// A held advisory lock, backed by a JSON file at `path`.
///
/// Dropping the value releases the lock (best-effort; errors during
/// release are ignored since there is no caller left to report them to).
pub struct LockFile {
    path: PathBuf,
    #[allow(dead_code)]
    file: File,
}

impl LockFile {
    /// Attempt to acquire the lock immediately. If an existing lock file is
    /// present but older than `timeout`, it is treated as stale (its holder
    /// presumably crashed) and reclaimed.
    pub fn acquire(path: &Path, label: &str, timeout: ChronoDuration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock dir {}", parent.display()))?;
        }

        if path.exists() {
            match read_lock_info(path) {
                Ok(info) => {
                    let age = Utc::now().signed_duration_since(info.acquired_at);
                    if age < timeout {
                        bail!(
                            "lock {} held by pid {} on {} since {} (age {}s < timeout {}s)",
                            path.display(),
                            info.pid,
                            info.hostname,
                            info.acquired_at,
                            age.num_seconds(),
                            timeout.num_seconds()
                        );
                    }
                    // Stale: holder exceeded the timeout. Remove and proceed.
                    let _ = fs::remove_file(path);
                }
                Err(_) => {
                    // Unreadable/corrupt lock file: treat as stale.
                    let _ = fs::remove_file(path);
                }
            }
        }

        let info = LockInfo::current(label);
        write_lock_info(path, &info)?;

        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Poll-acquire, retrying until `wait` elapses.
    pub fn acquire_with_wait(
        path: &Path,
        label: &str,
        stale_timeout: ChronoDuration,
        wait: std::time::Duration,
    ) -> Result<Self> {
        let deadline = std::time::Instant::now() + wait;
        loop {
            match Self::acquire(path, label, stale_timeout) {
                Ok(lock) => return Ok(lock),
                Err(e) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(e);
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
            }
        }
    }

    /// Release the lock, removing the sidecar file.
    pub fn release(self) -> Result<()> {
        fs::remove_file(&self.path)
            .with_context(|| format!("failed to remove lock file {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Read the current holder of a lock file without acquiring it.
pub fn read_lock_info(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock file {}", path.display()))
}

/// Whether a lock file currently exists and is not stale.
pub fn is_locked(path: &Path, timeout: ChronoDuration) -> bool {
    match read_lock_info(path) {
        Ok(info) => Utc::now().signed_duration_since(info.acquired_at) < timeout,
        Err(_) => false,
    }
}

fn write_lock_info(path: &Path, info: &LockInfo) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(info).context("failed to serialize lock info")?;

    {
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        tmp.write_all(json.as_bytes())
            .context("failed to write lock file contents")?;
        tmp.sync_all().context("failed to fsync lock file")?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename lock file into place at {}", path.display()))?;

    Ok(())
}
