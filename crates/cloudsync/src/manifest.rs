//! Manifest persistence (C2): locating, loading, validating, and atomically
//! replacing the per-source JSON manifest described in §6.2, plus a
//! single-writer lock layered on top of `cloudsync-lock`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use cloudsync_lock::LockFile;

use crate::error::CloudSyncError;
use crate::types::{Manifest, Source};

const MANIFEST_FILENAME: &str = "manifest.json";
const LOCK_FILENAME: &str = "manifest.lock";

/// Where a source's manifest and its bundles live, rooted at the configured
/// `bundle_root` joined with the source's key (§6.1).
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(bundle_root: impl Into<PathBuf>) -> Self {
        Self {
            root: bundle_root.into(),
        }
    }

    pub fn source_dir(&self, source_key: &str) -> PathBuf {
        self.root.join(source_key)
    }

    fn manifest_path(&self, source_key: &str) -> PathBuf {
        self.source_dir(source_key).join(MANIFEST_FILENAME)
    }

    fn lock_path(&self, source_key: &str) -> PathBuf {
        self.source_dir(source_key).join(LOCK_FILENAME)
    }

    /// Load the manifest for `source_key`, creating a fresh empty one if
    /// none exists yet (the "first run for this source" case, §4.3).
    pub fn load_or_create(&self, source: &Source, hostname: &str) -> Result<Manifest, CloudSyncError> {
        let path = self.manifest_path(source.key());
        if !path.exists() {
            return Ok(Manifest::new(source, hostname.to_string()));
        }
        self.load(source.key())
    }

    /// Load an existing manifest, failing if absent or unparseable.
    pub fn load(&self, source_key: &str) -> Result<Manifest, CloudSyncError> {
        let path = self.manifest_path(source_key);
        if !path.exists() {
            return Err(CloudSyncError::ManifestMissing(source_key.to_string()));
        }
        let content = fs::read_to_string(&path).map_err(|e| CloudSyncError::ManifestCorrupt {
            source_key: source_key.to_string(),
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let manifest: Manifest =
            serde_json::from_str(&content).map_err(|e| CloudSyncError::ManifestCorrupt {
                source_key: source_key.to_string(),
                reason: format!("invalid JSON: {e}"),
            })?;
        manifest
            .check_invariants()
            .map_err(|reason| CloudSyncError::ManifestCorrupt {
                source_key: source_key.to_string(),
                reason,
            })?;
        Ok(manifest)
    }

    /// Atomically replace the manifest for `source_key`: write to a sibling
    /// temp file, fsync, then rename over the target. A reader never
    /// observes a partially-written manifest.
    pub fn persist(&self, source_key: &str, manifest: &Manifest) -> Result<(), CloudSyncError> {
        let dir = self.source_dir(source_key);
        fs::create_dir_all(&dir).map_err(|e| CloudSyncError::ManifestCorrupt {
            source_key: source_key.to_string(),
            reason: format!("failed to create {}: {e}", dir.display()),
        })?;

        let path = self.manifest_path(source_key);
        let tmp_path = dir.join(format!("{MANIFEST_FILENAME}.tmp"));
        let json = serde_json::to_string_pretty(manifest).map_err(|e| CloudSyncError::ManifestCorrupt {
            source_key: source_key.to_string(),
            reason: format!("failed to serialize manifest: {e}"),
        })?;

        {
            let mut tmp = File::create(&tmp_path).map_err(|e| CloudSyncError::ManifestCorrupt {
                source_key: source_key.to_string(),
                reason: format!("failed to create {}: {e}", tmp_path.display()),
            })?;
            tmp.write_all(json.as_bytes())
                .map_err(|e| CloudSyncError::ManifestCorrupt {
                    source_key: source_key.to_string(),
                    reason: e.to_string(),
                })?;
            tmp.sync_all().map_err(|e| CloudSyncError::ManifestCorrupt {
                source_key: source_key.to_string(),
                reason: e.to_string(),
            })?;
        }

        fs::rename(&tmp_path, &path).map_err(|e| CloudSyncError::ManifestCorrupt {
            source_key: source_key.to_string(),
            reason: format!("failed to rename manifest into place: {e}"),
        })
    }

    /// Acquire the single-writer lock for `source_key`. Held across an
    /// entire engine run (§4.6): create/append a bundle, persist the
    /// manifest, sync to the transport, then release.
    pub fn lock(&self, source_key: &str, timeout: Duration) -> Result<ManifestLock, CloudSyncError> {
        let path = self.lock_path(source_key);
        let file = LockFile::acquire(
            &path,
            &format!("manifest:{source_key}"),
            ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::hours(1)),
        )
        .map_err(|_| CloudSyncError::ManifestLocked {
            source_key: source_key.to_string(),
            waited_ms: 0,
        })?;
        Ok(ManifestLock { _file: file })
    }
}

/// RAII guard for the manifest lock. Dropping releases it.
pub struct ManifestLock {
    _file: LockFile,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf as StdPathBuf;
    use tempfile::tempdir;

    fn git_source(key: &str) -> Source {
        Source::GitRepo {
            absolute_path: StdPathBuf::from(format!("/tmp/{key}")),
            repo_key: key.to_string(),
        }
    }

    #[test]
    fn load_or_create_returns_fresh_manifest_when_absent() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let manifest = store.load_or_create(&git_source("repo-a"), "host").unwrap();
        assert!(manifest.bundles.is_empty());
    }

    #[test]
    fn persist_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let manifest = store.load_or_create(&git_source("repo-a"), "host").unwrap();
        store.persist("repo-a", &manifest).unwrap();

        let loaded = store.load("repo-a").unwrap();
        assert_eq!(loaded.source_path, manifest.source_path);
    }

    #[test]
    fn load_missing_manifest_errors() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let err = store.load("nonexistent").unwrap_err();
        assert!(matches!(err, CloudSyncError::ManifestMissing(_)));
    }

    #[test]
    fn load_corrupt_json_errors() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let source_dir = store.source_dir("repo-a");
        fs::create_dir_all(&source_dir).unwrap();
        fs::write(source_dir.join(MANIFEST_FILENAME), b"not json").unwrap();

        let err = store.load("repo-a").unwrap_err();
        assert!(matches!(err, CloudSyncError::ManifestCorrupt { .. }));
    }

    #[test]
    fn load_manifest_violating_invariants_errors() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let source_dir = store.source_dir("repo-a");
        fs::create_dir_all(&source_dir).unwrap();
        // First bundle is incremental, which violates check_invariants().
        let json = r#"{
            "sourcePath": "/tmp/repo-a",
            "hostname": "host",
            "archiveType": "git-repository",
            "createdAt": "2024-01-01T00:00:00Z",
            "lastUpdatedAt": "2024-01-01T00:00:00Z",
            "bundles": [{
                "type": "incremental",
                "filename": "inc.bundle",
                "createdAt": "2024-01-01T00:00:00Z",
                "sizeBytes": 10,
                "checksum": "sha256:abc",
                "parentFilename": "full.bundle"
            }]
        }"#;
        fs::write(source_dir.join(MANIFEST_FILENAME), json).unwrap();

        let err = store.load("repo-a").unwrap_err();
        assert!(matches!(err, CloudSyncError::ManifestCorrupt { .. }));
    }

    #[test]
    fn lock_prevents_concurrent_acquisition() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let _first = store.lock("repo-a", Duration::from_secs(3600)).unwrap();
        let second = store.lock("repo-a", Duration::from_secs(3600));
        assert!(second.is_err());
    }

    #[test]
    fn lock_released_on_drop_allows_reacquire() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        {
            let _lock = store.lock("repo-a", Duration::from_secs(3600)).unwrap();
        }
        let second = store.lock("repo-a", Duration::from_secs(3600));
        assert!(second.is_ok());
    }
}
