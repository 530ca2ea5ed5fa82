//! Core domain types: sources, manifests, bundle records, and run outcomes.
//!
//! These are plain serializable structs — the on-disk manifest format is
//! JSON (§6.2), but the types here are the typed in-memory representation
//! components operate on. Nothing in this module talks to the filesystem;
//! that is `manifest.rs`'s job.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use cloudsync_retry::{deserialize_duration, serialize_duration};

/// A named input to be backed up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    GitRepo {
        absolute_path: PathBuf,
        /// Stable relative identifier, e.g. path under the projects root.
        /// This is the primary key for all persistent state.
        repo_key: String,
    },
    Directory {
        absolute_path: PathBuf,
        category: String,
    },
}

impl Source {
    /// The primary key used to locate this source's manifest and lock.
    pub fn key(&self) -> &str {
        match self {
            Source::GitRepo { repo_key, .. } => repo_key,
            Source::Directory { category, .. } => category,
        }
    }

    pub fn absolute_path(&self) -> &std::path::Path {
        match self {
            Source::GitRepo { absolute_path, .. } => absolute_path,
            Source::Directory { absolute_path, .. } => absolute_path,
        }
    }

    pub fn archive_type(&self) -> ArchiveType {
        match self {
            Source::GitRepo { .. } => ArchiveType::GitRepository,
            Source::Directory { .. } => ArchiveType::NonGitDirectory,
        }
    }
}

/// Size classification, derived from configurable byte thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
}

impl SizeCategory {
    /// Classify a byte size against the configured small/medium thresholds.
    /// Exactly-at-threshold sizes are *not* small (first-match-wins: "small"
    /// only captures strictly-below, per §8 boundary behavior).
    pub fn classify(bytes: u64, small_threshold: u64, medium_threshold: u64) -> Self {
        if bytes < small_threshold {
            SizeCategory::Small
        } else if bytes < medium_threshold {
            SizeCategory::Medium
        } else {
            SizeCategory::Large
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleKind {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveType {
    GitRepository,
    NonGitDirectory,
}

/// A single produced artifact (git bundle or tar archive) referenced by a
/// manifest. `kind` discriminates the shape via `#[serde(tag = "type")]` to
/// match the normative JSON schema in §6.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BundleRecord {
    Full {
        filename: String,
        created_at: DateTime<Utc>,
        size_bytes: u64,
        checksum: String,
        /// HEAD commit at time of bundle (git sources only).
        #[serde(skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
        /// Number of files packed (archive sources only).
        #[serde(skip_serializing_if = "Option::is_none")]
        files_count: Option<u64>,
    },
    Incremental {
        filename: String,
        created_at: DateTime<Utc>,
        size_bytes: u64,
        checksum: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
        parent_filename: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        commit_range: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        files_count: Option<u64>,
    },
}

impl BundleRecord {
    pub fn kind(&self) -> BundleKind {
        match self {
            BundleRecord::Full { .. } => BundleKind::Full,
            BundleRecord::Incremental { .. } => BundleKind::Incremental,
        }
    }

    pub fn filename(&self) -> &str {
        match self {
            BundleRecord::Full { filename, .. } => filename,
            BundleRecord::Incremental { filename, .. } => filename,
        }
    }

    pub fn checksum(&self) -> &str {
        match self {
            BundleRecord::Full { checksum, .. } => checksum,
            BundleRecord::Incremental { checksum, .. } => checksum,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        match self {
            BundleRecord::Full { size_bytes, .. } => *size_bytes,
            BundleRecord::Incremental { size_bytes, .. } => *size_bytes,
        }
    }

    pub fn commit(&self) -> Option<&str> {
        match self {
            BundleRecord::Full { commit, .. } => commit.as_deref(),
            BundleRecord::Incremental { commit, .. } => commit.as_deref(),
        }
    }

    pub fn parent_filename(&self) -> Option<&str> {
        match self {
            BundleRecord::Full { .. } => None,
            BundleRecord::Incremental {
                parent_filename, ..
            } => Some(parent_filename),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTypeCount {
    pub extension: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMetadata {
    #[serde(default)]
    pub total_size_uncompressed: u64,
    #[serde(default)]
    pub total_size_compressed: u64,
    #[serde(default)]
    pub compression_ratio: f64,
    #[serde(default)]
    pub file_types: Vec<FileTypeCount>,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreInstructions {
    #[serde(default)]
    pub target_path: String,
    /// `bundles[].filename` in insertion order; restore plays them back in
    /// this order (full first, then each incremental).
    #[serde(default)]
    pub order: Vec<String>,
}

/// The typed, on-disk manifest for one source. See §3.1/§6.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub source_path: String,
    pub hostname: String,
    pub archive_type: ArchiveType,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub bundles: Vec<BundleRecord>,
    /// HEAD captured in the most recent bundle (git sources only).
    #[serde(default)]
    pub last_bundle_commit: Option<String>,
    #[serde(default)]
    pub incremental_count: u32,
    #[serde(default)]
    pub last_full_at: Option<DateTime<Utc>>,
    /// Fingerprint of the source tree at the last successful snapshot
    /// (archive sources only).
    #[serde(default)]
    pub last_dir_checksum: Option<String>,
    #[serde(default)]
    pub metadata: ManifestMetadata,
    #[serde(default)]
    pub restore_instructions: RestoreInstructions,
}

impl Manifest {
    pub fn new(source: &Source, hostname: String) -> Self {
        let now = Utc::now();
        Self {
            source_path: source.absolute_path().to_string_lossy().into_owned(),
            hostname,
            archive_type: source.archive_type(),
            created_at: now,
            last_updated_at: now,
            bundles: Vec::new(),
            last_bundle_commit: None,
            incremental_count: 0,
            last_full_at: None,
            last_dir_checksum: None,
            metadata: ManifestMetadata::default(),
            restore_instructions: RestoreInstructions::default(),
        }
    }

    /// Validate the invariants listed in §3.1/§8. Returns the first
    /// violation found, if any, as a human-readable description.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.bundles.is_empty() {
            return Ok(());
        }

        if self.bundles[0].kind() != BundleKind::Full {
            return Err("bundles[0] must be a full bundle".to_string());
        }

        for (i, record) in self.bundles.iter().enumerate().skip(1) {
            if record.kind() == BundleKind::Incremental {
                let expected_parent = self.bundles[i - 1].filename();
                if record.parent_filename() != Some(expected_parent) {
                    return Err(format!(
                        "bundles[{i}].parentFilename does not match bundles[{}].filename",
                        i - 1
                    ));
                }
            }
        }

        if matches!(self.archive_type, ArchiveType::GitRepository) {
            if let Some(last) = self.bundles.last() {
                if self.last_bundle_commit.as_deref() != last.commit() {
                    return Err("lastBundleCommit does not match the last bundle's commit".to_string());
                }
            }
        }

        let trailing_incrementals = self
            .bundles
            .iter()
            .rev()
            .take_while(|b| b.kind() == BundleKind::Incremental)
            .count() as u32;
        if self.incremental_count != trailing_incrementals {
            return Err(format!(
                "incrementalCount {} does not match trailing incremental count {}",
                self.incremental_count, trailing_incrementals
            ));
        }

        Ok(())
    }

    pub fn push_bundle(&mut self, record: BundleRecord) {
        let is_full = record.kind() == BundleKind::Full;
        self.restore_instructions.order.push(record.filename().to_string());
        if is_full {
            self.incremental_count = 0;
            self.last_full_at = Some(Utc::now());
        } else {
            self.incremental_count += 1;
        }
        if let Some(commit) = record.commit() {
            self.last_bundle_commit = Some(commit.to_string());
        }
        self.bundles.push(record);
        self.last_updated_at = Utc::now();
    }
}

/// Outcome of a single engine run, appended to the run log (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    SkippedNoChange,
    Full,
    Incremental,
    Consolidated,
    Failed,
    EmptySource,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub source_key: String,
    pub outcome: RunOutcome,
    pub duration_ms: u64,
    pub bytes_produced: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_record(filename: &str) -> BundleRecord {
        BundleRecord::Full {
            filename: filename.to_string(),
            created_at: Utc::now(),
            size_bytes: 100,
            checksum: "sha256:abc".to_string(),
            commit: Some("deadbeef".to_string()),
            files_count: None,
        }
    }

    fn incremental_record(filename: &str, parent: &str, commit: &str) -> BundleRecord {
        BundleRecord::Incremental {
            filename: filename.to_string(),
            created_at: Utc::now(),
            size_bytes: 50,
            checksum: "sha256:def".to_string(),
            commit: Some(commit.to_string()),
            parent_filename: parent.to_string(),
            commit_range: None,
            files_count: None,
        }
    }

    #[test]
    fn size_category_boundary_is_not_small() {
        // §8: "Repo exactly at smallMiB threshold -> treated as non-small."
        assert_eq!(SizeCategory::classify(100, 100, 500), SizeCategory::Medium);
        assert_eq!(SizeCategory::classify(99, 100, 500), SizeCategory::Small);
        assert_eq!(SizeCategory::classify(500, 100, 500), SizeCategory::Large);
    }

    #[test]
    fn empty_manifest_satisfies_invariants() {
        let manifest = Manifest::new(
            &Source::GitRepo {
                absolute_path: PathBuf::from("/tmp/repo"),
                repo_key: "repo".to_string(),
            },
            "host".to_string(),
        );
        assert!(manifest.check_invariants().is_ok());
    }

    #[test]
    fn first_bundle_must_be_full() {
        let mut manifest = Manifest::new(
            &Source::GitRepo {
                absolute_path: PathBuf::from("/tmp/repo"),
                repo_key: "repo".to_string(),
            },
            "host".to_string(),
        );
        manifest.bundles.push(incremental_record("a.bundle", "full.bundle", "c1"));
        assert!(manifest.check_invariants().is_err());
    }

    #[test]
    fn incremental_chain_parent_must_match() {
        let mut manifest = Manifest::new(
            &Source::GitRepo {
                absolute_path: PathBuf::from("/tmp/repo"),
                repo_key: "repo".to_string(),
            },
            "host".to_string(),
        );
        manifest.push_bundle(full_record("full.bundle"));
        manifest.push_bundle(incremental_record("inc-1.bundle", "full.bundle", "c2"));
        assert!(manifest.check_invariants().is_ok());

        // Corrupt: wrong parent.
        manifest.bundles.push(incremental_record("inc-2.bundle", "wrong.bundle", "c3"));
        assert!(manifest.check_invariants().is_err());
    }

    #[test]
    fn incremental_count_resets_on_full_and_increments_on_incremental() {
        let mut manifest = Manifest::new(
            &Source::GitRepo {
                absolute_path: PathBuf::from("/tmp/repo"),
                repo_key: "repo".to_string(),
            },
            "host".to_string(),
        );
        manifest.push_bundle(full_record("full.bundle"));
        assert_eq!(manifest.incremental_count, 0);
        manifest.push_bundle(incremental_record("inc-1.bundle", "full.bundle", "c2"));
        assert_eq!(manifest.incremental_count, 1);
        manifest.push_bundle(incremental_record("inc-2.bundle", "inc-1.bundle", "c3"));
        assert_eq!(manifest.incremental_count, 2);
        manifest.push_bundle(full_record("full-2.bundle"));
        assert_eq!(manifest.incremental_count, 0);
    }

    #[test]
    fn last_bundle_commit_tracks_latest_bundle() {
        let mut manifest = Manifest::new(
            &Source::GitRepo {
                absolute_path: PathBuf::from("/tmp/repo"),
                repo_key: "repo".to_string(),
            },
            "host".to_string(),
        );
        manifest.push_bundle(full_record("full.bundle"));
        assert_eq!(manifest.last_bundle_commit.as_deref(), Some("deadbeef"));
        manifest.push_bundle(incremental_record("inc-1.bundle", "full.bundle", "c2"));
        assert_eq!(manifest.last_bundle_commit.as_deref(), Some("c2"));
    }

    #[test]
    fn manifest_json_roundtrip_matches_schema_shape() {
        let mut manifest = Manifest::new(
            &Source::GitRepo {
                absolute_path: PathBuf::from("/tmp/repo"),
                repo_key: "repo".to_string(),
            },
            "host".to_string(),
        );
        manifest.push_bundle(full_record("full.bundle"));
        let json = serde_json::to_string_pretty(&manifest).unwrap();
        assert!(json.contains("\"archiveType\""));
        assert!(json.contains("\"sourcePath\""));
        let parsed: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.bundles.len(), 1);
        assert_eq!(parsed.bundles[0].filename(), "full.bundle");
    }

    #[test]
    fn unknown_fields_are_tolerated_on_read() {
        let json = r#"{
            "sourcePath": "/tmp/repo",
            "hostname": "host",
            "archiveType": "git-repository",
            "createdAt": "2024-01-01T00:00:00Z",
            "lastUpdatedAt": "2024-01-01T00:00:00Z",
            "bundles": [],
            "someFutureField": 42
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.hostname, "host");
    }
}
