//! Property-based tests for manifest invariants (§3.1/§8).
//!
//! These exercise the quantified properties across arbitrary bundle chains
//! rather than the fixed examples the unit tests in each module cover:
//! - `Manifest::push_bundle` keeps `incrementalCount` equal to the trailing
//!   run of incremental records, for any sequence of full/incremental pushes.
//! - `check_invariants` accepts every chain `push_bundle` can produce.
//! - Manifests round-trip through JSON without losing the chain shape.

#[cfg(test)]
mod tests {
    use crate::types::{ArchiveType, BundleRecord, Manifest, Source};
    use chrono::Utc;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn git_source() -> Source {
        Source::GitRepo {
            absolute_path: PathBuf::from("/tmp/repo"),
            repo_key: "repo".to_string(),
        }
    }

    fn full_record(filename: &str) -> BundleRecord {
        BundleRecord::Full {
            filename: filename.to_string(),
            created_at: Utc::now(),
            size_bytes: 100,
            checksum: "sha256:deadbeef".to_string(),
            commit: Some(format!("commit-{filename}")),
            files_count: None,
        }
    }

    fn incremental_record(filename: &str, parent: &str) -> BundleRecord {
        BundleRecord::Incremental {
            filename: filename.to_string(),
            created_at: Utc::now(),
            size_bytes: 10,
            checksum: "sha256:cafebabe".to_string(),
            commit: Some(format!("commit-{filename}")),
            parent_filename: parent.to_string(),
            commit_range: None,
            files_count: None,
        }
    }

    /// `true` means push a full bundle, `false` an incremental one chained
    /// off the previous bundle. The first push is always forced to `true`
    /// since a chain cannot open on an incremental record.
    fn chain_strategy() -> impl Strategy<Value = Vec<bool>> {
        prop::collection::vec(any::<bool>(), 0..20)
    }

    proptest! {
        #[test]
        fn incremental_count_matches_trailing_run(kinds in chain_strategy()) {
            let mut manifest = Manifest::new(&git_source(), "host".to_string());
            let mut last_filename = String::new();
            let mut trailing = 0u32;

            for (i, is_full) in kinds.iter().enumerate() {
                let filename = format!("bundle-{i}.bundle");
                if *is_full || last_filename.is_empty() {
                    manifest.push_bundle(full_record(&filename));
                    trailing = 0;
                } else {
                    manifest.push_bundle(incremental_record(&filename, &last_filename));
                    trailing += 1;
                }
                last_filename = filename;
            }

            prop_assert_eq!(manifest.incremental_count, trailing);
            prop_assert!(manifest.check_invariants().is_ok());
        }

        #[test]
        fn manifest_roundtrips_through_json(kinds in chain_strategy()) {
            let mut manifest = Manifest::new(&git_source(), "host".to_string());
            let mut last_filename = String::new();

            for (i, is_full) in kinds.iter().enumerate() {
                let filename = format!("bundle-{i}.bundle");
                if *is_full || last_filename.is_empty() {
                    manifest.push_bundle(full_record(&filename));
                } else {
                    manifest.push_bundle(incremental_record(&filename, &last_filename));
                }
                last_filename = filename;
            }

            let json = serde_json::to_string(&manifest).unwrap();
            let parsed: Manifest = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(parsed.bundles.len(), manifest.bundles.len());
            prop_assert_eq!(parsed.incremental_count, manifest.incremental_count);
            prop_assert_eq!(parsed.archive_type, ArchiveType::GitRepository);
        }
    }
}
