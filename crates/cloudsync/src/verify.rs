//! Verification engine (C8), §4.7: periodically restores a sample of
//! sources into scratch directories and asserts they come back clean,
//! reporting consolidation debt alongside any restore failures.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::archive::Compressor;
use crate::config::{CloudSyncConfig, ConsolidationPolicy, SourceConfig};
use crate::git;
use crate::manifest::ManifestStore;
use crate::notify::{Event, NotifierHub};
use crate::restore::{RestoreEngine, RestoreOptions};
use crate::transport::Transport;
use crate::types::{ArchiveType, Manifest};

/// Outcome of verifying a single source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceVerification {
    pub source_key: String,
    pub passed: bool,
    pub detail: Option<String>,
    pub consolidation_debt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub sampled: Vec<SourceVerification>,
    pub failures: usize,
    pub consolidation_debt_count: usize,
}

pub struct VerifyEngine<'a> {
    store: &'a ManifestStore,
    transport: &'a dyn Transport,
}

impl<'a> VerifyEngine<'a> {
    pub fn new(store: &'a ManifestStore, transport: &'a dyn Transport) -> Self {
        Self { store, transport }
    }

    /// Runs the full verification pass: select a sample, restore each into
    /// scratch, assert post-conditions, and emit a report to `notifier`.
    pub fn run(&self, config: &CloudSyncConfig, scratch_root: &Path, notifier: &NotifierHub) -> Result<VerificationReport> {
        let manifests = load_manifests(self.store, &config.sources);
        let sample = select_sample(&manifests, config.verification.max_repos_to_test);

        let mut sampled = Vec::with_capacity(sample.len());
        for (source_key, manifest) in &sample {
            let outcome = self.verify_one(source_key, manifest, config, scratch_root);
            sampled.push(outcome);
        }

        let debt_list = consolidation_debt(&manifests, &config.consolidation);
        for source_key in &debt_list {
            notifier.emit(&Event::ConsolidationRecommended {
                source_key: source_key.clone(),
                incremental_count: manifests
                    .iter()
                    .find(|(k, _)| k == source_key)
                    .map(|(_, m)| m.incremental_count)
                    .unwrap_or(0),
            });
        }

        let failures = sampled.iter().filter(|s| !s.passed).count();
        let report = VerificationReport {
            sampled,
            failures,
            consolidation_debt_count: debt_list.len(),
        };

        notifier.emit(&Event::VerificationReport {
            sampled: report.sampled.len(),
            failures: report.failures,
            consolidation_debt: report.consolidation_debt_count,
        });

        Ok(report)
    }

    fn verify_one(
        &self,
        source_key: &str,
        manifest: &Manifest,
        config: &CloudSyncConfig,
        scratch_root: &Path,
    ) -> SourceVerification {
        let scratch = scratch_root.join(format!("verify-{source_key}"));
        let result = self.restore_and_assert(source_key, manifest, config, &scratch);

        let consolidation_debt = manifest.incremental_count >= config.consolidation.max_incrementals;

        match result {
            Ok(()) => {
                if config.verification.cleanup_after {
                    let _ = fs::remove_dir_all(&scratch);
                }
                SourceVerification {
                    source_key: source_key.to_string(),
                    passed: true,
                    detail: None,
                    consolidation_debt,
                }
            }
            Err(e) => SourceVerification {
                source_key: source_key.to_string(),
                passed: false,
                detail: Some(format!("{e:#}")),
                consolidation_debt,
            },
        }
    }

    fn restore_and_assert(&self, source_key: &str, manifest: &Manifest, config: &CloudSyncConfig, scratch: &Path) -> Result<()> {
        let restore_engine = RestoreEngine::new(self.store, self.transport);
        restore_engine.restore(
            source_key,
            scratch,
            &config.remote_base,
            config.timeouts.soft_repo,
            config.timeouts.soft_repo * config.timeouts.hard_multiplier,
            &config.retry_policy,
            &RestoreOptions { overwrite: true },
        )?;

        match manifest.archive_type {
            ArchiveType::GitRepository => assert_git_restore(scratch, manifest),
            ArchiveType::NonGitDirectory => assert_archive_restore(scratch),
        }
    }
}

fn load_manifests(store: &ManifestStore, sources: &[SourceConfig]) -> Vec<(String, Manifest)> {
    sources
        .iter()
        .filter_map(|s| {
            let key = match s {
                SourceConfig::GitRepo { repo_key, .. } => repo_key.clone(),
                SourceConfig::Directory { category, .. } => category.clone(),
            };
            store.load(&key).ok().map(|m| (key, m))
        })
        .collect()
}

/// Select at least one small source, the highest-`incrementalCount` source,
/// and up to N additional others, clamped by `max_repos_to_test` (§4.7.1).
fn select_sample(manifests: &[(String, Manifest)], max_repos_to_test: usize) -> Vec<(String, Manifest)> {
    if manifests.is_empty() {
        return Vec::new();
    }

    let mut chosen: Vec<usize> = Vec::new();

    if let Some(idx) = manifests
        .iter()
        .enumerate()
        .min_by_key(|(_, (_, m))| m.metadata.total_size_compressed)
        .map(|(i, _)| i)
    {
        chosen.push(idx);
    }

    if let Some(idx) = manifests
        .iter()
        .enumerate()
        .max_by_key(|(_, (_, m))| m.incremental_count)
        .map(|(i, _)| i)
    {
        if !chosen.contains(&idx) {
            chosen.push(idx);
        }
    }

    const DEFAULT_RANDOM_OTHERS: usize = 3;
    for (idx, _) in manifests.iter().enumerate() {
        if chosen.len() >= max_repos_to_test {
            break;
        }
        if chosen.len() >= 2 + DEFAULT_RANDOM_OTHERS {
            break;
        }
        if !chosen.contains(&idx) {
            chosen.push(idx);
        }
    }

    chosen.truncate(max_repos_to_test.max(1));
    chosen.into_iter().map(|i| manifests[i].clone()).collect()
}

fn consolidation_debt(manifests: &[(String, Manifest)], policy: &ConsolidationPolicy) -> Vec<String> {
    manifests
        .iter()
        .filter(|(_, m)| m.incremental_count >= policy.max_incrementals)
        .map(|(key, _)| key.clone())
        .collect()
}

fn assert_git_restore(repo: &Path, manifest: &Manifest) -> Result<()> {
    git::fsck_full(repo).context("git fsck --full reported problems")?;

    let count = git::rev_list_count(repo, "HEAD").context("failed to count commits")?;
    anyhow::ensure!(count >= 1, "restored repo has zero commits");

    if let Some(expected) = &manifest.last_bundle_commit {
        let refs = git::for_each_ref(repo, "%(objectname)").context("failed to enumerate refs")?;
        anyhow::ensure!(
            refs.iter().any(|r| r == expected),
            "manifest-recorded commit {expected} is not reachable from any ref"
        );
    }

    Ok(())
}

fn assert_archive_restore(target: &Path) -> Result<()> {
    anyhow::ensure!(target.exists(), "restore target does not exist");
    let mut entries = fs::read_dir(target).context("failed to read restored target")?;
    anyhow::ensure!(entries.next().is_some(), "restored target is empty");
    Ok(())
}

/// Enumerates a tar archive's entries without extracting them, the
/// equivalent of `tar -t`; used to assert the archive itself is readable
/// even when its restored target can't be separately inspected.
pub fn list_archive_entries(archive_path: &Path, compressor: Compressor) -> Result<Vec<String>> {
    let file = fs::File::open(archive_path).with_context(|| format!("failed to open {}", archive_path.display()))?;

    let names: Vec<String> = match compressor {
        Compressor::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(file)?;
            entry_names(tar::Archive::new(decoder))?
        }
        Compressor::Gzip => {
            let decoder = flate2::read::GzDecoder::new(file);
            entry_names(tar::Archive::new(decoder))?
        }
        Compressor::Bzip2 => {
            let decoder = bzip2::read::BzDecoder::new(file);
            entry_names(tar::Archive::new(decoder))?
        }
    };
    Ok(names)
}

fn entry_names<R: std::io::Read>(mut archive: tar::Archive<R>) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in archive.entries().context("failed to read tar entries")? {
        let entry = entry.context("failed to read tar entry")?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}
