//! Health surface (C9): a read-only view assembled on demand from the
//! manifest store, the run log, and each source's configuration — no live
//! filesystem scanning of source trees (§4.8). Struct shapes follow the
//! plain-data style of `types.rs` rather than a dedicated engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{CloudSyncConfig, ConsolidationPolicy, SourceConfig};
use crate::manifest::ManifestStore;
use crate::notify::RunLog;
use crate::types::{Manifest, RunOutcome, SizeCategory};

const SMALL_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;
const MEDIUM_THRESHOLD_BYTES: u64 = 500 * 1024 * 1024;

/// Per-source rollup: the last known state of one configured source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceHealth {
    pub source_key: String,
    pub category: SizeCategory,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<RunOutcome>,
    pub incremental_count: u32,
    pub consolidation_due: bool,
    pub last_bundle_commit: Option<String>,
    pub total_size_compressed: u64,
    /// Set when the manifest couldn't be loaded at all (corrupt or missing
    /// after at least one recorded run) — distinct from "never run".
    pub manifest_error: Option<String>,
}

/// Crate-wide rollup across every configured source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateHealth {
    pub sources_total: usize,
    pub sources_healthy: usize,
    pub sources_failing: usize,
    pub sources_consolidation_due: usize,
    pub sources_never_run: usize,
}

/// Liveness: whether the supervisor looks like it's actually running —
/// derived from whether any run has landed in the log recently enough to
/// match the configured cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessHealth {
    pub most_recent_run_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub generated_at: DateTime<Utc>,
    pub sources: Vec<SourceHealth>,
    pub aggregate: AggregateHealth,
    pub liveness: LivenessHealth,
}

/// Builds a `HealthSnapshot` from on-disk state only — manifests and the
/// run log — never touching the source trees themselves.
pub struct HealthReport<'a> {
    store: &'a ManifestStore,
    run_log: &'a RunLog,
    config: &'a CloudSyncConfig,
}

impl<'a> HealthReport<'a> {
    pub fn new(store: &'a ManifestStore, run_log: &'a RunLog, config: &'a CloudSyncConfig) -> Self {
        Self { store, run_log, config }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> HealthSnapshot {
        let latest_runs = self.run_log.latest_per_source().unwrap_or_default();

        let mut sources = Vec::with_capacity(self.config.sources.len());
        let mut most_recent_run_at: Option<DateTime<Utc>> = None;

        for source in &self.config.sources {
            let source_key = source_key(source);
            let last_run = latest_runs.get(&source_key);
            if let Some(run) = last_run {
                most_recent_run_at = Some(match most_recent_run_at {
                    Some(current) if current >= run.timestamp => current,
                    _ => run.timestamp,
                });
            }

            let manifest = self.store.load(&source_key).ok();
            sources.push(source_health(
                &source_key,
                manifest.as_ref(),
                last_run.map(|r| (r.timestamp, r.outcome)),
                &self.config.consolidation,
            ));
        }

        let aggregate = aggregate_health(&sources);
        let liveness = liveness_health(most_recent_run_at, now, &self.config.cadences.default_interval);

        HealthSnapshot {
            generated_at: now,
            sources,
            aggregate,
            liveness,
        }
    }
}

fn source_key(source: &SourceConfig) -> String {
    match source {
        SourceConfig::GitRepo { repo_key, .. } => repo_key.clone(),
        SourceConfig::Directory { category, .. } => category.clone(),
    }
}

fn source_health(
    source_key: &str,
    manifest: Option<&Manifest>,
    last_run: Option<(DateTime<Utc>, RunOutcome)>,
    consolidation: &ConsolidationPolicy,
) -> SourceHealth {
    let (total_size_compressed, incremental_count, last_bundle_commit, consolidation_due) = match manifest {
        Some(m) => (
            m.metadata.total_size_compressed,
            m.incremental_count,
            m.last_bundle_commit.clone(),
            is_consolidation_due(m, consolidation),
        ),
        None => (0, 0, None, false),
    };

    let category = SizeCategory::classify(total_size_compressed, SMALL_THRESHOLD_BYTES, MEDIUM_THRESHOLD_BYTES);

    let manifest_error = match (manifest, &last_run) {
        (None, Some(_)) => Some("manifest missing or unreadable despite recorded runs".to_string()),
        _ => None,
    };

    SourceHealth {
        source_key: source_key.to_string(),
        category,
        last_run_at: last_run.as_ref().map(|(ts, _)| *ts),
        last_outcome: last_run.map(|(_, outcome)| outcome),
        incremental_count,
        consolidation_due,
        last_bundle_commit,
        total_size_compressed,
        manifest_error,
    }
}

fn is_consolidation_due(manifest: &Manifest, policy: &ConsolidationPolicy) -> bool {
    if manifest.incremental_count >= policy.max_incrementals {
        return true;
    }
    match manifest.last_full_at {
        Some(last_full) => {
            let age = Utc::now().signed_duration_since(last_full);
            age.num_days() >= policy.age_days as i64
        }
        None => false,
    }
}

fn aggregate_health(sources: &[SourceHealth]) -> AggregateHealth {
    let sources_total = sources.len();
    let sources_never_run = sources.iter().filter(|s| s.last_run_at.is_none()).count();
    let sources_failing = sources
        .iter()
        .filter(|s| matches!(s.last_outcome, Some(RunOutcome::Failed)) || s.manifest_error.is_some())
        .count();
    let sources_consolidation_due = sources.iter().filter(|s| s.consolidation_due).count();
    let sources_healthy = sources_total.saturating_sub(sources_failing).saturating_sub(sources_never_run);

    AggregateHealth {
        sources_total,
        sources_healthy,
        sources_failing,
        sources_consolidation_due,
        sources_never_run,
    }
}

fn liveness_health(
    most_recent_run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    default_interval: &std::time::Duration,
) -> LivenessHealth {
    let stale_after = chrono::Duration::from_std(*default_interval * 2).unwrap_or(chrono::Duration::days(2));
    let stale = match most_recent_run_at {
        Some(ts) => now.signed_duration_since(ts) > stale_after,
        None => true,
    };

    LivenessHealth { most_recent_run_at, stale }
}
