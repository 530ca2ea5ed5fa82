//! Scheduler/Supervisor (C7, §4.5): invokes the bundle/archive engines on
//! cadence, serializes per-source runs, caps disjoint runs at a configurable
//! parallelism ceiling, and holds a cross-process mutex over the bundle
//! root so a second supervisor instance never races the same area.
//!
//! Concurrency model is grounded on the teacher's chunked worker-pool loop
//! (`engine_parallel.rs::run_publish_level`): due sources are batched into
//! `parallelism`-sized groups and run on plain `std::thread` workers. Unlike
//! the teacher, a run is also bounded by a soft/hard timeout pair (§4.5):
//! the dispatcher waits on an `mpsc` channel rather than joining directly,
//! so a run that blows through its hard timeout is recorded as `Failed`
//! and abandoned instead of blocking the tick indefinitely. Safe Rust gives
//! no way to kill a thread outright; an abandoned worker keeps running to
//! completion in the background and its eventual result is simply dropped.

use std::collections::{HashSet, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use cloudsync_lock::LockFile;

use crate::archive::{ArchiveConfig, ArchiveEngine, Compressor};
use crate::config::{CloudSyncConfig, SourceConfig};
use crate::error::CloudSyncError;
use crate::git_bundle::{BundleConfig, BundleEngine};
use crate::manifest::ManifestStore;
use crate::notify::{Event, NotifierHub, RunLog};
use crate::transport::Transport;
use crate::types::{RunOutcome, RunRecord, Source};

/// Filename of the cross-process mutex under the bundle root. Public so the
/// CLI's `lock status`/`lock break` operator escape hatch can find the same
/// file a running supervisor holds without duplicating the path logic.
pub const LOCK_FILENAME: &str = ".cloudsync-supervisor.lock";

/// Transport call budget for runs dispatched by the supervisor. Distinct
/// from the soft/hard engine-run timeout: this only bounds a single
/// Transport.* call within a run, not the run as a whole.
const TRANSPORT_BUDGET: Duration = Duration::from_secs(300);

fn source_config_key(src: &SourceConfig) -> String {
    match src {
        SourceConfig::GitRepo { repo_key, .. } => repo_key.clone(),
        SourceConfig::Directory { category, .. } => category.clone(),
    }
}

fn source_from_config(src: &SourceConfig) -> Source {
    match src {
        SourceConfig::GitRepo { path, repo_key } => Source::GitRepo {
            absolute_path: path.clone(),
            repo_key: repo_key.clone(),
        },
        SourceConfig::Directory { path, category } => Source::Directory {
            absolute_path: path.clone(),
            category: category.clone(),
        },
    }
}

/// A due (source, outcome) pair, computed by one dispatched worker thread.
struct Dispatched {
    source_key: String,
    record: Result<RunRecord>,
}

/// Long-running scheduler. Owns its dependencies so it can be handed to a
/// background thread (the CLI's `supervisor run`) without a borrow.
pub struct Supervisor {
    config: Arc<CloudSyncConfig>,
    store: Arc<ManifestStore>,
    transport: Arc<dyn Transport>,
    notifier: Arc<NotifierHub>,
    run_log: Arc<RunLog>,
    hostname: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Supervisor {
    pub fn new(
        config: Arc<CloudSyncConfig>,
        store: Arc<ManifestStore>,
        transport: Arc<dyn Transport>,
        notifier: Arc<NotifierHub>,
        run_log: Arc<RunLog>,
        hostname: String,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            notifier,
            run_log,
            hostname,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Acquire the cross-process mutex, run an immediate catch-up pass, then
    /// loop on `poll_interval` until `should_stop` returns `true`. Releases
    /// the mutex (via `LockFile`'s `Drop`) on any exit path.
    pub fn run(&self, poll_interval: Duration, should_stop: &dyn Fn() -> bool) -> Result<()> {
        let lock_path = self.config.bundle_root.join(LOCK_FILENAME);
        let stale_timeout = ChronoDuration::from_std(
            self.config.timeouts.soft_repo * self.config.timeouts.hard_multiplier,
        )
        .unwrap_or_else(|_| ChronoDuration::hours(2));

        let _lock = LockFile::acquire_with_wait(
            &lock_path,
            "supervisor",
            stale_timeout,
            Duration::from_secs(5),
        )
        .map_err(|e| CloudSyncError::ConcurrencyConflict(e.to_string()))?;

        self.notifier.emit(&Event::SupervisorLifecycle {
            state: "starting".to_string(),
        });

        // Startup catch-up: §4.5 requires evaluating `now - lastRunOk >=
        // cadence + grace` immediately rather than waiting a full interval.
        self.tick()?;

        while !should_stop() {
            thread::sleep(poll_interval);
            if should_stop() {
                break;
            }
            self.tick()?;
        }

        self.notifier.emit(&Event::SupervisorLifecycle {
            state: "stopped".to_string(),
        });
        Ok(())
    }

    /// One scheduling pass: determine due sources, dispatch them in
    /// `parallelism`-sized batches, record outcomes, and notify.
    pub fn tick(&self) -> Result<()> {
        let due = self.due_sources()?;
        if due.is_empty() {
            return Ok(());
        }

        let parallelism = self.config.parallelism.max(1);
        let mut queue: VecDeque<SourceConfig> = due.into_iter().collect();

        while !queue.is_empty() {
            let batch_size = parallelism.min(queue.len());
            let batch: Vec<SourceConfig> = (0..batch_size).filter_map(|_| queue.pop_front()).collect();
            self.run_batch(&batch);
        }

        Ok(())
    }

    /// Which configured sources are due: never run, last run failed, or
    /// `now - lastRunOk >= cadence + grace`. A source already in flight
    /// (queued by a prior tick whose worker has not yet reported back) is
    /// never re-enqueued (§4.5 backpressure).
    fn due_sources(&self) -> Result<Vec<SourceConfig>> {
        let latest = self.run_log.latest_per_source().unwrap_or_default();
        let now = Utc::now();
        let in_flight = self.in_flight.lock().unwrap();

        let mut due = Vec::new();
        for src in &self.config.sources {
            let key = source_config_key(src);
            if in_flight.contains(&key) {
                continue;
            }
            let interval = self.config.cadences.interval_for(&key);
            let grace = self.config.cadences.grace;
            let is_due = match latest.get(&key) {
                Some(record) if record.outcome != RunOutcome::Failed => {
                    let due_after = ChronoDuration::from_std(interval + grace).unwrap_or_default();
                    now.signed_duration_since(record.timestamp) >= due_after
                }
                _ => true,
            };
            if is_due {
                due.push(src.clone());
            }
        }
        Ok(due)
    }

    fn run_batch(&self, batch: &[SourceConfig]) {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            for src in batch {
                in_flight.insert(source_config_key(src));
            }
        }

        let (tx, rx) = mpsc::channel::<Dispatched>();
        for src in batch {
            let tx = tx.clone();
            let config = Arc::clone(&self.config);
            let store = Arc::clone(&self.store);
            let transport = Arc::clone(&self.transport);
            let hostname = self.hostname.clone();
            let src = src.clone();
            let source_key = source_config_key(&src);

            self.notifier.emit(&Event::RunStart {
                source_key: source_key.clone(),
            });

            thread::spawn(move || {
                let record = run_one(&config, &store, transport.as_ref(), &hostname, &src);
                let _ = tx.send(Dispatched { source_key, record });
            });
        }
        drop(tx);

        let hard_timeout = self.hard_timeout_for_batch();
        let deadline = Instant::now() + hard_timeout;
        let mut remaining: HashSet<String> = batch.iter().map(source_config_key).collect();

        while !remaining.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                for source_key in remaining.drain() {
                    self.record_timeout(&source_key);
                }
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(dispatched) => {
                    remaining.remove(&dispatched.source_key);
                    self.record_result(dispatched);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    for source_key in remaining.drain() {
                        self.record_timeout(&source_key);
                    }
                    break;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Hard timeout for a batch is the worst-case hard timeout across the
    /// two engine kinds (archives get the larger soft timeout); every
    /// worker in a batch races the same deadline since `mpsc::Receiver`
    /// has no per-sender timeout.
    fn hard_timeout_for_batch(&self) -> Duration {
        let soft = self.config.timeouts.soft_repo.max(self.config.timeouts.soft_archive);
        soft * self.config.timeouts.hard_multiplier
    }

    fn record_result(&self, dispatched: Dispatched) {
        self.in_flight.lock().unwrap().remove(&dispatched.source_key);

        match dispatched.record {
            Ok(record) => {
                let _ = self.run_log.append(&record);
                if record.outcome == RunOutcome::Failed {
                    self.notifier.emit(&Event::RunFailure {
                        source_key: dispatched.source_key.clone(),
                        duration_ms: record.duration_ms,
                        error_kind: "engine_failure".to_string(),
                        diagnostic: record.error_detail.clone().unwrap_or_default(),
                    });
                } else {
                    self.notifier.emit(&Event::RunSuccess {
                        source_key: dispatched.source_key.clone(),
                        outcome: record.outcome,
                        duration_ms: record.duration_ms,
                        bytes_produced: record.bytes_produced,
                    });
                }
                if record.outcome == RunOutcome::Incremental || record.outcome == RunOutcome::Full {
                    self.maybe_warn_consolidation(&dispatched.source_key);
                }
            }
            Err(e) => {
                let record = RunRecord {
                    timestamp: Utc::now(),
                    source_key: dispatched.source_key.clone(),
                    outcome: RunOutcome::Failed,
                    duration_ms: 0,
                    bytes_produced: 0,
                    error_detail: Some(format!("{e:#}")),
                };
                let _ = self.run_log.append(&record);
                self.notifier.emit(&Event::RunFailure {
                    source_key: dispatched.source_key,
                    duration_ms: 0,
                    error_kind: "engine_error".to_string(),
                    diagnostic: format!("{e:#}"),
                });
            }
        }
    }

    fn record_timeout(&self, source_key: &str) {
        // The worker thread may still be running; it is abandoned here
        // rather than killed (no safe API for that), and its eventual
        // result — if it ever arrives — is simply never read.
        self.in_flight.lock().unwrap().remove(source_key);
        let record = RunRecord {
            timestamp: Utc::now(),
            source_key: source_key.to_string(),
            outcome: RunOutcome::Failed,
            duration_ms: 0,
            bytes_produced: 0,
            error_detail: Some("hard timeout exceeded; run abandoned".to_string()),
        };
        let _ = self.run_log.append(&record);
        self.notifier.emit(&Event::RunFailure {
            source_key: source_key.to_string(),
            duration_ms: 0,
            error_kind: "hard_timeout".to_string(),
            diagnostic: "hard timeout exceeded; run abandoned".to_string(),
        });
    }

    fn maybe_warn_consolidation(&self, source_key: &str) {
        let manifest = match self.store.load(source_key) {
            Ok(m) => m,
            Err(_) => return,
        };
        if manifest.incremental_count >= self.config.consolidation.max_incrementals {
            self.notifier.emit(&Event::ConsolidationRecommended {
                source_key: source_key.to_string(),
                incremental_count: manifest.incremental_count,
            });
        }
    }
}

fn run_one(
    config: &CloudSyncConfig,
    store: &ManifestStore,
    transport: &dyn Transport,
    hostname: &str,
    src: &SourceConfig,
) -> Result<RunRecord> {
    let source = source_from_config(src);
    match src {
        SourceConfig::GitRepo { .. } => {
            let engine = BundleEngine::new(store, transport);
            let cfg = BundleConfig {
                size_thresholds: &config.size_thresholds,
                consolidation: &config.consolidation,
                critical_patterns: &config.critical_patterns,
                remote_base: &config.remote_base,
                transport_budget: TRANSPORT_BUDGET,
                lock_timeout: config.timeouts.soft_repo * config.timeouts.hard_multiplier,
                retry_policy: &config.retry_policy,
            };
            engine.run_once(&source, hostname, &cfg)
        }
        SourceConfig::Directory { .. } => {
            let engine = ArchiveEngine::new(store, transport);
            let cfg = ArchiveConfig {
                size_thresholds: &config.size_thresholds,
                consolidation: &config.consolidation,
                compressor: Compressor::default(),
                remote_base: &config.remote_base,
                transport_budget: TRANSPORT_BUDGET,
                lock_timeout: config.timeouts.soft_archive * config.timeouts.hard_multiplier,
                retry_policy: &config.retry_policy,
            };
            engine.run_once(&source, hostname, &cfg)
        }
    }
}
