//! Archive engine for non-git directories (C4): fingerprinting, full/
//! incremental tar creation, and restore ordering, per §4.4.
//!
//! Nothing elsewhere in this workspace tars anything, so this module's
//! compression stack is grounded on backup-shaped reference code instead
//! (see `DESIGN.md`).

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Instant, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use cloudsync_retry::RetryStrategyConfig;

use crate::config::{ConsolidationPolicy, SizeThresholds};
use crate::manifest::ManifestStore;
use crate::transport::{self, CallBudget, Transport};
use crate::types::{BundleRecord, FileTypeCount, Manifest, RunOutcome, RunRecord, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compressor {
    Zstd,
    Gzip,
    Bzip2,
}

impl Compressor {
    pub fn extension(self) -> &'static str {
        match self {
            Compressor::Zstd => "tar.zst",
            Compressor::Gzip => "tar.gz",
            Compressor::Bzip2 => "tar.bz2",
        }
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Compressor::Zstd
    }
}

pub struct ArchiveConfig<'a> {
    pub size_thresholds: &'a SizeThresholds,
    pub consolidation: &'a ConsolidationPolicy,
    pub compressor: Compressor,
    pub remote_base: &'a str,
    pub transport_budget: std::time::Duration,
    /// How long a held manifest lock for this source is considered live
    /// before a crashed holder's lock is reclaimed as stale.
    pub lock_timeout: std::time::Duration,
    pub retry_policy: &'a RetryStrategyConfig,
}

/// Per-file record kept in the `.tar-snapshot` sidecar, mirroring GNU tar's
/// listed-incremental snapshot: enough to tell "changed since last archive"
/// without re-reading file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEntry {
    size: u64,
    mtime_ns: u128,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    entries: BTreeMap<String, SnapshotEntry>,
}

const SNAPSHOT_FILENAME: &str = ".tar-snapshot";

#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Skip,
    Full,
    FullConsolidation,
    Incremental,
}

pub struct ArchiveEngine<'a> {
    pub store: &'a ManifestStore,
    pub transport: &'a dyn Transport,
}

impl<'a> ArchiveEngine<'a> {
    pub fn new(store: &'a ManifestStore, transport: &'a dyn Transport) -> Self {
        Self { store, transport }
    }

    /// Holds the source's manifest lock for the whole run: load, decide,
    /// create the archive, persist the manifest, sync to the transport, then
    /// release, matching §4.2's single-writer contract.
    pub fn run_once(&self, source: &Source, hostname: &str, cfg: &ArchiveConfig) -> Result<RunRecord> {
        let start = Instant::now();
        let source_key = source.key();
        let dir_path = source.absolute_path();

        let _lock = self.store.lock(source_key, cfg.lock_timeout)?;

        let mut manifest = self.store.load_or_create(source, hostname)?;
        let fingerprint = fingerprint_directory(dir_path)?;
        let size_bytes = directory_size(dir_path)?;

        let source_dir = self.store.source_dir(source_key);
        let decision = self.decide(&manifest, &fingerprint, size_bytes, &source_dir, cfg);

        let outcome = match decision {
            Decision::Skip => RunOutcome::SkippedNoChange,
            Decision::Full => {
                self.create_full(source, &mut manifest, &fingerprint, cfg)?;
                RunOutcome::Full
            }
            Decision::FullConsolidation => {
                self.create_full(source, &mut manifest, &fingerprint, cfg)?;
                RunOutcome::Consolidated
            }
            Decision::Incremental => {
                self.create_incremental(source, &mut manifest, &fingerprint, cfg)?;
                RunOutcome::Incremental
            }
        };

        Ok(RunRecord {
            timestamp: Utc::now(),
            source_key: source_key.to_string(),
            outcome,
            duration_ms: start.elapsed().as_millis() as u64,
            bytes_produced: size_bytes,
            error_detail: None,
        })
    }

    fn decide(
        &self,
        manifest: &Manifest,
        fingerprint: &str,
        size_bytes: u64,
        source_dir: &Path,
        cfg: &ArchiveConfig,
    ) -> Decision {
        if manifest.last_dir_checksum.as_deref() == Some(fingerprint) && !manifest.bundles.is_empty() {
            return Decision::Skip;
        }
        if manifest.bundles.is_empty() {
            return Decision::Full;
        }
        if consolidation_triggers(manifest, cfg.consolidation) {
            return Decision::FullConsolidation;
        }
        // A lost or unreadable `.tar-snapshot` means there is nothing to diff
        // an incremental against; fall back to a full archive (§4.4) rather
        // than treating every file as "changed" inside an incremental record.
        if read_snapshot(source_dir).is_none() {
            return Decision::Full;
        }
        if size_bytes < cfg.size_thresholds.small_bytes() {
            return Decision::Full;
        }
        Decision::Incremental
    }

    fn create_full(
        &self,
        source: &Source,
        manifest: &mut Manifest,
        fingerprint: &str,
        cfg: &ArchiveConfig,
    ) -> Result<()> {
        let dir_path = source.absolute_path();
        let source_key = source.key();
        let source_dir = self.store.source_dir(source_key);
        fs::create_dir_all(&source_dir)
            .with_context(|| format!("failed to create {}", source_dir.display()))?;

        if !manifest.bundles.is_empty() {
            archive_previous_artifacts(&source_dir, manifest)?;
        }

        let safe_name = sanitize_name(source_key);
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let filename = format!("{safe_name}-full-{timestamp}.{}", cfg.compressor.extension());
        let archive_path = source_dir.join(&filename);

        let files = list_files_relative_to_home(dir_path)?;
        let (uncompressed, compressed, file_types) =
            write_tar_archive(dir_path, &files, &archive_path, cfg.compressor)?;

        let checksum = sha256_file(&archive_path)?;

        // Seed the snapshot for future incrementals.
        let snapshot = build_snapshot(dir_path, &files)?;
        write_snapshot(&source_dir, &snapshot)?;

        manifest.bundles.clear();
        manifest.push_bundle(BundleRecord::Full {
            filename,
            created_at: Utc::now(),
            size_bytes: compressed,
            checksum,
            commit: None,
            files_count: Some(files.len() as u64),
        });
        manifest.last_dir_checksum = Some(fingerprint.to_string());
        manifest.metadata.total_size_uncompressed += uncompressed;
        manifest.metadata.total_size_compressed += compressed;
        manifest.metadata.compression_ratio = if uncompressed > 0 {
            compressed as f64 / uncompressed as f64
        } else {
            0.0
        };
        merge_file_types(&mut manifest.metadata.file_types, file_types);

        self.persist_and_sync(source, manifest, &source_dir, cfg)
    }

    fn create_incremental(
        &self,
        source: &Source,
        manifest: &mut Manifest,
        fingerprint: &str,
        cfg: &ArchiveConfig,
    ) -> Result<()> {
        let dir_path = source.absolute_path();
        let source_key = source.key();
        let source_dir = self.store.source_dir(source_key);
        fs::create_dir_all(&source_dir)?;

        let previous = read_snapshot(&source_dir).unwrap_or_default();
        let files = list_files_relative_to_home(dir_path)?;
        let changed: Vec<PathBuf> = files
            .iter()
            .filter(|rel| {
                let key = rel.to_string_lossy().into_owned();
                let full_path = resolve_home_relative(dir_path, rel);
                match (previous.entries.get(&key), fs::metadata(&full_path)) {
                    (Some(prev), Ok(meta)) => {
                        prev.size != meta.len() || prev.mtime_ns != mtime_ns(&meta)
                    }
                    _ => true,
                }
            })
            .cloned()
            .collect();

        let safe_name = sanitize_name(source_key);
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let filename = format!("{safe_name}-incremental-{timestamp}.{}", cfg.compressor.extension());
        let archive_path = source_dir.join(&filename);

        let (uncompressed, compressed, file_types) =
            write_tar_archive(dir_path, &changed, &archive_path, cfg.compressor)?;
        let checksum = sha256_file(&archive_path)?;

        let new_snapshot = build_snapshot(dir_path, &files)?;
        write_snapshot(&source_dir, &new_snapshot)?;

        let parent_filename = manifest
            .bundles
            .last()
            .map(|b| b.filename().to_string())
            .context("incremental archive requires a previous archive record")?;

        manifest.push_bundle(BundleRecord::Incremental {
            filename,
            created_at: Utc::now(),
            size_bytes: compressed,
            checksum,
            commit: None,
            parent_filename,
            commit_range: None,
            files_count: Some(changed.len() as u64),
        });
        manifest.last_dir_checksum = Some(fingerprint.to_string());
        manifest.metadata.total_size_uncompressed += uncompressed;
        manifest.metadata.total_size_compressed += compressed;
        merge_file_types(&mut manifest.metadata.file_types, file_types);

        self.persist_and_sync(source, manifest, &source_dir, cfg)
    }

    fn persist_and_sync(
        &self,
        source: &Source,
        manifest: &Manifest,
        source_dir: &Path,
        cfg: &ArchiveConfig,
    ) -> Result<()> {
        self.store.persist(source.key(), manifest)?;
        let remote_dir = format!("{}/{}", cfg.remote_base, source.key());
        transport::with_retry(cfg.retry_policy, || {
            self.transport.sync(source_dir, &remote_dir, CallBudget::new(cfg.transport_budget))
        })
        .context("transport sync failed after archive create")?;
        Ok(())
    }
}

fn consolidation_triggers(manifest: &Manifest, policy: &ConsolidationPolicy) -> bool {
    if manifest.incremental_count >= policy.max_incrementals {
        return true;
    }
    if let Some(last_full_at) = manifest.last_full_at {
        let age = Utc::now().signed_duration_since(last_full_at);
        if age.num_days() >= policy.age_days as i64 {
            return true;
        }
    }
    false
}

fn archive_previous_artifacts(source_dir: &Path, manifest: &Manifest) -> Result<()> {
    let archive_dir = source_dir.join(format!("archive-{}", Utc::now().format("%Y%m%d-%H%M%S")));
    fs::create_dir_all(&archive_dir)?;
    for bundle in &manifest.bundles {
        let src = source_dir.join(bundle.filename());
        if src.exists() {
            fs::rename(&src, archive_dir.join(bundle.filename()))?;
        }
    }
    Ok(())
}

fn sanitize_name(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Ordered list of `(relative_path, size, mtime_ns)` for every regular file
/// under `dir`, streamed through SHA-256. Symlinks are not followed.
fn fingerprint_directory(dir: &Path) -> Result<String> {
    let files = list_files_relative_to_home(dir)?;
    let mut hasher = Sha256::new();
    for rel in &files {
        let full_path = resolve_home_relative(dir, rel);
        let meta = fs::symlink_metadata(&full_path)
            .with_context(|| format!("failed to stat {}", full_path.display()))?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(meta.len().to_le_bytes());
        hasher.update(mtime_ns(&meta).to_le_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

fn directory_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in fs::read_dir(&d).with_context(|| format!("failed to read {}", d.display()))? {
            let entry = entry?;
            let meta = fs::symlink_metadata(entry.path())?;
            if meta.file_type().is_symlink() {
                continue;
            }
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// Relative paths under `dir`, sorted for deterministic ordering. "Relative
/// to home" (§4.4) just means the path we store is relative to `dir` itself
/// when `dir` already sits under the user's home; the restore side resolves
/// against a caller-supplied root rather than this module baking in `$HOME`.
fn list_files_relative_to_home(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk(dir, dir, &mut out)?;
    out.sort();
    Ok(out)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            if symlink_escapes_root(root, &path) {
                eprintln!(
                    "[warn] archive: refusing to follow symlink outside root: {}",
                    path.display()
                );
            }
            continue;
        }
        if meta.is_dir() {
            walk(root, &path, out)?;
        } else if meta.is_file() {
            out.push(path.strip_prefix(root).unwrap_or(&path).to_path_buf());
        }
    }
    Ok(())
}

/// Whether the symlink at `path` resolves to a target outside `root`. Used
/// only to decide whether the refusal-to-follow is worth a warning (§8); the
/// symlink is never followed either way.
fn symlink_escapes_root(root: &Path, path: &Path) -> bool {
    let target = match fs::read_link(path) {
        Ok(t) => t,
        Err(_) => return false,
    };
    let resolved = if target.is_absolute() {
        target
    } else {
        path.parent().unwrap_or(path).join(target)
    };
    let canonical_root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    match fs::canonicalize(&resolved) {
        Ok(canonical_target) => !canonical_target.starts_with(&canonical_root),
        Err(_) => true,
    }
}

fn resolve_home_relative(root: &Path, relative: &Path) -> PathBuf {
    root.join(relative)
}

fn mtime_ns(meta: &fs::Metadata) -> u128 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn build_snapshot(root: &Path, files: &[PathBuf]) -> Result<Snapshot> {
    let mut entries = BTreeMap::new();
    for rel in files {
        let full_path = resolve_home_relative(root, rel);
        let meta = fs::metadata(&full_path)
            .with_context(|| format!("failed to stat {}", full_path.display()))?;
        entries.insert(
            rel.to_string_lossy().into_owned(),
            SnapshotEntry {
                size: meta.len(),
                mtime_ns: mtime_ns(&meta),
            },
        );
    }
    Ok(Snapshot { entries })
}

fn write_snapshot(source_dir: &Path, snapshot: &Snapshot) -> Result<()> {
    let path = source_dir.join(SNAPSHOT_FILENAME);
    let json = serde_json::to_string(snapshot)?;
    fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))
}

/// Missing snapshot file falls back to treating every file as changed (a
/// full re-archive worth of content in the "incremental", recoverable per
/// §4.4's failure semantics rather than fatal).
fn read_snapshot(source_dir: &Path) -> Option<Snapshot> {
    let path = source_dir.join(SNAPSHOT_FILENAME);
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn write_tar_archive(
    root: &Path,
    files: &[PathBuf],
    dest: &Path,
    compressor: Compressor,
) -> Result<(u64, u64, Vec<FileTypeCount>)> {
    let out_file = File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let mut uncompressed = 0u64;
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();

    match compressor {
        Compressor::Zstd => {
            let encoder = zstd::stream::write::Encoder::new(out_file, 3)?.auto_finish();
            let mut builder = tar::Builder::new(encoder);
            for rel in files {
                uncompressed += append_file(&mut builder, root, rel, &mut counts)?;
            }
            builder.finish().context("failed to finalize tar.zst archive")?;
        }
        Compressor::Gzip => {
            let encoder = flate2::write::GzEncoder::new(out_file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            for rel in files {
                uncompressed += append_file(&mut builder, root, rel, &mut counts)?;
            }
            builder.into_inner()?.finish().context("failed to finalize tar.gz archive")?;
        }
        Compressor::Bzip2 => {
            let encoder = bzip2::write::BzEncoder::new(out_file, bzip2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            for rel in files {
                uncompressed += append_file(&mut builder, root, rel, &mut counts)?;
            }
            builder.into_inner()?.finish().context("failed to finalize tar.bz2 archive")?;
        }
    }

    let compressed = fs::metadata(dest)?.len();
    let file_types = counts
        .into_iter()
        .map(|(extension, count)| FileTypeCount { extension, count })
        .collect();
    Ok((uncompressed, compressed, file_types))
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    rel: &Path,
    counts: &mut BTreeMap<String, u64>,
) -> Result<u64> {
    let full_path = root.join(rel);
    let size = fs::metadata(&full_path)?.len();
    builder
        .append_path_with_name(&full_path, rel)
        .with_context(|| format!("failed to pack {}", full_path.display()))?;

    let extension = rel
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_else(|| "<none>".to_string());
    *counts.entry(extension).or_insert(0) += 1;

    Ok(size)
}

fn merge_file_types(existing: &mut Vec<FileTypeCount>, new: Vec<FileTypeCount>) {
    let mut map: BTreeMap<String, u64> = existing
        .drain(..)
        .map(|f| (f.extension, f.count))
        .collect();
    for f in new {
        *map.entry(f.extension).or_insert(0) += f.count;
    }
    *existing = map
        .into_iter()
        .map(|(extension, count)| FileTypeCount { extension, count })
        .collect();
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
