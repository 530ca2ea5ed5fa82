//! # CloudSync
//!
//! A backup and replication engine for a developer workstation that holds
//! many git repositories plus arbitrary non-git directories, mirrored to a
//! single remote object store through an external transport agent.
//!
//! CloudSync's value is not in talking to cloud storage — that is the
//! transport agent's job (§1) — but in deciding *what* to ship, packaging it
//! into a compact, versionable form, tracking incremental state across runs,
//! and restoring it faithfully on a different host.
//!
//! ## Pipeline
//!
//! Per scheduled tick: [`supervisor::Supervisor`] picks a due source, hands
//! it to [`git_bundle::BundleEngine`] or [`archive::ArchiveEngine`], which
//! reads/writes the source's [`manifest::ManifestStore`] entry, calls
//! through a [`transport::Transport`], and emits structured events to a
//! [`notify::Notifier`]. [`verify::VerifyEngine`] runs on its own cadence
//! and exercises [`restore::RestoreEngine`] against a scratch directory.
//!
//! ## Modules
//!
//! - [`types`] — domain types: sources, manifests, bundle records, outcomes
//! - [`error`] — error taxonomy (§7) and process exit codes (§6.3)
//! - [`config`] — typed configuration, loaded once and passed by value (C11)
//! - [`transport`] — abstract remote-sync surface and two implementations (C1)
//! - [`manifest`] — per-source manifest persistence and locking (C2)
//! - [`git`] — low-level `git` subprocess wrapper
//! - [`git_bundle`] — git bundle engine: decision procedure, consolidation (C3)
//! - [`critical_files`] — gitignored-but-critical file extractor (C5)
//! - [`archive`] — non-git directory archive engine (C4)
//! - [`restore`] — unified restore engine for both source kinds (C6)
//! - [`supervisor`] — scheduler: cadences, parallelism, cross-process lock (C7)
//! - [`verify`] — periodic sample-restore verification (C8)
//! - [`health`] — read-only monitoring snapshot (C9)
//! - [`notify`] — event fan-out to notification sinks (C10)
//! - [`process`] — timeout-bounded subprocess execution used by the shell transport
//!
//! ## Stability
//!
//! Pre-1.0; the manifest JSON shape (§6.2) is the one on-disk compatibility
//! surface and is held stable across `0.x` releases.

pub mod archive;
pub mod config;
pub mod critical_files;
pub mod error;
pub mod git;
pub mod git_bundle;
pub mod health;
pub mod manifest;
pub mod notify;
pub mod process;
#[cfg(test)]
mod property_tests;
pub mod restore;
pub mod supervisor;
pub mod transport;
pub mod types;
pub mod verify;

pub use error::CloudSyncError;
