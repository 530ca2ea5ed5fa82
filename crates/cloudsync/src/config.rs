//! Typed configuration (C11, §6.4).
//!
//! A single `CloudSyncConfig` is loaded once per process and passed by
//! value into every component — no hidden globals (§3.2). A runnable
//! binary needs a concrete on-disk shape, so this follows the usual TOML
//! layering: file defaults, overridden by environment variables,
//! overridden by explicit CLI flags.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::types::{deserialize_duration, serialize_duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeThresholds {
    #[serde(default = "default_small_mib")]
    pub small_mib: u64,
    #[serde(default = "default_medium_mib")]
    pub medium_mib: u64,
}

impl Default for SizeThresholds {
    fn default() -> Self {
        Self {
            small_mib: default_small_mib(),
            medium_mib: default_medium_mib(),
        }
    }
}

fn default_small_mib() -> u64 {
    100
}
fn default_medium_mib() -> u64 {
    500
}

impl SizeThresholds {
    pub fn small_bytes(&self) -> u64 {
        self.small_mib * 1024 * 1024
    }
    pub fn medium_bytes(&self) -> u64 {
        self.medium_mib * 1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationPolicy {
    #[serde(default = "default_max_incrementals")]
    pub max_incrementals: u32,
    #[serde(default = "default_age_days")]
    pub age_days: u32,
}

impl Default for ConsolidationPolicy {
    fn default() -> Self {
        Self {
            max_incrementals: default_max_incrementals(),
            age_days: default_age_days(),
        }
    }
}

fn default_max_incrementals() -> u32 {
    10
}
fn default_age_days() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cadences {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_interval"
    )]
    pub default_interval: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_grace"
    )]
    pub grace: Duration,
    /// Per-source-key interval overrides.
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

impl Default for Cadences {
    fn default() -> Self {
        Self {
            default_interval: default_interval(),
            grace: default_grace(),
            overrides: HashMap::new(),
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}
fn default_grace() -> Duration {
    Duration::from_secs(2 * 60)
}

impl Cadences {
    /// Resolve the configured interval for a source key, falling back to
    /// `default_interval` and parsing override strings with humantime.
    pub fn interval_for(&self, source_key: &str) -> Duration {
        self.overrides
            .get(source_key)
            .and_then(|s| humantime::parse_duration(s).ok())
            .unwrap_or(self.default_interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutsConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_soft_repo"
    )]
    pub soft_repo: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_soft_archive"
    )]
    pub soft_archive: Duration,
    #[serde(default = "default_hard_multiplier")]
    pub hard_multiplier: u32,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            soft_repo: default_soft_repo(),
            soft_archive: default_soft_archive(),
            hard_multiplier: default_hard_multiplier(),
        }
    }
}

fn default_soft_repo() -> Duration {
    Duration::from_secs(60 * 60)
}
fn default_soft_archive() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}
fn default_hard_multiplier() -> u32 {
    2
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalPatternsConfig {
    #[serde(default = "default_allow_patterns")]
    pub allow: Vec<String>,
    #[serde(default = "default_deny_patterns")]
    pub deny: Vec<String>,
}

fn default_allow_patterns() -> Vec<String> {
    vec![
        ".env*".to_string(),
        "*.pem".to_string(),
        "*credentials*".to_string(),
    ]
}

fn default_deny_patterns() -> Vec<String> {
    vec![
        "node_modules/".to_string(),
        "dist/".to_string(),
        ".cache/".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_verification_cadence"
    )]
    pub cadence: Duration,
    #[serde(default = "default_max_repos_to_test")]
    pub max_repos_to_test: usize,
    #[serde(default = "default_true")]
    pub cleanup_after: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cadence: default_verification_cadence(),
            max_repos_to_test: default_max_repos_to_test(),
            cleanup_after: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_verification_cadence() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}
fn default_max_repos_to_test() -> usize {
    5
}

/// An opaque sink configuration, e.g. a webhook endpoint. CloudSync ships a
/// webhook sink (§4.9/C10); additional sink kinds are a matter of adding
/// variants here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifierSinkConfig {
    Webhook {
        url: String,
        #[serde(default)]
        secret: Option<String>,
        #[serde(
            deserialize_with = "deserialize_duration",
            serialize_with = "serialize_duration",
            default = "default_webhook_timeout"
        )]
        timeout: Duration,
    },
    Log,
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    GitRepo {
        #[serde(deserialize_with = "deserialize_expanded_path")]
        path: PathBuf,
        #[serde(rename = "key")]
        repo_key: String,
    },
    Directory {
        #[serde(deserialize_with = "deserialize_expanded_path")]
        path: PathBuf,
        category: String,
    },
}

/// Expands a leading `~` (and `~user`) the way a shell would, since TOML
/// gives `serde` a literal string with no shell in between. Grounded on the
/// pack's `shellexpand`-using config loaders (see `DESIGN.md`); plain
/// strings without a leading `~` pass through unchanged.
fn deserialize_expanded_path<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(expand_path(&raw))
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

/// The top-level configuration object (C11).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudSyncConfig {
    #[serde(default = "default_bundle_root", deserialize_with = "deserialize_expanded_path")]
    pub bundle_root: PathBuf,
    #[serde(default)]
    pub remote_base: String,
    #[serde(default)]
    pub size_thresholds: SizeThresholds,
    #[serde(default)]
    pub consolidation: ConsolidationPolicy,
    #[serde(default)]
    pub cadences: Cadences,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub critical_patterns: CriticalPatternsConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub notifier_sinks: Vec<NotifierSinkConfig>,
    /// Path to the external transport agent binary, or `None` to use the
    /// in-process filesystem transport (tests, same-host mirrors).
    #[serde(default)]
    pub transport_command: Option<String>,
    /// Backoff policy for retrying `TransportFailure { retryable: true }`
    /// (§7). Defaults to 3 attempts, 5s base, capped at 5 minutes.
    #[serde(default = "cloudsync_retry::default_transport_policy")]
    pub retry_policy: cloudsync_retry::RetryStrategyConfig,
}

fn default_bundle_root() -> PathBuf {
    dirs_home().join(".cloudsync").join("bundles")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(1)
}

impl Default for CloudSyncConfig {
    fn default() -> Self {
        Self {
            bundle_root: default_bundle_root(),
            remote_base: String::new(),
            size_thresholds: SizeThresholds::default(),
            consolidation: ConsolidationPolicy::default(),
            cadences: Cadences::default(),
            timeouts: TimeoutsConfig::default(),
            parallelism: default_parallelism(),
            critical_patterns: CriticalPatternsConfig::default(),
            sources: Vec::new(),
            verification: VerificationConfig::default(),
            notifier_sinks: Vec::new(),
            transport_command: None,
            retry_policy: cloudsync_retry::default_transport_policy(),
        }
    }
}

impl CloudSyncConfig {
    /// Load from a `.cloudsync.toml` file, then apply environment overrides.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: CloudSyncConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location (`~/.cloudsync.toml`) if present,
    /// else fall back to defaults plus environment overrides.
    pub fn load_default() -> Result<Self> {
        let path = dirs_home().join(".cloudsync.toml");
        if path.exists() {
            Self::load_from_file(&path)
        } else {
            let mut config = CloudSyncConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("CLOUDSYNC_BUNDLE_ROOT") {
            self.bundle_root = expand_path(&root);
        }
        if let Ok(base) = std::env::var("CLOUDSYNC_REMOTE_BASE") {
            self.remote_base = base;
        }
        if let Ok(parallelism) = std::env::var("CLOUDSYNC_PARALLELISM") {
            if let Ok(n) = parallelism.parse() {
                self.parallelism = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            bail!("parallelism must be greater than 0");
        }
        if self.size_thresholds.small_mib == 0 {
            bail!("sizeThresholds.smallMiB must be greater than 0");
        }
        if self.size_thresholds.medium_mib <= self.size_thresholds.small_mib {
            bail!("sizeThresholds.mediumMiB must be greater than smallMiB");
        }
        if self.consolidation.max_incrementals == 0 {
            bail!("consolidation.maxIncrementals must be greater than 0");
        }
        if self.verification.max_repos_to_test == 0 {
            bail!("verification.maxReposToTest must be greater than 0");
        }
        for source in &self.sources {
            match source {
                SourceConfig::GitRepo { repo_key, .. } if repo_key.is_empty() => {
                    bail!("a source's key cannot be empty");
                }
                SourceConfig::Directory { category, .. } if category.is_empty() => {
                    bail!("a directory source's category cannot be empty");
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn default_toml_template() -> String {
        r#"# CloudSync configuration file
# Place at ~/.cloudsync.toml, or pass an explicit path to the CLI.

bundleRoot = "~/.cloudsync/bundles"
remoteBase = "remote:backups"
parallelism = 4

[sizeThresholds]
smallMiB = 100
mediumMiB = 500

[consolidation]
maxIncrementals = 10
ageDays = 30

[cadences]
defaultInterval = "24h"
grace = "2m"

[timeouts]
softRepo = "1h"
softArchive = "2h"
hardMultiplier = 2

[criticalPatterns]
allow = [".env*", "*.pem", "*credentials*"]
deny = ["node_modules/", "dist/", ".cache/"]

[verification]
enabled = true
cadence = "7d"
maxReposToTest = 5
cleanupAfter = true

[retryPolicy]
strategy = "exponential"
max_attempts = 3
base_delay = "5s"
max_delay = "5m"
jitter = 0.3

# [[sources]]
# kind = "git_repo"
# path = "/home/user/projects/my-app"
# key = "my-app"

# [[notifierSinks]]
# kind = "webhook"
# url = "https://example.com/hooks/cloudsync"
# timeout = "30s"
"#
        .to_string()
    }
}
