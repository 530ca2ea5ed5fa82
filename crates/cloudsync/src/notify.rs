//! Notifier (C10): fans structured events out to one or more sinks. Delivery
//! is best-effort and non-blocking from the engine's perspective — a slow
//! sink must never stall a run (§4.9).
//!
//! The webhook sink is a fire-and-forget HMAC-signed JSON POST, generalized
//! behind a `Notifier` trait so a log sink and a webhook sink share one
//! fan-out surface (`NotifierHub`).

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::NotifierSinkConfig;
use crate::types::RunRecord;

type HmacSha256 = Hmac<Sha256>;

/// The kinds of events the engine and supervisor emit, per §4.9.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    RunStart {
        source_key: String,
    },
    RunSuccess {
        source_key: String,
        outcome: crate::types::RunOutcome,
        duration_ms: u64,
        bytes_produced: u64,
    },
    RunFailure {
        source_key: String,
        duration_ms: u64,
        error_kind: String,
        diagnostic: String,
    },
    VerificationReport {
        sampled: usize,
        failures: usize,
        consolidation_debt: usize,
    },
    ConsolidationRecommended {
        source_key: String,
        incremental_count: u32,
    },
    SupervisorLifecycle {
        state: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

/// One delivery target for events. Implementations must not block the
/// caller for long — webhook delivery spawns its own thread, same as the
/// teacher's `WebhookClient::send_event`.
pub trait Notifier: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Writes every event to stderr with a level prefix, in the same shape the
/// teacher's `Reporter` trait produces (`[info] ...`).
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn emit(&self, event: &Event) {
        match event {
            Event::RunFailure { source_key, diagnostic, .. } => {
                eprintln!("[error] {source_key}: {diagnostic}");
            }
            Event::ConsolidationRecommended { source_key, incremental_count } => {
                eprintln!("[warn] {source_key}: consolidation recommended (incrementalCount={incremental_count})");
            }
            other => {
                eprintln!("[info] {}", describe(other));
            }
        }
    }
}

fn describe(event: &Event) -> String {
    match event {
        Event::RunStart { source_key } => format!("{source_key}: run started"),
        Event::RunSuccess {
            source_key,
            outcome,
            duration_ms,
            bytes_produced,
        } => format!("{source_key}: {outcome:?} in {duration_ms}ms ({bytes_produced} bytes)"),
        Event::RunFailure { source_key, diagnostic, .. } => format!("{source_key}: failed: {diagnostic}"),
        Event::VerificationReport { sampled, failures, consolidation_debt } => format!(
            "verification: sampled={sampled} failures={failures} consolidation_debt={consolidation_debt}"
        ),
        Event::ConsolidationRecommended { source_key, incremental_count } => {
            format!("{source_key}: consolidation recommended (incrementalCount={incremental_count})")
        }
        Event::SupervisorLifecycle { state } => format!("supervisor: {state}"),
    }
}

/// HMAC-signed JSON POST to a configured endpoint, fire-and-forget on a
/// background thread — delivery failures never propagate to the caller.
/// Directly grounded on `webhook.rs`'s `WebhookClient`.
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, secret: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            secret,
        })
    }
}

impl Notifier for WebhookNotifier {
    fn emit(&self, event: &Event) {
        let envelope = EventEnvelope {
            timestamp: Utc::now(),
            event: event.clone(),
        };
        let client = self.client.clone();
        let url = self.url.clone();
        let secret = self.secret.clone();

        std::thread::spawn(move || {
            if let Err(e) = post_event(&client, &url, secret.as_deref(), &envelope) {
                eprintln!("[warn] webhook delivery failed (non-blocking): {e:#}");
            }
        });
    }
}

fn post_event(
    client: &reqwest::blocking::Client,
    url: &str,
    secret: Option<&str>,
    envelope: &EventEnvelope,
) -> Result<()> {
    let json = serde_json::to_string(envelope).context("failed to serialize event")?;
    let mut request = client.post(url).header("Content-Type", "application/json");

    if let Some(secret) = secret {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(json.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        request = request.header("X-CloudSync-Signature", format!("sha256={signature}"));
    }

    let response = request.body(json).send().context("failed to send webhook request")?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        anyhow::bail!("webhook returned {status}: {body}");
    }
    Ok(())
}

/// Fan-out to every configured sink. Each sink's `emit` is best-effort; one
/// sink misbehaving never affects another or blocks the caller for long.
pub struct NotifierHub {
    sinks: Vec<Box<dyn Notifier>>,
}

impl NotifierHub {
    pub fn new(sinks: Vec<Box<dyn Notifier>>) -> Self {
        Self { sinks }
    }

    pub fn from_config(configs: &[NotifierSinkConfig]) -> Result<Self> {
        let mut sinks: Vec<Box<dyn Notifier>> = Vec::new();
        for config in configs {
            match config {
                NotifierSinkConfig::Log => sinks.push(Box::new(LogNotifier)),
                NotifierSinkConfig::Webhook { url, secret, timeout } => {
                    sinks.push(Box::new(WebhookNotifier::new(url.clone(), secret.clone(), *timeout)?));
                }
            }
        }
        Ok(Self::new(sinks))
    }

    pub fn emit(&self, event: &Event) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

impl Default for NotifierHub {
    fn default() -> Self {
        Self::new(vec![Box::new(LogNotifier)])
    }
}

const RUN_LOG_FILENAME: &str = "run-log.jsonl";
/// Rotate the run log once it exceeds this size, per §3.2's "rotated by
/// size/age policy" requirement.
const RUN_LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;

/// Append-only JSONL log of `RunRecord`s, one line per completed engine run.
/// Grounded on the teacher's `shipper-events::EventLog` (append, JSONL,
/// read-back for the health surface), sized for a rotate-on-overflow policy
/// the teacher's event log doesn't need (its process is one-shot).
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(bundle_root: impl Into<PathBuf>) -> Self {
        Self {
            path: bundle_root.into().join(RUN_LOG_FILENAME),
        }
    }

    /// Append one run record, rotating the log to a `.1` sibling first if it
    /// has grown past `RUN_LOG_ROTATE_BYTES`.
    pub fn append(&self, record: &RunRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create run log dir {}", parent.display()))?;
        }
        self.rotate_if_needed()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open run log {}", self.path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        let line = serde_json::to_string(record).context("failed to serialize run record")?;
        writeln!(writer, "{line}").context("failed to append run record")?;
        writer.flush().context("failed to flush run log")
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let Ok(meta) = fs::metadata(&self.path) else {
            return Ok(());
        };
        if meta.len() < RUN_LOG_ROTATE_BYTES {
            return Ok(());
        }
        let rotated = self.path.with_extension("jsonl.1");
        fs::rename(&self.path, &rotated)
            .with_context(|| format!("failed to rotate run log to {}", rotated.display()))
    }

    /// Read every record currently on disk, oldest first.
    pub fn read_all(&self) -> Result<Vec<RunRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).with_context(|| format!("failed to open run log {}", self.path.display()))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line.context("failed to read run log line")?;
            if line.trim().is_empty() {
                continue;
            }
            let record: RunRecord = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse run log line: {line}"))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Most recent record per source key.
    pub fn latest_per_source(&self) -> Result<std::collections::HashMap<String, RunRecord>> {
        let mut latest: std::collections::HashMap<String, RunRecord> = std::collections::HashMap::new();
        for record in self.read_all()? {
            latest
                .entry(record.source_key.clone())
                .and_modify(|existing| {
                    if record.timestamp > existing.timestamp {
                        *existing = record.clone();
                    }
                })
                .or_insert(record);
        }
        Ok(latest)
    }
}
