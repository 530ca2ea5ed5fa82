//! Error taxonomy (§7) and process exit codes (§6.3).
//!
//! Library-internal code returns `CloudSyncError`; the CLI boundary maps it
//! to an exit code and a one-line diagnostic. Orchestration glue (the
//! supervisor loop, multi-step engine runs) uses `anyhow::Result` and
//! attaches context as errors bubble up, the usual `anyhow` + `thiserror`
//! pairing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudSyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("source not found: {0}")]
    SourceMissing(String),

    #[error("manifest corrupt for {source_key}: {reason}")]
    ManifestCorrupt { source_key: String, reason: String },

    #[error("manifest missing for {0}")]
    ManifestMissing(String),

    #[error("manifest locked for {source_key} (waited {waited_ms}ms)")]
    ManifestLocked { source_key: String, waited_ms: u64 },

    #[error("bundle create failed for {source_key}: {reason}")]
    BundleCreateFailure { source_key: String, reason: String },

    #[error("transport failure ({}): {reason}", if *.retryable { "retryable" } else { "permanent" })]
    TransportFailure { retryable: bool, reason: String },

    #[error("integrity check failed for {artifact}: {reason}")]
    IntegrityFailure { artifact: String, reason: String },

    #[error("bundle verify failed for {artifact}: {reason}")]
    VerifyFailure { artifact: String, reason: String },

    #[error("artifact missing: {0}")]
    ArtifactMissing(String),

    #[error("restore target conflict: {0}")]
    TargetConflict(String),

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("operation cancelled")]
    Cancelled,

    #[error("another instance holds the lock: {0}")]
    ConcurrencyConflict(String),
}

impl CloudSyncError {
    /// Process exit code, per §6.3.
    pub fn exit_code(&self) -> i32 {
        match self {
            CloudSyncError::Config(_) => 1,
            CloudSyncError::SourceMissing(_) => 2,
            CloudSyncError::ManifestCorrupt { .. } | CloudSyncError::ManifestMissing(_) => 3,
            CloudSyncError::ManifestLocked { .. } => 3,
            CloudSyncError::IntegrityFailure { .. }
            | CloudSyncError::ArtifactMissing(_)
            | CloudSyncError::VerifyFailure { .. } => 4,
            CloudSyncError::TargetConflict(_) => 1,
            CloudSyncError::BundleCreateFailure { .. } | CloudSyncError::TransportFailure { .. } => 5,
            CloudSyncError::Timeout(_) | CloudSyncError::Cancelled => 6,
            CloudSyncError::ConcurrencyConflict(_) => 7,
        }
    }

    /// Whether an engine should retry the triggering operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudSyncError::TransportFailure { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_spec_table() {
        assert_eq!(CloudSyncError::Config("bad".into()).exit_code(), 1);
        assert_eq!(CloudSyncError::SourceMissing("x".into()).exit_code(), 2);
        assert_eq!(
            CloudSyncError::ManifestCorrupt {
                source_key: "x".into(),
                reason: "bad json".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(
            CloudSyncError::IntegrityFailure {
                artifact: "full.bundle".into(),
                reason: "checksum mismatch".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(
            CloudSyncError::VerifyFailure {
                artifact: "full.bundle".into(),
                reason: "unable to verify prerequisite commits".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(
            CloudSyncError::TransportFailure {
                retryable: false,
                reason: "denied".into()
            }
            .exit_code(),
            5
        );
        assert_eq!(CloudSyncError::Cancelled.exit_code(), 6);
        assert_eq!(
            CloudSyncError::ConcurrencyConflict("pid 1".into()).exit_code(),
            7
        );
    }

    #[test]
    fn only_retryable_transport_failures_are_retryable() {
        let retryable = CloudSyncError::TransportFailure {
            retryable: true,
            reason: "timeout".into(),
        };
        let permanent = CloudSyncError::TransportFailure {
            retryable: false,
            reason: "access denied".into(),
        };
        assert!(retryable.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(!CloudSyncError::Cancelled.is_retryable());
    }
}
