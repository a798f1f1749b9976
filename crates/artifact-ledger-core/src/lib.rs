use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod discover;
pub mod hash;
pub mod metrics;

pub use discover::{AssetDiscoverer, DiscoveredPaths};
pub use hash::{hash_file, hash_reader, normalize_digest, HASH_CHUNK_SIZE};
pub use metrics::extract_metrics;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("storage unavailable at {}: {reason}", path.display())]
    StorageUnavailable { path: PathBuf, reason: String },
    #[error("unreadable file {}: {reason}", path.display())]
    UnreadableFile { path: PathBuf, reason: String },
    #[error("migration unit `{unit}` failed: {reason}")]
    MigrationFailed { unit: String, reason: String },
    #[error("remediation `{action}` failed: {reason}")]
    RemediationFailed { action: String, reason: String },
    #[error("invalid glob pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    pub fn storage(path: &Path, reason: impl Display) -> Self {
        Self::StorageUnavailable { path: path.to_path_buf(), reason: reason.to_string() }
    }

    pub fn unreadable(path: &Path, reason: impl Display) -> Self {
        Self::UnreadableFile { path: path.to_path_buf(), reason: reason.to_string() }
    }

    /// Storage and migration failures end the process with a non-zero status; everything
    /// else is reported as data.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. } | Self::MigrationFailed { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Har,
    Zip,
    Raw,
}

impl ArchiveFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Har => "har",
            Self::Zip => "zip",
            Self::Raw => "raw",
        }
    }
}

/// Structural summary of an ingested archive.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssetMetrics {
    pub size_bytes: u64,
    pub archive_format: ArchiveFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_bytes: Option<u64>,
}

impl AssetMetrics {
    #[must_use]
    pub fn raw(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            archive_format: ArchiveFormat::Raw,
            entries_count: None,
            pages_count: None,
            body_bytes: None,
        }
    }
}

/// One ingested artifact. `(path, content_hash)` is unique in storage.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssetRecord {
    pub path: String,
    pub content_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub metrics: AssetMetrics,
}

/// A row from a source-of-record table naming a file and the hash it is expected to have.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReferenceRow {
    pub database: String,
    pub table: String,
    pub path: String,
    pub expected_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HealthCheck {
    pub database: String,
    pub result: String,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StaleEntry {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UnreadableEntry {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    Regenerate,
    Reingest,
}

impl RemediationAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regenerate => "regenerate",
            Self::Reingest => "reingest",
        }
    }
}

impl Display for RemediationAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RemediationOutcome {
    pub action: RemediationAction,
    pub paths: usize,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceScan {
    pub database: String,
    pub table: String,
    pub rows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
    /// Set when the table exists but reading it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditDetails {
    pub health: Vec<HealthCheck>,
    pub sources: Vec<SourceScan>,
    pub missing: Vec<String>,
    pub stale: Vec<StaleEntry>,
    pub stale_truncated: bool,
    pub unreadable: Vec<UnreadableEntry>,
    pub remediation: Vec<RemediationOutcome>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Clean,
    DriftDetected,
    Degraded,
}

impl AuditStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::DriftDetected => "drift_detected",
            Self::Degraded => "degraded",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "clean" => Some(Self::Clean),
            "drift_detected" => Some(Self::DriftDetected),
            "degraded" => Some(Self::Degraded),
            _ => None,
        }
    }

    /// Degraded wins over drift. Any failed health check, unreadable source table, unreadable
    /// file or failed remediation means the counts may be incomplete.
    #[must_use]
    pub fn classify(missing: usize, stale: usize, details: &AuditDetails) -> Self {
        let degraded = details.health.iter().any(|check| !check.ok)
            || details.sources.iter().any(|source| source.error.is_some())
            || !details.unreadable.is_empty()
            || details.remediation.iter().any(|outcome| !outcome.succeeded);
        if degraded {
            Self::Degraded
        } else if missing > 0 || stale > 0 {
            Self::DriftDetected
        } else {
            Self::Clean
        }
    }
}

/// One completed auditor run. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub scanned_paths: Vec<String>,
    pub missing_count: usize,
    pub stale_count: usize,
    pub regenerated_count: usize,
    pub reingested_count: usize,
    pub details: AuditDetails,
    pub status: AuditStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GenerationEvent {
    pub kind: String,
    pub source: String,
    pub target_path: String,
    pub template_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IngestEvent {
    pub kind: String,
    pub source: String,
    pub target_path: String,
    pub content_hash: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details_with_health(ok: bool) -> AuditDetails {
        AuditDetails {
            health: vec![HealthCheck {
                database: "enterprise.db".to_string(),
                result: if ok { "ok".to_string() } else { "*** in database main ***".to_string() },
                ok,
            }],
            ..AuditDetails::default()
        }
    }

    #[test]
    fn status_is_clean_without_drift() {
        let details = details_with_health(true);
        assert_eq!(AuditStatus::classify(0, 0, &details), AuditStatus::Clean);
    }

    #[test]
    fn status_reports_drift_for_missing_or_stale() {
        let details = details_with_health(true);
        assert_eq!(AuditStatus::classify(1, 0, &details), AuditStatus::DriftDetected);
        assert_eq!(AuditStatus::classify(0, 3, &details), AuditStatus::DriftDetected);
    }

    #[test]
    fn failed_health_check_degrades_status() {
        let details = details_with_health(false);
        assert_eq!(AuditStatus::classify(1, 1, &details), AuditStatus::Degraded);
    }

    #[test]
    fn failed_remediation_degrades_status() {
        let mut details = details_with_health(true);
        details.remediation.push(RemediationOutcome {
            action: RemediationAction::Regenerate,
            paths: 2,
            succeeded: false,
            error: Some("generator exited with status 1".to_string()),
        });
        assert_eq!(AuditStatus::classify(0, 2, &details), AuditStatus::Degraded);
    }

    #[test]
    fn unreadable_source_table_degrades_status() {
        let mut details = details_with_health(true);
        details.sources.push(SourceScan {
            database: "enterprise.db".to_string(),
            table: "generated_docs".to_string(),
            rows: 0,
            skipped_reason: None,
            error: Some("database disk image is malformed".to_string()),
        });
        assert_eq!(AuditStatus::classify(0, 0, &details), AuditStatus::Degraded);
    }

    #[test]
    fn status_strings_parse_back() {
        for status in [AuditStatus::Clean, AuditStatus::DriftDetected, AuditStatus::Degraded] {
            assert_eq!(AuditStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AuditStatus::parse("unknown"), None);
    }

    #[test]
    fn only_storage_and_migration_errors_are_fatal() {
        assert!(LedgerError::storage(Path::new("a.db"), "disk full").is_fatal());
        assert!(LedgerError::MigrationFailed { unit: "001".into(), reason: "x".into() }.is_fatal());
        assert!(!LedgerError::unreadable(Path::new("a.har"), "gone").is_fatal());
        assert!(!LedgerError::RemediationFailed { action: "regenerate".into(), reason: "x".into() }
            .is_fatal());
    }
}
