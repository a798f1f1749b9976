//! YAML configuration for ledger runs.
//!
//! Every field has a default so an empty file (or no file) is a valid configuration. Command-line
//! flags override what is loaded here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use artifact_ledger_core::LedgerError;
use artifact_ledger_store_sqlite::{ConnectionConfig, DEFAULT_CHECKPOINT_THRESHOLD_BYTES};
use serde::{Deserialize, Serialize};

/// What to do when an audit or ingest event cannot be appended to the analytics database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogPolicy {
    /// Record the failure in the returned report and carry on.
    #[default]
    BestEffort,
    /// Fail the run with `StorageUnavailable`.
    Required,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub databases: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database holding `asset_records`.
    #[serde(default)]
    pub assets: Option<PathBuf>,
    /// Database holding the event logs.
    #[serde(default)]
    pub analytics: Option<PathBuf>,
    /// Source-of-record databases scanned by the auditor.
    #[serde(default)]
    pub sources: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub checkpoint: bool,
    #[serde(default = "default_checkpoint_threshold_bytes")]
    pub checkpoint_threshold_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(default = "default_roots")]
    pub roots: Vec<PathBuf>,
    #[serde(default = "default_source_tables")]
    pub source_tables: Vec<String>,
    #[serde(default = "default_stale_detail_limit")]
    pub stale_detail_limit: usize,
    #[serde(default)]
    pub log_policy: LogPolicy,
    /// Program plus leading arguments; affected paths are appended.
    #[serde(default)]
    pub regenerate_command: Vec<String>,
    #[serde(default)]
    pub reingest_command: Vec<String>,
}

fn default_busy_timeout_ms() -> u64 {
    30_000
}

fn default_patterns() -> Vec<String> {
    vec!["*.har".to_string(), "*.zip".to_string()]
}

fn default_checkpoint_threshold_bytes() -> u64 {
    DEFAULT_CHECKPOINT_THRESHOLD_BYTES
}

fn default_roots() -> Vec<PathBuf> {
    vec![PathBuf::from(".")]
}

fn default_source_tables() -> Vec<String> {
    vec!["asset_records".to_string()]
}

fn default_stale_detail_limit() -> usize {
    50
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            databases: DatabaseConfig::default(),
            ingest: IngestConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            patterns: default_patterns(),
            checkpoint: false,
            checkpoint_threshold_bytes: default_checkpoint_threshold_bytes(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            source_tables: default_source_tables(),
            stale_detail_limit: default_stale_detail_limit(),
            log_policy: LogPolicy::default(),
            regenerate_command: Vec::new(),
            reingest_command: Vec::new(),
        }
    }
}

impl LedgerConfig {
    /// # Errors
    /// Returns [`LedgerError::Config`] when the file cannot be read, parsed, or validated.
    pub fn from_path(path: &Path) -> Result<Self, LedgerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| LedgerError::Config(format!("{}: {err}", path.display())))?;
        Self::parse(&content)
    }

    /// # Errors
    /// Returns [`LedgerError::Config`] when the YAML is malformed or fails validation.
    pub fn parse(yaml: &str) -> Result<Self, LedgerError> {
        // serde_yaml reads an empty document as unit, not as an empty mapping.
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|err| LedgerError::Config(err.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`LedgerError::Config`] naming the first invalid setting.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.busy_timeout_ms == 0 {
            return Err(LedgerError::Config("busy_timeout_ms must be greater than zero".into()));
        }
        if self.ingest.patterns.is_empty() {
            return Err(LedgerError::Config("ingest.patterns must not be empty".into()));
        }
        if let Some(pattern) = self.ingest.patterns.iter().find(|p| p.trim().is_empty()) {
            return Err(LedgerError::InvalidPattern {
                pattern: pattern.clone(),
                reason: "pattern is blank".into(),
            });
        }
        if self.audit.roots.is_empty() {
            return Err(LedgerError::Config("audit.roots must not be empty".into()));
        }
        if self.audit.stale_detail_limit == 0 {
            return Err(LedgerError::Config(
                "audit.stale_detail_limit must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig { busy_timeout: Duration::from_millis(self.busy_timeout_ms) }
    }
}
