//! Batched, idempotent ingestion of trace archives.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use artifact_ledger_core::{
    extract_metrics, hash_file, AssetDiscoverer, AssetRecord, IngestEvent, LedgerError,
    UnreadableEntry,
};
use artifact_ledger_store_sqlite::{CheckpointReport, LedgerStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{settle_log_write, LogPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOptions {
    pub patterns: Vec<String>,
    /// Checkpoint the write-ahead log after the batch commits.
    pub checkpoint: bool,
    /// Without `checkpoint`, still checkpoint once the log grows past this size.
    pub checkpoint_threshold_bytes: Option<u64>,
    /// Written to `ingest_events.kind`.
    pub kind: String,
    /// Written to `ingest_events.source`.
    pub source: String,
    pub log_policy: LogPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            patterns: vec!["*.har".to_string(), "*.zip".to_string()],
            checkpoint: false,
            checkpoint_threshold_bytes: None,
            kind: "ingest".to_string(),
            source: "ledger".to_string(),
            log_policy: LogPolicy::BestEffort,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub discovered: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub errored: usize,
    pub errors: Vec<UnreadableEntry>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointReport>,
    pub events_logged: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_error: Option<String>,
}

/// Discover, hash and record every archive under `inputs`.
///
/// All records go into `assets` in a single transaction. Files that vanish or cannot be read are
/// counted in `errored` and do not stop the batch. When `analytics` is given, one ingest event per
/// inserted or errored archive is appended after the commit.
///
/// # Errors
/// Returns [`LedgerError::InvalidPattern`] for a bad glob and [`LedgerError::StorageUnavailable`]
/// when the batch or checkpoint fails; a failed batch commits nothing.
pub fn ingest(
    assets: &mut LedgerStore,
    analytics: Option<&mut LedgerStore>,
    inputs: &[PathBuf],
    options: &IngestOptions,
) -> Result<IngestSummary, LedgerError> {
    let started = Instant::now();
    let discoverer =
        AssetDiscoverer::new(inputs.iter().cloned(), options.patterns.iter().cloned())?;

    let mut summary = IngestSummary::default();
    let mut records = Vec::new();
    for path in &discoverer {
        summary.discovered += 1;
        match prepare_record(&path) {
            Ok(record) => {
                tracing::debug!(
                    path = %path.display(),
                    hash = %record.content_hash,
                    "hashed archive"
                );
                records.push(record);
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable archive");
                summary.errors.push(UnreadableEntry {
                    path: path.display().to_string(),
                    error: err.to_string(),
                });
            }
        }
    }
    summary.errored = summary.errors.len();

    let inserted = assets.insert_assets(&records)?;
    summary.inserted = inserted.iter().filter(|fresh| **fresh).count();
    summary.skipped = inserted.len() - summary.inserted;

    summary.checkpoint = if options.checkpoint {
        Some(assets.checkpoint()?)
    } else if let Some(threshold) = options.checkpoint_threshold_bytes {
        assets.checkpoint_if_wal_exceeds(threshold)?
    } else {
        None
    };

    if let Some(analytics) = analytics {
        let events = ingest_events(&records, &inserted, &summary.errors, options);
        let (logged, log_error) = settle_log_write(
            analytics.append_ingest_events(&events),
            options.log_policy,
            "ingest events",
        )?;
        summary.events_logged = logged.unwrap_or_default();
        summary.log_error = log_error;
    }

    summary.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::info!(
        db = %assets.path().display(),
        discovered = summary.discovered,
        inserted = summary.inserted,
        skipped = summary.skipped,
        errored = summary.errored,
        duration_ms = summary.duration_ms,
        "ingestion finished"
    );
    Ok(summary)
}

fn prepare_record(path: &Path) -> Result<AssetRecord, LedgerError> {
    let size_bytes = fs::metadata(path).map_err(|err| LedgerError::unreadable(path, err))?.len();
    let content_hash = hash_file(path)?;
    Ok(AssetRecord {
        path: path.display().to_string(),
        content_hash,
        created_at: OffsetDateTime::now_utc(),
        metrics: extract_metrics(path, size_bytes),
    })
}

fn ingest_events(
    records: &[AssetRecord],
    inserted: &[bool],
    errors: &[UnreadableEntry],
    options: &IngestOptions,
) -> Vec<IngestEvent> {
    let now = OffsetDateTime::now_utc();
    let fresh = records.iter().zip(inserted).filter(|(_, fresh)| **fresh).map(|(record, _)| {
        IngestEvent {
            kind: options.kind.clone(),
            source: options.source.clone(),
            target_path: record.path.clone(),
            content_hash: Some(record.content_hash.clone()),
            created_at: now,
            error: None,
        }
    });
    let failed = errors.iter().map(|entry| IngestEvent {
        kind: options.kind.clone(),
        source: options.source.clone(),
        target_path: entry.path.clone(),
        content_hash: None,
        created_at: now,
        error: Some(entry.error.clone()),
    });
    fresh.chain(failed).collect()
}
