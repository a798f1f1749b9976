//! The consistency auditor: reconcile recorded hashes against the filesystem.
//!
//! A run moves through these phases:
//!
//! `Started -> HealthCheck -> Scanning -> Classifying -> [Remediating] -> Logging -> Finished`
//!
//! Only storage failures on the analytics side (under [`LogPolicy::Required`]) end a run early.
//! Everything else, including corrupt source databases and failed remediation, is reported in
//! the [`AuditEvent`] details.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use artifact_ledger_core::{
    hash_file, normalize_digest, AuditDetails, AuditEvent, AuditStatus, GenerationEvent,
    LedgerError, ReferenceRow, RemediationAction, RemediationOutcome, StaleEntry, UnreadableEntry,
};
use artifact_ledger_store_sqlite::LedgerStore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{settle_log_write, LogPolicy};

/// An external action run over a batch of paths, such as regenerating documents from their
/// templates or re-running ingestion. The returned error text is recorded, never raised.
pub trait Remediator {
    /// # Errors
    /// Returns a human-readable reason when the action did not succeed.
    fn remediate(&mut self, paths: &[PathBuf]) -> Result<(), String>;
}

impl<F> Remediator for F
where
    F: FnMut(&[PathBuf]) -> Result<(), String>,
{
    fn remediate(&mut self, paths: &[PathBuf]) -> Result<(), String> {
        self(paths)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditOptions {
    /// Relative reference paths are resolved against these, first match wins.
    pub roots: Vec<PathBuf>,
    pub source_tables: Vec<String>,
    pub stale_detail_limit: usize,
    pub log_policy: LogPolicy,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            roots: vec![PathBuf::from(".")],
            source_tables: vec!["asset_records".to_string()],
            stale_detail_limit: 50,
            log_policy: LogPolicy::BestEffort,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditReport {
    pub event: AuditEvent,
    /// Row id of the appended audit event, absent when the write failed.
    pub audit_event_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Started,
    HealthCheck,
    Scanning,
    Classifying,
    Remediating,
    Logging,
    Finished,
}

/// One drifted reference row and the filesystem path it was checked at.
struct Resolved<'a> {
    row: &'a ReferenceRow,
    path: PathBuf,
}

pub struct Auditor<'a> {
    options: AuditOptions,
    regenerator: Option<Box<dyn Remediator + 'a>>,
    reingester: Option<Box<dyn Remediator + 'a>>,
}

impl<'a> Auditor<'a> {
    #[must_use]
    pub fn new(options: AuditOptions) -> Self {
        Self { options, regenerator: None, reingester: None }
    }

    /// Regenerate stale artifacts after classification.
    #[must_use]
    pub fn with_regenerator(mut self, remediator: impl Remediator + 'a) -> Self {
        self.regenerator = Some(Box::new(remediator));
        self
    }

    /// Re-ingest missing and stale artifacts after classification.
    #[must_use]
    pub fn with_reingester(mut self, remediator: impl Remediator + 'a) -> Self {
        self.reingester = Some(Box::new(remediator));
        self
    }

    #[must_use]
    pub fn options(&self) -> &AuditOptions {
        &self.options
    }

    /// Audit every source database and append one event to `analytics`.
    ///
    /// A source table that cannot be read is recorded in the event's `sources` and degrades the
    /// run.
    ///
    /// # Errors
    /// Returns [`LedgerError::StorageUnavailable`] when the audit trail cannot be written and the
    /// log policy is [`LogPolicy::Required`].
    pub fn run(
        &mut self,
        sources: &[LedgerStore],
        analytics: &mut LedgerStore,
    ) -> Result<AuditReport, LedgerError> {
        enter(Phase::Started);
        let started_at = OffsetDateTime::now_utc();
        let mut details = AuditDetails::default();

        enter(Phase::HealthCheck);
        details.health = sources.iter().map(LedgerStore::health_check).collect();
        details.health.push(analytics.health_check());

        enter(Phase::Scanning);
        let mut rows = Vec::new();
        for source in sources {
            let scan = source.load_reference_rows(&self.options.source_tables);
            rows.extend(scan.rows);
            details.sources.extend(scan.tables);
        }

        enter(Phase::Classifying);
        let classified = self.classify(&rows, &mut details);

        let mut regenerated_count = 0;
        let mut reingested_count = 0;
        let mut generation_events = Vec::new();
        if self.regenerator.is_some() || self.reingester.is_some() {
            enter(Phase::Remediating);
            let stale_paths = classified.stale.iter().map(|r| r.path.clone()).collect::<Vec<_>>();
            if let Some(regenerator) = self.regenerator.as_mut() {
                if !stale_paths.is_empty() {
                    let outcome =
                        remediate(&mut **regenerator, RemediationAction::Regenerate, &stale_paths);
                    if outcome.succeeded {
                        regenerated_count = stale_paths.len();
                        generation_events = generation_events_for(&classified.stale);
                    }
                    details.remediation.push(outcome);
                }
            }
            if let Some(reingester) = self.reingester.as_mut() {
                let mut targets =
                    classified.missing.iter().map(|r| r.path.clone()).collect::<Vec<_>>();
                targets.extend(stale_paths.iter().cloned());
                if !targets.is_empty() {
                    let outcome =
                        remediate(&mut **reingester, RemediationAction::Reingest, &targets);
                    if outcome.succeeded {
                        reingested_count = targets.len();
                    }
                    details.remediation.push(outcome);
                }
            }
        }

        enter(Phase::Logging);
        let mut log_errors = Vec::new();
        if !generation_events.is_empty() {
            let (_, error) = settle_log_write(
                analytics.append_generation_events(&generation_events),
                self.options.log_policy,
                "generation events",
            )?;
            log_errors.extend(error);
        }

        let missing_count = details.missing.len();
        let stale_count = classified.stale.len();
        let status = AuditStatus::classify(missing_count, stale_count, &details);
        let scanned_paths =
            self.options.roots.iter().map(|root| root.display().to_string()).collect();
        let event = AuditEvent {
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            scanned_paths,
            missing_count,
            stale_count,
            regenerated_count,
            reingested_count,
            details,
            status,
        };
        let (audit_event_id, error) = settle_log_write(
            analytics.append_audit_event(&event),
            self.options.log_policy,
            "audit event",
        )?;
        log_errors.extend(error);

        enter(Phase::Finished);
        tracing::info!(
            missing = event.missing_count,
            stale = event.stale_count,
            regenerated = event.regenerated_count,
            reingested = event.reingested_count,
            status = event.status.as_str(),
            "audit finished"
        );
        Ok(AuditReport {
            event,
            audit_event_id,
            log_error: if log_errors.is_empty() { None } else { Some(log_errors.join("; ")) },
        })
    }

    /// A missing path is counted once, however many rows or expected hashes reference it.
    fn classify<'r>(&self, rows: &'r [ReferenceRow], details: &mut AuditDetails) -> Classified<'r> {
        let mut classified = Classified::default();
        let mut seen = BTreeSet::new();
        let mut missing = BTreeSet::new();
        let mut hashes: BTreeMap<PathBuf, Result<String, String>> = BTreeMap::new();

        for row in rows {
            let expected = row.expected_hash.as_deref().map(normalize_digest);
            if !seen.insert((row.path.clone(), expected.clone())) {
                continue;
            }

            let (path, exists) = self.resolve(&row.path);
            if !exists {
                if missing.insert(row.path.clone()) {
                    tracing::debug!(
                        path = %row.path,
                        table = %row.table,
                        "referenced file is missing"
                    );
                    details.missing.push(row.path.clone());
                    classified.missing.push(Resolved { row, path });
                }
                continue;
            }
            let Some(expected) = expected else {
                continue;
            };

            let actual = hashes
                .entry(path.clone())
                .or_insert_with(|| hash_file(&path).map_err(|err| err.to_string()))
                .clone();
            match actual {
                Ok(actual) if actual == expected => {}
                Ok(actual) => {
                    tracing::debug!(
                        path = %row.path,
                        %expected,
                        %actual,
                        "referenced file is stale"
                    );
                    if details.stale.len() < self.options.stale_detail_limit {
                        details.stale.push(StaleEntry { path: row.path.clone(), expected, actual });
                    } else {
                        details.stale_truncated = true;
                    }
                    classified.stale.push(Resolved { row, path });
                }
                Err(error) => {
                    details.unreadable.push(UnreadableEntry { path: row.path.clone(), error });
                }
            }
        }

        classified
    }

    /// Absolute paths are used as-is; relative ones resolve against the first root that has
    /// them. A path found under no root is reported against the first root.
    fn resolve(&self, reference: &str) -> (PathBuf, bool) {
        let path = Path::new(reference);
        if path.is_absolute() {
            return (path.to_path_buf(), path.exists());
        }
        match self.options.roots.iter().map(|root| root.join(path)).find(|c| c.exists()) {
            Some(found) => (found, true),
            None => {
                let fallback = self
                    .options
                    .roots
                    .first()
                    .map_or_else(|| path.to_path_buf(), |root| root.join(path));
                (fallback, false)
            }
        }
    }
}

#[derive(Default)]
struct Classified<'a> {
    missing: Vec<Resolved<'a>>,
    stale: Vec<Resolved<'a>>,
}

fn enter(phase: Phase) {
    tracing::debug!(?phase, "audit phase");
}

fn remediate<R: Remediator + ?Sized>(
    remediator: &mut R,
    action: RemediationAction,
    paths: &[PathBuf],
) -> RemediationOutcome {
    match remediator.remediate(paths) {
        Ok(()) => RemediationOutcome { action, paths: paths.len(), succeeded: true, error: None },
        Err(reason) => {
            let err = LedgerError::RemediationFailed { action: action.to_string(), reason };
            tracing::warn!(error = %err, paths = paths.len(), "remediation failed");
            RemediationOutcome {
                action,
                paths: paths.len(),
                succeeded: false,
                error: Some(err.to_string()),
            }
        }
    }
}

fn generation_events_for(stale: &[Resolved<'_>]) -> Vec<GenerationEvent> {
    let now = OffsetDateTime::now_utc();
    stale
        .iter()
        .map(|resolved| GenerationEvent {
            kind: RemediationAction::Regenerate.as_str().to_string(),
            source: resolved.row.database.clone(),
            target_path: resolved.row.path.clone(),
            template_id: Some(resolved.row.table.clone()),
            created_at: now,
            error: None,
        })
        .collect()
}
