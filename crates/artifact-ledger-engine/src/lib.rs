//! Ingestion and consistency auditing on top of the ledger store.

use artifact_ledger_core::LedgerError;

pub mod audit;
pub mod config;
pub mod ingest;

pub use audit::{AuditOptions, AuditReport, Auditor, Remediator};
pub use config::{AuditConfig, DatabaseConfig, IngestConfig, LedgerConfig, LogPolicy};
pub use ingest::{ingest, IngestOptions, IngestSummary};

/// Apply `policy` to the outcome of an event-log write.
///
/// Under [`LogPolicy::BestEffort`] a failure is logged and handed back as text for the caller's
/// report; under [`LogPolicy::Required`] it is returned as an error.
pub(crate) fn settle_log_write<T>(
    outcome: Result<T, LedgerError>,
    policy: LogPolicy,
    what: &str,
) -> Result<(Option<T>, Option<String>), LedgerError> {
    match outcome {
        Ok(value) => Ok((Some(value), None)),
        Err(err) if policy == LogPolicy::Required => Err(err),
        Err(err) => {
            tracing::warn!(error = %err, "failed to record {what}; continuing");
            Ok((None, Some(err.to_string())))
        }
    }
}
