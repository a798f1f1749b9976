//! Append-only event logs: audit runs, generation and ingestion events.
//!
//! Only inserts and reads live here. `UPDATE` and `DELETE` on these tables are rejected by
//! triggers installed by the migrations.

use artifact_ledger_core::{AuditEvent, AuditStatus, GenerationEvent, IngestEvent};
use rusqlite::types::Type;
use rusqlite::{params, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::{parse_rfc3339, rfc3339, LedgerStore, Result, StorageContext};

/// An event together with the row id it was stored under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stored<T> {
    pub id: i64,
    #[serde(flatten)]
    pub event: T,
}

fn count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn usize_at(row: &Row<'_>, index: usize) -> rusqlite::Result<usize> {
    Ok(usize::try_from(row.get::<_, i64>(index)?).unwrap_or_default())
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, index: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
    })
}

fn time_at(row: &Row<'_>, index: usize) -> rusqlite::Result<time::OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339(index, &raw)
}

impl LedgerStore {
    /// Append one audit run and return its row id.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` when the row cannot be written.
    pub fn append_audit_event(&mut self, event: &AuditEvent) -> Result<i64> {
        let path = self.path().to_path_buf();
        let scanned = serde_json::to_string(&event.scanned_paths)
            .storage(&path, "failed to serialize scanned paths")?;
        let details =
            serde_json::to_string(&event.details).storage(&path, "failed to serialize details")?;
        let started_at = rfc3339(event.started_at).storage(&path, "failed to format started_at")?;
        let finished_at =
            rfc3339(event.finished_at).storage(&path, "failed to format finished_at")?;

        let conn = self.connection();
        conn.execute(
            "INSERT INTO audit_events(
                started_at, finished_at, scanned_paths, missing_count, stale_count,
                regenerated_count, reingested_count, details, status
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                started_at,
                finished_at,
                scanned,
                count(event.missing_count),
                count(event.stale_count),
                count(event.regenerated_count),
                count(event.reingested_count),
                details,
                event.status.as_str(),
            ],
        )
        .storage(&path, "failed to append audit event")?;
        Ok(conn.last_insert_rowid())
    }

    /// Append generation events in one transaction.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` when any row cannot be written; none are kept in that case.
    pub fn append_generation_events(&mut self, events: &[GenerationEvent]) -> Result<usize> {
        let path = self.path().to_path_buf();
        let tx = self
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage(&path, "failed to begin generation event transaction")?;
        for event in events {
            let created_at =
                rfc3339(event.created_at).storage(&path, "failed to format created_at")?;
            tx.execute(
                "INSERT INTO generation_events(
                     kind, source, target_path, template_id, created_at, error
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.kind,
                    event.source,
                    event.target_path,
                    event.template_id,
                    created_at,
                    event.error
                ],
            )
            .storage(&path, "failed to append generation event")?;
        }
        tx.commit().storage(&path, "failed to commit generation events")?;
        Ok(events.len())
    }

    /// Append ingestion events in one transaction.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` when any row cannot be written; none are kept in that case.
    pub fn append_ingest_events(&mut self, events: &[IngestEvent]) -> Result<usize> {
        let path = self.path().to_path_buf();
        let tx = self
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage(&path, "failed to begin ingest event transaction")?;
        for event in events {
            let created_at =
                rfc3339(event.created_at).storage(&path, "failed to format created_at")?;
            tx.execute(
                "INSERT INTO ingest_events(
                     kind, source, target_path, content_hash, created_at, error
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.kind,
                    event.source,
                    event.target_path,
                    event.content_hash,
                    created_at,
                    event.error
                ],
            )
            .storage(&path, "failed to append ingest event")?;
        }
        tx.commit().storage(&path, "failed to commit ingest events")?;
        Ok(events.len())
    }

    /// # Errors
    /// Returns `StorageUnavailable` when the table cannot be read or a row is malformed.
    pub fn list_audit_events(&self) -> Result<Vec<Stored<AuditEvent>>> {
        self.list_events(
            "SELECT id, started_at, finished_at, scanned_paths, missing_count, stale_count,
                    regenerated_count, reingested_count, details, status
               FROM audit_events ORDER BY id",
            |row| {
                let status: String = row.get(9)?;
                let status = AuditStatus::parse(&status).ok_or_else(|| {
                    rusqlite::Error::InvalidColumnType(9, status.clone(), Type::Text)
                })?;
                Ok(Stored {
                    id: row.get(0)?,
                    event: AuditEvent {
                        started_at: time_at(row, 1)?,
                        finished_at: time_at(row, 2)?,
                        scanned_paths: json_at(row, 3)?,
                        missing_count: usize_at(row, 4)?,
                        stale_count: usize_at(row, 5)?,
                        regenerated_count: usize_at(row, 6)?,
                        reingested_count: usize_at(row, 7)?,
                        details: json_at(row, 8)?,
                        status,
                    },
                })
            },
        )
    }

    /// # Errors
    /// Returns `StorageUnavailable` when the table cannot be read or a row is malformed.
    pub fn list_generation_events(&self) -> Result<Vec<Stored<GenerationEvent>>> {
        self.list_events(
            "SELECT id, kind, source, target_path, template_id, created_at, error
               FROM generation_events ORDER BY id",
            |row| {
                Ok(Stored {
                    id: row.get(0)?,
                    event: GenerationEvent {
                        kind: row.get(1)?,
                        source: row.get(2)?,
                        target_path: row.get(3)?,
                        template_id: row.get(4)?,
                        created_at: time_at(row, 5)?,
                        error: row.get(6)?,
                    },
                })
            },
        )
    }

    /// # Errors
    /// Returns `StorageUnavailable` when the table cannot be read or a row is malformed.
    pub fn list_ingest_events(&self) -> Result<Vec<Stored<IngestEvent>>> {
        self.list_events(
            "SELECT id, kind, source, target_path, content_hash, created_at, error
               FROM ingest_events ORDER BY id",
            |row| {
                Ok(Stored {
                    id: row.get(0)?,
                    event: IngestEvent {
                        kind: row.get(1)?,
                        source: row.get(2)?,
                        target_path: row.get(3)?,
                        content_hash: row.get(4)?,
                        created_at: time_at(row, 5)?,
                        error: row.get(6)?,
                    },
                })
            },
        )
    }

    fn list_events<T>(
        &self,
        sql: &str,
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let mut stmt =
            self.connection().prepare(sql).storage(self.path(), "failed to prepare event query")?;
        let rows = stmt.query_map([], map).storage(self.path(), "failed to query events")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().storage(self.path(), "failed to read event row")
    }
}
