//! Reading `path`/hash rows from source-of-record tables.

use artifact_ledger_core::{ReferenceRow, SourceScan};

use crate::{is_identifier, LedgerStore, Result, StorageContext};

/// Rows loaded from one database plus a per-table account of what was read or skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceScan {
    pub rows: Vec<ReferenceRow>,
    pub tables: Vec<SourceScan>,
}

impl LedgerStore {
    /// Load every `(path, expected_hash)` pair from `tables`.
    ///
    /// The hash is read from `content_hash` or `sha256`, whichever exists (preferring a non-null
    /// `content_hash` when both do). Tables that are absent, lack a `path` column, or carry an
    /// unsafe name are skipped. A table that exists but cannot be read is skipped too, with the
    /// storage error kept in [`SourceScan::error`]. Both cases are reported in
    /// [`ReferenceScan::tables`].
    #[must_use]
    pub fn load_reference_rows(&self, tables: &[String]) -> ReferenceScan {
        let database = self.label();
        let mut scan = ReferenceScan::default();

        for table in tables {
            let mut entry = SourceScan {
                database: database.clone(),
                table: table.clone(),
                rows: 0,
                skipped_reason: None,
                error: None,
            };
            match self.read_table(table) {
                Ok(TableRows::Skipped(reason)) => entry.skipped_reason = Some(reason.to_string()),
                Ok(TableRows::Read(rows)) => {
                    entry.rows = rows.len();
                    scan.rows.extend(rows.into_iter().map(|(path, expected_hash)| ReferenceRow {
                        database: database.clone(),
                        table: table.clone(),
                        path,
                        expected_hash: expected_hash.filter(|hash| !hash.trim().is_empty()),
                    }));
                }
                Err(err) => {
                    tracing::warn!(
                        db = %self.path().display(),
                        table = %table,
                        error = %err,
                        "source table unreadable"
                    );
                    entry.skipped_reason = Some("table could not be read".to_string());
                    entry.error = Some(err.to_string());
                }
            }
            scan.tables.push(entry);
        }

        scan
    }

    fn read_table(&self, table: &str) -> Result<TableRows> {
        if !is_identifier(table) {
            return Ok(TableRows::Skipped("table name is not a plain identifier"));
        }
        let columns = self.table_columns(table)?;
        if columns.is_empty() {
            tracing::debug!(db = %self.path().display(), table = %table, "source table absent");
            return Ok(TableRows::Skipped("table does not exist"));
        }
        if !columns.iter().any(|column| column == "path") {
            return Ok(TableRows::Skipped("table has no path column"));
        }

        let has = |name: &str| columns.iter().any(|column| column == name);
        let hash_expr = match (has("content_hash"), has("sha256")) {
            (true, true) => "COALESCE(content_hash, sha256)",
            (true, false) => "content_hash",
            (false, true) => "sha256",
            (false, false) => "NULL",
        };
        let sql = format!("SELECT path, {hash_expr} FROM {table} WHERE path IS NOT NULL");
        self.read_pairs(&sql).map(TableRows::Read)
    }

    fn read_pairs(&self, sql: &str) -> Result<Vec<(String, Option<String>)>> {
        let mut stmt = self
            .connection()
            .prepare(sql)
            .storage(self.path(), "failed to prepare reference query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)))
            .storage(self.path(), "failed to query reference rows")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .storage(self.path(), "failed to read reference row")
    }
}

enum TableRows {
    Skipped(&'static str),
    Read(Vec<(String, Option<String>)>),
}
