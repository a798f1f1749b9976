//! Asset record persistence.

use artifact_ledger_core::{AssetMetrics, AssetRecord};
use rusqlite::{params, Row, TransactionBehavior};

use crate::{parse_rfc3339, rfc3339, LedgerStore, Result, StorageContext};

const SELECT_ASSET_COLUMNS: &str = "SELECT path, COALESCE(content_hash, sha256), created_at,
        COALESCE(metrics_json, metrics), size_bytes
   FROM asset_records";

impl LedgerStore {
    /// Insert `records` in one `BEGIN IMMEDIATE` transaction.
    ///
    /// Rows already present under the same `(path, content_hash)` are left untouched. The returned
    /// vector holds, per input record, whether a new row was written. Both hash columns and both
    /// metrics columns are populated.
    ///
    /// # Errors
    /// Returns [`artifact_ledger_core::LedgerError::StorageUnavailable`] on any database failure;
    /// nothing from the batch is committed in that case.
    pub fn insert_assets(&mut self, records: &[AssetRecord]) -> Result<Vec<bool>> {
        let path = self.path().to_path_buf();
        let tx = self
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage(&path, "failed to begin ingestion transaction")?;

        let mut inserted = Vec::with_capacity(records.len());
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO asset_records(
                        path, content_hash, sha256, size_bytes, metrics, metrics_json, created_at
                     ) VALUES (?1, ?2, ?2, ?3, ?4, ?4, ?5)",
                )
                .storage(&path, "failed to prepare asset insert")?;

            for record in records {
                let metrics = serde_json::to_string(&record.metrics)
                    .storage(&path, "failed to serialize asset metrics")?;
                let created_at =
                    rfc3339(record.created_at).storage(&path, "failed to format created_at")?;
                let size = i64::try_from(record.metrics.size_bytes).unwrap_or(i64::MAX);
                let changed = stmt
                    .execute(params![record.path, record.content_hash, size, metrics, created_at])
                    .storage(&path, &format!("failed to insert asset {}", record.path))?;
                inserted.push(changed == 1);
            }
        }

        tx.commit().storage(&path, "failed to commit ingestion transaction")?;
        Ok(inserted)
    }

    /// Every recorded asset version, oldest first.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` when the table cannot be read.
    pub fn list_assets(&self) -> Result<Vec<AssetRecord>> {
        self.query_assets(&format!("{SELECT_ASSET_COLUMNS} ORDER BY id"), &[])
    }

    /// All versions recorded for one path, oldest first.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` when the table cannot be read.
    pub fn assets_for_path(&self, asset_path: &str) -> Result<Vec<AssetRecord>> {
        let sql = format!("{SELECT_ASSET_COLUMNS} WHERE path = ?1 ORDER BY id");
        self.query_assets(&sql, &[&asset_path])
    }

    /// # Errors
    /// Returns `StorageUnavailable` when the table cannot be read.
    pub fn asset_count(&self) -> Result<u64> {
        let count = self
            .connection()
            .query_row("SELECT COUNT(*) FROM asset_records", [], |row| row.get::<_, i64>(0))
            .storage(self.path(), "failed to count asset records")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn query_assets(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<AssetRecord>> {
        let mut stmt =
            self.connection().prepare(sql).storage(self.path(), "failed to prepare asset query")?;
        let rows =
            stmt.query_map(args, asset_from_row).storage(self.path(), "failed to query assets")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().storage(self.path(), "failed to read asset row")
    }
}

fn asset_from_row(row: &Row<'_>) -> rusqlite::Result<AssetRecord> {
    let created_at: String = row.get(2)?;
    let metrics_json: Option<String> = row.get(3)?;
    let size_bytes: Option<i64> = row.get(4)?;
    let size_bytes = u64::try_from(size_bytes.unwrap_or_default()).unwrap_or_default();

    // Older writers stored free-form metrics; keep the size and drop the rest.
    let metrics = metrics_json
        .and_then(|json| serde_json::from_str::<AssetMetrics>(&json).ok())
        .unwrap_or_else(|| AssetMetrics::raw(size_bytes));

    Ok(AssetRecord {
        path: row.get(0)?,
        content_hash: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        created_at: parse_rfc3339(2, &created_at)?,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::thread;

    use artifact_ledger_core::{ArchiveFormat, LedgerError};
    use time::OffsetDateTime;

    use super::*;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn record(path: &str, hash: &str) -> AssetRecord {
        AssetRecord {
            path: path.to_string(),
            content_hash: hash.to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
            metrics: AssetMetrics {
                size_bytes: 42,
                archive_format: ArchiveFormat::Har,
                entries_count: Some(3),
                pages_count: Some(1),
                body_bytes: Some(100),
            },
        }
    }

    fn migrated(path: &Path) -> Result<LedgerStore> {
        let mut store = LedgerStore::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    #[test]
    fn duplicate_path_and_hash_is_ignored() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut store = migrated(&dir.path().join("assets.db"))?;

        let first = store.insert_assets(&[record("a.har", "h1"), record("b.har", "h2")])?;
        let second = store.insert_assets(&[record("a.har", "h1")])?;

        assert_eq!(first, vec![true, true]);
        assert_eq!(second, vec![false]);
        assert_eq!(store.asset_count()?, 2);
        Ok(())
    }

    #[test]
    fn changed_content_adds_a_new_version() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut store = migrated(&dir.path().join("assets.db"))?;

        store.insert_assets(&[record("a.har", "h1")])?;
        store.insert_assets(&[record("a.har", "h2")])?;

        let versions = store.assets_for_path("a.har")?;
        let hashes = versions.iter().map(|asset| asset.content_hash.as_str()).collect::<Vec<_>>();
        assert_eq!(hashes, vec!["h1", "h2"]);
        Ok(())
    }

    #[test]
    fn both_column_names_are_written() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut store = migrated(&dir.path().join("assets.db"))?;
        store.insert_assets(&[record("a.har", "h1")])?;

        type Columns = (String, String, String, String, i64);
        let (sha256, content_hash, metrics, metrics_json, size): Columns =
            store.connection().query_row(
                "SELECT sha256, content_hash, metrics, metrics_json, size_bytes FROM asset_records",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;
        assert_eq!(sha256, content_hash);
        assert_eq!(metrics, metrics_json);
        assert_eq!(size, 42);

        let listed = store.list_assets()?;
        assert_eq!(listed, vec![record("a.har", "h1")]);
        Ok(())
    }

    #[test]
    fn failed_batch_commits_nothing() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut store = migrated(&dir.path().join("assets.db"))?;
        store.connection().execute_batch(
            "CREATE TRIGGER reject_poison BEFORE INSERT ON asset_records
             WHEN NEW.path = 'poison.har'
             BEGIN SELECT RAISE(ABORT, 'poisoned'); END;",
        )?;

        let result = store.insert_assets(&[record("a.har", "h1"), record("poison.har", "h2")]);
        assert!(matches!(result, Err(LedgerError::StorageUnavailable { .. })));
        assert_eq!(store.asset_count()?, 0);
        Ok(())
    }

    #[test]
    fn concurrent_writers_lose_nothing() -> TestResult {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("assets.db");
        migrated(&db_path)?;

        let writers: usize = 2;
        let per_writer: usize = 25;
        let mut handles = Vec::new();
        for writer in 0..writers {
            let writer_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let mut store = LedgerStore::open(&writer_path)?;
                for batch in 0..5 {
                    let records = (0..per_writer / 5)
                        .map(|i| {
                            let path = format!("w{writer}/b{batch}/{i}.har");
                            record(&path, &format!("h{writer}{batch}{i}"))
                        })
                        .collect::<Vec<_>>();
                    store.insert_assets(&records)?;
                    // Re-inserting the same batch concurrently must stay a no-op.
                    store.insert_assets(&records)?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(result) = handle.join() else {
                panic!("writer thread panicked");
            };
            result?;
        }

        let store = LedgerStore::open(&db_path)?;
        assert_eq!(store.asset_count()?, (writers * per_writer) as u64);
        assert!(store.health_check().ok);
        Ok(())
    }
}
