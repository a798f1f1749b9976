//! Schema migrations: declarative SQL units followed by imperative upgrade routines.
//!
//! Declarative units are plain `CREATE ... IF NOT EXISTS` scripts. Upgrade routines handle the
//! changes SQL alone cannot express safely, such as adding a column only when an older database
//! file lacks it. Each unit runs in its own transaction and is recorded in `schema_migrations`.

use std::fs;
use std::path::Path;

use artifact_ledger_core::LedgerError;
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{rfc3339, table_exists, table_has_column, LedgerStore, Result, StorageContext};

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  unit TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('declarative','routine')),
  applied_at TEXT NOT NULL
);
";

const BUILTIN_UNITS: [(&str, &str); 3] = [
    ("0001_asset_records.sql", include_str!("../migrations/0001_asset_records.sql")),
    ("0002_analytics_events.sql", include_str!("../migrations/0002_analytics_events.sql")),
    ("0003_append_only_guards.sql", include_str!("../migrations/0003_append_only_guards.sql")),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclarativeUnit {
    pub name: String,
    pub sql: String,
}

/// An imperative upgrade step. `apply` must inspect the schema before changing it so that
/// repeated runs are no-ops.
#[derive(Debug, Clone, Copy)]
pub struct UpgradeRoutine {
    pub name: &'static str,
    pub apply: fn(&Connection) -> rusqlite::Result<()>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub declarative: Vec<String>,
    pub routines: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MigrationRunner {
    units: Vec<DeclarativeUnit>,
    routines: Vec<UpgradeRoutine>,
}

impl MigrationRunner {
    /// Runner over the units compiled into this crate plus the built-in upgrade routines.
    #[must_use]
    pub fn builtin() -> Self {
        let units = BUILTIN_UNITS
            .iter()
            .map(|(name, sql)| DeclarativeUnit {
                name: (*name).to_string(),
                sql: (*sql).to_string(),
            })
            .collect();
        Self { units, routines: builtin_routines() }
    }

    /// Runner over every `*.sql` file in `dir`, plus the built-in upgrade routines.
    ///
    /// # Errors
    /// Returns [`LedgerError::MigrationFailed`] when the directory or a unit cannot be read.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let read_failed = |reason: String| LedgerError::MigrationFailed {
            unit: dir.display().to_string(),
            reason,
        };

        let mut units = Vec::new();
        for entry in fs::read_dir(dir).map_err(|err| read_failed(err.to_string()))? {
            let path = entry.map_err(|err| read_failed(err.to_string()))?.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
                continue;
            }
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let sql = fs::read_to_string(&path).map_err(|err| LedgerError::MigrationFailed {
                unit: name.clone(),
                reason: err.to_string(),
            })?;
            units.push(DeclarativeUnit { name, sql });
        }

        Ok(Self { units, routines: builtin_routines() })
    }

    #[must_use]
    pub fn with_routine(mut self, routine: UpgradeRoutine) -> Self {
        self.routines.push(routine);
        self
    }

    #[must_use]
    pub fn units(&self) -> &[DeclarativeUnit] {
        &self.units
    }

    /// Names of every declarative unit and routine this runner would apply, in run order.
    #[must_use]
    pub fn unit_names(&self) -> Vec<String> {
        let mut declarative = self.units.iter().map(|unit| unit.name.clone()).collect::<Vec<_>>();
        declarative.sort();
        let mut routines =
            self.routines.iter().map(|routine| routine.name.to_string()).collect::<Vec<_>>();
        routines.sort();
        declarative.extend(routines);
        declarative
    }

    /// Apply every declarative unit, then every routine, each group in lexical-name order.
    ///
    /// A failing unit stops the run; units applied before it stay applied.
    ///
    /// # Errors
    /// Returns [`LedgerError::MigrationFailed`] naming the failing unit, or
    /// [`LedgerError::StorageUnavailable`] when the bookkeeping table cannot be created.
    pub fn run(&self, store: &mut LedgerStore) -> Result<MigrationReport> {
        let path = store.path().to_path_buf();
        store
            .connection()
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .storage(&path, "failed to create schema_migrations")?;

        let mut units = self.units.iter().collect::<Vec<_>>();
        units.sort_by(|a, b| a.name.cmp(&b.name));
        let mut routines = self.routines.clone();
        routines.sort_by_key(|routine| routine.name);

        let mut report = MigrationReport::default();
        let conn = store.connection_mut();

        for unit in units {
            apply_unit(conn, &unit.name, "declarative", |conn| conn.execute_batch(&unit.sql))?;
            report.declarative.push(unit.name.clone());
        }
        for routine in routines {
            apply_unit(conn, routine.name, "routine", routine.apply)?;
            report.routines.push(routine.name.to_string());
        }

        tracing::info!(
            db = %path.display(),
            declarative = report.declarative.len(),
            routines = report.routines.len(),
            "migrations applied"
        );
        Ok(report)
    }
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::builtin()
    }
}

fn apply_unit(
    conn: &mut Connection,
    name: &str,
    kind: &str,
    apply: impl FnOnce(&Connection) -> rusqlite::Result<()>,
) -> Result<()> {
    let failed = |err: rusqlite::Error| LedgerError::MigrationFailed {
        unit: name.to_string(),
        reason: err.to_string(),
    };

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).map_err(failed)?;
    apply(&tx).map_err(failed)?;
    let applied_at = rfc3339(OffsetDateTime::now_utc()).map_err(failed)?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations(unit, kind, applied_at) VALUES (?1, ?2, ?3)",
        params![name, kind, applied_at],
    )
    .map_err(failed)?;
    tx.commit().map_err(failed)?;

    tracing::debug!(unit = name, kind, "migration unit applied");
    Ok(())
}

fn builtin_routines() -> Vec<UpgradeRoutine> {
    vec![
        UpgradeRoutine { name: "0001_dual_hash_columns", apply: dual_hash_columns },
        UpgradeRoutine { name: "0002_dual_metrics_columns", apply: dual_metrics_columns },
        UpgradeRoutine { name: "0003_size_bytes_column", apply: size_bytes_column },
    ]
}

fn dual_hash_columns(conn: &Connection) -> rusqlite::Result<()> {
    if !table_exists(conn, "asset_records")? {
        return Ok(());
    }

    for column in ["content_hash", "sha256"] {
        if !table_has_column(conn, "asset_records", column)? {
            conn.execute_batch(&format!("ALTER TABLE asset_records ADD COLUMN {column} TEXT;"))?;
        }
    }
    conn.execute_batch(
        "UPDATE asset_records SET sha256 = content_hash
           WHERE sha256 IS NULL AND content_hash IS NOT NULL;
         UPDATE asset_records SET content_hash = sha256
           WHERE content_hash IS NULL AND sha256 IS NOT NULL;
         CREATE UNIQUE INDEX IF NOT EXISTS idx_asset_records_path_hash
           ON asset_records(path, content_hash);
         CREATE INDEX IF NOT EXISTS idx_asset_records_hash ON asset_records(content_hash);",
    )
}

fn dual_metrics_columns(conn: &Connection) -> rusqlite::Result<()> {
    if !table_exists(conn, "asset_records")? {
        return Ok(());
    }

    for column in ["metrics", "metrics_json"] {
        if !table_has_column(conn, "asset_records", column)? {
            conn.execute_batch(&format!("ALTER TABLE asset_records ADD COLUMN {column} TEXT;"))?;
        }
    }
    conn.execute_batch(
        "UPDATE asset_records SET metrics_json = metrics
           WHERE metrics_json IS NULL AND metrics IS NOT NULL;
         UPDATE asset_records SET metrics = metrics_json
           WHERE metrics IS NULL AND metrics_json IS NOT NULL;",
    )
}

fn size_bytes_column(conn: &Connection) -> rusqlite::Result<()> {
    if table_exists(conn, "asset_records")?
        && !table_has_column(conn, "asset_records", "size_bytes")?
    {
        conn.execute_batch(
            "ALTER TABLE asset_records ADD COLUMN size_bytes INTEGER NOT NULL DEFAULT 0;",
        )?;
    }
    Ok(())
}

impl LedgerStore {
    /// Apply the built-in migrations.
    ///
    /// # Errors
    /// See [`MigrationRunner::run`].
    pub fn migrate(&mut self) -> Result<MigrationReport> {
        MigrationRunner::builtin().run(self)
    }

    /// `(type, name)` of every table, index and trigger, sorted, excluding SQLite internals.
    ///
    /// # Errors
    /// Returns [`LedgerError::StorageUnavailable`] when `sqlite_master` cannot be read.
    pub fn schema_objects(&self) -> Result<Vec<(String, String)>> {
        let path = self.path();
        let mut stmt = self
            .connection()
            .prepare(
                "SELECT type, name FROM sqlite_master
                 WHERE name NOT LIKE 'sqlite_%'
                 ORDER BY type, name",
            )
            .storage(path, "failed to prepare schema listing")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .storage(path, "failed to list schema objects")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().storage(path, "failed to read schema object")
    }

    /// Units recorded in `schema_migrations`, in name order. Empty before the first run.
    ///
    /// # Errors
    /// Returns [`LedgerError::StorageUnavailable`] when the table cannot be read.
    pub fn applied_units(&self) -> Result<Vec<String>> {
        if !self.table_exists("schema_migrations")? {
            return Ok(Vec::new());
        }
        let path = self.path();
        let mut stmt = self
            .connection()
            .prepare("SELECT unit FROM schema_migrations ORDER BY unit")
            .storage(path, "failed to prepare migration listing")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .storage(path, "failed to list applied migrations")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().storage(path, "failed to read applied migration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn migrating_twice_yields_identical_schema() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut store = LedgerStore::open(&dir.path().join("analytics.db"))?;

        let first = store.migrate()?;
        let schema_after_first = store.schema_objects()?;
        let second = store.migrate()?;
        let schema_after_second = store.schema_objects()?;

        assert_eq!(first, second);
        assert_eq!(schema_after_first, schema_after_second);
        for table in ["asset_records", "audit_events", "generation_events", "ingest_events"] {
            assert!(schema_after_first.contains(&("table".to_string(), table.to_string())));
        }
        assert!(schema_after_first
            .contains(&("trigger".to_string(), "trg_audit_events_no_update".to_string())));
        let mut expected = MigrationRunner::builtin().unit_names();
        expected.sort();
        assert_eq!(store.applied_units()?, expected);
        Ok(())
    }

    #[test]
    fn legacy_single_column_table_is_backfilled() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut store = LedgerStore::open(&dir.path().join("legacy.db"))?;
        store.connection().execute_batch(
            "CREATE TABLE asset_records (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               path TEXT NOT NULL,
               sha256 TEXT NOT NULL,
               metrics_json TEXT,
               created_at TEXT NOT NULL
             );
             INSERT INTO asset_records(path, sha256, metrics_json, created_at)
             VALUES ('captures/login.har', 'abc', '{\"size_bytes\":3}', '2026-01-01T00:00:00Z');",
        )?;

        store.migrate()?;

        let (content_hash, metrics, size): (String, String, i64) = store.connection().query_row(
            "SELECT content_hash, metrics, size_bytes FROM asset_records
              WHERE path = 'captures/login.har'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        assert_eq!(content_hash, "abc");
        assert_eq!(metrics, "{\"size_bytes\":3}");
        assert_eq!(size, 0);

        let duplicate = store.connection().execute(
            "INSERT INTO asset_records(path, sha256, content_hash, created_at)
             VALUES ('captures/login.har', 'abc', 'abc', '2026-01-02T00:00:00Z')",
            [],
        );
        assert!(duplicate.is_err());
        Ok(())
    }

    #[test]
    fn failing_unit_is_named_and_earlier_units_stay_applied() -> TestResult {
        let dir = tempfile::tempdir()?;
        let migrations = dir.path().join("migrations");
        fs::create_dir_all(&migrations)?;
        fs::write(migrations.join("0001_ok.sql"), "CREATE TABLE IF NOT EXISTS kept(id INTEGER);")?;
        fs::write(migrations.join("0002_broken.sql"), "CREATE TABLE broken(;")?;
        fs::write(migrations.join("README.md"), "not a migration")?;

        let mut store = LedgerStore::open(&dir.path().join("target.db"))?;
        let runner = MigrationRunner::from_dir(&migrations)?;
        assert_eq!(runner.units().len(), 2);

        let Err(err) = runner.run(&mut store) else {
            panic!("broken unit must fail");
        };
        match err {
            LedgerError::MigrationFailed { unit, .. } => assert_eq!(unit, "0002_broken.sql"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.table_exists("kept")?);
        assert_eq!(store.applied_units()?, vec!["0001_ok.sql".to_string()]);
        Ok(())
    }

    #[test]
    fn routines_run_after_declarative_units_in_name_order() -> TestResult {
        fn marker(conn: &Connection) -> rusqlite::Result<()> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS routine_marker(seen INTEGER);
                 INSERT INTO routine_marker(seen) SELECT COUNT(*) FROM asset_records;",
            )
        }

        let dir = tempfile::tempdir()?;
        let mut store = LedgerStore::open(&dir.path().join("assets.db"))?;
        let report = MigrationRunner::builtin()
            .with_routine(UpgradeRoutine { name: "0000_marker", apply: marker })
            .run(&mut store)?;

        assert_eq!(report.routines.first().map(String::as_str), Some("0000_marker"));
        assert_eq!(report.declarative.len(), 3);
        assert!(store.table_exists("routine_marker")?);
        Ok(())
    }
}
