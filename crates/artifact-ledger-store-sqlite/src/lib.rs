//! SQLite persistence for the artifact ledger.
//!
//! Every component reaches a database file through [`open_connection`] or [`LedgerStore`], so the
//! WAL journal, busy timeout and foreign-key pragmas are applied uniformly.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use artifact_ledger_core::{HealthCheck, LedgerError};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod assets;
pub mod events;
pub mod migrate;
pub mod references;

pub use events::Stored;
pub use migrate::{DeclarativeUnit, MigrationReport, MigrationRunner, UpgradeRoutine};
pub use references::ReferenceScan;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Default busy timeout applied to every connection.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// WAL size above which an opportunistic checkpoint is worth running.
pub const DEFAULT_CHECKPOINT_THRESHOLD_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub busy_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { busy_timeout: DEFAULT_BUSY_TIMEOUT }
    }
}

/// Attach the database path to any storage-level failure.
pub trait StorageContext<T> {
    /// # Errors
    /// Converts the underlying error into [`LedgerError::StorageUnavailable`].
    fn storage(self, path: &Path, context: &str) -> Result<T>;
}

impl<T, E: Display> StorageContext<T> for std::result::Result<T, E> {
    fn storage(self, path: &Path, context: &str) -> Result<T> {
        self.map_err(|err| LedgerError::storage(path, format!("{context}: {err}")))
    }
}

/// Open `path` with the ledger's runtime pragmas.
///
/// # Errors
/// Returns [`LedgerError::StorageUnavailable`] when the parent directory cannot be created, the
/// file cannot be opened, or a pragma is rejected.
pub fn open_connection(path: &Path, config: &ConnectionConfig) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).storage(path, "failed to create database directory")?;
    }

    let conn = Connection::open(path).storage(path, "failed to open sqlite database")?;
    conn.busy_timeout(config.busy_timeout).storage(path, "failed to set busy timeout")?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )
    .storage(path, "failed to configure sqlite pragmas")?;

    Ok(conn)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointReport {
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

#[derive(Debug)]
pub struct LedgerStore {
    conn: Connection,
    path: PathBuf,
}

impl LedgerStore {
    /// Open a store with the default connection settings.
    ///
    /// # Errors
    /// See [`open_connection`].
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &ConnectionConfig::default())
    }

    /// # Errors
    /// See [`open_connection`].
    pub fn open_with(path: &Path, config: &ConnectionConfig) -> Result<Self> {
        let conn = open_connection(path, config)?;
        tracing::debug!(db = %path.display(), "opened sqlite database");
        Ok(Self { conn, path: path.to_path_buf() })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Display name used in reports: the file name when there is one.
    #[must_use]
    pub fn label(&self) -> String {
        self.path.file_name().map_or_else(
            || self.path.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        )
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `PRAGMA quick_check`. Every reported problem is kept, one per line. Failures are
    /// captured in the returned value, never raised.
    #[must_use]
    pub fn health_check(&self) -> HealthCheck {
        let result = match quick_check(&self.conn) {
            Ok(lines) if lines.is_empty() => "quick_check returned no rows".to_string(),
            Ok(lines) => lines.join("\n"),
            Err(err) => format!("quick_check failed: {err}"),
        };
        let ok = result == "ok";
        if !ok {
            tracing::warn!(db = %self.path.display(), %result, "quick_check reported problems");
        }
        HealthCheck { database: self.label(), result, ok }
    }

    /// Fold the write-ahead log back into the main file and truncate it.
    ///
    /// # Errors
    /// Returns [`LedgerError::StorageUnavailable`] when the checkpoint pragma fails.
    pub fn checkpoint(&self) -> Result<CheckpointReport> {
        let (busy, log_frames, checkpointed_frames) = self
            .conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })
            .storage(&self.path, "failed to checkpoint write-ahead log")?;
        let report = CheckpointReport { busy: busy != 0, log_frames, checkpointed_frames };
        tracing::info!(
            db = %self.path.display(),
            busy = report.busy,
            log_frames,
            checkpointed_frames,
            "wal checkpoint complete"
        );
        Ok(report)
    }

    /// Checkpoint only when the `-wal` file has grown past `threshold_bytes`.
    ///
    /// # Errors
    /// See [`LedgerStore::checkpoint`].
    pub fn checkpoint_if_wal_exceeds(
        &self,
        threshold_bytes: u64,
    ) -> Result<Option<CheckpointReport>> {
        let size = self.wal_size_bytes();
        if size <= threshold_bytes {
            tracing::debug!(
                db = %self.path.display(),
                size,
                threshold_bytes,
                "wal below threshold"
            );
            return Ok(None);
        }
        self.checkpoint().map(Some)
    }

    #[must_use]
    pub fn wal_size_bytes(&self) -> u64 {
        let mut wal = self.path.clone().into_os_string();
        wal.push("-wal");
        fs::metadata(PathBuf::from(wal)).map_or(0, |meta| meta.len())
    }

    /// # Errors
    /// Returns [`LedgerError::StorageUnavailable`] when `sqlite_master` cannot be read.
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        table_exists(&self.conn, table).storage(&self.path, "failed to inspect sqlite_master")
    }

    /// Column names of `table`, empty when the table does not exist.
    ///
    /// # Errors
    /// Returns [`LedgerError::StorageUnavailable`] when `table_info` cannot be read.
    pub fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        table_columns(&self.conn, table)
            .storage(&self.path, &format!("failed to inspect table_info for {table}"))
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

fn quick_check(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA quick_check")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    if !is_identifier(table) || !table_exists(conn, table)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}

pub(crate) fn table_has_column(
    conn: &Connection,
    table: &str,
    column: &str,
) -> rusqlite::Result<bool> {
    Ok(table_columns(conn, table)?.iter().any(|name| name == column))
}

/// Table and column names are interpolated into SQL, so only plain identifiers are accepted.
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> rusqlite::Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
}

pub(crate) fn parse_rfc3339(index: usize, value: &str) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn open_applies_wal_and_busy_timeout() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/dir/assets.db");
        let config = ConnectionConfig { busy_timeout: Duration::from_millis(1500) };
        let store = LedgerStore::open_with(&path, &config)?;

        let journal: String =
            store.connection().query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let timeout: i64 =
            store.connection().query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;
        let foreign_keys: i64 =
            store.connection().query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        let synchronous: i64 =
            store.connection().query_row("PRAGMA synchronous", [], |row| row.get(0))?;

        assert_eq!(journal, "wal");
        assert_eq!(timeout, 1500);
        assert_eq!(foreign_keys, 1);
        assert_eq!(synchronous, 1);
        assert!(path.exists());
        assert_eq!(store.label(), "assets.db");
        Ok(())
    }

    #[test]
    fn unopenable_path_is_storage_unavailable() -> TestResult {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory")?;

        let Err(err) = LedgerStore::open(&blocker.join("assets.db")) else {
            panic!("opening beneath a regular file must fail");
        };
        assert!(matches!(err, LedgerError::StorageUnavailable { .. }));
        assert!(err.is_fatal());
        Ok(())
    }

    #[test]
    fn corrupt_file_is_storage_unavailable() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("corrupt.db");
        fs::write(&path, vec![0x5a_u8; 8192])?;

        let result = LedgerStore::open(&path);
        assert!(matches!(result, Err(LedgerError::StorageUnavailable { .. })));
        Ok(())
    }

    #[test]
    fn health_check_reports_clean_database() -> TestResult {
        let dir = tempfile::tempdir()?;
        let store = LedgerStore::open(&dir.path().join("enterprise.db"))?;
        let check = store.health_check();
        assert!(check.ok);
        assert_eq!(check.result, "ok");
        assert_eq!(check.database, "enterprise.db");
        Ok(())
    }

    /// Seed `path` with enough rows to span many pages, then overwrite one page in the middle.
    fn corrupt_database(path: &Path) -> TestResult {
        {
            let mut store = LedgerStore::open(path)?;
            let tx = store.connection_mut().transaction()?;
            tx.execute_batch("CREATE TABLE generated_docs(path TEXT NOT NULL, sha256 TEXT);")?;
            for i in 0..2000 {
                tx.execute(
                    "INSERT INTO generated_docs(path, sha256) VALUES (?1, ?2)",
                    params![format!("docs/page-{i:05}.md"), format!("{i:064x}")],
                )?;
            }
            tx.commit()?;
            store.checkpoint()?;
        }

        let mut bytes = fs::read(path)?;
        let page = 4096;
        let middle = (bytes.len() / page / 2) * page;
        bytes[middle..middle + page].fill(0xff);
        fs::write(path, bytes)?;
        Ok(())
    }

    #[test]
    fn health_check_keeps_every_reported_problem() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("enterprise.db");
        corrupt_database(&path)?;

        let store = LedgerStore::open(&path)?;
        let check = store.health_check();
        assert!(!check.ok);
        assert!(check.result.contains("in database main"), "result: {}", check.result);
        assert!(check.result.contains("page"), "result: {}", check.result);
        Ok(())
    }

    #[test]
    fn checkpoint_truncates_wal() -> TestResult {
        let dir = tempfile::tempdir()?;
        let store = LedgerStore::open(&dir.path().join("assets.db"))?;
        store.connection().execute_batch(
            "CREATE TABLE scratch(id INTEGER PRIMARY KEY, body TEXT);
             INSERT INTO scratch(body) VALUES ('a'), ('b'), ('c');",
        )?;

        assert!(store.checkpoint_if_wal_exceeds(u64::MAX)?.is_none());
        let report = store.checkpoint()?;
        assert!(!report.busy);
        assert_eq!(store.wal_size_bytes(), 0);
        Ok(())
    }

    #[test]
    fn column_inspection_handles_missing_tables() -> TestResult {
        let dir = tempfile::tempdir()?;
        let store = LedgerStore::open(&dir.path().join("source.db"))?;
        store.connection().execute_batch("CREATE TABLE docs(path TEXT, sha256 TEXT);")?;

        assert!(store.table_exists("docs")?);
        assert!(!store.table_exists("absent")?);
        assert_eq!(store.table_columns("docs")?, vec!["path".to_string(), "sha256".to_string()]);
        assert!(store.table_columns("absent")?.is_empty());
        assert!(store.table_columns("docs; DROP TABLE docs")?.is_empty());
        Ok(())
    }

    #[test]
    fn identifiers_reject_sql_fragments() {
        assert!(is_identifier("generated_docs"));
        assert!(is_identifier("_private2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("docs;--"));
        assert!(!is_identifier("a b"));
    }
}
