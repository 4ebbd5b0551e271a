use crate::errors::SinkError;
use crate::fingerprint::{self, DEFAULT_TABLE_PREFIX};
use crate::model::{Cell, ResultTable, JOB_INDEX_COLUMN};
use crate::retry::RetryPolicy;
use crate::storage::view::{concat, Axis};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const BOOKKEEPING_TABLE: &str = "table_names";

/// How long one connection waits on SQLite's write lock before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SIDECAR_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// File-backed store accumulating every job's tables.
///
/// No connection is held between calls: each write opens its own connection and
/// commits one IMMEDIATE transaction, so threads and separate processes can write the
/// same file concurrently and rely on SQLite's locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSink {
    path: PathBuf,
    #[serde(default = "default_prefix")]
    table_prefix: String,
    #[serde(default)]
    retry: RetryPolicy,
}

fn default_prefix() -> String {
    DEFAULT_TABLE_PREFIX.to_string()
}

impl ResultSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table_prefix: default_prefix(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table_prefix(&self) -> &str {
        &self.table_prefix
    }

    fn connect(&self) -> Result<Connection, SinkError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| SinkError::io(parent, e))?;
            }
        }
        let conn = Connection::open(&self.path).map_err(|e| self.sql(e))?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(|e| self.sql(e))?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (name TEXT PRIMARY KEY)",
            BOOKKEEPING_TABLE
        ))
        .map_err(|e| self.sql(e))?;
        Ok(conn)
    }

    fn sql(&self, e: rusqlite::Error) -> SinkError {
        SinkError::sqlite(&self.path, e)
    }

    fn with_busy_retry<T>(
        &self,
        op: &str,
        mut f: impl FnMut() -> Result<T, SinkError>,
    ) -> Result<T, SinkError> {
        let (res, attempts) = self.retry.run(|_| f(), |e| e.is_busy());
        if attempts > 1 {
            tracing::debug!(event = "sink.lock_retry", op, attempts, ok = res.is_ok());
        }
        res
    }

    /// Appends `table` to the data table named by `hint`, or by its schema when no hint
    /// is given, and records that name in bookkeeping within the same transaction.
    ///
    /// Returns the table name written, or `None` when `table` has no rows.
    pub fn insert(&self, table: &ResultTable, hint: Option<&str>) -> Result<Option<String>, SinkError> {
        if table.is_empty() {
            return Ok(None);
        }
        check_shape(table)?;
        let name = match hint {
            Some(h) => h.to_string(),
            None => fingerprint::table_name(&self.table_prefix, &table.columns),
        };
        self.with_busy_retry("insert", || self.write_tables(&[(name.as_str(), table)]))?;
        tracing::debug!(
            event = "sink.insert",
            table = %name,
            source_table = %table.name,
            rows = table.len()
        );
        Ok(Some(name))
    }

    /// Writes every non-empty table of one job in a single transaction, so a job's
    /// output lands completely or not at all. Returns the data table name per written
    /// table, in input order.
    pub fn insert_all(&self, tables: &[ResultTable]) -> Result<Vec<String>, SinkError> {
        let mut batch = Vec::new();
        for t in tables.iter().filter(|t| !t.is_empty()) {
            check_shape(t)?;
            batch.push((fingerprint::table_name(&self.table_prefix, &t.columns), t));
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let refs: Vec<(&str, &ResultTable)> = batch.iter().map(|(n, t)| (n.as_str(), *t)).collect();
        self.with_busy_retry("insert_all", || self.write_tables(&refs))?;
        tracing::debug!(
            event = "sink.insert_all",
            tables = batch.len(),
            rows = batch.iter().map(|(_, t)| t.len()).sum::<usize>()
        );
        Ok(batch.into_iter().map(|(n, _)| n).collect())
    }

    fn write_tables(&self, items: &[(&str, &ResultTable)]) -> Result<(), SinkError> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.sql(e))?;
        for (name, table) in items {
            self.write_one(&tx, name, table)?;
        }
        tx.commit().map_err(|e| self.sql(e))?;
        Ok(())
    }

    fn write_one(&self, tx: &Connection, name: &str, table: &ResultTable) -> Result<(), SinkError> {
        let existing = table_columns(tx, name).map_err(|e| self.sql(e))?;
        if existing.is_empty() {
            // untyped columns keep each value's storage class, so a column that was
            // all null in the first job still takes numbers from later ones
            let cols = table
                .columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            tx.execute(&format!("CREATE TABLE {} ({})", quote_ident(name), cols), [])
                .map_err(|e| self.sql(e))?;
        } else {
            let mut have = existing.clone();
            let mut want = table.columns.clone();
            have.sort();
            want.sort();
            if have != want {
                return Err(SinkError::SchemaConflict {
                    table: name.to_string(),
                    existing,
                    incoming: table.columns.clone(),
                });
            }
        }

        let cols = table
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=table.columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = tx
            .prepare(&format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(name),
                cols,
                placeholders
            ))
            .map_err(|e| self.sql(e))?;
        for row in &table.rows {
            stmt.execute(rusqlite::params_from_iter(row.iter()))
                .map_err(|e| self.sql(e))?;
        }

        tx.execute(
            &format!("INSERT OR IGNORE INTO {} (name) VALUES (?1)", BOOKKEEPING_TABLE),
            [name],
        )
        .map_err(|e| self.sql(e))?;
        Ok(())
    }

    /// Names recorded in bookkeeping. A missing store has none.
    pub fn written_tables(&self) -> Result<BTreeSet<String>, SinkError> {
        if !self.path.exists() {
            return Ok(BTreeSet::new());
        }
        self.with_busy_retry("written_tables", || {
            let conn = self.connect()?;
            let mut stmt = conn
                .prepare(&format!("SELECT name FROM {} ORDER BY name", BOOKKEEPING_TABLE))
                .map_err(|e| self.sql(e))?;
            let names = stmt
                .query_map([], |r| r.get::<_, String>(0))
                .map_err(|e| self.sql(e))?
                .collect::<Result<BTreeSet<_>, _>>()
                .map_err(|e| self.sql(e))?;
            Ok(names)
        })
    }

    pub fn read_table(&self, name: &str) -> Result<ResultTable, SinkError> {
        if !self.path.exists() {
            return Err(SinkError::UnknownTable(name.to_string()));
        }
        let conn = self.connect()?;
        if table_columns(&conn, name).map_err(|e| self.sql(e))?.is_empty() {
            return Err(SinkError::UnknownTable(name.to_string()));
        }
        read_all(&conn, name).map_err(|e| self.sql(e))
    }

    /// Every bookkeeping table concatenated along `axis`, in table-name order.
    pub fn consolidated_view(&self, axis: Axis) -> Result<ResultTable, SinkError> {
        let mut frames = Vec::new();
        for name in self.written_tables()? {
            frames.push(self.read_table(&name)?);
        }
        Ok(concat(frames, axis))
    }

    /// Job ids that already have rows in any bookkeeping table.
    pub fn completed_jobs(&self) -> Result<BTreeSet<String>, SinkError> {
        let mut done = BTreeSet::new();
        let tables = self.written_tables()?;
        if tables.is_empty() {
            return Ok(done);
        }
        let conn = self.connect()?;
        for name in tables {
            let cols = table_columns(&conn, &name).map_err(|e| self.sql(e))?;
            if !cols.iter().any(|c| c == JOB_INDEX_COLUMN) {
                continue;
            }
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT DISTINCT {} FROM {}",
                    quote_ident(JOB_INDEX_COLUMN),
                    quote_ident(&name)
                ))
                .map_err(|e| self.sql(e))?;
            let ids = stmt
                .query_map([], |r| r.get::<_, Cell>(0))
                .map_err(|e| self.sql(e))?;
            for id in ids {
                let id = id.map_err(|e| self.sql(e))?;
                if !id.is_null() {
                    done.insert(id.to_string());
                }
            }
        }
        Ok(done)
    }

    /// Deletes the store file. When the file cannot be removed (another handle keeps it
    /// open on some platforms) the managed tables are dropped instead and bookkeeping is
    /// emptied. Clearing a missing or already-empty store is a no-op.
    pub fn clear(&self) -> Result<(), SinkError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                self.remove_sidecars();
                tracing::info!(event = "sink.cleared", mode = "deleted", path = %self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.remove_sidecars();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    event = "sink.clear_fallback",
                    path = %self.path.display(),
                    error = %e,
                    "store file could not be deleted, dropping managed tables"
                );
                self.clear_tables()
            }
        }
    }

    /// Drops every table named in bookkeeping, then empties bookkeeping.
    pub fn clear_tables(&self) -> Result<(), SinkError> {
        if !self.path.exists() {
            return Ok(());
        }
        self.with_busy_retry("clear_tables", || {
            let mut conn = self.connect()?;
            // clear() lands here when the directory refuses changes, which rules out a
            // journal file next to the store
            conn.query_row("PRAGMA journal_mode = MEMORY", [], |_| Ok(()))
                .map_err(|e| self.sql(e))?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| self.sql(e))?;
            let names: Vec<String> = {
                let mut stmt = tx
                    .prepare(&format!("SELECT name FROM {}", BOOKKEEPING_TABLE))
                    .map_err(|e| self.sql(e))?;
                let rows = stmt
                    .query_map([], |r| r.get::<_, String>(0))
                    .map_err(|e| self.sql(e))?;
                rows.collect::<Result<_, _>>().map_err(|e| self.sql(e))?
            };
            for name in &names {
                tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)), [])
                    .map_err(|e| self.sql(e))?;
            }
            tx.execute(&format!("DELETE FROM {}", BOOKKEEPING_TABLE), [])
                .map_err(|e| self.sql(e))?;
            tx.commit().map_err(|e| self.sql(e))?;
            tracing::info!(event = "sink.cleared", mode = "dropped", tables = names.len());
            Ok(())
        })
    }

    fn remove_sidecars(&self) {
        for suffix in SIDECAR_SUFFIXES {
            let mut p = OsString::from(self.path.as_os_str());
            p.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(p));
        }
    }
}

fn check_shape(table: &ResultTable) -> Result<(), SinkError> {
    for (i, row) in table.rows.iter().enumerate() {
        if row.len() != table.columns.len() {
            return Err(SinkError::RowShape {
                table: table.name.clone(),
                row: i,
                expected: table.columns.len(),
                got: row.len(),
            });
        }
    }
    Ok(())
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    rows.collect()
}

pub(crate) fn read_all(conn: &Connection, table: &str) -> rusqlite::Result<ResultTable> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote_ident(table)))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut out = ResultTable::new(table, columns);
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            cells.push(row.get::<_, Cell>(i)?);
        }
        out.rows.push(cells);
    }
    Ok(out)
}
