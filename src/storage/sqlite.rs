// 单连接 SQLite 句柄:所有写入走同一条连接上的事务+重试原语。
use crate::storage::{safe_ident, StoreError};
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

pub use rusqlite::types::Value as SqlValue;

const DEFAULT_BUSY_RETRIES: u32 = 100;

/// Owns the process-wide connection to the embedded store file. The
/// connection is shared by every conversation; writers serialize on the
/// mutex, and contention from *other* connections on the same file is
/// absorbed by the retry loop in [`SqliteStore::batch_insert`].
pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
    busy_retries: u32,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(Self {
            path,
            conn: Mutex::new(Some(conn)),
            busy_retries: DEFAULT_BUSY_RETRIES,
        })
    }

    /// Shrinks the contention retry budget; tests use this to make
    /// exhaustion observable without a hundred backoff sleeps.
    pub fn with_busy_retries(mut self, budget: u32) -> Self {
        self.busy_retries = budget;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        f(conn)
    }

    fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        f(conn)
    }

    /// Transactional bulk insert of positional rows (one value per column,
    /// in declared order). All-or-nothing: one multi-row statement inside
    /// one transaction; a busy/locked store is retried with jittered
    /// backoff up to the budget, anything else rolls back and propagates.
    pub fn batch_insert(&self, table: &str, rows: &[Vec<SqlValue>]) -> Result<(), StoreError> {
        let table = safe_ident(table);
        let Some(first) = rows.first() else {
            return Ok(());
        };
        let sql = insert_sql(&table, None, first.len(), rows.len())?;
        self.run_insert(&table, &sql, rows)
    }

    /// Same machinery for a column-subset insert. `columns` must already be
    /// validated against the live schema (the table layer does this); the
    /// names are spliced into the statement verbatim.
    pub fn batch_insert_named(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<SqlValue>],
    ) -> Result<(), StoreError> {
        let table = safe_ident(table);
        if rows.is_empty() {
            return Ok(());
        }
        let sql = insert_sql(&table, Some(columns), columns.len(), rows.len())?;
        self.run_insert(&table, &sql, rows)
    }

    fn run_insert(&self, table: &str, sql: &str, rows: &[Vec<SqlValue>]) -> Result<(), StoreError> {
        let arity = rows[0].len();
        if rows.iter().any(|row| row.len() != arity) {
            return Err(StoreError::SchemaMismatch {
                table: table.to_string(),
                detail: "rows in one batch must share the same arity".to_string(),
            });
        }
        let mut attempt = 0u32;
        loop {
            let result = self.with_conn_mut(|conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    sql,
                    rusqlite::params_from_iter(rows.iter().flatten()),
                )?;
                tx.commit()?;
                Ok(())
            });
            match result {
                Ok(()) => return Ok(()),
                Err(err) if is_busy(&err) => {
                    if attempt >= self.busy_retries {
                        return Err(StoreError::ContentionExceeded {
                            table: table.to_string(),
                            attempts: attempt,
                        });
                    }
                    attempt += 1;
                    warn!(
                        "store busy, retrying insert into {table} ({attempt}/{})",
                        self.busy_retries
                    );
                    std::thread::sleep(contention_backoff());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// User-defined tables only; `sqlite_*` bookkeeping is filtered out.
    pub fn table_list(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
    }

    pub fn has_table(&self, name: &str) -> Result<bool, StoreError> {
        let name = safe_ident(name);
        self.with_conn(|conn| {
            let found: Option<String> = conn
                .query_row(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                    [&name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Column names in declared order.
    pub fn table_columns(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let name = safe_ident(name);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({name})"))?;
            let columns = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(columns)
        })
    }

    pub(crate) fn table_ddl(&self, name: &str) -> Result<Option<String>, StoreError> {
        let name = safe_ident(name);
        self.with_conn(|conn| {
            let sql: Option<String> = conn
                .query_row(
                    "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?",
                    [&name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(sql)
        })
    }

    pub(crate) fn execute_ddl(&self, sql: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
    }

    /// Releases the connection. Idempotent: closing twice is a no-op, and
    /// later operations report [`StoreError::Closed`].
    pub fn close(&self) {
        let mut guard = self.conn.lock();
        if let Some(conn) = guard.take() {
            if let Err((conn, err)) = conn.close() {
                warn!("closing store {} failed: {err}", self.path.display());
                drop(conn);
            }
        }
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        self.close();
    }
}

/// Lazy, finite, non-restartable batch reader over one table. Each batch
/// takes the connection lock only for its own fetch (rowid keyset paging),
/// so a long scan never starves concurrent writers.
pub struct ScanBatches<'a> {
    store: &'a SqliteStore,
    table: String,
    columns: Vec<String>,
    batch_size: usize,
    last_rowid: i64,
    done: bool,
}

impl<'a> ScanBatches<'a> {
    pub(crate) fn new(
        store: &'a SqliteStore,
        table: &str,
        batch_size: usize,
    ) -> Result<Self, StoreError> {
        let table = safe_ident(table);
        let columns = store.table_columns(&table)?;
        if columns.is_empty() {
            return Err(StoreError::SchemaMismatch {
                table,
                detail: "no such table".to_string(),
            });
        }
        Ok(Self {
            store,
            table,
            columns,
            batch_size: batch_size.max(1),
            last_rowid: 0,
            done: false,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl Iterator for ScanBatches<'_> {
    type Item = Result<Vec<Vec<SqlValue>>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let sql = format!(
            "SELECT rowid, {} FROM {} WHERE rowid > ? ORDER BY rowid LIMIT ?",
            self.columns.join(", "),
            self.table
        );
        let fetched = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![self.last_rowid, self.batch_size as i64],
                    |row| {
                        let rowid: i64 = row.get(0)?;
                        let mut values = Vec::with_capacity(self.columns.len());
                        for index in 0..self.columns.len() {
                            values.push(row.get::<_, SqlValue>(index + 1)?);
                        }
                        Ok((rowid, values))
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        });
        match fetched {
            Ok(rows) if rows.is_empty() => {
                self.done = true;
                None
            }
            Ok(rows) => {
                self.last_rowid = rows.last().map(|(rowid, _)| *rowid).unwrap_or(i64::MAX);
                Some(Ok(rows.into_iter().map(|(_, values)| values).collect()))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

fn insert_sql(
    table: &str,
    columns: Option<&[String]>,
    arity: usize,
    row_count: usize,
) -> Result<String, StoreError> {
    if table.is_empty() || arity == 0 {
        return Err(StoreError::SchemaMismatch {
            table: table.to_string(),
            detail: "empty table name or zero-column row".to_string(),
        });
    }
    let group = format!("({})", vec!["?"; arity].join(", "));
    let values = vec![group; row_count].join(", ");
    let sql = match columns {
        Some(columns) => format!(
            "INSERT INTO {table} ({}) VALUES {values}",
            columns.join(", ")
        ),
        None => format!("INSERT INTO {table} VALUES {values}"),
    };
    Ok(sql)
}

fn is_busy(err: &StoreError) -> bool {
    match err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(inner, _)) => matches!(
            inner.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

fn contention_backoff() -> Duration {
    // 0.1–0.5s 均匀抖动;熵取自 uuid,避免引入独立的随机数依赖。
    let mixed = Uuid::new_v4().as_u128();
    let frac = (mixed % 1_000) as f64 / 1_000.0;
    Duration::from_secs_f64(0.1 + 0.4 * frac)
}
