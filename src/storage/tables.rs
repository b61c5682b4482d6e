// 表抽象:共享的批量写/批量读机制 + 固定的三类业务表。
use crate::storage::{
    safe_ident, ChatEventRecord, RoomRecord, ScanBatches, SqlValue, SqliteStore, StoreError,
};
use rusqlite::OptionalExtension;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

const CONFIG_ROW_KEY: i64 = 0;

/// Schema-aware operations shared by every logical table. The variant layer
/// ([`TypedTable`]) adds DDL and decoding; everything that writes goes
/// through the store's transactional batch-insert primitive.
pub struct Table {
    store: Arc<SqliteStore>,
    name: String,
}

impl Table {
    pub fn new(store: Arc<SqliteStore>, name: &str) -> Result<Self, StoreError> {
        let name = safe_ident(name);
        if name.is_empty() {
            return Err(StoreError::SchemaMismatch {
                table: String::new(),
                detail: "empty table name".to_string(),
            });
        }
        Ok(Self { store, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Whether every requested column exists in the live schema.
    pub fn ensure_columns(&self, keys: &[String]) -> Result<bool, StoreError> {
        let live = self.store.table_columns(&self.name)?;
        Ok(keys.iter().all(|key| live.contains(key)))
    }

    /// Inserts JSON-object rows. The union of keys across all rows must
    /// match live columns exactly in the subset sense; otherwise the call
    /// fails with [`StoreError::SchemaMismatch`] before any statement is
    /// issued. Missing keys bind NULL; nested values are stored as JSON
    /// text.
    pub fn insert_dicts(&self, rows: &[Map<String, Value>]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut keys: BTreeSet<&str> = BTreeSet::new();
        for row in rows {
            keys.extend(row.keys().map(String::as_str));
        }
        let columns: Vec<String> = keys.into_iter().map(str::to_string).collect();
        let live = self.store.table_columns(&self.name)?;
        let missing: Vec<&String> = columns.iter().filter(|key| !live.contains(key)).collect();
        if !missing.is_empty() {
            return Err(StoreError::SchemaMismatch {
                table: self.name.clone(),
                detail: format!(
                    "columns not in table: {}",
                    missing
                        .iter()
                        .map(|key| key.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        }
        let value_rows: Vec<Vec<SqlValue>> = rows
            .iter()
            .map(|row| columns.iter().map(|col| json_to_sql(row.get(col))).collect())
            .collect();
        self.store
            .batch_insert_named(&self.name, &columns, &value_rows)
    }

    /// Lazy full-table read in bounded batches (default callers use 1000).
    pub fn scan_batches(&self, batch_size: usize) -> Result<ScanBatches<'_>, StoreError> {
        ScanBatches::new(&self.store, &self.name, batch_size)
    }

    pub fn row_count(&self) -> Result<i64, StoreError> {
        self.store.with_conn(|conn| {
            let count =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.name), [], |row| {
                    row.get(0)
                })?;
            Ok(count)
        })
    }
}

/// The closed set of table variants. Each supplies its idempotent DDL and a
/// positional-row decoder; convenience queries live on the corresponding
/// [`TypedTable`] impl.
pub trait TableKind {
    type Record;
    const DEFAULT_NAME: &'static str;

    fn ddl(table: &str) -> String;
    fn decode(row: &[SqlValue]) -> Result<Self::Record, StoreError>;
}

pub struct TypedTable<K: TableKind> {
    table: Table,
    _kind: PhantomData<K>,
}

impl<K: TableKind> TypedTable<K> {
    pub fn open(store: Arc<SqliteStore>, name: &str) -> Result<Self, StoreError> {
        let table = Table::new(store, name)?;
        table.store().execute_ddl(&K::ddl(table.name()))?;
        Ok(Self {
            table,
            _kind: PhantomData,
        })
    }

    pub fn open_default(store: Arc<SqliteStore>) -> Result<Self, StoreError> {
        Self::open(store, K::DEFAULT_NAME)
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn scan_decoded(
        &self,
        batch_size: usize,
    ) -> Result<impl Iterator<Item = Result<Vec<K::Record>, StoreError>> + '_, StoreError> {
        let scan = self.table.scan_batches(batch_size)?;
        Ok(scan.map(|batch| {
            batch.and_then(|rows| {
                rows.iter()
                    .map(|row| K::decode(row))
                    .collect::<Result<Vec<_>, _>>()
            })
        }))
    }
}

pub struct RoomInfo;

impl TableKind for RoomInfo {
    type Record = RoomRecord;
    const DEFAULT_NAME: &'static str = "room_info";

    fn ddl(table: &str) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
              user_id INTEGER PRIMARY KEY,
              admin_thread_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_user_id ON {table} (user_id);
            "#
        )
    }

    fn decode(row: &[SqlValue]) -> Result<RoomRecord, StoreError> {
        match row {
            [SqlValue::Integer(user_id), SqlValue::Integer(admin_thread_id)] => Ok(RoomRecord {
                user_id: *user_id,
                admin_thread_id: *admin_thread_id,
            }),
            _ => Err(decode_error(Self::DEFAULT_NAME, row)),
        }
    }
}

pub struct RoomChats;

impl TableKind for RoomChats {
    type Record = ChatEventRecord;
    const DEFAULT_NAME: &'static str = "room_chats";

    fn ddl(table: &str) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id INTEGER,
              sender TEXT,
              message TEXT,
              date TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_user_id ON {table} (user_id, id);
            "#
        )
    }

    fn decode(row: &[SqlValue]) -> Result<ChatEventRecord, StoreError> {
        match row {
            [SqlValue::Integer(id), SqlValue::Integer(user_id), SqlValue::Text(sender), message, SqlValue::Text(date)] =>
            {
                let message = match message {
                    SqlValue::Text(text) => Some(text.clone()),
                    SqlValue::Null => None,
                    _ => return Err(decode_error(Self::DEFAULT_NAME, row)),
                };
                Ok(ChatEventRecord {
                    id: *id,
                    user_id: *user_id,
                    sender: sender.clone(),
                    message,
                    date: date.clone(),
                })
            }
            _ => Err(decode_error(Self::DEFAULT_NAME, row)),
        }
    }
}

pub struct ConfigBlob;

impl TableKind for ConfigBlob {
    type Record = (i64, String);
    const DEFAULT_NAME: &'static str = "config";

    fn ddl(table: &str) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
              key INTEGER PRIMARY KEY,
              json_data TEXT
            );
            "#
        )
    }

    fn decode(row: &[SqlValue]) -> Result<(i64, String), StoreError> {
        match row {
            [SqlValue::Integer(key), SqlValue::Text(json_data)] => Ok((*key, json_data.clone())),
            _ => Err(decode_error(Self::DEFAULT_NAME, row)),
        }
    }
}

pub type RoomInfoTable = TypedTable<RoomInfo>;
pub type RoomChatsTable = TypedTable<RoomChats>;
pub type ConfigTable = TypedTable<ConfigBlob>;

impl TypedTable<RoomInfo> {
    pub fn insert(&self, user_id: i64, admin_thread_id: i64) -> Result<(), StoreError> {
        self.table.store().batch_insert(
            self.table.name(),
            &[vec![
                SqlValue::Integer(user_id),
                SqlValue::Integer(admin_thread_id),
            ]],
        )
    }

    pub fn by_user(&self, user_id: i64) -> Result<Option<RoomRecord>, StoreError> {
        self.lookup("user_id", user_id)
    }

    pub fn by_admin_thread(&self, admin_thread_id: i64) -> Result<Option<RoomRecord>, StoreError> {
        self.lookup("admin_thread_id", admin_thread_id)
    }

    fn lookup(&self, column: &str, value: i64) -> Result<Option<RoomRecord>, StoreError> {
        self.table.store().with_conn(|conn| {
            let record = conn
                .query_row(
                    &format!(
                        "SELECT user_id, admin_thread_id FROM {} WHERE {column} = ?",
                        self.table.name()
                    ),
                    [value],
                    |row| {
                        Ok(RoomRecord {
                            user_id: row.get(0)?,
                            admin_thread_id: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
    }
}

impl TypedTable<RoomChats> {
    pub fn insert(
        &self,
        user_id: i64,
        sender: &str,
        message: &str,
        date: &str,
    ) -> Result<(), StoreError> {
        self.table.store().batch_insert(
            self.table.name(),
            &[vec![
                SqlValue::Null,
                SqlValue::Integer(user_id),
                SqlValue::Text(sender.to_string()),
                SqlValue::Text(message.to_string()),
                SqlValue::Text(date.to_string()),
            ]],
        )
    }

    /// The `count` most recent events for one user, newest first.
    pub fn last_n(&self, user_id: i64, count: usize) -> Result<Vec<ChatEventRecord>, StoreError> {
        self.table.store().with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, user_id, sender, message, date FROM {} \
                 WHERE user_id = ? ORDER BY id DESC LIMIT ?",
                self.table.name()
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, count as i64], |row| {
                    Ok(ChatEventRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        sender: row.get(2)?,
                        message: row.get(3)?,
                        date: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

impl TypedTable<ConfigBlob> {
    /// Wholesale overwrite of the singleton blob at the fixed key.
    pub fn save(&self, map: &Map<String, Value>) -> Result<(), StoreError> {
        let json_text = Value::Object(map.clone()).to_string();
        self.table.store().with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (key, json_data) VALUES (?, ?) \
                     ON CONFLICT(key) DO UPDATE SET json_data = excluded.json_data",
                    self.table.name()
                ),
                rusqlite::params![CONFIG_ROW_KEY, json_text],
            )?;
            Ok(())
        })
    }

    /// Absent row reads as an empty object; a malformed blob is logged and
    /// read as empty rather than wedging every consumer.
    pub fn load(&self) -> Result<Map<String, Value>, StoreError> {
        let raw: Option<String> = self.table.store().with_conn(|conn| {
            let text = conn
                .query_row(
                    &format!("SELECT json_data FROM {} WHERE key = ?", self.table.name()),
                    [CONFIG_ROW_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(text)
        })?;
        let Some(text) = raw else {
            return Ok(Map::new());
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(map),
            _ => {
                warn!(
                    "config blob in {} is not a JSON object, treating as empty",
                    self.table.name()
                );
                Ok(Map::new())
            }
        }
    }
}

fn json_to_sql(value: Option<&Value>) -> SqlValue {
    match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::Bool(flag)) => SqlValue::Integer(i64::from(*flag)),
        Some(Value::Number(num)) => {
            if let Some(int) = num.as_i64() {
                SqlValue::Integer(int)
            } else {
                SqlValue::Real(num.as_f64().unwrap_or(0.0))
            }
        }
        Some(Value::String(text)) => SqlValue::Text(text.clone()),
        Some(other) => SqlValue::Text(other.to_string()),
    }
}

fn decode_error(table: &str, row: &[SqlValue]) -> StoreError {
    StoreError::SchemaMismatch {
        table: table.to_string(),
        detail: format!("row shape does not match the table ({} values)", row.len()),
    }
}
