// 存储模块：封装共享 SQLite 连接上的房间/聊天/配置持久化读写。

mod ident;
mod merge;
mod sqlite;
mod tables;

pub use ident::safe_ident;
pub use merge::{merge_stores, MergeReport, MergedTable};
pub use sqlite::{ScanBatches, SqlValue, SqliteStore};
pub use tables::{
    ConfigBlob, ConfigTable, RoomChats, RoomChatsTable, RoomInfo, RoomInfoTable, Table, TableKind,
    TypedTable,
};

/// One conversation room: a user and their dedicated admin-side thread.
/// Created lazily on first contact, never updated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub user_id: i64,
    pub admin_thread_id: i64,
}

/// One append-only chat log entry. `sender` is kept as stored text; the
/// history builder is the layer that insists on known sender values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEventRecord {
    pub id: i64,
    pub user_id: i64,
    pub sender: String,
    pub message: Option<String>,
    pub date: String,
}

#[derive(Debug)]
pub enum StoreError {
    /// A dict-keyed insert referenced columns the live table does not have,
    /// or a merge hit two tables with diverging schemas. Never retried.
    SchemaMismatch { table: String, detail: String },
    /// The contention retry budget ran out without a successful commit.
    ContentionExceeded { table: String, attempts: u32 },
    /// The handle was closed; the caller holds a stale reference.
    Closed,
    Io(std::io::Error),
    Sqlite(rusqlite::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SchemaMismatch { table, detail } => {
                write!(f, "schema mismatch on table {table}: {detail}")
            }
            Self::ContentionExceeded { table, attempts } => {
                write!(
                    f,
                    "store still locked after {attempts} attempts on table {table}"
                )
            }
            Self::Closed => write!(f, "store handle is closed"),
            Self::Io(err) => write!(f, "store io error: {err}"),
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Sqlite(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sqlite(err)
    }
}
