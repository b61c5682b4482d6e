use parley::storage::{
    merge_stores, ConfigTable, RoomChatsTable, RoomInfoTable, SqlValue, SqliteStore, StoreError,
    Table,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn open(dir: &TempDir, name: &str) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(dir.path().join(name)).unwrap())
}

fn chat_row(user_id: i64, message: &str) -> Vec<SqlValue> {
    vec![
        SqlValue::Null,
        SqlValue::Integer(user_id),
        SqlValue::Text("user".to_string()),
        SqlValue::Text(message.to_string()),
        SqlValue::Text("d".to_string()),
    ]
}

#[test]
fn merge_into_empty_store_creates_tables_and_streams_rows() {
    let dir = TempDir::new().unwrap();
    let source = open(&dir, "source.db");
    let dest = open(&dir, "dest.db");

    let rooms = RoomInfoTable::open_default(source.clone()).unwrap();
    rooms.insert(1, 100).unwrap();
    rooms.insert(2, 200).unwrap();
    let _chats = RoomChatsTable::open_default(source.clone()).unwrap();
    // enough rows to force more than one scan batch during the merge
    let rows: Vec<Vec<SqlValue>> = (0..1200).map(|i| chat_row(1, &format!("m{i}"))).collect();
    source.batch_insert("room_chats", &rows).unwrap();
    let config = ConfigTable::open_default(source.clone()).unwrap();
    config
        .save(&json!({ "system_prompt": "hi" }).as_object().unwrap().clone())
        .unwrap();

    let report = merge_stores(&dest, &source).unwrap();

    assert!(report.tables.iter().all(|table| table.created));
    assert_eq!(report.total_rows(), 2 + 1200 + 1);
    assert_eq!(
        Table::new(dest.clone(), "room_chats").unwrap().row_count().unwrap(),
        1200
    );
    let dest_rooms = RoomInfoTable::open_default(dest.clone()).unwrap();
    assert_eq!(dest_rooms.by_user(2).unwrap().unwrap().admin_thread_id, 200);
    let dest_chats = RoomChatsTable::open_default(dest.clone()).unwrap();
    let last = dest_chats.last_n(1, 1).unwrap();
    assert_eq!(last[0].message.as_deref(), Some("m1199"));
    let dest_config = ConfigTable::open_default(dest).unwrap();
    assert_eq!(
        dest_config.load().unwrap().get("system_prompt"),
        Some(&json!("hi"))
    );
}

#[test]
fn merge_keeps_existing_destination_rows() {
    let dir = TempDir::new().unwrap();
    let source = open(&dir, "source.db");
    let dest = open(&dir, "dest.db");

    RoomInfoTable::open_default(source.clone())
        .unwrap()
        .insert(2, 20)
        .unwrap();
    let dest_rooms = RoomInfoTable::open_default(dest.clone()).unwrap();
    dest_rooms.insert(1, 10).unwrap();

    let report = merge_stores(&dest, &source).unwrap();

    assert!(report.tables.iter().all(|table| !table.created));
    assert_eq!(dest_rooms.by_user(1).unwrap().unwrap().admin_thread_id, 10);
    assert_eq!(dest_rooms.by_user(2).unwrap().unwrap().admin_thread_id, 20);
}

#[test]
fn merge_rejects_diverging_schemas() {
    let dir = TempDir::new().unwrap();
    let source = open(&dir, "source.db");
    RoomInfoTable::open_default(source.clone()).unwrap();

    let dest_path = dir.path().join("dest.db");
    {
        let conn = rusqlite::Connection::open(&dest_path).unwrap();
        conn.execute_batch("CREATE TABLE room_info (user_id INTEGER, unrelated TEXT)")
            .unwrap();
    }
    let dest = SqliteStore::open(&dest_path).unwrap();

    let err = merge_stores(&dest, &source).unwrap_err();
    match err {
        StoreError::SchemaMismatch { table, .. } => assert_eq!(table, "room_info"),
        other => panic!("expected SchemaMismatch, got {other}"),
    }
}

#[test]
fn merge_of_overlapping_primary_keys_fails() {
    let dir = TempDir::new().unwrap();
    let source = open(&dir, "source.db");
    let dest = open(&dir, "dest.db");

    RoomInfoTable::open_default(source.clone())
        .unwrap()
        .insert(1, 100)
        .unwrap();
    RoomInfoTable::open_default(dest.clone())
        .unwrap()
        .insert(1, 999)
        .unwrap();

    let err = merge_stores(&dest, &source).unwrap_err();
    assert!(matches!(err, StoreError::Sqlite(_)), "got {err}");
    // destination keeps its own row
    let dest_rooms = RoomInfoTable::open_default(dest).unwrap();
    assert_eq!(dest_rooms.by_user(1).unwrap().unwrap().admin_thread_id, 999);
}
