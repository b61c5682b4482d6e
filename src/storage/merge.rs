// 离线工具:把一个库的全部用户表按批追加进另一个库。
use crate::storage::{ScanBatches, SqliteStore, StoreError};
use tracing::info;

const MERGE_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct MergedTable {
    pub name: String,
    pub rows_copied: u64,
    pub created: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub tables: Vec<MergedTable>,
}

impl MergeReport {
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|table| table.rows_copied).sum()
    }
}

/// Appends every user table of `source` into `dest`, streaming rows in
/// bounded batches. Existing destination tables must carry the exact same
/// column list; missing ones are recreated from the source's stored DDL.
///
/// Rows are plain-inserted: stores with overlapping primary keys fail with
/// the constraint error, and a re-run after a partial failure duplicates
/// already-copied autoincrement rows. Merge disjoint stores.
pub fn merge_stores(dest: &SqliteStore, source: &SqliteStore) -> Result<MergeReport, StoreError> {
    let mut report = MergeReport::default();
    for table in source.table_list()? {
        let created = if dest.has_table(&table)? {
            let source_columns = source.table_columns(&table)?;
            let dest_columns = dest.table_columns(&table)?;
            if source_columns != dest_columns {
                return Err(StoreError::SchemaMismatch {
                    table,
                    detail: format!(
                        "column lists differ: source [{}] vs dest [{}]",
                        source_columns.join(", "),
                        dest_columns.join(", ")
                    ),
                });
            }
            false
        } else {
            let Some(ddl) = source.table_ddl(&table)? else {
                return Err(StoreError::SchemaMismatch {
                    table,
                    detail: "source table has no stored DDL".to_string(),
                });
            };
            dest.execute_ddl(&ddl)?;
            true
        };

        let mut rows_copied = 0u64;
        for batch in ScanBatches::new(source, &table, MERGE_BATCH_SIZE)? {
            let batch = batch?;
            rows_copied += batch.len() as u64;
            dest.batch_insert(&table, &batch)?;
        }
        info!(
            "merged {rows_copied} rows from {} into {}#{table}",
            source.path().display(),
            dest.path().display()
        );
        report.tables.push(MergedTable {
            name: table,
            rows_copied,
            created,
        });
    }
    Ok(report)
}
