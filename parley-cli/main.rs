use anyhow::Result;
use clap::{Parser, Subcommand};
use parley::storage::{merge_stores, ConfigTable, SqliteStore, Table};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parley-cli", about = "Offline utilities for parley store files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Append every table of a source store into a destination store.
    /// Stores must be disjoint; overlapping primary keys abort the merge.
    Merge {
        /// Destination store file (modified in place)
        #[arg(long = "into")]
        dest: PathBuf,
        /// Source store file (read only)
        source: PathBuf,
    },
    /// Print row counts for every user table in a store
    Stats { db: PathBuf },
    /// Print the persisted config blob as pretty JSON
    ConfigShow { db: PathBuf },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Merge { dest, source } => {
            let dest = SqliteStore::open(&dest)?;
            let source = SqliteStore::open(&source)?;
            let report = merge_stores(&dest, &source)?;
            for table in &report.tables {
                println!(
                    "{}: {} rows{}",
                    table.name,
                    table.rows_copied,
                    if table.created { " (created)" } else { "" }
                );
            }
            println!("total: {} rows", report.total_rows());
            Ok(())
        }
        Command::Stats { db } => {
            let store = Arc::new(SqliteStore::open(&db)?);
            for name in store.table_list()? {
                let table = Table::new(store.clone(), &name)?;
                println!("{name}: {} rows", table.row_count()?);
            }
            Ok(())
        }
        Command::ConfigShow { db } => {
            let store = Arc::new(SqliteStore::open(&db)?);
            let config = ConfigTable::open_default(store)?;
            let blob = config.load()?;
            println!("{}", serde_json::to_string_pretty(&Value::Object(blob))?);
            Ok(())
        }
    }
}

fn init_tracing() {
    let config = parley::config::load_config();
    let default_level = config.observability.log_level.trim().to_lowercase();
    let default_level = if default_level.is_empty() {
        "warn".to_string()
    } else {
        default_level
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
