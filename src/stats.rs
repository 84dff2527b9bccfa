//! Table overview for `dix tables`.

use anyhow::Result;

use crate::config::Config;
use crate::db;

/// Per-table summary row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStats {
    pub name: String,
    pub helper: bool,
    pub indexes: Vec<String>,
    pub records: usize,
    pub checksum: String,
}

pub async fn table_stats(config: &Config) -> Result<Vec<TableStats>> {
    let (database, _report) = db::open_database(config).await?;
    let mut out = Vec::new();
    for table in database.tables() {
        out.push(TableStats {
            name: table.name().to_string(),
            helper: table.is_helper(),
            indexes: table.index_names(),
            records: table.count().await?,
            checksum: table.checksum().to_string(),
        });
    }
    database.close().await?;
    Ok(out)
}

pub async fn run_tables(config: &Config) -> Result<()> {
    let stats = table_stats(config).await?;

    println!("Database: {}", config.db.path.display());
    println!();
    println!(
        "{:<20} {:<7} {:>9}  {:<12}  INDEXES",
        "TABLE", "KIND", "RECORDS", "CHECKSUM"
    );
    for t in &stats {
        println!(
            "{:<20} {:<7} {:>9}  {:<12}  {}",
            t.name,
            if t.helper { "helper" } else { "files" },
            t.records,
            &t.checksum[..t.checksum.len().min(12)],
            if t.indexes.is_empty() {
                "-".to_string()
            } else {
                t.indexes.join(", ")
            }
        );
    }
    Ok(())
}
