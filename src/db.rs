//! SQLite connection and database bootstrap for the CLI.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::database::{Database, OpenReport};
use crate::migrate::create_schema;
use crate::sqlite_store::SqliteKvStore;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    connect_path(&config.db.path).await
}

pub async fn connect_path(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    Ok(pool)
}

/// Connect, define every configured table and open the database. Tables
/// whose definition changed since the last run are reset here.
pub async fn open_database(config: &Config) -> Result<(Database, OpenReport)> {
    let pool = connect(config).await?;
    create_schema(&pool).await?;

    let store = Arc::new(SqliteKvStore::new(pool));
    let db = Database::new(config.db.name.clone(), store, config.db_options());
    for def in config.table_defs() {
        db.define(def)?;
    }
    let report = db.open().await?;
    if !report.rebuilds.is_empty() {
        info!(tables = ?report.rebuilds, "table definitions changed, indexes reset");
    }
    Ok((db, report))
}
