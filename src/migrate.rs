use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the key/value table. Idempotent.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Keys are BLOBs so ordering is plain memcmp, matching Rust string order
    // (index keys contain NUL separators).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv (
            space TEXT NOT NULL,
            key BLOB NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (space, key)
        ) WITHOUT ROWID
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
