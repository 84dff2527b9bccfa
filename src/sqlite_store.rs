//! SQLite-backed [`KvStore`] implementation.
//!
//! Every namespace lives in the single `kv` table created by
//! [`create_schema`](crate::migrate::create_schema), keyed by
//! `(space, key)`. Keys are stored as BLOBs so range scans follow byte
//! order; values are JSON text. Batches run in one transaction.

use std::ops::Bound;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use drive_index_core::store::{BatchOp, KeyRange, KvStore};
use drive_index_core::{IndexError, Result};

/// SQLite implementation of the [`KvStore`] trait.
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn store_err(e: sqlx::Error) -> IndexError {
    IndexError::Store(e.to_string())
}

fn decode_row(key: Vec<u8>, value: String) -> Result<(String, Value)> {
    let key = String::from_utf8(key)
        .map_err(|e| IndexError::Store(format!("non UTF-8 key in store: {}", e)))?;
    Ok((key, serde_json::from_str(&value)?))
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, space: &str, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT value FROM kv WHERE space = ? AND key = ?")
            .bind(space)
            .bind(key.as_bytes())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        match row {
            Some(row) => {
                let value: String = row.get("value");
                Ok(Some(serde_json::from_str(&value)?))
            }
            None => Ok(None),
        }
    }

    async fn scan(
        &self,
        space: &str,
        range: &KeyRange,
        reverse: bool,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Value)>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT key, value FROM kv WHERE space = ");
        qb.push_bind(space);
        match &range.lower {
            Bound::Included(k) => {
                qb.push(" AND key >= ").push_bind(k.as_bytes().to_vec());
            }
            Bound::Excluded(k) => {
                qb.push(" AND key > ").push_bind(k.as_bytes().to_vec());
            }
            Bound::Unbounded => {}
        }
        match &range.upper {
            Bound::Included(k) => {
                qb.push(" AND key <= ").push_bind(k.as_bytes().to_vec());
            }
            Bound::Excluded(k) => {
                qb.push(" AND key < ").push_bind(k.as_bytes().to_vec());
            }
            Bound::Unbounded => {}
        }
        qb.push(if reverse {
            " ORDER BY key DESC"
        } else {
            " ORDER BY key ASC"
        });
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.into_iter()
            .map(|row| decode_row(row.get("key"), row.get("value")))
            .collect()
    }

    async fn write(&self, batch: Vec<BatchOp>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for op in batch {
            match op {
                BatchOp::Put { space, key, value } => {
                    sqlx::query(
                        r#"
                        INSERT INTO kv (space, key, value) VALUES (?, ?, ?)
                        ON CONFLICT(space, key) DO UPDATE SET value = excluded.value
                        "#,
                    )
                    .bind(space)
                    .bind(key.into_bytes())
                    .bind(serde_json::to_string(&value)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(store_err)?;
                }
                BatchOp::Delete { space, key } => {
                    sqlx::query("DELETE FROM kv WHERE space = ? AND key = ?")
                        .bind(space)
                        .bind(key.into_bytes())
                        .execute(&mut *tx)
                        .await
                        .map_err(store_err)?;
                }
            }
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn clear(&self, space: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE space = ?")
            .bind(space)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
