//! Record retrieval by URL.
//!
//! Fetches one indexed record from a table. Used by the `dix get` CLI
//! command.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::db;

/// Record shape printed by `dix get`.
#[derive(Debug, Clone, Serialize)]
pub struct RecordResponse {
    pub table: String,
    pub url: String,
    pub origin: String,
    pub indexed_at: String, // ISO8601
    pub value: serde_json::Value,
}

/// Core get function returning structured data.
pub async fn get_record(config: &Config, table: &str, url: &str) -> Result<RecordResponse> {
    let (database, _report) = db::open_database(config).await?;
    let Some(handle) = database.table(table) else {
        database.close().await?;
        bail!("unknown table: {}", table);
    };

    let record = handle.get(url).await;
    database.close().await?;
    let Some(record) = record? else {
        bail!("record not found: {}", url);
    };

    Ok(RecordResponse {
        table: table.to_string(),
        url: record.url,
        origin: record.origin,
        indexed_at: format_ts_iso(record.indexed_at),
        value: record.value,
    })
}

/// CLI entry point: calls get_record and prints to stdout.
pub async fn run_get(config: &Config, table: &str, url: &str) -> Result<()> {
    let record = get_record(config, table, url).await?;

    println!("--- Record ---");
    println!("table:      {}", record.table);
    println!("url:        {}", record.url);
    println!(
        "origin:     {}",
        if record.origin.is_empty() {
            "(helper)"
        } else {
            &record.origin
        }
    );
    println!("indexed_at: {}", record.indexed_at);
    println!();
    println!("{}", serde_json::to_string_pretty(&record.value)?);

    Ok(())
}

fn format_ts_iso(ts_millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_millis)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts_millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_millis() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_ts_iso(1_700_000_000_123), "2023-11-14T22:13:20Z");
    }
}
