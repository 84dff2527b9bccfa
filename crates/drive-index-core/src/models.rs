//! Core data models shared by the indexer, tables and queries.
//!
//! These are the shapes that get persisted in the key/value store: indexed
//! [`Record`]s, per-source [`Watermark`]s and per-table [`TableMeta`]
//! checksums, plus the [`ChangeEntry`] a source's change log yields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One indexed file, as stored in a table's primary namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// `origin + path`, the primary key.
    pub url: String,
    /// Origin of the owning source. Empty for helper tables.
    pub origin: String,
    /// Unix milliseconds at which the record was (re)indexed.
    pub indexed_at: i64,
    /// Decoded, validated and preprocessed payload.
    pub value: Value,
}

impl Record {
    pub fn new(url: impl Into<String>, origin: impl Into<String>, value: Value) -> Self {
        Self {
            url: url.into(),
            origin: origin.into(),
            indexed_at: chrono::Utc::now().timestamp_millis(),
            value,
        }
    }

    /// File path inside the owning source (`url` minus `origin`).
    pub fn path(&self) -> &str {
        self.url.strip_prefix(self.origin.as_str()).unwrap_or(&self.url)
    }

    /// Look up a possibly dotted field path (`"author.name"`) in the payload.
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup_field(&self.value, path)
    }
}

/// Resolve a dotted field path inside a JSON value.
pub fn lookup_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, part| current.as_object()?.get(part))
}

/// Highest source version fully applied to every table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub origin: String,
    pub version: u64,
}

impl Watermark {
    pub fn new(origin: impl Into<String>, version: u64) -> Self {
        Self {
            origin: origin.into(),
            version,
        }
    }
}

/// Persisted checksum of a table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub checksum: String,
}

/// Kind of a change-log mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Put,
    #[serde(alias = "delete")]
    Del,
}

/// One entry of a source's append-only change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub path: String,
    pub kind: ChangeKind,
    /// Source version produced by this mutation.
    pub seq: u64,
}

impl ChangeEntry {
    pub fn put(path: impl Into<String>, seq: u64) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Put,
            seq,
        }
    }

    pub fn del(path: impl Into<String>, seq: u64) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Del,
            seq,
        }
    }
}
