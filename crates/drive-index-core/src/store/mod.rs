//! Persisted key/value storage abstraction.
//!
//! The [`KvStore`] trait is the only thing the index needs from its
//! persistence layer: namespaced ("sublevel") maps of string keys to JSON
//! values with ordered range scans and atomic multi-key batches. Table
//! primary stores, secondary indexes, table checksums and source watermarks
//! all live in their own namespace.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Lexicographic key range inside one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Bound<String>,
    pub upper: Bound<String>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    pub fn new(lower: Bound<String>, upper: Bound<String>) -> Self {
        Self { lower, upper }
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: &str) -> Self {
        Self {
            lower: Bound::Included(prefix.to_string()),
            upper: match prefix_successor(prefix) {
                Some(next) => Bound::Excluded(next),
                None => Bound::Unbounded,
            },
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let above = match &self.lower {
            Bound::Included(l) => key >= l.as_str(),
            Bound::Excluded(l) => key > l.as_str(),
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(u) => key <= u.as_str(),
            Bound::Excluded(u) => key < u.as_str(),
            Bound::Unbounded => true,
        };
        above && below
    }

    /// True when no key can satisfy both bounds.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u))
            | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
            _ => false,
        }
    }

    /// Continue a paged scan after `last_key` in the given direction.
    pub fn resume_after(&self, last_key: &str, reverse: bool) -> Self {
        if reverse {
            Self {
                lower: self.lower.clone(),
                upper: Bound::Excluded(last_key.to_string()),
            }
        } else {
            Self {
                lower: Bound::Excluded(last_key.to_string()),
                upper: self.upper.clone(),
            }
        }
    }
}

/// Smallest string greater than every string prefixed by `prefix`.
fn prefix_successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

/// One operation of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Put {
        space: String,
        key: String,
        value: Value,
    },
    Delete {
        space: String,
        key: String,
    },
}

/// Abstract namespaced key/value backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get`](KvStore::get) | Point lookup |
/// | [`scan`](KvStore::scan) | Ordered range scan, either direction, optional limit |
/// | [`write`](KvStore::write) | Apply a batch of puts/deletes atomically |
/// | [`clear`](KvStore::clear) | Drop every key of a namespace |
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, space: &str, key: &str) -> Result<Option<Value>>;

    async fn scan(
        &self,
        space: &str,
        range: &KeyRange,
        reverse: bool,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Value)>>;

    /// Apply every operation or none of them. Readers never observe a
    /// partially applied batch.
    async fn write(&self, batch: Vec<BatchOp>) -> Result<()>;

    async fn clear(&self, space: &str) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A handle on one namespace of a [`KvStore`].
#[derive(Clone)]
pub struct Sublevel {
    store: Arc<dyn KvStore>,
    space: String,
}

impl Sublevel {
    pub fn new(store: Arc<dyn KvStore>, space: impl Into<String>) -> Self {
        Self {
            store,
            space: space.into(),
        }
    }

    pub fn space(&self) -> &str {
        &self.space
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.store.get(&self.space, key).await
    }

    /// Fetch and decode a typed value. Undecodable entries read as absent.
    pub async fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.store.write(vec![self.put_op(key, value)]).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.write(vec![self.delete_op(key)]).await
    }

    pub async fn scan(
        &self,
        range: &KeyRange,
        reverse: bool,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Value)>> {
        self.store.scan(&self.space, range, reverse, limit).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear(&self.space).await
    }

    pub fn put_op(&self, key: &str, value: Value) -> BatchOp {
        BatchOp::Put {
            space: self.space.clone(),
            key: key.to_string(),
            value,
        }
    }

    pub fn delete_op(&self, key: &str) -> BatchOp {
        BatchOp::Delete {
            space: self.space.clone(),
            key: key.to_string(),
        }
    }
}

impl std::fmt::Debug for Sublevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sublevel").field("space", &self.space).finish()
    }
}
