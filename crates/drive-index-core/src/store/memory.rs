//! In-memory [`KvStore`] implementation for testing and embedded use.
//!
//! Uses one `BTreeMap` per namespace behind a single `RwLock`, so a batch is
//! applied under one write guard and range scans come out ordered for free.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::Result;

use super::{BatchOp, KeyRange, KvStore};

type Space = BTreeMap<String, Value>;

/// In-memory store for tests and ephemeral databases.
pub struct InMemoryKvStore {
    spaces: RwLock<HashMap<String, Space>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            spaces: RwLock::new(HashMap::new()),
        }
    }

    /// Number of keys currently held in `space`.
    pub fn len(&self, space: &str) -> usize {
        self.spaces.read().get(space).map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, space: &str) -> bool {
        self.len(space) == 0
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, space: &str, key: &str) -> Result<Option<Value>> {
        let spaces = self.spaces.read();
        Ok(spaces.get(space).and_then(|s| s.get(key)).cloned())
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
        let spaces = self.spaces.read();
        let Some(entries) = spaces.get(space) else {
            return Ok(Vec::new());
        };
        let limit = limit.unwrap_or(usize::MAX);
        let bounds = (range.lower.clone(), range.upper.clone());
        let iter = entries.range::<String, _>(bounds);
        let collected = if reverse {
            iter.rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            iter.take(limit).map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        Ok(collected)
    }

    async fn write(&self, batch: Vec<BatchOp>) -> Result<()> {
        let mut spaces = self.spaces.write();
        for op in batch {
            match op {
                BatchOp::Put { space, key, value } => {
                    spaces.entry(space).or_default().insert(key, value);
                }
                BatchOp::Delete { space, key } => {
                    if let Some(s) = spaces.get_mut(&space) {
                        s.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn clear(&self, space: &str) -> Result<()> {
        self.spaces.write().remove(space);
        Ok(())
    }
}
