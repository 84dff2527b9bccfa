//! Table Index: a named record collection with secondary indexes.
//!
//! Each table owns one primary namespace (`<table>`, record URL → stored
//! [`Record`]) and one namespace per secondary index
//! (`<table>/idx/<index>`, keyed by `encode(value) \0 url`). Index
//! maintenance always goes through [`TableState::put_ops`] /
//! [`TableState::delete_ops`], which produce the primary and secondary
//! changes for one record as a single batch, so readers never see a
//! record whose index entries are only half updated.
//!
//! [`Table`] is the public handle. Writes on file-backed tables go through
//! the owning source (write the file, then re-run the indexing pass); helper
//! tables write straight into the store.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use drive_index_core::keys::{entry_key, index_values};
use drive_index_core::pattern::FilePattern;
use drive_index_core::pipeline::process_for_write;
use drive_index_core::store::{BatchOp, KvStore, Sublevel};
use drive_index_core::table_def::URL_INDEX;
use drive_index_core::{IndexError, IndexSpec, Record, Result, TableDef};

use crate::database::Database;
use crate::events::{Emitter, TableEvent};
use crate::query::{Query, Update, WhereClause};
use crate::source::{split_record_url, with_timeout, Source};

/// One secondary index and its namespace.
#[derive(Debug, Clone)]
pub(crate) struct SecondaryIndex {
    pub spec: IndexSpec,
    pub level: Sublevel,
}

impl SecondaryIndex {
    fn keys_for(&self, record: &Record) -> BTreeSet<String> {
        index_values(record.field(&self.spec.field), self.spec.multi)
            .into_iter()
            .map(|encoded| entry_key(&encoded, &record.url))
            .collect()
    }
}

/// Store operations and events for a set of record changes, applied with a
/// single batch write.
#[derive(Default)]
pub(crate) struct Pending {
    ops: Vec<BatchOp>,
    events: Vec<(Arc<TableState>, TableEvent)>,
}

impl Pending {
    pub fn push_op(&mut self, op: BatchOp) {
        self.ops.push(op);
    }

    pub fn extend(&mut self, other: Pending) {
        self.ops.extend(other.ops);
        self.events.extend(other.events);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub async fn commit(self, store: &Arc<dyn KvStore>) -> Result<()> {
        if !self.ops.is_empty() {
            store.write(self.ops).await?;
        }
        for (table, event) in self.events {
            table.events.emit(event);
        }
        Ok(())
    }
}

/// Registry entry behind every [`Table`] handle.
pub(crate) struct TableState {
    pub def: TableDef,
    pub checksum: String,
    pub pattern: FilePattern,
    pub primary: Sublevel,
    pub indexes: Vec<SecondaryIndex>,
    pub events: Emitter<TableEvent>,
}

impl TableState {
    pub fn new(def: TableDef, store: Arc<dyn KvStore>) -> Result<Self> {
        def.validate_definition()?;
        let pattern = def.compile_pattern()?;
        let indexes = def
            .indexes()?
            .into_iter()
            .map(|spec| {
                let level = Sublevel::new(
                    Arc::clone(&store),
                    format!("{}/idx/{}", def.name(), spec.name),
                );
                SecondaryIndex { spec, level }
            })
            .collect();
        Ok(Self {
            checksum: def.checksum(),
            primary: Sublevel::new(store, def.name().to_string()),
            pattern,
            indexes,
            events: Emitter::new(),
            def,
        })
    }

    pub fn name(&self) -> &str {
        self.def.name()
    }

    pub fn is_record_file(&self, path: &str) -> bool {
        !self.def.is_helper() && self.pattern.is_match(path)
    }

    pub fn index(&self, name: &str) -> Option<&SecondaryIndex> {
        self.indexes.iter().find(|i| i.spec.name == name)
    }

    pub async fn get(&self, url: &str) -> Result<Option<Record>> {
        self.primary.get_as::<Record>(url).await
    }

    /// Changes that store `record`, replacing whatever was indexed at its URL.
    pub async fn put_ops(self: &Arc<Self>, record: Record) -> Result<Pending> {
        let previous = self.get(&record.url).await?;
        let mut pending = Pending::default();
        for index in &self.indexes {
            let new_keys = index.keys_for(&record);
            if let Some(prev) = &previous {
                for stale in index.keys_for(prev).difference(&new_keys) {
                    pending.push_op(index.level.delete_op(stale));
                }
            }
            for key in &new_keys {
                pending.push_op(index.level.put_op(key, Value::Null));
            }
        }
        pending.push_op(self.primary.put_op(&record.url, serde_json::to_value(&record)?));
        pending
            .events
            .push((Arc::clone(self), TableEvent::PutRecord(record)));
        Ok(pending)
    }

    /// Changes that drop the record at `url`; empty when nothing is indexed there.
    pub async fn delete_ops(self: &Arc<Self>, url: &str, origin: &str) -> Result<Pending> {
        let mut pending = Pending::default();
        let Some(previous) = self.get(url).await? else {
            return Ok(pending);
        };
        for index in &self.indexes {
            for key in index.keys_for(&previous) {
                pending.push_op(index.level.delete_op(&key));
            }
        }
        pending.push_op(self.primary.delete_op(url));
        pending.events.push((
            Arc::clone(self),
            TableEvent::DelRecord {
                url: url.to_string(),
                origin: origin.to_string(),
                indexed_at: chrono::Utc::now().timestamp_millis(),
            },
        ));
        Ok(pending)
    }

    pub async fn index_put(self: &Arc<Self>, record: Record) -> Result<()> {
        let store = Arc::clone(self.primary.store());
        self.put_ops(record).await?.commit(&store).await
    }

    pub async fn index_delete(self: &Arc<Self>, url: &str, origin: &str) -> Result<bool> {
        let store = Arc::clone(self.primary.store());
        let pending = self.delete_ops(url, origin).await?;
        let removed = !pending.is_empty();
        pending.commit(&store).await?;
        Ok(removed)
    }

    /// Drop every record and index entry of this table.
    pub async fn clear(&self) -> Result<()> {
        self.primary.clear().await?;
        for index in &self.indexes {
            index.level.clear().await?;
        }
        Ok(())
    }
}

/// Handle on one registered table.
#[derive(Clone)]
pub struct Table {
    pub(crate) db: Database,
    pub(crate) state: Arc<TableState>,
}

impl Table {
    pub(crate) fn new(db: Database, state: Arc<TableState>) -> Self {
        Self { db, state }
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn definition(&self) -> &TableDef {
        &self.state.def
    }

    pub fn checksum(&self) -> &str {
        &self.state.checksum
    }

    pub fn is_helper(&self) -> bool {
        self.state.def.is_helper()
    }

    /// Names of the secondary indexes, in definition order.
    pub fn index_names(&self) -> Vec<String> {
        self.state.indexes.iter().map(|i| i.spec.name.clone()).collect()
    }

    // queries

    pub fn query(&self) -> Query {
        Query::new(self.clone())
    }

    pub fn where_(&self, index: &str) -> Result<WhereClause> {
        self.query().where_(index)
    }

    pub fn order_by(&self, index: &str) -> Result<Query> {
        self.query().order_by(index)
    }

    pub fn filter<F>(&self, f: F) -> Query
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.query().filter(f)
    }

    pub fn limit(&self, n: usize) -> Query {
        self.query().limit(n)
    }

    pub fn offset(&self, n: usize) -> Query {
        self.query().offset(n)
    }

    pub fn reverse(&self) -> Query {
        self.query().reverse()
    }

    pub async fn count(&self) -> Result<usize> {
        self.query().count().await
    }

    pub async fn to_array(&self) -> Result<Vec<Record>> {
        self.query().to_array().await
    }

    pub async fn each<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(Record),
    {
        self.query().each(f).await
    }

    /// Point lookup by record URL.
    pub async fn get(&self, url: &str) -> Result<Option<Record>> {
        self.state.get(url).await
    }

    /// First record whose `index` equals `value`.
    pub async fn get_by(&self, index: &str, value: impl Into<Value>) -> Result<Option<Record>> {
        self.where_(index)?.equals(value)?.first().await
    }

    // writes

    /// Validate, preprocess and serialize `value`, then store it at `url`.
    ///
    /// File-backed tables write the file into the owning source and re-run
    /// its indexing pass; the source must be registered and writable.
    pub async fn put(&self, url: &str, value: Value) -> Result<String> {
        check_url(url, "put")?;
        let _guard = self.db.inner.locks.acquire(&write_key(url)).await;
        self.put_unlocked(url, value).await
    }

    /// Apply `update` to the record at `url`. Returns the number of records
    /// changed (0 or 1).
    pub async fn update(&self, url: &str, update: Update) -> Result<usize> {
        check_url(url, "update")?;
        let _guard = self.db.inner.locks.acquire(&write_key(url)).await;
        self.require_writable(url, "update").await?;
        self.where_(URL_INDEX)?.equals(url)?.update(update).await
    }

    /// Like [`update`](Self::update), but stores the update as a new record
    /// when nothing exists at `url` yet.
    pub async fn upsert(&self, url: &str, update: Update) -> Result<usize> {
        check_url(url, "upsert")?;
        let _guard = self.db.inner.locks.acquire(&write_key(url)).await;
        self.require_writable(url, "upsert").await?;
        let changed = self
            .where_(URL_INDEX)?
            .equals(url)?
            .update(update.clone())
            .await?;
        if changed > 0 {
            return Ok(changed);
        }
        self.put_unlocked(url, update.initial_value()).await?;
        Ok(1)
    }

    /// Remove the record at `url`. File-backed records are unlinked from
    /// their source.
    pub async fn delete(&self, url: &str) -> Result<usize> {
        check_url(url, "delete")?;
        self.where_(URL_INDEX)?.equals(url)?.delete().await
    }

    // record helpers

    pub fn is_record_file(&self, path: &str) -> bool {
        self.state.is_record_file(path)
    }

    /// Record URLs of every file in `source` that belongs to this table.
    pub async fn list_record_files(&self, source: &dyn Source) -> Result<Vec<String>> {
        if self.is_helper() {
            return Ok(Vec::new());
        }
        let files = with_timeout(
            source.url(),
            self.db.inner.options.read_timeout,
            source.readdir("/", true),
        )
        .await?;
        Ok(files
            .into_iter()
            .filter(|path| self.state.is_record_file(path))
            .map(|path| format!("{}{}", source.url(), path))
            .collect())
    }

    /// `put-record` / `del-record` notifications for this table.
    pub fn subscribe(&self) -> broadcast::Receiver<TableEvent> {
        self.state.events.subscribe()
    }

    pub(crate) async fn put_unlocked(&self, url: &str, value: Value) -> Result<String> {
        if !value.is_object() {
            return Err(IndexError::Parameter(
                "The second parameter of put() must be a record object".to_string(),
            ));
        }
        let stored = process_for_write(&self.state.def, value)?;

        if self.is_helper() {
            trace!(table = self.name(), url, "put helper record");
            self.state.index_put(Record::new(url, "", stored)).await?;
            return Ok(url.to_string());
        }

        let (origin, path) = split_record_url(url)
            .ok_or_else(|| IndexError::Parameter(format!("Invalid record url: {}", url)))?;
        if !self.is_record_file(&path) {
            return Err(IndexError::Parameter(format!(
                "{} does not match the file pattern of table '{}'",
                path,
                self.name()
            )));
        }
        let source = self.writable_source(&origin, "put")?;
        let bytes = serde_json::to_vec(&stored)?;
        debug!(table = self.name(), url, "writing record file");
        with_timeout(
            &origin,
            self.db.inner.options.read_timeout,
            source.write_file(&path, &bytes),
        )
        .await?;
        self.db.inner.index_drive(&source).await?;
        Ok(url.to_string())
    }

    /// Fails unless the source owning the record at `url` accepts writes.
    /// Helper records and absent records pass.
    async fn require_writable(&self, url: &str, op: &str) -> Result<()> {
        if self.is_helper() {
            return Ok(());
        }
        if let Some(record) = self.state.get(url).await? {
            self.writable_source(&record.origin, op)?;
        }
        Ok(())
    }

    /// The registered, writable source for `origin`, or a query error.
    pub(crate) fn writable_source(&self, origin: &str, op: &str) -> Result<Arc<dyn Source>> {
        let source = self.db.inner.registered_source(origin).ok_or_else(|| {
            IndexError::Query(format!(
                "Unable to {}(): {} is not part of the index",
                op, origin
            ))
        })?;
        if !source.writable() {
            return Err(IndexError::Query(format!(
                "Unable to {}(): {} is not writable",
                op, origin
            )));
        }
        Ok(source)
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("name", &self.name()).finish()
    }
}

fn write_key(url: &str) -> String {
    format!("write:{}", url)
}

fn check_url(url: &str, op: &str) -> Result<()> {
    if url.is_empty() {
        return Err(IndexError::Parameter(format!(
            "The first parameter of {}() must be a url",
            op
        )));
    }
    Ok(())
}
