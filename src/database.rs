//! The database facade: table registry, source registry and lifecycle.
//!
//! ```ignore
//! let store = Arc::new(InMemoryKvStore::new());
//! let db = Database::new("social", store, DbOptions::default());
//! db.define(TableDef::new("profiles").file_pattern("/profile.json").index("name"))?;
//! db.define(TableDef::new("posts").file_pattern("/posts/*.json").index("createdAt"))?;
//! let report = db.open().await?;
//!
//! db.index_source(drive.clone(), IndexOptions::default()).await?;
//! let alice = db.table("profiles").unwrap().get_by("name", "alice").await?;
//! ```
//!
//! [`Database`] is a cheap handle (`Arc` inside); clones share the same
//! registries. Tables must be defined before [`Database::open`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::debug;

use drive_index_core::store::{KeyRange, KvStore, Sublevel};
use drive_index_core::{IndexError, Result, TableDef, TableMeta, Watermark};

use crate::events::{DbEvent, Emitter};
use crate::lock::KeyedLock;
use crate::source::{split_record_url, OriginRef, Source, SourceResolver};
use crate::table::{Table, TableState};

/// Namespace holding one `TableMeta` per table.
pub const SCHEMA_SPACE: &str = "_tableSchema";
/// Namespace holding one `Watermark` per source origin.
pub const META_SPACE: &str = "_indexMeta";

/// Tunables of the indexer.
#[derive(Clone)]
pub struct DbOptions {
    /// Bound on every source call.
    pub read_timeout: Duration,
    /// Delay between attempts to reach a missing source.
    pub retry_interval: Duration,
    /// Versions requested per change-log read.
    pub history_window: u64,
    /// Opens sources for origins the database has not seen.
    pub resolver: Option<Arc<dyn SourceResolver>>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(30),
            history_window: 1000,
            resolver: None,
        }
    }
}

impl std::fmt::Debug for DbOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbOptions")
            .field("read_timeout", &self.read_timeout)
            .field("retry_interval", &self.retry_interval)
            .field("history_window", &self.history_window)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

/// Options for [`Database::index_source`].
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    /// Keep the index current by re-indexing on change notifications.
    pub watch: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self { watch: true }
    }
}

/// What [`Database::open`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenReport {
    /// Tables whose definition changed since the last open.
    pub rebuilds: Vec<String>,
}

pub(crate) struct SourceEntry {
    pub source: Arc<dyn Source>,
    pub watcher: Option<JoinHandle<()>>,
    pub retry: Option<JoinHandle<()>>,
}

impl SourceEntry {
    pub fn stop_tasks(&mut self) {
        if let Some(handle) = self.watcher.take() {
            handle.abort();
        }
        if let Some(handle) = self.retry.take() {
            handle.abort();
        }
    }
}

pub(crate) struct DbInner {
    pub name: String,
    pub store: Arc<dyn KvStore>,
    pub options: DbOptions,
    pub tables: RwLock<Vec<Arc<TableState>>>,
    pub sources: RwLock<HashMap<String, SourceEntry>>,
    pub locks: KeyedLock,
    pub events: Emitter<DbEvent>,
    pub schema: Sublevel,
    pub meta: Sublevel,
    pub open: AtomicBool,
    pub opening: tokio::sync::Mutex<()>,
}

impl DbInner {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn registered_source(&self, origin: &str) -> Option<Arc<dyn Source>> {
        self.sources
            .read()
            .get(origin)
            .map(|entry| Arc::clone(&entry.source))
    }

    pub fn is_registered(&self, origin: &str) -> bool {
        self.sources.read().contains_key(origin)
    }

    /// Tables backed by source files, in registration order.
    pub fn file_tables(&self) -> Vec<Arc<TableState>> {
        self.tables
            .read()
            .iter()
            .filter(|t| !t.def.is_helper())
            .cloned()
            .collect()
    }

    pub async fn watermark(&self, origin: &str) -> Result<u64> {
        Ok(self
            .meta
            .get_as::<Watermark>(origin)
            .await?
            .map(|w| w.version)
            .unwrap_or(0))
    }

    pub fn watermark_value(origin: &str, version: u64) -> Result<Value> {
        Ok(serde_json::to_value(Watermark::new(origin, version))?)
    }
}

/// Handle on an index database.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl Database {
    pub fn new(name: impl Into<String>, store: Arc<dyn KvStore>, options: DbOptions) -> Self {
        let inner = DbInner {
            name: name.into(),
            schema: Sublevel::new(Arc::clone(&store), SCHEMA_SPACE),
            meta: Sublevel::new(Arc::clone(&store), META_SPACE),
            store,
            options,
            tables: RwLock::new(Vec::new()),
            sources: RwLock::new(HashMap::new()),
            locks: KeyedLock::new(),
            events: Emitter::new(),
            open: AtomicBool::new(false),
            opening: tokio::sync::Mutex::new(()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &DbOptions {
        &self.inner.options
    }

    /// Register a table. Only allowed before the database is opened.
    pub fn define(&self, def: TableDef) -> Result<Table> {
        if self.is_open() {
            return Err(IndexError::Schema(
                "Cannot define a table when database is open".to_string(),
            ));
        }
        let state = Arc::new(TableState::new(def, Arc::clone(&self.inner.store))?);
        let mut tables = self.inner.tables.write();
        if tables.iter().any(|t| t.name() == state.name()) {
            return Err(IndexError::Schema(format!(
                "Table '{}' is already defined",
                state.name()
            )));
        }
        tables.push(Arc::clone(&state));
        Ok(Table::new(self.clone(), state))
    }

    /// Open the database: compare table checksums with the persisted ones
    /// and reset every index when any of them changed.
    pub async fn open(&self) -> Result<OpenReport> {
        let _opening = self.inner.opening.lock().await;
        if self.is_open() {
            return Ok(OpenReport::default());
        }
        debug!(db = %self.inner.name, "opening");

        let tables: Vec<Arc<TableState>> = self.inner.tables.read().clone();
        let mut rebuilds = Vec::new();
        for table in &tables {
            let stored = self.inner.schema.get_as::<TableMeta>(table.name()).await?;
            if stored.map(|m| m.checksum).as_deref() != Some(table.checksum.as_str()) {
                rebuilds.push(table.name().to_string());
            }
        }

        self.inner.reset_outdated_indexes(&rebuilds).await?;

        for table in &tables {
            let meta = TableMeta {
                checksum: table.checksum.clone(),
            };
            self.inner
                .schema
                .put(table.name(), serde_json::to_value(meta)?)
                .await?;
        }

        self.inner.open.store(true, Ordering::SeqCst);
        debug!(db = %self.inner.name, rebuilds = rebuilds.len(), "opened");
        Ok(OpenReport { rebuilds })
    }

    /// Stop every watch and retry task, forget the registered sources and
    /// close the store.
    pub async fn close(&self) -> Result<()> {
        let _opening = self.inner.opening.lock().await;
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(db = %self.inner.name, "closing");
        let entries: Vec<SourceEntry> = self.inner.sources.write().drain().map(|(_, e)| e).collect();
        for mut entry in entries {
            entry.stop_tasks();
        }
        self.inner.store.close().await
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// True when no indexing pass or record write holds or awaits a lock.
    pub fn is_idle(&self) -> bool {
        self.inner.locks.is_empty()
    }

    pub fn table(&self, name: &str) -> Option<Table> {
        self.inner
            .tables
            .read()
            .iter()
            .find(|t| t.name() == name)
            .map(|state| Table::new(self.clone(), Arc::clone(state)))
    }

    /// Registered tables in definition order. Names starting with `_` are
    /// internal and left out.
    pub fn tables(&self) -> Vec<Table> {
        self.inner
            .tables
            .read()
            .iter()
            .filter(|t| !t.name().starts_with('_'))
            .map(|state| Table::new(self.clone(), Arc::clone(state)))
            .collect()
    }

    /// Register a source (if new) and bring its records up to date.
    ///
    /// A source that does not answer within the read timeout is not an
    /// error: a `source-missing` event is emitted and a background task
    /// keeps retrying until it answers or is unindexed.
    pub async fn index_source(&self, source: impl Into<OriginRef>, opts: IndexOptions) -> Result<()> {
        self.ensure_open()?;
        let source = self.resolve(source.into()).await?;
        if self.inner.is_registered(source.url()) {
            return self.inner.index_drive(&source).await;
        }
        self.inner.add_source(source, opts).await
    }

    /// [`index_source`](Self::index_source) for several sources concurrently.
    pub async fn index_sources<I, R>(&self, sources: I, opts: IndexOptions) -> Result<()>
    where
        I: IntoIterator<Item = R>,
        R: Into<OriginRef>,
    {
        let mut set = JoinSet::new();
        for source in sources {
            let db = self.clone();
            let source: OriginRef = source.into();
            set.spawn(async move { db.index_source(source, opts).await });
        }
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let result = joined.map_err(|e| IndexError::Source(e.to_string()))?;
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Deregister a source and drop every record derived from it.
    pub async fn unindex_source(&self, source: impl Into<OriginRef>) -> Result<()> {
        self.ensure_open()?;
        let source = source.into();
        let origin = source.origin();
        let handle = self
            .inner
            .registered_source(&origin)
            .or_else(|| source.source().cloned());
        self.inner.remove_source(&origin, handle).await
    }

    /// Re-read and re-index one file, given its record URL.
    pub async fn index_file(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        let (origin, path) = split_record_url(url)
            .ok_or_else(|| IndexError::Parameter(format!("Invalid record url: {}", url)))?;
        let source = self.resolve(OriginRef::Origin(origin)).await?;
        self.inner.index_single_file(&source, &path).await
    }

    /// Remove one file's records from every matching table.
    pub async fn unindex_file(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        let (origin, path) = split_record_url(url)
            .ok_or_else(|| IndexError::Parameter(format!("Invalid record url: {}", url)))?;
        self.inner.unindex_single_file(&origin, &path).await
    }

    /// Origins of every registered source.
    pub fn list_sources(&self) -> Vec<String> {
        let mut origins: Vec<String> = self.inner.sources.read().keys().cloned().collect();
        origins.sort();
        origins
    }

    pub fn is_source(&self, source: impl Into<OriginRef>) -> bool {
        self.inner.is_registered(&source.into().origin())
    }

    /// The registered source for `origin`.
    pub fn source(&self, origin: &str) -> Option<Arc<dyn Source>> {
        self.inner.registered_source(origin)
    }

    /// Persisted watermarks, including sources that are no longer registered.
    pub async fn watermarks(&self) -> Result<Vec<Watermark>> {
        Ok(self
            .inner
            .meta
            .scan(&KeyRange::all(), false, None)
            .await?
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value(v).ok())
            .collect())
    }

    pub async fn watermark(&self, origin: &str) -> Result<Option<Watermark>> {
        self.inner.meta.get_as::<Watermark>(origin).await
    }

    /// Database-level events (`source-indexed`, `indexes-reset`, ...).
    pub fn subscribe(&self) -> broadcast::Receiver<DbEvent> {
        self.inner.events.subscribe()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(IndexError::Query(format!(
                "Database '{}' is not open",
                self.inner.name
            )))
        }
    }

    async fn resolve(&self, source: OriginRef) -> Result<Arc<dyn Source>> {
        match source {
            OriginRef::Source(source) => Ok(source),
            OriginRef::Origin(_) => {
                let origin = source.origin();
                if let Some(registered) = self.inner.registered_source(&origin) {
                    return Ok(registered);
                }
                match &self.inner.options.resolver {
                    Some(resolver) => resolver.resolve(&origin).await,
                    None => Err(IndexError::Query(format!(
                        "{} is not a registered source and no resolver is configured",
                        origin
                    ))),
                }
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("open", &self.is_open())
            .finish()
    }
}
