//! Incremental indexing of sources.
//!
//! Per source the indexer moves through
//! `unregistered → initial pass → watching/idle ⇄ incremental pass → unregistered`.
//!
//! An indexing pass ([`DbInner::index_drive`]) runs under the
//! `index:<origin>` key of the database's [`KeyedLock`](crate::lock::KeyedLock):
//!
//! 1. load the source's watermark (0 when absent)
//! 2. stop when it already covers the source's current version
//! 3. scan the change log for `(watermark, version]`
//! 4. apply each surviving mutation to every table whose pattern matches,
//!    writing the record changes and the watermark `{origin, seq}` in one batch
//! 5. finally move the watermark to the scanned version
//!
//! Because the watermark advances with each applied mutation, a pass that
//! fails halfway resumes at the failed mutation next time.

use std::collections::hash_map::Entry;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, trace, warn};

use drive_index_core::pipeline::{decode_payload, process_for_index, Processed};
use drive_index_core::store::{BatchOp, KeyRange};
use drive_index_core::{ChangeKind, Record, Result, Watermark};

use crate::database::{DbInner, IndexOptions, SourceEntry};
use crate::events::DbEvent;
use crate::scanner::{self, ScanOptions};
use crate::source::{with_timeout, Source};
use crate::table::{Pending, TableState};

fn index_key(origin: &str) -> String {
    format!("index:{}", origin)
}

impl DbInner {
    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            window: self.options.history_window,
            timeout: self.options.read_timeout,
        }
    }

    /// Register `source` and run its initial pass.
    pub(crate) async fn add_source(
        self: &Arc<Self>,
        source: Arc<dyn Source>,
        opts: IndexOptions,
    ) -> Result<()> {
        let origin = source.url().to_string();
        let registered = match self.sources.write().entry(origin.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(SourceEntry {
                    source: Arc::clone(&source),
                    watcher: None,
                    retry: None,
                });
                true
            }
        };
        if !registered {
            // lost a registration race; the winner owns the watch and retry tasks
            return self.index_drive(&source).await;
        }
        debug!(%origin, watch = opts.watch, "adding source");

        match self.index_drive(&source).await {
            Ok(()) => {
                if opts.watch {
                    self.watch(&source);
                }
                Ok(())
            }
            Err(e) if e.is_unavailable() => {
                debug!(%origin, "source unavailable, starting retry loop");
                self.events.emit(DbEvent::SourceMissing {
                    origin: origin.clone(),
                });
                let handle = self.spawn_retry(Arc::clone(&source), opts);
                match self.sources.write().get_mut(&origin) {
                    Some(entry) => entry.retry = Some(handle),
                    None => handle.abort(),
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Deregister a source, stop its tasks and drop its records and watermark.
    pub(crate) async fn remove_source(
        &self,
        origin: &str,
        source: Option<Arc<dyn Source>>,
    ) -> Result<()> {
        debug!(%origin, "removing source");
        self.unwatch(origin);
        if let Some(mut entry) = self.sources.write().remove(origin) {
            entry.stop_tasks();
        }
        self.unindex_drive(origin, source.as_ref()).await
    }

    /// Re-index `source` whenever it reports a new version.
    pub(crate) fn watch(self: &Arc<Self>, source: &Arc<dyn Source>) {
        let origin = source.url().to_string();
        let Some(mut updates) = source.subscribe() else {
            debug!(%origin, "source does not emit change notifications");
            return;
        };
        let weak: Weak<DbInner> = Arc::downgrade(self);
        let source = Arc::clone(source);
        let task_origin = origin.clone();
        let handle = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                // one pass covers every notification queued so far
                loop {
                    match updates.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                let Some(inner) = weak.upgrade() else { break };
                if !inner.is_open() || !inner.is_registered(&task_origin) {
                    break;
                }
                if let Err(e) = inner.index_drive(&source).await {
                    warn!(origin = %task_origin, error = %e, "watch-triggered indexing failed");
                }
            }
        });

        let mut sources = self.sources.write();
        match sources.get_mut(&origin) {
            Some(entry) => {
                if let Some(previous) = entry.watcher.replace(handle) {
                    previous.abort();
                }
            }
            None => handle.abort(),
        }
    }

    pub(crate) fn unwatch(&self, origin: &str) {
        if let Some(entry) = self.sources.write().get_mut(origin) {
            if let Some(handle) = entry.watcher.take() {
                handle.abort();
            }
        }
    }

    /// Keep re-attempting the initial pass of a missing source until it
    /// answers, fails for another reason, or is deregistered.
    fn spawn_retry(
        self: &Arc<Self>,
        source: Arc<dyn Source>,
        opts: IndexOptions,
    ) -> tokio::task::JoinHandle<()> {
        let weak: Weak<DbInner> = Arc::downgrade(self);
        let interval = self.options.retry_interval;
        tokio::spawn(async move {
            let origin = source.url().to_string();
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { return };
                if !inner.is_open() || !inner.is_registered(&origin) {
                    return;
                }
                trace!(%origin, "retrying missing source");
                match inner.index_drive(&source).await {
                    Ok(()) => {
                        debug!(%origin, "missing source found");
                        inner.events.emit(DbEvent::SourceFound {
                            origin: origin.clone(),
                        });
                        if opts.watch {
                            inner.watch(&source);
                        }
                        return;
                    }
                    Err(e) if e.is_unavailable() => continue,
                    Err(e) => {
                        debug!(%origin, error = %e, "retry loop aborted");
                        return;
                    }
                }
            }
        })
    }

    /// One incremental indexing pass. Failures other than unavailability
    /// are also reported as `source-error` events.
    pub(crate) async fn index_drive(&self, source: &Arc<dyn Source>) -> Result<()> {
        let origin = source.url().to_string();
        let _guard = self.locks.acquire(&index_key(&origin)).await;
        match self.run_pass(source.as_ref(), &origin).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !e.is_unavailable() {
                    warn!(%origin, error = %e, "indexing pass failed");
                    self.events.emit(DbEvent::SourceError {
                        origin: origin.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    async fn run_pass(&self, source: &dyn Source, origin: &str) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }

        let from = self.watermark(origin).await?;
        let target = source.version();
        if from >= target {
            trace!(%origin, version = from, "already indexed");
            self.events.emit(DbEvent::SourceIndexed {
                origin: origin.to_string(),
                version: from,
            });
            return Ok(());
        }

        debug!(%origin, from, to = target, "indexing");
        self.events.emit(DbEvent::SourceIndexing {
            origin: origin.to_string(),
            from,
            to: target,
        });

        let tables = self.file_tables();
        let patterns: Vec<_> = tables.iter().map(|t| t.pattern.clone()).collect();
        let updates = scanner::scan(source, &patterns, from, target, self.scan_options()).await?;
        let total = updates.len();

        for (i, update) in updates.iter().enumerate() {
            let mut pending = match update.kind {
                ChangeKind::Del => self.unindex_path(&tables, origin, &update.path).await?,
                ChangeKind::Put => self.read_and_index(&tables, source, &update.path).await?,
            };
            pending.push_op(self.watermark_op(origin, update.seq)?);
            pending.commit(&self.store).await?;
            self.events.emit(DbEvent::SourceIndexProgress {
                origin: origin.to_string(),
                done: i + 1,
                total,
            });
        }

        // trailing changes to unmatched paths still count as indexed
        if updates.last().map(|u| u.seq) != Some(target) {
            self.meta
                .put(origin, DbInner::watermark_value(origin, target)?)
                .await?;
        }

        debug!(%origin, applied = total, version = target, "indexed");
        self.events.emit(DbEvent::SourceIndexed {
            origin: origin.to_string(),
            version: target,
        });
        self.events.emit(DbEvent::IndexesUpdated {
            origin: origin.to_string(),
            version: target,
        });
        Ok(())
    }

    fn watermark_op(&self, origin: &str, version: u64) -> Result<BatchOp> {
        Ok(self
            .meta
            .put_op(origin, DbInner::watermark_value(origin, version)?))
    }

    /// Read one file and stage its records in every matching table. A file
    /// that fails to decode or validate is staged as a removal.
    async fn read_and_index(
        &self,
        tables: &[Arc<TableState>],
        source: &dyn Source,
        path: &str,
    ) -> Result<Pending> {
        let origin = source.url();
        let matching: Vec<&Arc<TableState>> =
            tables.iter().filter(|t| t.is_record_file(path)).collect();
        if matching.is_empty() {
            return Ok(Pending::default());
        }

        let bytes = match with_timeout(origin, self.options.read_timeout, source.read_file(path)).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                trace!(%origin, path, "file vanished before it was read");
                return self.unindex_path(tables, origin, path).await;
            }
            Err(e) => return Err(e),
        };

        let url = format!("{}{}", origin, path);
        let decoded = decode_payload(&bytes);
        let mut pending = Pending::default();
        for table in matching {
            let outcome = match &decoded {
                Ok(value) => process_for_index(&table.def, value.clone()),
                Err(reason) => {
                    warn!(table = table.name(), %url, %reason, "record rejected");
                    Processed::Rejected(reason.clone())
                }
            };
            match outcome {
                Processed::Accepted(value) => {
                    trace!(table = table.name(), %url, "indexing record");
                    pending.extend(table.put_ops(Record::new(&url, origin, value)).await?);
                }
                Processed::Rejected(_) => {
                    pending.extend(table.delete_ops(&url, origin).await?);
                }
            }
        }
        Ok(pending)
    }

    async fn unindex_path(
        &self,
        tables: &[Arc<TableState>],
        origin: &str,
        path: &str,
    ) -> Result<Pending> {
        let url = format!("{}{}", origin, path);
        let mut pending = Pending::default();
        for table in tables.iter().filter(|t| t.is_record_file(path)) {
            pending.extend(table.delete_ops(&url, origin).await?);
        }
        Ok(pending)
    }

    /// Drop every record derived from `origin` plus its watermark.
    async fn unindex_drive(&self, origin: &str, source: Option<&Arc<dyn Source>>) -> Result<()> {
        let _guard = self.locks.acquire(&index_key(origin)).await;
        let tables = self.file_tables();

        let listed = match source {
            Some(source) => {
                match with_timeout(origin, self.options.read_timeout, source.readdir("/", true)).await {
                    Ok(files) => files,
                    Err(e) => {
                        warn!(%origin, error = %e, "could not list source files, using stored records only");
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        let mut pending = Pending::default();
        let mut removed = 0usize;
        for table in &tables {
            let mut urls: BTreeSet<String> = listed
                .iter()
                .filter(|path| table.is_record_file(path))
                .map(|path| format!("{}{}", origin, path))
                .collect();
            let stored = table
                .primary
                .scan(&KeyRange::prefix(&format!("{}/", origin)), false, None)
                .await?;
            urls.extend(stored.into_iter().map(|(url, _)| url));
            for url in urls {
                let ops = table.delete_ops(&url, origin).await?;
                if !ops.is_empty() {
                    removed += 1;
                }
                pending.extend(ops);
            }
        }
        pending.push_op(self.meta.delete_op(origin));
        pending.commit(&self.store).await?;
        debug!(%origin, removed, "unindexed source");
        Ok(())
    }

    /// Re-index one file outside of a change-log pass.
    pub(crate) async fn index_single_file(&self, source: &Arc<dyn Source>, path: &str) -> Result<()> {
        let origin = source.url().to_string();
        let _guard = self.locks.acquire(&index_key(&origin)).await;
        let tables = self.file_tables();
        let pending = self.read_and_index(&tables, source.as_ref(), path).await?;
        pending.commit(&self.store).await
    }

    pub(crate) async fn unindex_single_file(&self, origin: &str, path: &str) -> Result<()> {
        let _guard = self.locks.acquire(&index_key(origin)).await;
        let tables = self.file_tables();
        let pending = self.unindex_path(&tables, origin, path).await?;
        pending.commit(&self.store).await
    }

    /// Clear every table and rewind every watermark to 0 when any table
    /// definition changed. Returns whether anything was reset.
    pub(crate) async fn reset_outdated_indexes(&self, rebuilds: &[String]) -> Result<bool> {
        if rebuilds.is_empty() {
            return Ok(false);
        }
        debug!(tables = ?rebuilds, "resetting outdated indexes");

        let tables: Vec<Arc<TableState>> = self.tables.read().clone();
        for table in &tables {
            trace!(table = table.name(), "clearing");
            table.clear().await?;
        }

        let mut batch = Vec::new();
        for (origin, value) in self.meta.scan(&KeyRange::all(), false, None).await? {
            let origin = serde_json::from_value::<Watermark>(value)
                .map(|w| w.origin)
                .unwrap_or(origin);
            batch.push(self.watermark_op(&origin, 0)?);
        }
        if !batch.is_empty() {
            self.store.write(batch).await?;
        }

        self.events.emit(DbEvent::IndexesReset);
        Ok(true)
    }
}
