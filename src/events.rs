//! Events emitted by the database and its tables.
//!
//! Both are fanned out over tokio broadcast channels; emitting with no
//! subscriber is not an error.

use drive_index_core::Record;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// Database-level lifecycle and indexing events.
#[derive(Debug, Clone, PartialEq)]
pub enum DbEvent {
    /// An indexing pass started for `origin`, from the watermark to the
    /// source's current version.
    SourceIndexing { origin: String, from: u64, to: u64 },
    SourceIndexProgress { origin: String, done: usize, total: usize },
    SourceIndexed { origin: String, version: u64 },
    /// The initial pass timed out; a retry loop is running.
    SourceMissing { origin: String },
    /// A previously missing source answered and was indexed.
    SourceFound { origin: String },
    SourceError { origin: String, error: String },
    /// Table definitions changed and every index was cleared.
    IndexesReset,
    IndexesUpdated { origin: String, version: u64 },
}

impl DbEvent {
    /// Kebab-case event name, e.g. `source-indexed`.
    pub fn name(&self) -> &'static str {
        match self {
            DbEvent::SourceIndexing { .. } => "source-indexing",
            DbEvent::SourceIndexProgress { .. } => "source-index-progress",
            DbEvent::SourceIndexed { .. } => "source-indexed",
            DbEvent::SourceMissing { .. } => "source-missing",
            DbEvent::SourceFound { .. } => "source-found",
            DbEvent::SourceError { .. } => "source-error",
            DbEvent::IndexesReset => "indexes-reset",
            DbEvent::IndexesUpdated { .. } => "indexes-updated",
        }
    }

    pub fn origin(&self) -> Option<&str> {
        match self {
            DbEvent::SourceIndexing { origin, .. }
            | DbEvent::SourceIndexProgress { origin, .. }
            | DbEvent::SourceIndexed { origin, .. }
            | DbEvent::SourceMissing { origin }
            | DbEvent::SourceFound { origin }
            | DbEvent::SourceError { origin, .. }
            | DbEvent::IndexesUpdated { origin, .. } => Some(origin),
            DbEvent::IndexesReset => None,
        }
    }
}

/// Per-table record events.
#[derive(Debug, Clone, PartialEq)]
pub enum TableEvent {
    PutRecord(Record),
    DelRecord {
        url: String,
        origin: String,
        indexed_at: i64,
    },
}

/// Thin wrapper so emitters don't care whether anyone listens.
#[derive(Debug, Clone)]
pub struct Emitter<T: Clone> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> Emitter<T> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: T) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_wire_names() {
        let e = DbEvent::SourceIndexProgress { origin: "hyper://a".into(), done: 1, total: 2 };
        assert_eq!(e.name(), "source-index-progress");
        assert_eq!(e.origin(), Some("hyper://a"));
        assert_eq!(DbEvent::IndexesReset.origin(), None);
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let emitter: Emitter<DbEvent> = Emitter::new();
        emitter.emit(DbEvent::IndexesReset);
        let mut rx = emitter.subscribe();
        emitter.emit(DbEvent::SourceFound { origin: "hyper://a".into() });
        assert_eq!(rx.recv().await.unwrap(), DbEvent::SourceFound { origin: "hyper://a".into() });
    }
}
