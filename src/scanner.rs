//! Change-log scanning.
//!
//! Turns a version range of a source's change log into the list of
//! mutations an indexing pass has to apply: only paths some table cares
//! about, only the latest mutation per path, ascending by sequence.
//!
//! The log is read in windows of at most `window` versions and reduced as
//! it streams in, so a long history never has to be held in memory at once.

use std::collections::HashMap;
use std::time::Duration;

use tracing::trace;

use drive_index_core::pattern::{normalize_path, FilePattern};
use drive_index_core::{ChangeEntry, Result};

use crate::source::{with_timeout, Source};

/// Scan parameters shared by every pass of one database.
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    /// Maximum number of versions requested per `history` call.
    pub window: u64,
    /// Read timeout applied to each `history` call.
    pub timeout: Duration,
}

/// Mutations with `from < seq <= to` that touch a path matched by at least
/// one of `patterns`, reduced to the latest one per path and sorted by
/// sequence.
pub async fn scan(
    source: &dyn Source,
    patterns: &[FilePattern],
    from: u64,
    to: u64,
    options: ScanOptions,
) -> Result<Vec<ChangeEntry>> {
    let window = options.window.max(1);
    let mut latest: HashMap<String, ChangeEntry> = HashMap::new();

    let mut start = from.saturating_add(1);
    let end = to.saturating_add(1);
    while start < end {
        let stop = start.saturating_add(window).min(end);
        trace!(origin = source.url(), start, stop, "reading change log");
        let chunk = with_timeout(
            source.url(),
            options.timeout,
            source.history(start, stop),
        )
        .await?;
        reduce_into(&mut latest, chunk, patterns, start, stop);
        start = stop;
    }

    Ok(into_sorted(latest))
}

/// Latest-wins reduction of a complete list of change entries.
pub fn reduce_latest(entries: Vec<ChangeEntry>, patterns: &[FilePattern]) -> Vec<ChangeEntry> {
    let mut latest = HashMap::new();
    reduce_into(&mut latest, entries, patterns, 0, u64::MAX);
    into_sorted(latest)
}

fn reduce_into(
    latest: &mut HashMap<String, ChangeEntry>,
    entries: Vec<ChangeEntry>,
    patterns: &[FilePattern],
    start: u64,
    stop: u64,
) {
    for mut entry in entries {
        // sources are trusted to honour the range, but a stray entry must
        // never be applied twice
        if entry.seq < start || entry.seq >= stop {
            continue;
        }
        entry.path = normalize_path(&entry.path);
        if !patterns.iter().any(|p| p.is_match(&entry.path)) {
            continue;
        }
        match latest.get(&entry.path) {
            Some(existing) if existing.seq > entry.seq => {}
            _ => {
                latest.insert(entry.path.clone(), entry);
            }
        }
    }
}

fn into_sorted(latest: HashMap<String, ChangeEntry>) -> Vec<ChangeEntry> {
    let mut out: Vec<ChangeEntry> = latest.into_values().collect();
    out.sort_by_key(|e| e.seq);
    out
}
