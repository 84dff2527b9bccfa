//! `dix drive init`, `dix index` and `dix unindex`.
//!
//! Drives on the command line are [`FsDrive`] directories. Indexing first
//! snapshots the directory so on-disk edits become versioned changes, then
//! runs one indexing pass per drive. Watching is off: the command exits once
//! every drive is caught up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::database::IndexOptions;
use crate::db;
use crate::drive_fs::FsDrive;
use crate::progress::{spawn_reporter, ProgressMode};
use crate::source::Source;

/// Outcome of indexing one drive directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSummary {
    pub dir: PathBuf,
    pub origin: String,
    /// Change-log entries recorded by the snapshot.
    pub changes: usize,
    pub version: u64,
}

pub fn run_drive_init(dir: &Path) -> Result<()> {
    let drive = FsDrive::init(dir)
        .with_context(|| format!("Failed to initialize drive at {}", dir.display()))?;
    let changes = drive.snapshot()?;
    println!("{}", drive.url());
    info!(origin = drive.url(), changes, "drive initialized");
    Ok(())
}

/// Snapshot and index every directory, returning one summary per drive.
pub async fn index_dirs(
    config: &Config,
    dirs: &[PathBuf],
    mode: ProgressMode,
    snapshot: bool,
) -> Result<Vec<IndexSummary>> {
    let (database, _report) = db::open_database(config).await?;
    let reporter = spawn_reporter(database.subscribe(), mode.reporter());

    let mut drives: Vec<(PathBuf, Arc<FsDrive>, usize)> = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let drive = FsDrive::open(dir)
            .with_context(|| format!("{} is not a drive (run `dix drive init`)", dir.display()))?;
        let changes = if snapshot { drive.snapshot()? } else { 0 };
        drives.push((dir.clone(), Arc::new(drive), changes));
    }

    let sources: Vec<Arc<dyn Source>> = drives
        .iter()
        .map(|(_, drive, _)| Arc::clone(drive) as Arc<dyn Source>)
        .collect();
    let result = database
        .index_sources(sources, IndexOptions { watch: false })
        .await;

    let mut summaries = Vec::with_capacity(drives.len());
    if result.is_ok() {
        for (dir, drive, changes) in &drives {
            let version = database
                .watermark(drive.url())
                .await?
                .map(|w| w.version)
                .unwrap_or(0);
            summaries.push(IndexSummary {
                dir: dir.clone(),
                origin: drive.url().to_string(),
                changes: *changes,
                version,
            });
        }
    }

    database.close().await?;
    reporter.abort();
    result?;
    Ok(summaries)
}

pub async fn run_index(
    config: &Config,
    dirs: &[PathBuf],
    mode: ProgressMode,
    snapshot: bool,
) -> Result<()> {
    let summaries = index_dirs(config, dirs, mode, snapshot).await?;
    println!("{:<44} {:>8} {:>8}  DIR", "ORIGIN", "CHANGES", "VERSION");
    for s in &summaries {
        println!(
            "{:<44} {:>8} {:>8}  {}",
            s.origin,
            s.changes,
            s.version,
            s.dir.display()
        );
    }
    Ok(())
}

/// Drop every record derived from the drives in `dirs`.
pub async fn run_unindex(config: &Config, dirs: &[PathBuf]) -> Result<()> {
    let (database, _report) = db::open_database(config).await?;
    for dir in dirs {
        let drive: Arc<dyn Source> = Arc::new(
            FsDrive::open(dir).with_context(|| format!("{} is not a drive", dir.display()))?,
        );
        database.unindex_source(&drive).await?;
        println!("unindexed {}", drive.url());
    }
    database.close().await?;
    Ok(())
}
