//! Directory-backed versioned drive.
//!
//! An [`FsDrive`] is a plain directory plus a `.drive/` metadata folder:
//!
//! ```text
//! <dir>/
//!   .drive/key         drive id (uuid), origin is drive://<id>
//!   .drive/log.jsonl   append-only change log, one {path, kind, seq, hash} per line
//!   profile.json
//!   posts/1.json
//! ```
//!
//! Writes made through the [`Source`] trait append to the log directly.
//! Edits made on disk by other tools become versioned changes once
//! [`FsDrive::snapshot`] compares the tree against the last logged content
//! hash of every path.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use walkdir::WalkDir;

use drive_index_core::pattern::normalize_path;
use drive_index_core::{ChangeEntry, ChangeKind, IndexError, Result};

use crate::source::Source;

const META_DIR: &str = ".drive";
const KEY_FILE: &str = "key";
const LOG_FILE: &str = "log.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogLine {
    path: String,
    kind: ChangeKind,
    seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

/// A versioned drive stored in a local directory.
pub struct FsDrive {
    root: PathBuf,
    url: String,
    log: Mutex<Vec<LogLine>>,
    /// Orders file writes with their log entries.
    writes: tokio::sync::Mutex<()>,
    updates: broadcast::Sender<u64>,
}

impl FsDrive {
    /// Turn `dir` into a drive (creating it if needed). Re-initialising an
    /// existing drive keeps its key and log.
    pub fn init(dir: &Path) -> Result<Self> {
        let meta = dir.join(META_DIR);
        fs::create_dir_all(&meta)?;
        let key_path = meta.join(KEY_FILE);
        if !key_path.exists() {
            let key = uuid::Uuid::new_v4().simple().to_string();
            fs::write(&key_path, key)?;
        }
        let log_path = meta.join(LOG_FILE);
        if !log_path.exists() {
            fs::write(&log_path, "")?;
        }
        Self::open(dir)
    }

    /// Open an existing drive directory.
    pub fn open(dir: &Path) -> Result<Self> {
        let meta = dir.join(META_DIR);
        let key = fs::read_to_string(meta.join(KEY_FILE)).map_err(|e| {
            IndexError::NotFound(format!("{} is not a drive: {}", dir.display(), e))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(IndexError::Source(format!(
                "{} has an empty drive key",
                dir.display()
            )));
        }

        let mut log = Vec::new();
        let log_path = meta.join(LOG_FILE);
        if log_path.exists() {
            let reader = BufReader::new(fs::File::open(&log_path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogLine = serde_json::from_str(&line)?;
                log.push(entry);
            }
        }

        let (updates, _) = broadcast::channel(256);
        Ok(Self {
            root: dir.to_path_buf(),
            url: format!("drive://{}", key),
            log: Mutex::new(log),
            writes: tokio::sync::Mutex::new(()),
            updates,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record on-disk edits as versioned changes. Returns the number of
    /// change-log entries appended.
    pub fn snapshot(&self) -> Result<usize> {
        let mut on_disk: BTreeMap<String, String> = BTreeMap::new();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.file_name() != META_DIR)
        {
            let entry = entry.map_err(|e| IndexError::Source(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            let path = to_drive_path(relative);
            on_disk.insert(path, hash_bytes(&fs::read(entry.path())?));
        }

        let mut log = self.log.lock();
        let known = latest_state(&log);
        let mut appended = Vec::new();
        let mut seq = log.len() as u64;

        for (path, hash) in &on_disk {
            if known.get(path) != Some(hash) {
                seq += 1;
                appended.push(LogLine {
                    path: path.clone(),
                    kind: ChangeKind::Put,
                    seq,
                    hash: Some(hash.clone()),
                });
            }
        }
        for path in known.keys() {
            if !on_disk.contains_key(path) {
                seq += 1;
                appended.push(LogLine {
                    path: path.clone(),
                    kind: ChangeKind::Del,
                    seq,
                    hash: None,
                });
            }
        }

        let count = appended.len();
        if count > 0 {
            self.append(&mut log, appended)?;
            let _ = self.updates.send(seq);
        }
        Ok(count)
    }

    fn resolve(&self, path: &str) -> Result<(String, PathBuf)> {
        let path = normalize_path(path);
        let full = {
            let relative = Path::new(path.trim_start_matches('/'));
            let safe = relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
            if !safe || relative.as_os_str().is_empty() {
                return Err(IndexError::Parameter(format!("Invalid drive path: {}", path)));
            }
            if relative.starts_with(META_DIR) {
                return Err(IndexError::Parameter(format!("Reserved drive path: {}", path)));
            }
            self.root.join(relative)
        };
        Ok((path, full))
    }

    /// Append one change for `path` and notify subscribers.
    fn log_change(&self, path: String, kind: ChangeKind, hash: Option<String>) -> Result<()> {
        let seq = {
            let mut log = self.log.lock();
            let seq = log.len() as u64 + 1;
            self.append(&mut log, vec![LogLine { path, kind, seq, hash }])?;
            seq
        };
        let _ = self.updates.send(seq);
        Ok(())
    }

    fn append(&self, log: &mut Vec<LogLine>, lines: Vec<LogLine>) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(META_DIR).join(LOG_FILE))?;
        for line in &lines {
            writeln!(file, "{}", serde_json::to_string(line)?)?;
        }
        file.flush()?;
        log.extend(lines);
        Ok(())
    }
}

/// Latest content hash of every path that currently exists according to the log.
fn latest_state(log: &[LogLine]) -> BTreeMap<String, String> {
    let mut state = BTreeMap::new();
    for line in log {
        match line.kind {
            ChangeKind::Put => {
                state.insert(line.path.clone(), line.hash.clone().unwrap_or_default());
            }
            ChangeKind::Del => {
                state.remove(&line.path);
            }
        }
    }
    state
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn to_drive_path(relative: &Path) -> String {
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    format!("/{}", parts.join("/"))
}

#[async_trait]
impl Source for FsDrive {
    fn url(&self) -> &str {
        &self.url
    }

    fn version(&self) -> u64 {
        self.log.lock().len() as u64
    }

    fn writable(&self) -> bool {
        true
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let (path, full) = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(IndexError::NotFound(format!("{}{}", self.url, path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let (path, full) = self.resolve(path)?;
        let _writing = self.writes.lock().await;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, data).await?;
        self.log_change(path, ChangeKind::Put, Some(hash_bytes(data)))
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let (path, full) = self.resolve(path)?;
        let _writing = self.writes.lock().await;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IndexError::NotFound(format!("{}{}", self.url, path)));
            }
            Err(e) => return Err(e.into()),
        }
        self.log_change(path, ChangeKind::Del, None)
    }

    async fn readdir(&self, path: &str, recursive: bool) -> Result<Vec<String>> {
        let dir = normalize_path(path);
        let base = self.root.join(dir.trim_start_matches('/'));
        if !base.exists() {
            return Err(IndexError::NotFound(format!("{}{}", self.url, dir)));
        }
        let walker = WalkDir::new(&base)
            .min_depth(1)
            .max_depth(if recursive { usize::MAX } else { 1 });
        let mut out = Vec::new();
        for entry in walker
            .into_iter()
            .filter_entry(|e| e.file_name() != META_DIR)
        {
            let entry = entry.map_err(|e| IndexError::Source(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            out.push(to_drive_path(relative));
        }
        out.sort();
        Ok(out)
    }

    async fn history(&self, start: u64, end: u64) -> Result<Vec<ChangeEntry>> {
        let log = self.log.lock();
        Ok(log
            .iter()
            .filter(|l| l.seq >= start && l.seq < end)
            .map(|l| ChangeEntry {
                path: l.path.clone(),
                kind: l.kind,
                seq: l.seq,
            })
            .collect())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<u64>> {
        Some(self.updates.subscribe())
    }
}
