//! In-memory versioned drive.
//!
//! [`MemDrive`] keeps files in a map and every mutation in an append-only
//! change log; the drive's version is the length of that log. It is what
//! tests and embedders use when no real peer-to-peer drive is around.
//!
//! Taking a drive offline ([`MemDrive::set_online`]) makes every capability
//! call stall forever, which is exactly what an unreachable remote drive
//! looks like to the indexer: the read timeout fires.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use drive_index_core::pattern::normalize_path;
use drive_index_core::{ChangeEntry, IndexError, Result};

use crate::source::Source;

#[derive(Default)]
struct MemState {
    files: BTreeMap<String, Vec<u8>>,
    log: Vec<ChangeEntry>,
}

/// A versioned drive held entirely in memory.
pub struct MemDrive {
    url: String,
    writable: bool,
    online: AtomicBool,
    state: Arc<Mutex<MemState>>,
    updates: broadcast::Sender<u64>,
    history_calls: AtomicUsize,
}

impl MemDrive {
    /// A writable drive at `hyper://<key>`.
    pub fn new(key: &str) -> Self {
        Self::with_url(format!("hyper://{}", key))
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            url: url.into(),
            writable: true,
            online: AtomicBool::new(true),
            state: Arc::new(Mutex::new(MemState::default())),
            updates,
            history_calls: AtomicUsize::new(0),
        }
    }

    /// Another handle on the same drive contents without write access, as a
    /// peer that does not own the drive would see it.
    pub fn read_only_view(&self) -> Self {
        Self {
            url: self.url.clone(),
            writable: false,
            online: AtomicBool::new(self.online.load(Ordering::SeqCst)),
            state: Arc::clone(&self.state),
            updates: self.updates.clone(),
            history_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of live change-notification subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.updates.receiver_count()
    }

    /// Number of change-log reads served so far.
    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    /// Write a JSON document, bypassing the writable flag (the drive owner
    /// writing from elsewhere).
    pub fn put_json(&self, path: &str, value: &Value) -> u64 {
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        self.apply_put(path, bytes)
    }

    /// Write raw bytes, bypassing the writable flag.
    pub fn put_bytes(&self, path: &str, bytes: &[u8]) -> u64 {
        self.apply_put(path, bytes.to_vec())
    }

    /// Delete a file, bypassing the writable flag. Returns the new version,
    /// or `None` when the file did not exist.
    pub fn remove(&self, path: &str) -> Option<u64> {
        self.apply_del(path)
    }

    fn apply_put(&self, path: &str, bytes: Vec<u8>) -> u64 {
        let path = normalize_path(path);
        let version = {
            let mut state = self.state.lock();
            let seq = state.log.len() as u64 + 1;
            state.files.insert(path.clone(), bytes);
            state.log.push(ChangeEntry::put(path, seq));
            seq
        };
        let _ = self.updates.send(version);
        version
    }

    fn apply_del(&self, path: &str) -> Option<u64> {
        let path = normalize_path(path);
        let version = {
            let mut state = self.state.lock();
            state.files.remove(&path)?;
            let seq = state.log.len() as u64 + 1;
            state.log.push(ChangeEntry::del(path, seq));
            seq
        };
        let _ = self.updates.send(version);
        Some(version)
    }

    async fn reachable(&self) {
        if !self.is_online() {
            std::future::pending::<()>().await;
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(IndexError::Source(format!("{} is not writable", self.url)))
        }
    }
}

#[async_trait]
impl Source for MemDrive {
    fn url(&self) -> &str {
        &self.url
    }

    fn version(&self) -> u64 {
        self.state.lock().log.len() as u64
    }

    fn writable(&self) -> bool {
        self.writable
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.reachable().await;
        let path = normalize_path(path);
        self.state
            .lock()
            .files
            .get(&path)
            .cloned()
            .ok_or_else(|| IndexError::NotFound(format!("{}{}", self.url, path)))
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.reachable().await;
        self.ensure_writable()?;
        self.apply_put(path, data.to_vec());
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        self.reachable().await;
        self.ensure_writable()?;
        self.apply_del(path)
            .map(|_| ())
            .ok_or_else(|| IndexError::NotFound(format!("{}{}", self.url, normalize_path(path))))
    }

    async fn readdir(&self, path: &str, recursive: bool) -> Result<Vec<String>> {
        self.reachable().await;
        let dir = normalize_path(path);
        let prefix = if dir.ends_with('/') { dir } else { format!("{}/", dir) };
        let state = self.state.lock();
        Ok(state
            .files
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .filter(|p| recursive || !p[prefix.len()..].contains('/'))
            .cloned()
            .collect())
    }

    async fn history(&self, start: u64, end: u64) -> Result<Vec<ChangeEntry>> {
        self.reachable().await;
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Ok(state
            .log
            .iter()
            .filter(|e| e.seq >= start && e.seq < end)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<u64>> {
        Some(self.updates.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drive_index_core::ChangeKind;
    use serde_json::json;

    #[tokio::test]
    async fn mutations_append_to_the_log() {
        let drive = MemDrive::new("abc");
        assert_eq!(drive.version(), 0);
        drive.put_json("/profile.json", &json!({"name": "alice"}));
        drive.write_file("posts/1.json", b"{}").await.unwrap();
        drive.unlink("/profile.json").await.unwrap();
        assert_eq!(drive.version(), 3);

        let log = drive.history(1, 4).await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1].path, "/posts/1.json");
        assert_eq!(log[2].kind, ChangeKind::Del);
        assert_eq!(drive.history(2, 3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn readdir_lists_with_leading_slash() {
        let drive = MemDrive::new("abc");
        drive.put_json("/profile.json", &json!({}));
        drive.put_json("/posts/1.json", &json!({}));
        drive.put_json("/posts/2020/2.json", &json!({}));
        let all = drive.readdir("/", true).await.unwrap();
        assert_eq!(all.len(), 3);
        let top = drive.readdir("/", false).await.unwrap();
        assert_eq!(top, vec!["/profile.json".to_string()]);
        let posts = drive.readdir("/posts", false).await.unwrap();
        assert_eq!(posts, vec!["/posts/1.json".to_string()]);
    }

    #[tokio::test]
    async fn read_only_view_rejects_writes_but_shares_content() {
        let drive = MemDrive::new("abc");
        drive.put_json("/a.json", &json!({"x": 1}));
        let view = drive.read_only_view();
        assert!(!view.writable());
        assert!(view.write_file("/b.json", b"{}").await.is_err());
        assert_eq!(view.read_file("/a.json").await.unwrap(), br#"{"x":1}"#.to_vec());
    }

    #[tokio::test]
    async fn offline_drive_stalls() {
        let drive = MemDrive::new("abc");
        drive.set_online(false);
        let res = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            drive.read_file("/a.json"),
        )
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn subscribers_see_new_versions() {
        let drive = MemDrive::new("abc");
        let mut rx = drive.subscribe().unwrap();
        drive.put_json("/a.json", &json!({}));
        assert_eq!(rx.recv().await.unwrap(), 1);
    }
}
