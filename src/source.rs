//! The Source capability: a versioned, append-only file store ("drive").
//!
//! The index never implements networking or storage of drives itself. It
//! consumes anything implementing [`Source`]: the in-memory [`MemDrive`],
//! the directory-backed [`FsDrive`], or an adapter over a remote peer.
//!
//! Source calls may hang when the drive is unreachable; the index wraps
//! every call in its read timeout (see [`with_timeout`]) and classifies an
//! elapsed timeout as [`IndexError::SourceUnavailable`].
//!
//! [`MemDrive`]: crate::drive_mem::MemDrive
//! [`FsDrive`]: crate::drive_fs::FsDrive

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use drive_index_core::{ChangeEntry, IndexError, Record, Result};

/// A versioned file store the index can read from and (maybe) write to.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable origin, e.g. `hyper://abc`. Record URLs are `url() + path`.
    fn url(&self) -> &str;

    /// Current version. Every mutation bumps it by one.
    fn version(&self) -> u64;

    fn writable(&self) -> bool;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn unlink(&self, path: &str) -> Result<()>;

    /// Paths below `path`, each with a leading `/`.
    async fn readdir(&self, path: &str, recursive: bool) -> Result<Vec<String>>;

    /// Change-log entries with `start <= seq < end`, in sequence order.
    async fn history(&self, start: u64, end: u64) -> Result<Vec<ChangeEntry>>;

    /// Notifications carrying the new version after each change, when the
    /// source supports watching.
    fn subscribe(&self) -> Option<broadcast::Receiver<u64>> {
        None
    }
}

/// Turns an origin string into a source handle for origins the database has
/// not seen yet.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, origin: &str) -> Result<Arc<dyn Source>>;
}

/// Any of the ways callers can name a source, normalised once at the API
/// boundary.
#[derive(Clone)]
pub enum OriginRef {
    Origin(String),
    Source(Arc<dyn Source>),
}

impl OriginRef {
    pub fn origin(&self) -> String {
        match self {
            OriginRef::Origin(url) => origin_of(url).unwrap_or_else(|| url.clone()),
            OriginRef::Source(source) => source.url().to_string(),
        }
    }

    pub fn source(&self) -> Option<&Arc<dyn Source>> {
        match self {
            OriginRef::Source(source) => Some(source),
            OriginRef::Origin(_) => None,
        }
    }
}

impl fmt::Debug for OriginRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginRef::Origin(url) => f.debug_tuple("Origin").field(url).finish(),
            OriginRef::Source(source) => f.debug_tuple("Source").field(&source.url()).finish(),
        }
    }
}

impl From<&str> for OriginRef {
    fn from(value: &str) -> Self {
        OriginRef::Origin(value.to_string())
    }
}

impl From<String> for OriginRef {
    fn from(value: String) -> Self {
        OriginRef::Origin(value)
    }
}

impl From<&String> for OriginRef {
    fn from(value: &String) -> Self {
        OriginRef::Origin(value.clone())
    }
}

impl From<Arc<dyn Source>> for OriginRef {
    fn from(value: Arc<dyn Source>) -> Self {
        OriginRef::Source(value)
    }
}

impl From<&Arc<dyn Source>> for OriginRef {
    fn from(value: &Arc<dyn Source>) -> Self {
        OriginRef::Source(Arc::clone(value))
    }
}

impl From<&Record> for OriginRef {
    fn from(value: &Record) -> Self {
        OriginRef::Origin(value.origin.clone())
    }
}

/// `scheme://host` part of a URL, without any trailing path.
pub fn origin_of(url: &str) -> Option<String> {
    split_record_url(url).map(|(origin, _)| origin)
}

/// Split `scheme://host/path` into `("scheme://host", "/path")`. The path
/// defaults to `/`.
pub fn split_record_url(url: &str) -> Option<(String, String)> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme.is_empty() {
        return None;
    }
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if host.is_empty() {
        return None;
    }
    let path = path.split(['?', '#']).next().unwrap_or("/");
    let path = if path.is_empty() { "/" } else { path };
    Some((format!("{}://{}", scheme, host), path.to_string()))
}

/// Run a source call under the read timeout.
pub async fn with_timeout<T, F>(origin: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(IndexError::SourceUnavailable(format!(
            "{} did not respond within {:?}",
            origin, timeout
        ))),
    }
}
