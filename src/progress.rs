//! Indexing progress reporting.
//!
//! Turns database events into observable progress during `dix index` so
//! users see which drive is being read, how many changed files are left
//! and the version each drive was indexed to. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::events::DbEvent;

/// A single progress event for an indexing pass.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IndexProgressEvent {
    /// Change log is being read between two versions.
    Scanning { origin: String, from: u64, to: u64 },
    /// `done` of `total` changed files applied.
    Applying {
        origin: String,
        done: u64,
        total: u64,
    },
    Indexed { origin: String, version: u64 },
    /// The drive did not answer in time.
    Missing { origin: String },
    Failed { origin: String, error: String },
}

impl IndexProgressEvent {
    /// Progress view of a database event; `None` for events that carry no
    /// progress.
    pub fn from_db_event(event: &DbEvent) -> Option<Self> {
        Some(match event {
            DbEvent::SourceIndexing { origin, from, to } => IndexProgressEvent::Scanning {
                origin: origin.clone(),
                from: *from,
                to: *to,
            },
            DbEvent::SourceIndexProgress {
                origin,
                done,
                total,
            } => IndexProgressEvent::Applying {
                origin: origin.clone(),
                done: *done as u64,
                total: *total as u64,
            },
            DbEvent::SourceIndexed { origin, version } => IndexProgressEvent::Indexed {
                origin: origin.clone(),
                version: *version,
            },
            DbEvent::SourceMissing { origin } => IndexProgressEvent::Missing {
                origin: origin.clone(),
            },
            DbEvent::SourceError { origin, error } => IndexProgressEvent::Failed {
                origin: origin.clone(),
                error: error.clone(),
            },
            _ => return None,
        })
    }
}

/// Reports indexing progress. Implementations write to stderr (human or JSON).
pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// Human-friendly progress on stderr: "index drive://ab12  applying  1,234 / 5,000 files".
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = match &event {
            IndexProgressEvent::Scanning { origin, from, to } => format!(
                "index {}  scanning  v{} -> v{}\n",
                origin,
                format_number(*from),
                format_number(*to)
            ),
            IndexProgressEvent::Applying {
                origin,
                done,
                total,
            } => format!(
                "index {}  applying  {} / {} files\n",
                origin,
                format_number(*done),
                format_number(*total)
            ),
            IndexProgressEvent::Indexed { origin, version } => {
                format!("index {}  done  v{}\n", origin, format_number(*version))
            }
            IndexProgressEvent::Missing { origin } => {
                format!("index {}  not responding\n", origin)
            }
            IndexProgressEvent::Failed { origin, error } => {
                format!("index {}  failed: {}\n", origin, error)
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &IndexProgressEvent) -> serde_json::Value {
        match event {
            IndexProgressEvent::Scanning { origin, from, to } => serde_json::json!({
                "event": "progress",
                "origin": origin,
                "phase": "scanning",
                "from": from,
                "to": to
            }),
            IndexProgressEvent::Applying {
                origin,
                done,
                total,
            } => serde_json::json!({
                "event": "progress",
                "origin": origin,
                "phase": "applying",
                "n": done,
                "total": total
            }),
            IndexProgressEvent::Indexed { origin, version } => serde_json::json!({
                "event": "indexed",
                "origin": origin,
                "version": version
            }),
            IndexProgressEvent::Missing { origin } => serde_json::json!({
                "event": "missing",
                "origin": origin
            }),
            IndexProgressEvent::Failed { origin, error } => serde_json::json!({
                "event": "error",
                "origin": origin,
                "error": error
            }),
        }
    }
}

impl IndexProgressReporter for JsonProgress {
    fn report(&self, event: IndexProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Forward database events to `reporter` until the channel closes or the
/// returned handle is aborted.
pub fn spawn_reporter(
    mut events: broadcast::Receiver<DbEvent>,
    reporter: Box<dyn IndexProgressReporter>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(progress) = IndexProgressEvent::from_db_event(&event) {
                        reporter.report(progress);
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}
