//! # drive-index
//!
//! A local-first index over versioned, append-only file stores ("drives").
//!
//! Each drive holds JSON files and a change log where every mutation bumps
//! the drive version by one. The indexer reads the change log since the
//! last version it saw (the watermark), keeps only the latest mutation per
//! path, runs matching files through each table's validate / preprocess
//! hooks and maintains a primary index plus secondary indexes per table.
//! Queries walk those indexes in key order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │   Drives    │──▶│   Scanner   │──▶│   Indexer    │──▶│ KvStore  │
//! │ Mem / Fs    │   │ latest-wins │   │ tables+marks │   │ SQLite   │
//! └─────────────┘   └─────────────┘   └──────┬───────┘   └────┬─────┘
//!                                            │                │
//!                                     ┌──────▼──────┐   ┌─────▼────┐
//!                                     │   Events    │   │  Query   │
//!                                     └─────────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dix init                       # create database
//! dix drive init ./alice         # make a directory a drive
//! dix index ./alice              # index its JSON files
//! dix query posts --where createdAt --above 0 --limit 5
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`database`] | Database facade: tables, sources, lifecycle |
//! | [`indexer`] | Indexing passes, watch and retry tasks |
//! | [`scanner`] | Windowed change-log reads, latest-wins reduction |
//! | [`table`] | Tables and their secondary indexes |
//! | [`query`] | Chainable queries and bulk update/delete |
//! | [`lock`] | Named async mutexes |
//! | [`source`] | The drive capability trait |
//! | [`drive_mem`] | In-memory drive |
//! | [`drive_fs`] | Directory-backed drive |
//! | [`events`] | Database and table events |
//! | [`sqlite_store`] | SQLite key/value store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`progress`] | Indexing progress reporting |

pub mod config;
pub mod database;
pub mod db;
pub mod drive_fs;
pub mod drive_mem;
pub mod events;
pub mod get;
pub mod index_cmd;
pub mod indexer;
pub mod lock;
pub mod migrate;
pub mod progress;
pub mod query;
pub mod query_cmd;
pub mod scanner;
pub mod source;
pub mod sources;
pub mod sqlite_store;
pub mod stats;
pub mod table;

pub use database::{Database, DbOptions, IndexOptions, OpenReport};
pub use drive_index_core::store::memory::InMemoryKvStore;
pub use drive_index_core::store::KvStore;
pub use drive_index_core::{
    ChangeEntry, ChangeKind, IndexError, IndexSpec, Record, Result, TableDef, Watermark,
};
pub use events::{DbEvent, TableEvent};
pub use query::{Query, Update, WhereClause};
pub use source::{Source, SourceResolver};
pub use table::Table;
