//! # drive-index core
//!
//! Runtime-independent building blocks of the drive index: record and
//! watermark models, the error taxonomy, the namespaced key/value store
//! trait (plus an in-memory implementation), order-preserving index key
//! encoding, table definitions and the validate/preprocess/serialize
//! pipeline.
//!
//! This crate contains no tokio, sqlx or filesystem I/O. The async engine
//! (indexer, tables, queries, sources) lives in the `drive-index` crate.

pub mod error;
pub mod keys;
pub mod models;
pub mod pattern;
pub mod pipeline;
pub mod store;
pub mod table_def;

pub use error::{IndexError, Result};
pub use models::{ChangeEntry, ChangeKind, Record, TableMeta, Watermark};
pub use table_def::{IndexSpec, TableDef};
