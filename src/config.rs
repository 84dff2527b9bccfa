//! Configuration loading for the `dix` binary.
//!
//! ```toml
//! [db]
//! path = "./data/dix.sqlite"
//!
//! [indexer]
//! read_timeout_secs = 30
//! retry_interval_secs = 30
//! history_window = 1000
//!
//! [tables.profiles]
//! file_pattern = "/profile.json"
//! index = ["name"]
//!
//! [tables.posts]
//! file_pattern = ["/posts/*.json"]
//! index = ["createdAt", "*tags"]
//! required = ["text", "createdAt"]
//! defaults = { tags = [] }
//! ```
//!
//! Each `[tables.<name>]` entry becomes a [`TableDef`]. `required` is turned
//! into a validate hook and `defaults` into a preprocess hook; both are folded
//! into the table revision so changing them triggers a rebuild on next open.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use drive_index_core::models::lookup_field;
use drive_index_core::table_def::canonical_json;
use drive_index_core::TableDef;

use crate::database::DbOptions;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Name reported by the database handle.
    #[serde(default = "default_db_name")]
    pub name: String,
}

fn default_db_name() -> String {
    "dix".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_history_window")]
    pub history_window: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_timeout_secs(),
            retry_interval_secs: default_timeout_secs(),
            history_window: default_history_window(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_history_window() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// One pattern or a list of them.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum Patterns {
    One(String),
    Many(Vec<String>),
}

impl Patterns {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Patterns::One(p) => vec![p.clone()],
            Patterns::Many(ps) => ps.clone(),
        }
    }
}

impl Default for Patterns {
    fn default() -> Self {
        Patterns::One("*.json".to_string())
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TableConfig {
    #[serde(default)]
    pub file_pattern: Patterns,
    #[serde(default)]
    pub index: Vec<String>,
    #[serde(default)]
    pub helper: bool,
    /// Fields a record must carry to be indexed.
    #[serde(default)]
    pub required: Vec<String>,
    /// Top-level fields filled in when a record lacks them.
    #[serde(default)]
    pub defaults: Map<String, Value>,
    #[serde(default)]
    pub revision: Option<String>,
}

impl TableConfig {
    pub fn to_table_def(&self, name: &str) -> TableDef {
        let mut def = TableDef::new(name);
        if self.helper {
            def = def.helper();
        } else {
            for pattern in self.file_pattern.to_vec() {
                def = def.file_pattern(pattern);
            }
        }
        for spec in &self.index {
            def = def.index(spec.clone());
        }

        if !self.required.is_empty() {
            let required = self.required.clone();
            def = def.validate(move |value| {
                Ok(required
                    .iter()
                    .all(|field| lookup_field(value, field).is_some_and(|v| !v.is_null())))
            });
        }
        if !self.defaults.is_empty() {
            let defaults = self.defaults.clone();
            def = def.preprocess(move |value| {
                let mut merged = value.as_object()?.clone();
                for (key, default) in &defaults {
                    merged.entry(key.clone()).or_insert_with(|| default.clone());
                }
                Some(Value::Object(merged))
            });
        }

        if self.revision.is_some() || !self.required.is_empty() || !self.defaults.is_empty() {
            let hooks = json!({
                "revision": self.revision,
                "required": self.required,
                "defaults": self.defaults,
            });
            def = def.revision(canonical_json(&hooks));
        }
        def
    }
}

impl Config {
    pub fn table_defs(&self) -> Vec<TableDef> {
        self.tables
            .iter()
            .map(|(name, table)| table.to_table_def(name))
            .collect()
    }

    pub fn db_options(&self) -> DbOptions {
        DbOptions {
            read_timeout: Duration::from_secs(self.indexer.read_timeout_secs),
            retry_interval: Duration::from_secs(self.indexer.retry_interval_secs),
            history_window: self.indexer.history_window,
            resolver: None,
        }
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.indexer.read_timeout_secs == 0 {
        anyhow::bail!("indexer.read_timeout_secs must be > 0");
    }
    if config.indexer.retry_interval_secs == 0 {
        anyhow::bail!("indexer.retry_interval_secs must be > 0");
    }
    if config.indexer.history_window == 0 {
        anyhow::bail!("indexer.history_window must be > 0");
    }

    for (name, table) in &config.tables {
        if name.starts_with('_') {
            anyhow::bail!("table name '{}' must not start with '_'", name);
        }
        table
            .to_table_def(name)
            .validate_definition()
            .with_context(|| format!("Invalid definition for table '{}'", name))?;
    }

    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drive_index_core::pipeline::{process_for_index, Processed};

    const SAMPLE: &str = r#"
        [db]
        path = "./data/dix.sqlite"

        [tables.profiles]
        file_pattern = "/profile.json"
        index = ["name"]

        [tables.posts]
        file_pattern = ["/posts/*.json"]
        index = ["createdAt", "*tags"]
        required = ["text"]
        defaults = { tags = [] }

        [tables.bookmarks]
        helper = true
        index = ["href"]
    "#;

    #[test]
    fn parses_tables_and_defaults() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.indexer.read_timeout_secs, 30);
        assert_eq!(config.indexer.history_window, 1000);
        assert_eq!(config.log.level, "warn");
        assert_eq!(config.db.name, "dix");

        let defs = config.table_defs();
        let names: Vec<&str> = defs.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["bookmarks", "posts", "profiles"]);
        assert!(defs[0].is_helper());
        assert_eq!(defs[1].file_patterns(), vec!["/posts/*.json".to_string()]);
    }

    #[test]
    fn required_and_defaults_become_hooks() {
        let config = parse_config(SAMPLE).unwrap();
        let posts = config.tables["posts"].to_table_def("posts");

        match process_for_index(&posts, json!({ "text": "hi" })) {
            Processed::Accepted(v) => assert_eq!(v, json!({ "text": "hi", "tags": [] })),
            _ => panic!("expected record to be accepted"),
        }
        assert!(matches!(
            process_for_index(&posts, json!({ "tags": ["a"] })),
            Processed::Rejected(_)
        ));
    }

    #[test]
    fn hook_settings_change_checksum() {
        let config = parse_config(SAMPLE).unwrap();
        let before = config.tables["posts"].to_table_def("posts").checksum();

        let mut changed = config.tables["posts"].clone();
        changed.required.push("createdAt".to_string());
        assert_ne!(before, changed.to_table_def("posts").checksum());
    }

    #[test]
    fn rejects_bad_indexer_values() {
        let err = parse_config("[db]\npath = \"x\"\n[indexer]\nhistory_window = 0\n").unwrap_err();
        assert!(err.to_string().contains("history_window"));
    }

    #[test]
    fn rejects_underscore_tables() {
        let err = parse_config("[db]\npath = \"x\"\n[tables._private]\n").unwrap_err();
        assert!(err.to_string().contains("_private"));
    }

    #[test]
    fn rejects_invalid_index_spec() {
        let err = parse_config("[db]\npath = \"x\"\n[tables.t]\nindex = [\":url\"]\n").unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid definition"));
    }
}
