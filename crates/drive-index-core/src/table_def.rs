//! Table definitions.
//!
//! A [`TableDef`] is the immutable configuration of one table: which source
//! files feed it, which secondary indexes it maintains and the optional
//! `validate` / `preprocess` / `serialize` hooks its records pass through.
//! Its [`checksum`](TableDef::checksum) is persisted at open time; a mismatch
//! forces every index to be rebuilt.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{IndexError, Result};
use crate::pattern::FilePattern;

/// Key name reserved for the primary (record URL) ordering.
pub const URL_INDEX: &str = ":url";

/// Namespaces used internally by the database.
pub const RESERVED_NAMES: &[&str] = &["_tableSchema", "_indexMeta"];

pub type ValidateFn = Arc<dyn Fn(&Value) -> anyhow::Result<bool> + Send + Sync>;
pub type TransformFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// One secondary index of a table.
///
/// `"name"` indexes a single value, `"*tags"` indexes every element of an
/// array field, and dotted paths (`"author.name"`) reach into objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub field: String,
    pub multi: bool,
}

impl IndexSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let (field, multi) = match spec.strip_prefix('*') {
            Some(rest) => (rest, true),
            None => (spec, false),
        };
        if field.is_empty() || field.split('.').any(str::is_empty) {
            return Err(IndexError::Schema(format!("Invalid index spec '{}'", spec)));
        }
        if field == URL_INDEX {
            return Err(IndexError::Schema(format!(
                "'{}' is reserved for the primary index",
                URL_INDEX
            )));
        }
        Ok(Self {
            name: field.to_string(),
            field: field.to_string(),
            multi,
        })
    }

    fn spec_string(&self) -> String {
        if self.multi {
            format!("*{}", self.field)
        } else {
            self.field.clone()
        }
    }
}

/// Configuration of one table.
#[derive(Clone)]
pub struct TableDef {
    name: String,
    file_patterns: Vec<String>,
    index_specs: Vec<String>,
    helper: bool,
    revision: Option<String>,
    validate: Option<ValidateFn>,
    preprocess: Option<TransformFn>,
    serialize: Option<TransformFn>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_patterns: Vec::new(),
            index_specs: Vec::new(),
            helper: false,
            revision: None,
            validate: None,
            preprocess: None,
            serialize: None,
        }
    }

    pub fn file_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.file_patterns.push(pattern.into());
        self
    }

    pub fn index(mut self, spec: impl Into<String>) -> Self {
        self.index_specs.push(spec.into());
        self
    }

    /// Mark as a helper table: populated only through direct table writes.
    pub fn helper(mut self) -> Self {
        self.helper = true;
        self
    }

    /// Free-form tag folded into the checksum. Bump it when hook behaviour
    /// changes so existing indexes get rebuilt.
    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn validate<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(f));
        self
    }

    pub fn preprocess<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.preprocess = Some(Arc::new(f));
        self
    }

    pub fn serialize<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.serialize = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_helper(&self) -> bool {
        self.helper
    }

    /// Configured patterns, or `*.json` when none were given.
    pub fn file_patterns(&self) -> Vec<String> {
        if self.file_patterns.is_empty() {
            vec!["*.json".to_string()]
        } else {
            self.file_patterns.clone()
        }
    }

    pub fn validate_fn(&self) -> Option<&ValidateFn> {
        self.validate.as_ref()
    }

    pub fn preprocess_fn(&self) -> Option<&TransformFn> {
        self.preprocess.as_ref()
    }

    pub fn serialize_fn(&self) -> Option<&TransformFn> {
        self.serialize.as_ref()
    }

    /// Parsed index specs, in definition order.
    pub fn indexes(&self) -> Result<Vec<IndexSpec>> {
        let mut out: Vec<IndexSpec> = Vec::with_capacity(self.index_specs.len());
        for spec in &self.index_specs {
            let parsed = IndexSpec::parse(spec)?;
            if out.iter().any(|s| s.name == parsed.name) {
                return Err(IndexError::Schema(format!(
                    "Duplicate index '{}' on table '{}'",
                    parsed.name, self.name
                )));
            }
            out.push(parsed);
        }
        Ok(out)
    }

    /// Compiled file pattern. Helper tables match nothing.
    pub fn compile_pattern(&self) -> Result<FilePattern> {
        if self.helper {
            FilePattern::new(Vec::<String>::new())
        } else {
            FilePattern::new(self.file_patterns())
        }
    }

    /// Check the definition is usable.
    pub fn validate_definition(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(IndexError::Schema("Table name must not be empty".to_string()));
        }
        if self.name.contains('/') {
            return Err(IndexError::Schema(format!(
                "Table name '{}' must not contain '/'",
                self.name
            )));
        }
        if RESERVED_NAMES.contains(&self.name.as_str()) {
            return Err(IndexError::Schema(format!(
                "Table name '{}' is reserved",
                self.name
            )));
        }
        self.indexes()?;
        self.compile_pattern()?;
        Ok(())
    }

    /// Deterministic description used for the checksum.
    pub fn describe(&self) -> Value {
        let patterns: Vec<String> = if self.helper {
            Vec::new()
        } else {
            self.file_patterns()
        };
        let index: Vec<String> = self
            .index_specs
            .iter()
            .map(|s| {
                IndexSpec::parse(s)
                    .map(|p| p.spec_string())
                    .unwrap_or_else(|_| s.clone())
            })
            .collect();
        json!({
            "name": self.name,
            "filePattern": patterns,
            "index": index,
            "helperTable": self.helper,
            "validate": self.validate.is_some(),
            "preprocess": self.preprocess.is_some(),
            "serialize": self.serialize.is_some(),
            "revision": self.revision,
        })
    }

    /// SHA-256 over the canonical description, hex encoded.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(&self.describe()).as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Debug for TableDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableDef")
            .field("name", &self.name)
            .field("file_patterns", &self.file_patterns)
            .field("index_specs", &self.index_specs)
            .field("helper", &self.helper)
            .field("revision", &self.revision)
            .field("validate", &self.validate.is_some())
            .field("preprocess", &self.preprocess.is_some())
            .field("serialize", &self.serialize.is_some())
            .finish()
    }
}

/// JSON text with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_spec_parsing() {
        assert_eq!(
            IndexSpec::parse("*tags").unwrap(),
            IndexSpec { name: "tags".into(), field: "tags".into(), multi: true }
        );
        assert!(!IndexSpec::parse("author.name").unwrap().multi);
        assert!(IndexSpec::parse("").is_err());
        assert!(IndexSpec::parse("*").is_err());
        assert!(IndexSpec::parse("a..b").is_err());
        assert!(IndexSpec::parse(":url").is_err());
    }

    #[test]
    fn duplicate_indexes_are_rejected() {
        let def = TableDef::new("posts").index("tags").index("*tags");
        assert!(matches!(def.validate_definition(), Err(IndexError::Schema(_))));
    }

    #[test]
    fn reserved_and_empty_names_are_rejected() {
        assert!(TableDef::new("").validate_definition().is_err());
        assert!(TableDef::new("_indexMeta").validate_definition().is_err());
        assert!(TableDef::new("a/b").validate_definition().is_err());
        assert!(TableDef::new("_private").validate_definition().is_ok());
    }

    #[test]
    fn checksum_is_stable_and_sensitive() {
        let base = || TableDef::new("posts").file_pattern("/posts/*.json").index("createdAt");
        assert_eq!(base().checksum(), base().checksum());
        assert_ne!(base().checksum(), base().index("*tags").checksum());
        assert_ne!(base().checksum(), base().revision("2").checksum());
        assert_ne!(
            base().checksum(),
            base().validate(|_| Ok(true)).checksum(),
            "adding a hook changes the checksum"
        );
        assert_ne!(
            base().checksum(),
            TableDef::new("posts").file_pattern("/posts/**/*.json").index("createdAt").checksum()
        );
    }

    #[test]
    fn default_pattern_and_helper_matching() {
        let def = TableDef::new("profiles");
        assert_eq!(def.file_patterns(), vec!["*.json".to_string()]);
        assert!(def.compile_pattern().unwrap().is_match("/x.json"));
        let helper = TableDef::new("cache").helper();
        assert!(!helper.compile_pattern().unwrap().is_match("/x.json"));
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let a = serde_json::json!({"b": 1, "a": {"d": 2, "c": [3, {"f": 4, "e": 5}]}});
        assert_eq!(canonical_json(&a), r#"{"a":{"c":[3,{"e":5,"f":4}],"d":2},"b":1}"#);
    }
}
