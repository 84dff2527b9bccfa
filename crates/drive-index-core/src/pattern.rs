//! Glob matching of source file paths against table file patterns.
//!
//! Patterns follow the usual shell conventions: `*` matches within one path
//! segment, `**` crosses directories. Paths are matched with a leading `/`;
//! patterns without one are anchored at the root (`"*.json"` matches
//! `"/profile.json"` but not `"/posts/1.json"`).

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{IndexError, Result};

/// A compiled set of glob patterns.
#[derive(Debug, Clone)]
pub struct FilePattern {
    patterns: Vec<String>,
    set: GlobSet,
}

impl FilePattern {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| normalize_path(p.as_ref()))
            .collect();
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| IndexError::Schema(format!("Invalid file pattern '{}': {}", pattern, e)))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| IndexError::Schema(format!("Invalid file patterns: {}", e)))?;
        Ok(Self { patterns, set })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.set.is_match(normalize_path(path))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Ensure a leading `/`.
pub fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}
