//! Error taxonomy shared by every layer of the index.

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Invalid table definition, or a definition attempted after open.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Malformed query, or a write against an unregistered / read-only source.
    #[error("Query error: {0}")]
    Query(String),

    /// Invalid argument shape passed to a table or query method.
    #[error("Parameter error: {0}")]
    Parameter(String),

    /// The source did not answer within the read timeout. Recoverable.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A record was rejected by its table's validator on the write path.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    /// True for the timeout class that feeds the retry loop instead of failing terminally.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, IndexError::SourceUnavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            IndexError::NotFound(_) => true,
            IndexError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
