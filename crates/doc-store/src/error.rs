//! Error type for document store operations.

/// Error type for document store and table operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Could not open a connection to the backend
    #[error("Failed to connect to document store: {0}")]
    Connection(String),

    /// The backend rejected or failed an operation
    #[error("Document store backend error: {0}")]
    Backend(String),

    /// Field names are interpolated into backend queries and must be plain identifiers
    #[error("Invalid field name: '{0}'")]
    InvalidFieldName(String),

    /// A write carried only part of the table's configured key
    #[error("Record is missing configured key field '{0}'")]
    MissingKey(String),

    /// Error reading or writing a persisted collection
    #[error("Failed to persist collection: {0}")]
    Io(#[from] std::io::Error),

    /// Error encoding or decoding a document
    #[error("Failed to encode document: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<surrealdb::Error> for StoreError {
    fn from(e: surrealdb::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Whether `name` can be used as a field or collection name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn ensure_valid_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidFieldName(name.to_string()))
    }
}
