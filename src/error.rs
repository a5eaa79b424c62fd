//! Error taxonomy of the synchronization layer.
//!
//! Internal operations return [`SyncError`]; the registry absorbs them into
//! success flags at its public boundary.

use doc_store::StoreError;
use sync_core::FieldViolation;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Invalid declaration, configuration or unknown resource
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown resource '{0}'")]
    UnknownResource(String),

    /// A request or fetched result did not match its declared schema
    #[error("Validation failed for '{uri}': {violation}")]
    Validation {
        uri: String,
        #[source]
        violation: FieldViolation,
    },

    /// No source plugin produced data
    #[error("Fetch failed for '{uri}': {reason}")]
    Fetch { uri: String, reason: String },

    #[error("Fetch of '{uri}' from '{plugin}' timed out after {secs}s")]
    Timeout {
        uri: String,
        plugin: String,
        secs: u64,
    },

    #[error("Fetch of '{0}' was cancelled")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Coverage bookkeeping could not be read or written
    #[error("Coverage error: {0:#}")]
    Coverage(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
