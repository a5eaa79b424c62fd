//! Backend traits.
//!
//! A [`DocumentStore`] is one open connection to a document-oriented
//! key-value service. A [`Connector`] opens connections; tables hold a
//! connector so they can recycle their connection periodically.
//!
//! ## Backends
//!
//! - `MemoryStore` - In-process collections, optionally persisted as JSON files
//! - `SurrealStore` - SurrealDB v2 SDK (`ws://`, `http://` or embedded `mem://`)

use async_trait::async_trait;
use std::sync::Arc;
use sync_core::Record;

use crate::error::Result;
use crate::filter::Filter;

/// A stored document.
pub type Document = Record;

/// One write in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Merge `document` into every document matching `filter`, inserting it
    /// when nothing matches. `filter` must not be empty.
    Upsert { filter: Filter, document: Document },

    /// Unconditionally insert `document`.
    Insert(Document),
}

/// Counts reported by [`DocumentStore::apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub inserted: usize,
    pub updated: usize,
}

impl WriteSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Operations on one open connection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Documents in `collection` matching `filter`.
    ///
    /// When `projection` is non-empty only the listed fields are returned.
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        projection: &[String],
    ) -> Result<Vec<Document>>;

    /// Apply a batch of writes in order.
    async fn apply(&self, collection: &str, ops: Vec<WriteOp>) -> Result<WriteSummary>;

    /// Delete documents matching `filter`, returning how many were removed.
    async fn delete(&self, collection: &str, filter: &Filter) -> Result<usize>;

    /// Names of every collection holding documents.
    async fn collections(&self) -> Result<Vec<String>>;
}

/// Opens connections to a backend.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Open a new connection.
    async fn connect(&self) -> Result<Arc<dyn DocumentStore>>;
}
