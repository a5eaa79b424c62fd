//! Document tables for fin-sync
//!
//! Provides primary-key-aware tables on top of a document-oriented
//! key-value service.
//!
//! # Architecture
//!
//! - `DocumentStore` is one open connection: find, batched writes, delete
//! - `Connector` opens connections so tables can recycle them
//! - `PhysicalTable` adds key semantics, partition fan-out and time windows
//! - `BulkWriter` buffers upserts and flushes them in batches
//!
//! ## Backends
//!
//! - `MemoryStore` - In-process collections, optionally persisted as JSON files
//! - `SurrealStore` - SurrealDB v2 (`ws://`, `http://` or embedded `mem://`)
//!
//! ## Key modes
//!
//! The configured identity and time fields decide how upserts match rows.
//! See [`KeyMode`].

mod backend;
mod bulk;
mod error;
mod filter;
mod memory;
pub mod partition;
mod surreal;
mod table;

// Re-export backend traits
pub use backend::{Connector, Document, DocumentStore, WriteOp, WriteSummary};

// Re-export error types
pub use error::{is_valid_name, Result, StoreError};

// Re-export filters
pub use filter::{Clause, Filter};

// Re-export backends
pub use memory::{MemoryConnector, MemoryStore};
pub use surreal::{
    surreal_connect, surreal_connect_with_retries, SurrealConnector, SurrealOpts, SurrealStore,
};

// Re-export table types
pub use bulk::BulkWriter;
pub use partition::{per_identity, PartitionStrategy};
pub use table::{
    DeleteSpec, KeyMode, PhysicalRecord, PhysicalTable, TableConfig, TableQuery,
    DEFAULT_BATCH_SIZE, DEFAULT_RECYCLE_AFTER,
};
