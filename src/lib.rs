//! fin-sync library
//!
//! Data virtualization and incremental synchronization for financial
//! time-series and reference data.
//!
//! # Overview
//!
//! - Resources (`Finance.BalanceSheet`, `Market.Daily`, ...) are declared in a
//!   YAML file and bound to physical document-store tables.
//! - `update` plans the minimal re-fetch window from stored coverage, fetches
//!   it from the first capable source plugin, validates and merges the rows,
//!   then widens the coverage records.
//! - `query` reads stored rows, optionally addressing fields by their
//!   readable labels.
//!
//! # CLI Usage
//!
//! ```bash
//! # Synchronize two identities of a resource
//! fin-sync --config fin-sync.toml update Market.Daily --identity 000001.SZ --identity 600000.SH
//!
//! # Read them back as JSON lines
//! fin-sync --config fin-sync.toml query Market.Daily --identity 000001.SZ --since 2021-01-01
//!
//! # Inspect coverage
//! fin-sync --config fin-sync.toml coverage Market.Daily --identity 000001.SZ
//! ```

pub mod alias;
pub mod config;
pub mod declaration;
pub mod descriptor;
pub mod error;
pub mod pipeline;
pub mod planner;
pub mod plugin;
pub mod registry;
pub mod router;
pub mod sources;

pub use alias::{AliasEntry, AliasIndex, UNRESOLVED};
pub use config::{Config, StorageConfig, SyncSettings};
pub use declaration::{load_declarations, parse_declarations};
pub use descriptor::ResourceDescriptor;
pub use error::{Result, SyncError};
pub use pipeline::{Patch, PatchOutcome, PatchStage, SyncPipeline};
pub use planner::{Plan, Planner, TimeRange, DEFAULT_EPOCH};
pub use plugin::{FieldLabels, Reference, Request, SourcePlugin};
pub use registry::{QueryOptions, Registry, RegistryBuilder};
pub use router::SourceRouter;
pub use sources::JsonlSource;
