//! Core types for the fin-sync framework.
//!
//! This crate provides the foundational types shared by the storage layer,
//! the coverage bookkeeping and the synchronization engine:
//!
//! - [`Value`] - Small tagged union carried in every record
//! - [`ValueType`] - Runtime type names used by field declarations
//! - [`Record`] - A schemaless `field -> Value` mapping
//! - [`Table`] - Tabular result exchanged with source plugins and callers
//! - [`FieldSpec`] - Per-field contract used by the schema checker
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── doc-store   (persists Records, returns Tables)
//!    ├─── checkpoint  (coverage bookkeeping over doc-store)
//!    └─── fin-sync    (registry, planner, router, pipeline)
//! ```
//!
//! # Example
//!
//! ```rust
//! use sync_core::{check_params, FieldSpec, FieldSpecMap, Record, Value, ValueType};
//!
//! let mut spec = FieldSpecMap::new();
//! spec.insert("amount".to_string(), FieldSpec::required(vec![ValueType::Number]));
//!
//! let mut params = Record::new();
//! params.insert("amount".to_string(), Value::Int(100));
//! assert!(check_params(&params, Some(&spec)));
//! ```

pub mod schema;
pub mod table;
pub mod types;
pub mod values;

pub use schema::{
    check_params, check_result, validate_params, validate_result, FieldSpec, FieldSpecMap,
    FieldViolation, ViolationReason,
};
pub use table::Table;
pub use types::ValueType;
pub use values::{format_timestamp, parse_timestamp, Record, Value};
