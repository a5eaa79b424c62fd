//! Coverage bookkeeping for fin-sync
//!
//! Records, per resource and per (resource, identity), which time window has
//! already been synchronized and when the last synchronization happened. The
//! planner reads these records to decide how much to re-fetch; the pipeline
//! widens them after a successful merge.
//!
//! # Storage layout
//!
//! Records live in an identity-only [`doc_store::PhysicalTable`] whose
//! identity field is the joined tag string:
//!
//! ```json
//! {
//!     "tag": "Finance.BalanceSheet.000001SZ",
//!     "since": "2021-01-01T00:00:00.000Z",
//!     "until": "2021-12-31T00:00:00.000Z",
//!     "last_synced_at": "2022-01-03T08:00:00.000Z"
//! }
//! ```

mod book;
mod record;
mod tag;

#[cfg(test)]
mod tests;

pub use book::{CoverageBook, COVERAGE_COLLECTION, TAG_FIELD};
pub use record::CoverageRecord;
pub use tag::CoverageTag;
