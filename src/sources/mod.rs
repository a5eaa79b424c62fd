//! Source plugins bundled with the crate.

pub mod jsonl;

pub use jsonl::JsonlSource;
