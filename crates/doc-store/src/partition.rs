//! Physical partitioning strategies.
//!
//! A strategy turns one logical request against a table into a finite list
//! of physical sub-requests, and names the collection a write for a given
//! identity belongs to. The table runs every sub-request and re-joins the
//! results on its key columns.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A logical request handed to a strategy.
#[derive(Debug, Clone)]
pub struct PartitionRequest<'a> {
    /// Collection name prefix of the logical table
    pub prefix: &'a str,
    /// Requested identities; empty means every identity
    pub identities: &'a [String],
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub fields: &'a [String],
    /// Collections currently present in the backend
    pub existing: &'a [String],
}

/// One physical query produced by a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct SubRequest {
    pub collection: String,
    /// Identities to filter on inside the collection; empty means no filter
    pub identities: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub fields: Vec<String>,
}

type SplitFn = dyn Fn(&PartitionRequest<'_>) -> Vec<SubRequest> + Send + Sync;
type LocateFn = dyn Fn(&str, Option<&str>) -> String + Send + Sync;

/// A named pair of split and locate functions.
#[derive(Clone)]
pub struct PartitionStrategy {
    name: String,
    split: Arc<SplitFn>,
    locate: Arc<LocateFn>,
}

impl PartitionStrategy {
    pub fn new(
        name: impl Into<String>,
        split: impl Fn(&PartitionRequest<'_>) -> Vec<SubRequest> + Send + Sync + 'static,
        locate: impl Fn(&str, Option<&str>) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            split: Arc::new(split),
            locate: Arc::new(locate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sub-requests for a logical request.
    pub fn split(&self, request: &PartitionRequest<'_>) -> Vec<SubRequest> {
        (self.split)(request)
    }

    /// Collection holding rows of `identity`.
    pub fn locate(&self, prefix: &str, identity: Option<&str>) -> String {
        (self.locate)(prefix, identity)
    }

    /// Look a strategy up by its declaration name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "per_identity" => Some(per_identity()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for PartitionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionStrategy")
            .field("name", &self.name)
            .finish()
    }
}

/// Collection-name-safe form of an identity (`000001.SZ` -> `000001_SZ`).
pub fn sanitize_identity(identity: &str) -> String {
    identity
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Separates a table prefix from its partition suffix. Declared locations
/// and prefixes may not contain `__`, so `fin_daily` never claims
/// `fin_daily_adj` or its partitions.
const PARTITION_MARKER: &str = "__p_";

fn partition_marker(prefix: &str) -> String {
    format!("{prefix}{PARTITION_MARKER}")
}

fn partition_name(prefix: &str, identity: &str) -> String {
    format!("{}{}", partition_marker(prefix), sanitize_identity(identity))
}

/// One collection per identity, named `{prefix}__p_{identity}`.
///
/// Requests without identities fan out to every existing partition.
pub fn per_identity() -> PartitionStrategy {
    PartitionStrategy::new(
        "per_identity",
        |req: &PartitionRequest<'_>| {
            if req.identities.is_empty() {
                let marker = partition_marker(req.prefix);
                return req
                    .existing
                    .iter()
                    .filter(|c| c.starts_with(&marker))
                    .map(|collection| SubRequest {
                        collection: collection.clone(),
                        identities: Vec::new(),
                        since: req.since,
                        until: req.until,
                        fields: req.fields.to_vec(),
                    })
                    .collect();
            }
            req.identities
                .iter()
                .map(|identity| SubRequest {
                    collection: partition_name(req.prefix, identity),
                    identities: vec![identity.clone()],
                    since: req.since,
                    until: req.until,
                    fields: req.fields.to_vec(),
                })
                .collect()
        },
        |prefix: &str, identity: Option<&str>| match identity {
            Some(identity) => partition_name(prefix, identity),
            None => prefix.to_string(),
        },
    )
}
