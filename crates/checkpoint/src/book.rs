//! Coverage storage.

use anyhow::Context;
use chrono::{DateTime, Utc};
use doc_store::{Connector, DeleteSpec, Filter, PhysicalTable, TableConfig, TableQuery};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{CoverageRecord, CoverageTag};

/// Collection coverage rows are stored in.
pub const COVERAGE_COLLECTION: &str = "sync_coverage";

/// Identity field of the coverage table.
pub const TAG_FIELD: &str = "tag";

/// Persisted coverage, one row per joined tag.
///
/// The book only ever widens a record. Widening is a read-modify-write and
/// runs under the book's write lock, since every identity of a resource also
/// widens the resource tag.
pub struct CoverageBook {
    table: PhysicalTable,
    write_lock: Mutex<()>,
}

impl CoverageBook {
    /// Open the book in the default collection.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_collection(COVERAGE_COLLECTION, connector)
    }

    pub fn with_collection(collection: &str, connector: Arc<dyn Connector>) -> Self {
        let config = TableConfig::new(collection).with_identity(TAG_FIELD);
        Self {
            table: PhysicalTable::new(config, connector),
            write_lock: Mutex::new(()),
        }
    }

    /// Stored coverage for a tag.
    pub async fn get(&self, tag: &CoverageTag) -> anyhow::Result<Option<CoverageRecord>> {
        let joined = tag.joined();
        let records = self
            .table
            .query_records(&TableQuery::new().identity(joined.clone()))
            .await
            .with_context(|| format!("Failed to read coverage for '{joined}'"))?;
        Ok(records
            .into_iter()
            .next()
            .map(|r| CoverageRecord::from_fields(joined, &r.fields)))
    }

    /// Widen the coverage of a tag and persist the result.
    pub async fn advance(
        &self,
        tag: &CoverageTag,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        synced_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<CoverageRecord> {
        let joined = tag.joined();
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .get(tag)
            .await?
            .unwrap_or_else(|| CoverageRecord::new(joined.clone()));

        if !record.advance(since, until, synced_at) {
            debug!("Coverage for '{joined}' unchanged");
            return Ok(record);
        }

        self.table
            .upsert(Some(&joined), None, record.to_fields(), &Filter::new())
            .await
            .with_context(|| format!("Failed to write coverage for '{joined}'"))?;
        debug!(
            "Coverage for '{joined}' now {:?}..{:?} (synced {:?})",
            record.since, record.until, record.last_synced_at
        );
        Ok(record)
    }

    /// Every stored record, ordered by tag.
    pub async fn all(&self) -> anyhow::Result<Vec<CoverageRecord>> {
        let records = self
            .table
            .query_records(&TableQuery::new())
            .await
            .context("Failed to list coverage")?;
        Ok(records
            .into_iter()
            .filter_map(|r| {
                let tag = r.identity?;
                Some(CoverageRecord::from_fields(tag, &r.fields))
            })
            .collect())
    }

    /// Forget the coverage of a tag. Returns whether a record existed.
    pub async fn reset(&self, tag: &CoverageTag) -> anyhow::Result<bool> {
        let joined = tag.joined();
        let removed = self
            .table
            .delete(&DeleteSpec {
                identity: Some(joined.clone()),
                ..DeleteSpec::default()
            })
            .await
            .with_context(|| format!("Failed to reset coverage for '{joined}'"))?;
        if removed > 0 {
            info!("Reset coverage for '{joined}'");
        }
        Ok(removed > 0)
    }

    /// Forget a tag and the tags exactly one segment below it, such as a
    /// resource and its identities. Tags listed in `keep` survive. Returns
    /// how many were removed.
    pub async fn reset_tree(
        &self,
        tag: &CoverageTag,
        keep: &[CoverageTag],
    ) -> anyhow::Result<usize> {
        let joined = tag.joined();
        let nested = format!("{joined}.");
        let keep: Vec<String> = keep.iter().map(CoverageTag::joined).collect();
        let mut removed = 0;
        for record in self.all().await? {
            let child = record
                .tag
                .strip_prefix(&nested)
                .is_some_and(|rest| !rest.contains('.'));
            if (record.tag == joined || child) && !keep.contains(&record.tag) {
                removed += self
                    .table
                    .delete(&DeleteSpec {
                        identity: Some(record.tag.clone()),
                        ..DeleteSpec::default()
                    })
                    .await
                    .with_context(|| format!("Failed to reset coverage for '{}'", record.tag))?;
            }
        }
        if removed > 0 {
            info!("Reset {removed} coverage records under '{joined}'");
        }
        Ok(removed)
    }
}
