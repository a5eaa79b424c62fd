//! The synchronization pipeline.
//!
//! One run is a *patch*: plan the window, fetch it from the first capable
//! source, validate the result, merge it into the physical table and widen
//! the coverage records.
//!
//! ```text
//! Planned ──> Fetched ──> Validated ──> Merged ──> BookkeepingUpdated
//!    │           │
//!    │           └──> SchemaError (fetched rows discarded)
//!    ├──> FetchError (nothing written)
//!    └──> NoOp
//! ```
//!
//! Upserts are idempotent and coverage only widens, so a failed patch can be
//! re-run from the start. Buffered rows are flushed before any coverage is
//! written, and coverage is never written when the merge failed.

use checkpoint::{CoverageBook, CoverageTag};
use chrono::{DateTime, Utc};
use doc_store::PhysicalTable;
use std::sync::Arc;
use sync_core::{validate_result, Record, Table, Value};
use tracing::{info, warn};

use crate::descriptor::ResourceDescriptor;
use crate::error::{Result, SyncError};
use crate::planner::{Plan, Planner, TimeRange};
use crate::router::SourceRouter;

/// Recycling threshold used while merging a large fetch.
pub const EAGER_RECYCLE_AFTER: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStage {
    Planned,
    Fetched,
    Validated,
    Merged,
    BookkeepingUpdated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Still running
    Pending,
    Ok,
    NoOp,
    FetchError(String),
    SchemaError(String),
    StorageError(String),
}

/// One unit of synchronization work. Never persisted.
#[derive(Debug, Clone)]
pub struct Patch {
    pub uri: String,
    pub identity: Option<String>,
    pub planned: Option<TimeRange>,
    pub fetched_rows: Option<usize>,
    pub merged_rows: usize,
    /// Rows dropped for missing a key field
    pub skipped_rows: usize,
    pub stage: PatchStage,
    pub outcome: PatchOutcome,
}

impl Patch {
    fn new(uri: &str, identity: Option<&str>) -> Self {
        Self {
            uri: uri.to_string(),
            identity: identity.map(str::to_string),
            planned: None,
            fetched_rows: None,
            merged_rows: 0,
            skipped_rows: 0,
            stage: PatchStage::Planned,
            outcome: PatchOutcome::Pending,
        }
    }

    fn failed(mut self, outcome: PatchOutcome) -> Self {
        warn!(
            "Patch for '{}' ({:?}) failed at {:?}: {:?}",
            self.uri, self.identity, self.stage, outcome
        );
        self.outcome = outcome;
        self
    }

    /// `Ok` or `NoOp`.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, PatchOutcome::Ok | PatchOutcome::NoOp)
    }

    /// Failure message, if the patch failed.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            PatchOutcome::FetchError(e)
            | PatchOutcome::SchemaError(e)
            | PatchOutcome::StorageError(e) => Some(e),
            _ => None,
        }
    }
}

type Window = (Option<DateTime<Utc>>, Option<DateTime<Utc>>);

pub struct SyncPipeline {
    router: Arc<SourceRouter>,
    coverage: Arc<CoverageBook>,
    planner: Planner,
    large_identity_rows: usize,
    eager_recycle_after: usize,
}

impl SyncPipeline {
    pub fn new(
        router: Arc<SourceRouter>,
        coverage: Arc<CoverageBook>,
        planner: Planner,
        large_identity_rows: usize,
    ) -> Self {
        Self {
            router,
            coverage,
            planner,
            large_identity_rows,
            eager_recycle_after: EAGER_RECYCLE_AFTER,
        }
    }

    /// Merges above `rows` rows recycle their connection every `operations` operations.
    pub fn with_eager_recycling(mut self, rows: usize, operations: usize) -> Self {
        self.large_identity_rows = rows;
        self.eager_recycle_after = operations;
        self
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    async fn plan(
        &self,
        descriptor: &ResourceDescriptor,
        identity: Option<&str>,
        requested: &TimeRange,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Plan> {
        if force {
            let range = self.planner.full_range(now).narrow(requested);
            return Ok(if range.is_empty() {
                Plan::NoOp
            } else {
                Plan::Fetch(range)
            });
        }

        let tag = CoverageTag::for_request(&descriptor.uri, identity);
        let coverage = self.coverage.get(&tag).await.map_err(SyncError::Coverage)?;
        let reference = match &coverage {
            Some(_) => self.router.reference(descriptor, identity).await,
            None => None,
        };
        Ok(self
            .planner
            .plan(coverage.as_ref(), reference.as_ref(), requested, now))
    }

    /// Run one patch to completion.
    pub async fn run(
        &self,
        descriptor: &ResourceDescriptor,
        table: &PhysicalTable,
        identity: Option<&str>,
        requested: &TimeRange,
        extra: &Record,
        force: bool,
    ) -> Patch {
        let mut patch = Patch::new(&descriptor.uri, identity);
        let now = Utc::now();

        let range = match self.plan(descriptor, identity, requested, force, now).await {
            Ok(Plan::Fetch(range)) => range,
            Ok(Plan::NoOp) => {
                info!("'{}' ({identity:?}) is up to date", descriptor.uri);
                patch.outcome = PatchOutcome::NoOp;
                return patch;
            }
            Err(e) => return patch.failed(PatchOutcome::StorageError(e.to_string())),
        };
        patch.planned = Some(range);

        let rows = match self.router.route(descriptor, identity, &range, extra).await {
            Ok(Some(rows)) => rows,
            Ok(None) => {
                return patch.failed(PatchOutcome::FetchError(format!(
                    "no source returned rows for '{}'",
                    descriptor.uri
                )))
            }
            Err(e) => return patch.failed(PatchOutcome::FetchError(e.to_string())),
        };
        patch.stage = PatchStage::Fetched;
        patch.fetched_rows = Some(rows.len());

        if let Err(violation) = validate_result(&rows, Some(&descriptor.result_schema)) {
            let e = SyncError::Validation {
                uri: descriptor.uri.clone(),
                violation,
            };
            return patch.failed(PatchOutcome::SchemaError(e.to_string()));
        }
        patch.stage = PatchStage::Validated;

        let window = match self.merge(descriptor, table, rows, &mut patch).await {
            Ok(window) => window,
            Err(e) => return patch.failed(PatchOutcome::StorageError(e.to_string())),
        };
        patch.stage = PatchStage::Merged;

        // Keyed on time: coverage is what was actually stored. Otherwise the planned window.
        let (since, until) = if descriptor.time_field.is_some() {
            window
        } else {
            (range.since, range.until)
        };
        let mut tags = vec![CoverageTag::resource(&descriptor.uri)];
        if let Some(identity) = identity {
            tags.push(CoverageTag::identity(&descriptor.uri, identity));
        }
        for tag in &tags {
            if let Err(e) = self.coverage.advance(tag, since, until, Some(now)).await {
                return patch.failed(PatchOutcome::StorageError(
                    SyncError::Coverage(e).to_string(),
                ));
            }
        }
        patch.stage = PatchStage::BookkeepingUpdated;
        patch.outcome = PatchOutcome::Ok;

        info!(
            "Synchronized '{}' ({identity:?}): {} rows merged, {} skipped",
            descriptor.uri, patch.merged_rows, patch.skipped_rows
        );
        patch
    }

    async fn merge(
        &self,
        descriptor: &ResourceDescriptor,
        table: &PhysicalTable,
        rows: Table,
        patch: &mut Patch,
    ) -> Result<Window> {
        let eager = rows.len() > self.large_identity_rows;
        if eager {
            info!(
                "Merging {} rows into '{}', recycling connections every {} operations",
                rows.len(),
                descriptor.uri,
                self.eager_recycle_after
            );
            table.lower_recycle_threshold(self.eager_recycle_after).await;
        }
        let result = Self::write_rows(descriptor, table, rows, patch).await;
        if eager {
            table.reset_recycle_threshold().await;
        }
        result
    }

    async fn write_rows(
        descriptor: &ResourceDescriptor,
        table: &PhysicalTable,
        rows: Table,
        patch: &mut Patch,
    ) -> Result<Window> {
        let mut writer = table.bulk();
        let (mut earliest, mut latest): Window = (None, None);

        for (index, row) in rows.into_rows().into_iter().enumerate() {
            let identity = match &descriptor.identity_field {
                Some(field) => match row.get(field).and_then(Value::as_identity) {
                    Some(identity) => Some(identity),
                    None => {
                        warn!(
                            "Skipping row {index} of '{}': missing identity field '{field}'",
                            descriptor.uri
                        );
                        patch.skipped_rows += 1;
                        continue;
                    }
                },
                None => None,
            };
            let time = match &descriptor.time_field {
                Some(field) => match row.get(field).and_then(Value::as_timestamp) {
                    Some(time) => Some(time),
                    None => {
                        warn!(
                            "Skipping row {index} of '{}': missing time field '{field}'",
                            descriptor.uri
                        );
                        patch.skipped_rows += 1;
                        continue;
                    }
                },
                None => None,
            };

            writer.push(identity.as_deref(), time, row).await?;
            if let Some(time) = time {
                earliest = Some(earliest.map_or(time, |e: DateTime<Utc>| e.min(time)));
                latest = Some(latest.map_or(time, |l: DateTime<Utc>| l.max(time)));
            }
            patch.merged_rows += 1;
        }

        writer.flush().await?;
        Ok((earliest, latest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::SourcePlugin;
    use crate::router::tests::StaticPlugin;
    use chrono::{Duration as Days, TimeZone};
    use doc_store::{MemoryConnector, TableQuery};
    use std::time::Duration;
    use sync_core::{FieldSpec, FieldSpecMap, ValueType};

    fn day(d: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap() + Days::days(d)
    }

    fn rows(identity: &str, count: i64) -> Vec<Record> {
        (0..count)
            .map(|d| {
                Record::from([
                    ("code".to_string(), Value::from(identity)),
                    ("trade_date".to_string(), Value::Timestamp(day(d))),
                    ("close".to_string(), Value::Float(10.0 + d as f64)),
                ])
            })
            .collect()
    }

    fn descriptor() -> ResourceDescriptor {
        ResourceDescriptor::new("X", "fin", "daily")
            .with_identity("code")
            .with_time("trade_date")
    }

    struct Harness {
        pipeline: SyncPipeline,
        table: PhysicalTable,
        coverage: Arc<CoverageBook>,
        data: Arc<MemoryConnector>,
    }

    fn harness(plugin: StaticPlugin) -> Harness {
        let plugins: Vec<Arc<dyn SourcePlugin>> = vec![Arc::new(plugin)];
        let router = Arc::new(SourceRouter::new(plugins, Duration::from_secs(5)));
        let coverage = Arc::new(CoverageBook::new(Arc::new(MemoryConnector::default())));
        let data = Arc::new(MemoryConnector::default());
        let table = PhysicalTable::new(
            descriptor().table_config(&crate::config::SyncSettings::default()),
            data.clone(),
        );
        Harness {
            pipeline: SyncPipeline::new(
                router,
                coverage.clone(),
                Planner::new(Utc.with_ymd_and_hms(1990, 1, 1, 0, 0, 0).unwrap()),
                50_000,
            ),
            table,
            coverage,
            data,
        }
    }

    async fn run(h: &Harness, force: bool) -> Patch {
        h.pipeline
            .run(
                &descriptor(),
                &h.table,
                Some("id1"),
                &TimeRange::unbounded(),
                &Record::new(),
                force,
            )
            .await
    }

    #[tokio::test]
    async fn test_successful_patch_updates_coverage() {
        let h = harness(StaticPlugin::new("p", &["X"]).with_rows(rows("id1", 10)));
        let patch = run(&h, false).await;

        assert_eq!(patch.outcome, PatchOutcome::Ok);
        assert_eq!(patch.stage, PatchStage::BookkeepingUpdated);
        assert_eq!(patch.fetched_rows, Some(10));
        assert_eq!(patch.merged_rows, 10);
        assert_eq!(h.table.query(&TableQuery::new()).await.unwrap().len(), 10);

        let record = h
            .coverage
            .get(&CoverageTag::identity("X", "id1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.since, Some(day(0)));
        assert_eq!(record.until, Some(day(9)));
        assert!(record.last_synced_at.is_some());
        assert!(h
            .coverage
            .get(&CoverageTag::resource("X"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let h = harness(StaticPlugin::new("p", &["X"]).with_rows(rows("id1", 5)));
        assert!(run(&h, true).await.is_success());
        let first = h.table.query(&TableQuery::new()).await.unwrap();
        assert!(run(&h, true).await.is_success());
        let second = h.table.query(&TableQuery::new()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_current_coverage_is_noop() {
        let h = harness(StaticPlugin::new("p", &["X"]).with_rows(rows("id1", 3)));
        assert_eq!(run(&h, false).await.outcome, PatchOutcome::Ok);
        let patch = run(&h, false).await;
        assert_eq!(patch.outcome, PatchOutcome::NoOp);
        assert!(patch.is_success());
        assert!(patch.planned.is_none());
    }

    #[tokio::test]
    async fn test_fetch_error_writes_nothing() {
        let h = harness(StaticPlugin::new("p", &["X"]).failing());
        let patch = run(&h, false).await;
        assert!(matches!(patch.outcome, PatchOutcome::FetchError(_)));
        assert_eq!(patch.stage, PatchStage::Planned);
        assert!(h.table.query(&TableQuery::new()).await.unwrap().is_empty());
        assert!(h.coverage.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schema_error_discards_rows() {
        let mut bad = rows("id1", 3);
        bad[1].insert("close".to_string(), Value::from("n/a"));
        let h = harness(StaticPlugin::new("p", &["X"]).with_rows(bad));
        let schema = FieldSpecMap::from([(
            "close".to_string(),
            FieldSpec::required(vec![ValueType::Number]),
        )]);
        let strict = descriptor().with_result_schema(schema);

        let patch = h
            .pipeline
            .run(
                &strict,
                &h.table,
                Some("id1"),
                &TimeRange::unbounded(),
                &Record::new(),
                false,
            )
            .await;
        assert!(matches!(patch.outcome, PatchOutcome::SchemaError(_)));
        assert!(patch.error().is_some_and(|e| e.contains("close")));
        assert_eq!(patch.stage, PatchStage::Fetched);
        assert!(h.table.query(&TableQuery::new()).await.unwrap().is_empty());
        assert!(h.coverage.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rows_missing_keys_are_skipped() {
        let mut partial = rows("id1", 4);
        partial[0].remove("trade_date");
        partial[3].remove("code");
        let h = harness(StaticPlugin::new("p", &["X"]).with_rows(partial));

        let patch = run(&h, false).await;
        assert_eq!(patch.outcome, PatchOutcome::Ok);
        assert_eq!(patch.merged_rows, 2);
        assert_eq!(patch.skipped_rows, 2);

        let record = h
            .coverage
            .get(&CoverageTag::identity("X", "id1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.since, Some(day(1)));
        assert_eq!(record.until, Some(day(2)));
    }

    #[tokio::test]
    async fn test_large_merge_recycles_eagerly() {
        let mut h = harness(StaticPlugin::new("p", &["X"]).with_rows(rows("id1", 5)));
        h.table = PhysicalTable::new(
            descriptor()
                .table_config(&crate::config::SyncSettings::default())
                .with_batch_size(2),
            h.data.clone(),
        );
        h.pipeline = h.pipeline.with_eager_recycling(3, 1);

        assert!(run(&h, false).await.is_success());
        // Three flushes, each on a fresh connection
        assert_eq!(h.data.connect_count(), 3);
        assert_eq!(h.table.recycle_threshold().await, doc_store::DEFAULT_RECYCLE_AFTER);
    }
}
