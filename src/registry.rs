//! The resource registry.
//!
//! Binds every declared resource URI to its physical table and exposes the
//! caller API: `query`, `update`, `delete` and coverage inspection. Errors
//! never escape this boundary; operations return `bool` or `Option`, log the
//! failure and keep its message as the registry's last error.

use checkpoint::{CoverageBook, CoverageRecord, CoverageTag};
use doc_store::{Connector, DeleteSpec, Filter, MemoryConnector, PhysicalTable, TableQuery};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use sync_core::{validate_params, Record, Table};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alias::AliasIndex;
use crate::config::{Config, SyncSettings};
use crate::declaration::load_declarations;
use crate::descriptor::ResourceDescriptor;
use crate::error::{Result, SyncError};
use crate::pipeline::{Patch, SyncPipeline};
use crate::planner::{Planner, TimeRange};
use crate::plugin::SourcePlugin;
use crate::router::SourceRouter;
use crate::sources::JsonlSource;

/// Options of [`Registry::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Identities to read; empty reads every identity
    pub identities: Vec<String>,
    pub range: TimeRange,
    /// Fields to return besides the key columns; empty returns everything
    pub fields: Vec<String>,
    /// `fields` are readable labels, and result columns are relabelled
    pub use_labels: bool,
    /// Extra equality filters, also validated against the query schema
    pub extra: Record,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identities.push(identity.into());
        self
    }

    pub fn range(mut self, range: TimeRange) -> Self {
        self.range = range;
        self
    }

    pub fn fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn labels(mut self) -> Self {
        self.use_labels = true;
        self
    }
}

struct Resource {
    descriptor: ResourceDescriptor,
    table: PhysicalTable,
}

pub struct Registry {
    resources: HashMap<String, Resource>,
    router: Arc<SourceRouter>,
    coverage: Arc<CoverageBook>,
    pipeline: SyncPipeline,
    aliases: OnceLock<AliasIndex>,
    last_error: Mutex<Option<String>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Declared resources, ordered by URI.
    pub fn resources(&self) -> Vec<&ResourceDescriptor> {
        let mut descriptors: Vec<&ResourceDescriptor> =
            self.resources.values().map(|r| &r.descriptor).collect();
        descriptors.sort_by(|a, b| a.uri.cmp(&b.uri));
        descriptors
    }

    pub fn descriptor(&self, uri: &str) -> Option<&ResourceDescriptor> {
        self.resources.get(uri).map(|r| &r.descriptor)
    }

    pub fn router(&self) -> &SourceRouter {
        &self.router
    }

    /// The field alias index, built from the registered plugins on first use.
    pub fn aliases(&self) -> &AliasIndex {
        self.aliases
            .get_or_init(|| AliasIndex::build(self.router.plugins()))
    }

    /// Message of the most recent failed operation.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancel in-flight fetches. Later updates fail with a fetch error.
    pub fn shutdown(&self) {
        info!("Shutting down registry");
        self.router.cancel();
    }

    fn record_error(&self, message: String) {
        error!("{message}");
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    fn absorb<T>(&self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.record_error(e.to_string());
                None
            }
        }
    }

    fn resource(&self, uri: &str) -> Result<&Resource> {
        self.resources
            .get(uri)
            .ok_or_else(|| SyncError::UnknownResource(uri.to_string()))
    }

    // ------------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------------

    /// Read stored rows of a resource.
    ///
    /// Returns `None` on an unknown resource, a request violating the query
    /// schema, or a storage failure. A query matching nothing returns an
    /// empty table.
    pub async fn query(&self, uri: &str, options: &QueryOptions) -> Option<Table> {
        self.absorb(self.try_query(uri, options).await)
    }

    async fn try_query(&self, uri: &str, options: &QueryOptions) -> Result<Table> {
        let resource = self.resource(uri)?;
        let descriptor = &resource.descriptor;

        let identities: Vec<Option<&str>> = if options.identities.is_empty() {
            vec![None]
        } else {
            options.identities.iter().map(|i| Some(i.as_str())).collect()
        };
        for identity in identities {
            let request =
                SourceRouter::pack_request(descriptor, identity, &options.range, &options.extra);
            validate_params(&request, Some(&descriptor.query_schema)).map_err(|violation| {
                SyncError::Validation {
                    uri: uri.to_string(),
                    violation,
                }
            })?;
        }

        let fields = if options.use_labels {
            self.aliases().to_canonical(&options.fields)
        } else {
            options.fields.clone()
        };
        let extra = options
            .extra
            .iter()
            .fold(Filter::new(), |filter, (key, value)| {
                filter.equals(key.clone(), value.clone())
            });
        let query = TableQuery::new()
            .identities(options.identities.clone())
            .between(options.range.since, options.range.until)
            .filter(extra)
            .fields(fields);

        let table = resource.table.query(&query).await?;
        debug!("Query on '{uri}' returned {} rows", table.len());
        if options.use_labels {
            return Ok(table.rename_columns(&self.aliases().label_map()));
        }
        Ok(table)
    }

    // ------------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------------

    /// Synchronize a resource (optionally one identity) from its sources.
    ///
    /// `true` when the patch merged rows or found coverage already current.
    /// `force` skips planning and fetches epoch through now, narrowed by
    /// `range`.
    pub async fn update(
        &self,
        uri: &str,
        identity: Option<&str>,
        range: &TimeRange,
        force: bool,
    ) -> bool {
        self.update_patch(uri, identity, range, &Record::new(), force)
            .await
            .is_some_and(|patch| patch.is_success())
    }

    /// Like [`Registry::update`], returning the finished patch.
    ///
    /// `extra` is passed through to the source plugins. `None` only for an
    /// unknown resource.
    pub async fn update_patch(
        &self,
        uri: &str,
        identity: Option<&str>,
        range: &TimeRange,
        extra: &Record,
        force: bool,
    ) -> Option<Patch> {
        let resource = self.absorb(self.resource(uri))?;
        let patch = self
            .pipeline
            .run(
                &resource.descriptor,
                &resource.table,
                identity,
                range,
                extra,
                force,
            )
            .await;
        if let Some(message) = patch.error() {
            self.record_error(format!("Update of '{uri}' ({identity:?}) failed: {message}"));
        }
        Some(patch)
    }

    // ------------------------------------------------------------------------
    // Delete & coverage
    // ------------------------------------------------------------------------

    /// Remove stored rows, returning how many were deleted.
    ///
    /// Dropping a whole identity resets its coverage; dropping the whole
    /// resource resets the resource's coverage and every identity under it.
    /// Partial windows leave coverage untouched.
    pub async fn delete(
        &self,
        uri: &str,
        identity: Option<&str>,
        range: &TimeRange,
    ) -> Option<usize> {
        self.absorb(self.try_delete(uri, identity, range).await)
    }

    async fn try_delete(
        &self,
        uri: &str,
        identity: Option<&str>,
        range: &TimeRange,
    ) -> Result<usize> {
        let resource = self.resource(uri)?;
        let removed = resource
            .table
            .delete(&DeleteSpec {
                identity: identity.map(str::to_string),
                since: range.since,
                until: range.until,
                ..DeleteSpec::default()
            })
            .await?;

        if range.is_unbounded() {
            match identity {
                Some(identity) => {
                    self.coverage
                        .reset(&CoverageTag::identity(uri, identity))
                        .await
                        .map_err(SyncError::Coverage)?;
                }
                None => {
                    // Resources declared under this URI keep their own coverage
                    let nested = format!("{}.", resource.descriptor.uri);
                    let keep: Vec<CoverageTag> = self
                        .resources()
                        .into_iter()
                        .filter(|d| d.uri.starts_with(&nested))
                        .map(|d| CoverageTag::resource(&d.uri))
                        .collect();
                    self.coverage
                        .reset_tree(&CoverageTag::resource(uri), &keep)
                        .await
                        .map_err(SyncError::Coverage)?;
                }
            }
        } else {
            debug!("Partial delete on '{uri}' keeps its coverage");
        }
        info!("Deleted {removed} rows from '{uri}' ({identity:?})");
        Ok(removed)
    }

    /// Stored coverage of a resource, or of one of its identities.
    pub async fn coverage(&self, uri: &str, identity: Option<&str>) -> Option<CoverageRecord> {
        let result = match self.resource(uri) {
            Ok(_) => self
                .coverage
                .get(&CoverageTag::for_request(uri, identity))
                .await
                .map_err(SyncError::Coverage),
            Err(e) => Err(e),
        };
        self.absorb(result).flatten()
    }

    /// Every stored coverage record.
    pub async fn all_coverage(&self) -> Vec<CoverageRecord> {
        let result = self.coverage.all().await.map_err(SyncError::Coverage);
        self.absorb(result).unwrap_or_default()
    }
}

/// Assembles a [`Registry`] from settings, declarations, plugins and storage.
#[derive(Default)]
pub struct RegistryBuilder {
    settings: SyncSettings,
    declarations: Vec<ResourceDescriptor>,
    plugins: Vec<Arc<dyn SourcePlugin>>,
    connector: Option<Arc<dyn Connector>>,
    cancel: Option<CancellationToken>,
}

impl RegistryBuilder {
    /// Settings, declarations, storage and bundled plugins from a config file.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut builder = Self::default()
            .settings(config.sync.clone())
            .connector(config.storage.connector()?);
        if let Some(path) = &config.declarations {
            builder = builder.declarations(load_declarations(path)?);
        }
        if let Some(jsonl) = &config.sources.jsonl {
            builder = builder.plugin(Arc::new(JsonlSource::open(&jsonl.dir)?));
        }
        Ok(builder)
    }

    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn declarations(mut self, declarations: Vec<ResourceDescriptor>) -> Self {
        self.declarations.extend(declarations);
        self
    }

    pub fn declaration(mut self, descriptor: ResourceDescriptor) -> Self {
        self.declarations.push(descriptor);
        self
    }

    /// Register a plugin. Plugins are tried in registration order.
    pub fn plugin(mut self, plugin: Arc<dyn SourcePlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> anyhow::Result<Registry> {
        self.settings.validate()?;
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(MemoryConnector::default()));

        let mut router = SourceRouter::new(self.plugins, self.settings.fetch_timeout()?);
        if let Some(token) = self.cancel {
            router = router.with_cancellation(token);
        }
        let router = Arc::new(router);
        let coverage = Arc::new(CoverageBook::new(connector.clone()));
        let pipeline = SyncPipeline::new(
            router.clone(),
            coverage.clone(),
            Planner::new(self.settings.epoch()?),
            self.settings.large_identity_rows,
        );

        let mut resources = HashMap::new();
        for descriptor in self.declarations {
            if resources.contains_key(&descriptor.uri) {
                warn!("Skipping duplicate resource '{}'", descriptor.uri);
                continue;
            }
            let table = PhysicalTable::new(descriptor.table_config(&self.settings), connector.clone());
            resources.insert(descriptor.uri.clone(), Resource { descriptor, table });
        }
        info!(
            "Registry ready: {} resources, {} source plugins, {} storage",
            resources.len(),
            router.plugins().len(),
            connector.name()
        );

        Ok(Registry {
            resources,
            router,
            coverage,
            pipeline,
            aliases: OnceLock::new(),
            last_error: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::tests::StaticPlugin;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;
    use sync_core::{FieldSpec, FieldSpecMap, Value, ValueType};

    fn rows(code: &str, days: i64) -> Vec<Record> {
        let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        (0..days)
            .map(|d| {
                Record::from([
                    ("code".to_string(), Value::from(code)),
                    ("trade_date".to_string(), Value::Timestamp(start + Duration::days(d))),
                    ("close".to_string(), Value::Float(1.0 + d as f64)),
                ])
            })
            .collect()
    }

    fn registry(plugin: StaticPlugin) -> Registry {
        let schema = FieldSpecMap::from([(
            "code".to_string(),
            FieldSpec::optional(vec![ValueType::Text]),
        )]);
        Registry::builder()
            .declaration(
                ResourceDescriptor::new("Market.Daily", "fin", "daily")
                    .with_identity("code")
                    .with_time("trade_date")
                    .with_query_schema(schema),
            )
            .plugin(Arc::new(plugin))
            .build()
            .unwrap()
    }

    fn labelled() -> StaticPlugin {
        let mut plugin = StaticPlugin::new("p", &["Market.Daily"]).with_rows(rows("A", 3));
        plugin.labels = BTreeMap::from([(
            "Market.Daily".to_string(),
            BTreeMap::from([("close".to_string(), "Close Price".to_string())]),
        )]);
        plugin
    }

    #[tokio::test]
    async fn test_update_then_query() {
        let registry = registry(labelled());
        assert!(
            registry
                .update("Market.Daily", Some("A"), &TimeRange::unbounded(), false)
                .await
        );

        let table = registry
            .query("Market.Daily", &QueryOptions::new().identity("A"))
            .await
            .unwrap();
        assert_eq!(table.len(), 3);

        let labelled = registry
            .query(
                "Market.Daily",
                &QueryOptions::new()
                    .fields(vec!["Close Price".to_string()])
                    .labels(),
            )
            .await
            .unwrap();
        assert!(labelled.has_column("Close Price"));
        assert!(!labelled.has_column("close"));
    }

    #[tokio::test]
    async fn test_unknown_resource_sets_last_error() {
        let registry = registry(labelled());
        assert!(registry.query("Nope", &QueryOptions::new()).await.is_none());
        assert!(registry.last_error().unwrap().contains("Nope"));
        assert!(!registry.update("Nope", None, &TimeRange::unbounded(), false).await);
    }

    #[tokio::test]
    async fn test_query_schema_is_enforced() {
        let registry = registry(labelled());
        let mut options = QueryOptions::new();
        options.extra.insert("code".to_string(), Value::Int(7));
        assert!(registry.query("Market.Daily", &options).await.is_none());
        assert!(registry.last_error().unwrap().contains("code"));
    }

    #[tokio::test]
    async fn test_failed_update_reports_error() {
        let registry = registry(StaticPlugin::new("p", &["Market.Daily"]).failing());
        assert!(
            !registry
                .update("Market.Daily", Some("A"), &TimeRange::unbounded(), false)
                .await
        );
        assert!(registry.last_error().is_some());
        assert!(registry.coverage("Market.Daily", Some("A")).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_resets_coverage() {
        let registry = registry(labelled());
        let unbounded = TimeRange::unbounded();
        assert!(registry.update("Market.Daily", Some("A"), &unbounded, false).await);
        assert!(registry.coverage("Market.Daily", Some("A")).await.is_some());

        let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let partial = TimeRange::between(start, start);
        assert_eq!(registry.delete("Market.Daily", Some("A"), &partial).await, Some(1));
        assert!(registry.coverage("Market.Daily", Some("A")).await.is_some());

        assert_eq!(registry.delete("Market.Daily", None, &unbounded).await, Some(2));
        assert!(registry.coverage("Market.Daily", Some("A")).await.is_none());
        assert!(registry.coverage("Market.Daily", None).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_fetches() {
        let registry = registry(labelled());
        registry.shutdown();
        let patch = registry
            .update_patch(
                "Market.Daily",
                Some("A"),
                &TimeRange::unbounded(),
                &Record::new(),
                false,
            )
            .await
            .unwrap();
        assert!(patch.error().is_some_and(|e| e.contains("cancelled")));
    }
}
