//! Resource descriptors.

use doc_store::{PartitionStrategy, TableConfig};
use sync_core::FieldSpecMap;

use crate::config::SyncSettings;

/// Binds an abstract resource URI to its physical table and schemas.
///
/// Descriptors are created at startup from the declaration file and never
/// change afterwards.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    /// Unique resource identifier, e.g. `Finance.BalanceSheet`
    pub uri: String,
    /// Logical database the table belongs to
    pub storage_location: String,
    pub table_prefix: String,
    pub identity_field: Option<String>,
    pub time_field: Option<String>,
    /// Contract for request parameters
    pub query_schema: FieldSpecMap,
    /// Contract for fetched result columns
    pub result_schema: FieldSpecMap,
    pub partition: Option<PartitionStrategy>,
}

impl ResourceDescriptor {
    pub fn new(
        uri: impl Into<String>,
        storage_location: impl Into<String>,
        table_prefix: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            storage_location: storage_location.into(),
            table_prefix: table_prefix.into(),
            identity_field: None,
            time_field: None,
            query_schema: FieldSpecMap::new(),
            result_schema: FieldSpecMap::new(),
            partition: None,
        }
    }

    pub fn with_identity(mut self, field: impl Into<String>) -> Self {
        self.identity_field = Some(field.into());
        self
    }

    pub fn with_time(mut self, field: impl Into<String>) -> Self {
        self.time_field = Some(field.into());
        self
    }

    pub fn with_query_schema(mut self, schema: FieldSpecMap) -> Self {
        self.query_schema = schema;
        self
    }

    pub fn with_result_schema(mut self, schema: FieldSpecMap) -> Self {
        self.result_schema = schema;
        self
    }

    pub fn with_partition(mut self, strategy: PartitionStrategy) -> Self {
        self.partition = Some(strategy);
        self
    }

    /// Physical collection name (or prefix, when partitioned):
    /// `{storage_location}_{table_prefix}`.
    pub fn collection(&self) -> String {
        format!("{}_{}", self.storage_location, self.table_prefix)
    }

    /// Key under which requests carry the identity.
    pub fn identity_key(&self) -> &str {
        self.identity_field.as_deref().unwrap_or("identity")
    }

    /// Key under which requests carry the time range.
    pub fn time_key(&self) -> &str {
        self.time_field.as_deref().unwrap_or("datetime")
    }

    /// The configured key columns, identity first.
    pub fn key_fields(&self) -> Vec<String> {
        self.identity_field
            .iter()
            .chain(self.time_field.iter())
            .cloned()
            .collect()
    }

    pub fn table_config(&self, settings: &SyncSettings) -> TableConfig {
        let mut config = TableConfig::new(self.collection())
            .with_batch_size(settings.batch_size)
            .with_recycle_after(settings.recycle_after);
        if let Some(field) = &self.identity_field {
            config = config.with_identity(field.clone());
        }
        if let Some(field) = &self.time_field {
            config = config.with_time(field.clone());
        }
        if let Some(strategy) = &self.partition {
            config = config.with_partition(strategy.clone());
        }
        config
    }
}
