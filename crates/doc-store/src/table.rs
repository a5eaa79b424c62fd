//! Primary-key-aware physical tables.
//!
//! A [`PhysicalTable`] sits on top of one or more backend collections and
//! gives them key semantics derived from which of the identity and time
//! fields are configured:
//!
//! | identity | time | mode | rows |
//! |---|---|---|---|
//! | yes | yes | [`KeyMode::IdentityTime`] | many time-versioned rows per identity |
//! | yes | no | [`KeyMode::IdentityOnly`] | one row per identity |
//! | no | yes | [`KeyMode::TimeOnly`] | one row per timestamp |
//! | no | no | [`KeyMode::Keyless`] | append-only, upserts insert |
//!
//! The table recycles its backend connection after a configurable number of
//! operations. With a [`PartitionStrategy`] the logical table spans several
//! collections; queries fan out and the sub-results are re-joined on the key
//! columns.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use sync_core::{Record, Table, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::{Connector, DocumentStore, WriteOp, WriteSummary};
use crate::bulk::BulkWriter;
use crate::error::{Result, StoreError};
use crate::filter::Filter;
use crate::partition::{PartitionRequest, PartitionStrategy, SubRequest};

/// Default number of buffered rows before a bulk writer flushes.
pub const DEFAULT_BATCH_SIZE: usize = 950;

/// Default number of operations served by one connection.
pub const DEFAULT_RECYCLE_AFTER: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    IdentityTime,
    IdentityOnly,
    TimeOnly,
    Keyless,
}

/// Static configuration of a table.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Collection name, or collection prefix when partitioned
    pub prefix: String,
    pub identity_field: Option<String>,
    pub time_field: Option<String>,
    pub partition: Option<PartitionStrategy>,
    pub batch_size: usize,
    pub recycle_after: usize,
}

impl TableConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            identity_field: None,
            time_field: None,
            partition: None,
            batch_size: DEFAULT_BATCH_SIZE,
            recycle_after: DEFAULT_RECYCLE_AFTER,
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

    pub fn with_partition(mut self, strategy: PartitionStrategy) -> Self {
        self.partition = Some(strategy);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_recycle_after(mut self, operations: usize) -> Self {
        self.recycle_after = operations.max(1);
        self
    }

    pub fn key_mode(&self) -> KeyMode {
        match (&self.identity_field, &self.time_field) {
            (Some(_), Some(_)) => KeyMode::IdentityTime,
            (Some(_), None) => KeyMode::IdentityOnly,
            (None, Some(_)) => KeyMode::TimeOnly,
            (None, None) => KeyMode::Keyless,
        }
    }

    /// The configured key columns, identity first.
    pub fn key_fields(&self) -> Vec<String> {
        self.identity_field
            .iter()
            .chain(self.time_field.iter())
            .cloned()
            .collect()
    }
}

/// A stored row split into its key header and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalRecord {
    pub identity: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub fields: Record,
}

impl PhysicalRecord {
    pub fn new(identity: Option<String>, time: Option<DateTime<Utc>>, fields: Record) -> Self {
        Self {
            identity,
            time,
            fields,
        }
    }

    /// Split a stored document using the table's key fields.
    pub fn from_document(mut document: Record, config: &TableConfig) -> Self {
        let identity = config
            .identity_field
            .as_ref()
            .and_then(|f| document.remove(f))
            .and_then(|v| v.as_identity());
        let time = config
            .time_field
            .as_ref()
            .and_then(|f| document.remove(f))
            .and_then(|v| v.as_timestamp());
        Self::new(identity, time, document)
    }
}

/// A logical query.
#[derive(Debug, Clone, Default)]
pub struct TableQuery {
    /// Identities to read; empty reads every identity
    pub identities: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub extra: Filter,
    /// Fields to return besides the key columns; empty returns everything
    pub fields: Vec<String>,
}

impl TableQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identities.push(identity.into());
        self
    }

    pub fn identities(mut self, identities: Vec<String>) -> Self {
        self.identities.extend(identities);
        self
    }

    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn filter(mut self, extra: Filter) -> Self {
        self.extra = extra;
        self
    }

    pub fn fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }
}

/// What to delete. Every part is optional; an empty spec deletes the table.
#[derive(Debug, Clone, Default)]
pub struct DeleteSpec {
    pub identity: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub extra: Filter,
    /// Explicit `(identity, time)` keys; when set, only these rows are removed
    pub keys: Vec<(Option<String>, Option<DateTime<Utc>>)>,
}

struct ConnectionSlot {
    store: Option<Arc<dyn DocumentStore>>,
    operations: usize,
    recycle_after: usize,
}

pub struct PhysicalTable {
    config: TableConfig,
    connector: Arc<dyn Connector>,
    slot: Mutex<ConnectionSlot>,
}

impl PhysicalTable {
    pub fn new(config: TableConfig, connector: Arc<dyn Connector>) -> Self {
        let recycle_after = config.recycle_after;
        Self {
            config,
            connector,
            slot: Mutex::new(ConnectionSlot {
                store: None,
                operations: 0,
                recycle_after,
            }),
        }
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn key_mode(&self) -> KeyMode {
        self.config.key_mode()
    }

    pub fn name(&self) -> &str {
        &self.config.prefix
    }

    // ------------------------------------------------------------------------
    // Connection lifetime
    // ------------------------------------------------------------------------

    /// Current connection, reopened once it has served `recycle_after` operations.
    async fn connection(&self) -> Result<Arc<dyn DocumentStore>> {
        let mut slot = self.slot.lock().await;
        let reusable = match &slot.store {
            Some(store) if slot.operations < slot.recycle_after => Some(store.clone()),
            _ => None,
        };
        let store = match reusable {
            Some(store) => store,
            None => {
                if slot.store.is_some() {
                    debug!(
                        "Recycling {} connection for '{}' after {} operations",
                        self.connector.name(),
                        self.config.prefix,
                        slot.operations
                    );
                }
                let store = self.connector.connect().await?;
                slot.store = Some(store.clone());
                slot.operations = 0;
                store
            }
        };
        slot.operations += 1;
        Ok(store)
    }

    /// Lower the recycling threshold and restart the operation count.
    ///
    /// Used before very large merges so the connection is reopened eagerly.
    pub async fn lower_recycle_threshold(&self, operations: usize) {
        let mut slot = self.slot.lock().await;
        slot.recycle_after = slot.recycle_after.min(operations.max(1));
        slot.operations = 0;
    }

    /// Restore the configured recycling threshold.
    pub async fn reset_recycle_threshold(&self) {
        self.slot.lock().await.recycle_after = self.config.recycle_after;
    }

    pub async fn recycle_threshold(&self) -> usize {
        self.slot.lock().await.recycle_after
    }

    /// Operations served by the current connection.
    pub async fn operations_since_connect(&self) -> usize {
        self.slot.lock().await.operations
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    fn sub_requests(&self, query: &TableQuery, existing: &[String]) -> Vec<SubRequest> {
        match &self.config.partition {
            None => vec![SubRequest {
                collection: self.config.prefix.clone(),
                identities: query.identities.clone(),
                since: query.since,
                until: query.until,
                fields: query.fields.clone(),
            }],
            Some(strategy) => strategy.split(&PartitionRequest {
                prefix: &self.config.prefix,
                identities: &query.identities,
                since: query.since,
                until: query.until,
                fields: &query.fields,
                existing,
            }),
        }
    }

    fn sub_filter(&self, sub: &SubRequest, extra: &Filter) -> Filter {
        let mut filter = Filter::new();
        if let Some(field) = &self.config.identity_field {
            filter = match sub.identities.as_slice() {
                [] => filter,
                [one] => filter.equals(field.clone(), one.as_str()),
                many => filter.any_of(
                    field.clone(),
                    many.iter().map(|i| Value::from(i.as_str())).collect(),
                ),
            };
        } else if !sub.identities.is_empty() {
            debug!(
                "Table '{}' has no identity field; ignoring identity filter",
                self.config.prefix
            );
        }
        if let Some(field) = &self.config.time_field {
            filter = filter.between(field, sub.since, sub.until);
        }
        filter.and(extra)
    }

    fn projection(&self, fields: &[String]) -> Vec<String> {
        if fields.is_empty() {
            return Vec::new();
        }
        let mut projection = self.config.key_fields();
        for field in fields {
            if !projection.contains(field) {
                projection.push(field.clone());
            }
        }
        projection
    }

    /// Run a logical query and return the re-joined rows.
    ///
    /// Rows are ordered by time, then identity. Sub-queries returning no rows
    /// simply contribute nothing.
    pub async fn query(&self, query: &TableQuery) -> Result<Table> {
        let conn = self.connection().await?;
        let existing = if self.config.partition.is_some() && query.identities.is_empty() {
            conn.collections().await?
        } else {
            Vec::new()
        };

        let keys = self.config.key_fields();
        let mut combined = Table::default();
        for sub in self.sub_requests(query, &existing) {
            let filter = self.sub_filter(&sub, &query.extra);
            let documents = conn
                .find(&sub.collection, &filter, &self.projection(&sub.fields))
                .await?;
            debug!(
                "Sub-query on '{}' returned {} rows",
                sub.collection,
                documents.len()
            );
            combined = combined.combine(Table::from_rows(documents), &keys);
        }

        let order: Vec<String> = self
            .config
            .time_field
            .iter()
            .chain(self.config.identity_field.iter())
            .cloned()
            .collect();
        combined.sort_by_columns(&order);
        Ok(combined)
    }

    /// Like [`PhysicalTable::query`], split into key header and payload.
    pub async fn query_records(&self, query: &TableQuery) -> Result<Vec<PhysicalRecord>> {
        Ok(self
            .query(query)
            .await?
            .into_rows()
            .into_iter()
            .map(|row| PhysicalRecord::from_document(row, &self.config))
            .collect())
    }

    /// Smallest and largest non-null value of `field`, optionally for one identity.
    pub async fn range_of(
        &self,
        field: &str,
        identity: Option<&str>,
    ) -> Result<Option<(Value, Value)>> {
        let mut query = TableQuery::new().fields(vec![field.to_string()]);
        if let Some(identity) = identity {
            query = query.identity(identity);
        }
        let table = self.query(&query).await?;

        let mut range: Option<(Value, Value)> = None;
        for value in table.column(field).filter(|v| !v.is_null()) {
            range = Some(match range {
                None => (value.clone(), value.clone()),
                Some((min, max)) => {
                    let min = if value.compare(&min) == Some(std::cmp::Ordering::Less) {
                        value.clone()
                    } else {
                        min
                    };
                    let max = if value.compare(&max) == Some(std::cmp::Ordering::Greater) {
                        value.clone()
                    } else {
                        max
                    };
                    (min, max)
                }
            });
        }
        Ok(range)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Resolve the target collection and write operation for one row.
    ///
    /// Key values not passed explicitly are taken from the record itself. A
    /// row carrying only part of a composite key is rejected; a row whose
    /// derived key is empty is inserted, never matched against everything.
    pub(crate) fn prepare_write(
        &self,
        identity: Option<&str>,
        time: Option<DateTime<Utc>>,
        mut record: Record,
        extra: &Filter,
    ) -> Result<(String, WriteOp)> {
        let identity = identity.map(str::to_string).or_else(|| {
            self.config
                .identity_field
                .as_ref()
                .and_then(|f| record.get(f))
                .and_then(Value::as_identity)
        });
        let time = time.or_else(|| {
            self.config
                .time_field
                .as_ref()
                .and_then(|f| record.get(f))
                .and_then(Value::as_timestamp)
        });

        let mut key = Filter::new();
        if let (Some(field), Some(identity)) = (&self.config.identity_field, &identity) {
            record.insert(field.clone(), Value::from(identity.as_str()));
            key = key.equals(field.clone(), identity.as_str());
        }
        if let (Some(field), Some(time)) = (&self.config.time_field, time) {
            record.insert(field.clone(), Value::Timestamp(time));
            key = key.equals(field.clone(), time);
        }

        let collection = match &self.config.partition {
            Some(strategy) => strategy.locate(&self.config.prefix, identity.as_deref()),
            None => self.config.prefix.clone(),
        };

        if self.key_mode() == KeyMode::Keyless || key.is_empty() {
            return Ok((collection, WriteOp::Insert(record)));
        }
        if self.key_mode() == KeyMode::IdentityTime {
            if identity.is_none() {
                return Err(StoreError::MissingKey(
                    self.config.identity_field.clone().unwrap_or_default(),
                ));
            }
            if time.is_none() {
                return Err(StoreError::MissingKey(
                    self.config.time_field.clone().unwrap_or_default(),
                ));
            }
        }

        Ok((
            collection,
            WriteOp::Upsert {
                filter: key.and(extra),
                document: record,
            },
        ))
    }

    pub(crate) async fn write(&self, collection: &str, ops: Vec<WriteOp>) -> Result<WriteSummary> {
        let conn = self.connection().await?;
        conn.apply(collection, ops).await
    }

    /// Insert or overwrite a single row.
    pub async fn upsert(
        &self,
        identity: Option<&str>,
        time: Option<DateTime<Utc>>,
        record: Record,
        extra: &Filter,
    ) -> Result<WriteSummary> {
        let (collection, op) = self.prepare_write(identity, time, record, extra)?;
        self.write(&collection, vec![op]).await
    }

    /// A buffered writer flushing every `batch_size` rows.
    pub fn bulk(&self) -> BulkWriter<'_> {
        BulkWriter::new(self, self.config.batch_size)
    }

    /// Delete rows, returning how many were removed.
    pub async fn delete(&self, spec: &DeleteSpec) -> Result<usize> {
        let conn = self.connection().await?;

        if !spec.keys.is_empty() {
            let mut removed = 0;
            for (identity, time) in &spec.keys {
                let mut filter = Filter::new();
                if let (Some(field), Some(identity)) = (&self.config.identity_field, identity) {
                    filter = filter.equals(field.clone(), identity.as_str());
                }
                if let (Some(field), Some(time)) = (&self.config.time_field, time) {
                    filter = filter.equals(field.clone(), *time);
                }
                if filter.is_empty() {
                    continue;
                }
                let collection = match &self.config.partition {
                    Some(strategy) => strategy.locate(&self.config.prefix, identity.as_deref()),
                    None => self.config.prefix.clone(),
                };
                removed += conn.delete(&collection, &filter.and(&spec.extra)).await?;
            }
            return Ok(removed);
        }

        let query = TableQuery {
            identities: spec.identity.iter().cloned().collect(),
            since: spec.since,
            until: spec.until,
            extra: spec.extra.clone(),
            fields: Vec::new(),
        };
        let existing = if self.config.partition.is_some() && spec.identity.is_none() {
            conn.collections().await?
        } else {
            Vec::new()
        };

        let mut removed = 0;
        for sub in self.sub_requests(&query, &existing) {
            let filter = self.sub_filter(&sub, &spec.extra);
            removed += conn.delete(&sub.collection, &filter).await?;
        }
        debug!("Deleted {removed} rows from '{}'", self.config.prefix);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnector;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 3, d, 0, 0, 0).unwrap()
    }

    fn close(value: f64) -> Record {
        Record::from([("close".to_string(), Value::Float(value))])
    }

    fn table(config: TableConfig) -> (PhysicalTable, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::default());
        (PhysicalTable::new(config, connector.clone()), connector)
    }

    #[test]
    fn test_key_modes() {
        let base = TableConfig::new("t");
        assert_eq!(base.key_mode(), KeyMode::Keyless);
        assert_eq!(base.clone().with_identity("code").key_mode(), KeyMode::IdentityOnly);
        assert_eq!(base.clone().with_time("date").key_mode(), KeyMode::TimeOnly);
        assert_eq!(
            base.with_identity("code").with_time("date").key_mode(),
            KeyMode::IdentityTime
        );
    }

    #[tokio::test]
    async fn test_identity_time_versions_rows() {
        let (t, _) = table(TableConfig::new("daily").with_identity("code").with_time("date"));
        let none = Filter::new();
        t.upsert(Some("A"), Some(day(1)), close(1.0), &none).await.unwrap();
        t.upsert(Some("A"), Some(day(2)), close(2.0), &none).await.unwrap();
        t.upsert(Some("A"), Some(day(2)), close(2.5), &none).await.unwrap();

        let rows = t.query_records(&TableQuery::new().identity("A")).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].time, Some(day(2)));
        assert_eq!(rows[1].fields.get("close"), Some(&Value::Float(2.5)));
    }

    #[tokio::test]
    async fn test_identity_only_overwrites() {
        let (t, _) = table(TableConfig::new("info").with_identity("code"));
        let none = Filter::new();
        t.upsert(Some("A"), None, close(1.0), &none).await.unwrap();
        t.upsert(Some("A"), None, close(3.0), &none).await.unwrap();
        let rows = t.query(&TableQuery::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_time_only_one_row_per_timestamp() {
        let (t, _) = table(TableConfig::new("calendar").with_time("date"));
        let none = Filter::new();
        t.upsert(None, Some(day(1)), close(1.0), &none).await.unwrap();
        t.upsert(None, Some(day(1)), close(1.0), &none).await.unwrap();
        t.upsert(None, Some(day(2)), close(1.0), &none).await.unwrap();
        assert_eq!(t.query(&TableQuery::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_keyless_and_missing_key_insert() {
        let (log, _) = table(TableConfig::new("log"));
        let none = Filter::new();
        log.upsert(None, None, close(1.0), &none).await.unwrap();
        log.upsert(None, None, close(1.0), &none).await.unwrap();
        assert_eq!(log.query(&TableQuery::new()).await.unwrap().len(), 2);

        // Identity-only table, key absent: inserted, existing rows untouched
        let (info, _) = table(TableConfig::new("info").with_identity("code"));
        info.upsert(Some("A"), None, close(1.0), &none).await.unwrap();
        info.upsert(None, None, close(9.0), &none).await.unwrap();
        let rows = info.query(&TableQuery::new().identity("A")).await.unwrap();
        assert_eq!(rows.rows()[0].get("close"), Some(&Value::Float(1.0)));
        assert_eq!(info.query(&TableQuery::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_partial_composite_key_is_rejected() {
        let (t, _) = table(TableConfig::new("daily").with_identity("code").with_time("date"));
        let result = t.upsert(Some("A"), None, close(1.0), &Filter::new()).await;
        assert!(matches!(result, Err(StoreError::MissingKey(field)) if field == "date"));
    }

    #[tokio::test]
    async fn test_key_taken_from_record() {
        let (t, _) = table(TableConfig::new("daily").with_identity("code").with_time("date"));
        let mut record = close(1.0);
        record.insert("code".to_string(), "A".into());
        record.insert("date".to_string(), "2021-03-01".into());
        t.upsert(None, None, record, &Filter::new()).await.unwrap();

        let rows = t.query_records(&TableQuery::new()).await.unwrap();
        assert_eq!(rows[0].identity.as_deref(), Some("A"));
        assert_eq!(rows[0].time, Some(day(1)));
    }

    #[tokio::test]
    async fn test_query_window_and_projection() {
        let (t, _) = table(TableConfig::new("daily").with_identity("code").with_time("date"));
        let none = Filter::new();
        for d in 1..=5 {
            let mut record = close(d as f64);
            record.insert("volume".to_string(), Value::Int(d as i64));
            t.upsert(Some("A"), Some(day(d)), record, &none).await.unwrap();
        }
        let result = t
            .query(
                &TableQuery::new()
                    .identity("A")
                    .between(Some(day(2)), Some(day(4)))
                    .fields(vec!["close".to_string()]),
            )
            .await
            .unwrap();
        assert_eq!(result.len(), 3);
        assert!(!result.has_column("volume"));
        assert!(result.has_column("code"));
    }

    #[tokio::test]
    async fn test_range_of() {
        let (t, _) = table(TableConfig::new("daily").with_identity("code").with_time("date"));
        let none = Filter::new();
        t.upsert(Some("A"), Some(day(3)), close(1.0), &none).await.unwrap();
        t.upsert(Some("A"), Some(day(1)), close(1.0), &none).await.unwrap();
        t.upsert(Some("B"), Some(day(9)), close(1.0), &none).await.unwrap();

        let range = t.range_of("date", Some("A")).await.unwrap();
        assert_eq!(
            range,
            Some((Value::Timestamp(day(1)), Value::Timestamp(day(3))))
        );
        assert_eq!(t.range_of("date", Some("C")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_window_and_keys() {
        let (t, _) = table(TableConfig::new("daily").with_identity("code").with_time("date"));
        let none = Filter::new();
        for d in 1..=4 {
            t.upsert(Some("A"), Some(day(d)), close(1.0), &none).await.unwrap();
        }
        let removed = t
            .delete(&DeleteSpec {
                identity: Some("A".to_string()),
                since: Some(day(3)),
                ..DeleteSpec::default()
            })
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let removed = t
            .delete(&DeleteSpec {
                keys: vec![(Some("A".to_string()), Some(day(1)))],
                ..DeleteSpec::default()
            })
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(t.query(&TableQuery::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_recycling() {
        let (t, connector) = table(TableConfig::new("info").with_identity("code").with_recycle_after(3));
        let none = Filter::new();
        for i in 0..7 {
            t.upsert(Some(&format!("id{i}")), None, close(1.0), &none)
                .await
                .unwrap();
        }
        // Connections opened at operations 1, 4 and 7
        assert_eq!(connector.connect_count(), 3);
        assert_eq!(t.operations_since_connect().await, 1);

        t.lower_recycle_threshold(2).await;
        assert_eq!(t.operations_since_connect().await, 0);
        assert_eq!(t.recycle_threshold().await, 2);
        t.upsert(Some("x"), None, close(1.0), &none).await.unwrap();
        t.upsert(Some("y"), None, close(1.0), &none).await.unwrap();
        t.upsert(Some("z"), None, close(1.0), &none).await.unwrap();
        assert_eq!(connector.connect_count(), 4);

        t.reset_recycle_threshold().await;
        assert_eq!(t.recycle_threshold().await, 3);
    }
}
