//! SurrealDB v2 SDK backend.
//!
//! Documents are written with their values in canonical JSON form
//! (timestamps as fixed-width RFC3339 text), so range filters on time fields
//! compare correctly as strings. Field and collection names are interpolated
//! into SurrealQL and must pass [`crate::is_valid_name`]; values are always
//! bound as parameters.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::OnceCell;

use crate::backend::{Connector, Document, DocumentStore, WriteOp, WriteSummary};
use crate::error::{ensure_valid_name, Result, StoreError};
use crate::filter::{Clause, Filter};

/// SurrealDB connection options
#[derive(Clone, Debug)]
pub struct SurrealOpts {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
}

impl Default for SurrealOpts {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            username: "root".to_string(),
            password: "root".to_string(),
            namespace: "fin".to_string(),
            database: "fin".to_string(),
        }
    }
}

impl SurrealOpts {
    /// Whether the endpoint is the embedded in-memory engine.
    pub fn is_embedded(&self) -> bool {
        self.endpoint.starts_with("mem://")
    }
}

/// Default number of connection retry attempts
const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
/// Default delay between retry attempts in seconds
const DEFAULT_RETRY_DELAY_SECS: u64 = 2;

pub async fn surreal_connect(opts: &SurrealOpts) -> Result<Surreal<Any>> {
    surreal_connect_with_retries(opts, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY_SECS).await
}

/// Connect to SurrealDB with configurable retries.
///
/// Retries connection failures up to `max_retries` times, waiting
/// `retry_delay_secs` seconds between attempts.
pub async fn surreal_connect_with_retries(
    opts: &SurrealOpts,
    max_retries: u32,
    retry_delay_secs: u64,
) -> Result<Surreal<Any>> {
    // Convert http:// to ws:// for WebSocket connection
    let endpoint = opts
        .endpoint
        .replace("http://", "ws://")
        .replace("https://", "wss://");

    tracing::debug!(
        "Connecting to SurrealDB at {} (namespace: {}, database: {})",
        endpoint,
        opts.namespace,
        opts.database
    );

    let mut last_error = None;

    for attempt in 1..=max_retries.max(1) {
        match try_connect(&endpoint, opts).await {
            Ok(surreal) => {
                if attempt > 1 {
                    tracing::info!("Successfully connected to SurrealDB after {attempt} attempts");
                }
                return Ok(surreal);
            }
            Err(e) => {
                if attempt < max_retries {
                    tracing::warn!(
                        "Failed to connect to SurrealDB at '{endpoint}' (attempt {attempt}/{max_retries}): {e}. Retrying in {retry_delay_secs}s..."
                    );
                    tokio::time::sleep(Duration::from_secs(retry_delay_secs)).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(StoreError::Connection(format!(
        "SurrealDB at '{endpoint}' unreachable after {max_retries} attempts: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Attempt a single connection to SurrealDB.
async fn try_connect(endpoint: &str, opts: &SurrealOpts) -> Result<Surreal<Any>> {
    let surreal = surrealdb::engine::any::connect(endpoint)
        .await
        .map_err(|e| StoreError::Connection(format!("connection to '{endpoint}' failed: {e}")))?;

    // The embedded engine runs without authentication
    if !opts.is_embedded() {
        let username = &opts.username;
        surreal
            .signin(surrealdb::opt::auth::Root {
                username,
                password: &opts.password,
            })
            .await
            .map_err(|e| {
                StoreError::Connection(format!("authentication failed (user: '{username}'): {e}"))
            })?;
    }

    surreal
        .use_ns(&opts.namespace)
        .use_db(&opts.database)
        .await
        .map_err(|e| {
            StoreError::Connection(format!(
                "failed to select namespace '{}' / database '{}': {e}",
                opts.namespace, opts.database
            ))
        })?;

    Ok(surreal)
}

/// Render `filter` as a WHERE clause, binding its values into `params`.
fn where_clause(
    filter: &Filter,
    params: &mut BTreeMap<String, serde_json::Value>,
) -> Result<String> {
    if filter.is_empty() {
        return Ok(String::new());
    }
    let mut conditions = Vec::with_capacity(filter.clauses().len());
    for (i, clause) in filter.clauses().iter().enumerate() {
        let field = clause.field();
        ensure_valid_name(field)?;
        let param = format!("p{i}");
        let (op, value) = match clause {
            Clause::Eq(_, v) => ("=", v.to_json()),
            Clause::In(_, vs) => ("IN", vs.iter().map(|v| v.to_json()).collect()),
            Clause::Gte(_, v) => (">=", v.to_json()),
            Clause::Lte(_, v) => ("<=", v.to_json()),
        };
        conditions.push(format!("`{field}` {op} ${param}"));
        params.insert(param, value);
    }
    Ok(format!(" WHERE {}", conditions.join(" AND ")))
}

fn table_params(collection: &str) -> Result<BTreeMap<String, serde_json::Value>> {
    ensure_valid_name(collection)?;
    Ok(BTreeMap::from([(
        "tb".to_string(),
        serde_json::Value::String(collection.to_string()),
    )]))
}

#[derive(Clone)]
pub struct SurrealStore {
    client: Surreal<Any>,
}

impl SurrealStore {
    pub fn new(client: Surreal<Any>) -> Self {
        Self { client }
    }

    pub fn inner(&self) -> &Surreal<Any> {
        &self.client
    }

    async fn upsert_one(&self, collection: &str, filter: &Filter, document: &Document) -> Result<bool> {
        if filter.is_empty() {
            return Err(StoreError::Backend(
                "refusing upsert with an empty filter".to_string(),
            ));
        }
        let mut params = table_params(collection)?;
        let condition = where_clause(filter, &mut params)?;
        params.insert("doc".to_string(), serde_json::to_value(document)?);

        let mut response = self
            .client
            .query(format!(
                "UPDATE type::table($tb) MERGE $doc{condition} RETURN AFTER"
            ))
            .bind(params.clone())
            .await?;
        let updated: Vec<serde_json::Value> = response.take(0)?;
        if !updated.is_empty() {
            return Ok(true);
        }

        self.client
            .query("CREATE type::table($tb) CONTENT $doc RETURN NONE")
            .bind(params)
            .await?
            .check()?;
        Ok(false)
    }

    async fn insert_one(&self, collection: &str, document: &Document) -> Result<()> {
        let mut params = table_params(collection)?;
        params.insert("doc".to_string(), serde_json::to_value(document)?);
        self.client
            .query("CREATE type::table($tb) CONTENT $doc RETURN NONE")
            .bind(params)
            .await?
            .check()?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SurrealStore {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        projection: &[String],
    ) -> Result<Vec<Document>> {
        let mut params = table_params(collection)?;
        let condition = where_clause(filter, &mut params)?;
        let fields = if projection.is_empty() {
            "* OMIT id".to_string()
        } else {
            for field in projection {
                ensure_valid_name(field)?;
            }
            projection
                .iter()
                .map(|f| format!("`{f}`"))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut response = self
            .client
            .query(format!("SELECT {fields} FROM type::table($tb){condition}"))
            .bind(params)
            .await?;
        let rows: Vec<serde_json::Value> = response.take(0)?;
        rows.into_iter()
            .map(|row| serde_json::from_value::<Document>(row).map_err(StoreError::from))
            .collect()
    }

    async fn apply(&self, collection: &str, ops: Vec<WriteOp>) -> Result<WriteSummary> {
        let mut summary = WriteSummary::default();
        for op in ops {
            match op {
                WriteOp::Insert(document) => {
                    self.insert_one(collection, &document).await?;
                    summary.inserted += 1;
                }
                WriteOp::Upsert { filter, document } => {
                    if self.upsert_one(collection, &filter, &document).await? {
                        summary.updated += 1;
                    } else {
                        summary.inserted += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<usize> {
        let mut params = table_params(collection)?;
        let condition = where_clause(filter, &mut params)?;
        let mut response = self
            .client
            .query(format!("DELETE type::table($tb){condition} RETURN BEFORE"))
            .bind(params)
            .await?;
        let removed: Vec<serde_json::Value> = response.take(0)?;
        Ok(removed.len())
    }

    async fn collections(&self) -> Result<Vec<String>> {
        let mut response = self.client.query("INFO FOR DB;").await?;
        let info: Option<serde_json::Value> = response.take(0)?;
        Ok(info
            .as_ref()
            .and_then(|i| i.get("tables"))
            .and_then(|t| t.as_object())
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// Opens SurrealDB connections.
///
/// The embedded `mem://` engine keeps its data inside the client, so every
/// connection request for it returns the same client instead of a fresh,
/// empty database.
pub struct SurrealConnector {
    opts: SurrealOpts,
    embedded: OnceCell<Surreal<Any>>,
}

impl SurrealConnector {
    pub fn new(opts: SurrealOpts) -> Self {
        Self {
            opts,
            embedded: OnceCell::new(),
        }
    }

    pub fn opts(&self) -> &SurrealOpts {
        &self.opts
    }
}

#[async_trait]
impl Connector for SurrealConnector {
    fn name(&self) -> &str {
        "surreal"
    }

    async fn connect(&self) -> Result<Arc<dyn DocumentStore>> {
        let client = if self.opts.is_embedded() {
            self.embedded
                .get_or_try_init(|| surreal_connect(&self.opts))
                .await?
                .clone()
        } else {
            surreal_connect(&self.opts).await?
        };
        Ok(Arc::new(SurrealStore::new(client)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::Value;

    #[test]
    fn test_where_clause_binds_values() {
        let filter = Filter::new()
            .equals("code", "A")
            .any_of("market", vec!["SH".into(), "SZ".into()]);
        let mut params = BTreeMap::new();
        let clause = where_clause(&filter, &mut params).unwrap();
        assert_eq!(clause, " WHERE `code` = $p0 AND `market` IN $p1");
        assert_eq!(params["p0"], serde_json::json!("A"));
        assert_eq!(params["p1"], serde_json::json!(["SH", "SZ"]));
    }

    #[test]
    fn test_where_clause_rejects_injection() {
        let filter = Filter::new().equals("code` = 1 OR `x", Value::Int(1));
        let mut params = BTreeMap::new();
        assert!(matches!(
            where_clause(&filter, &mut params),
            Err(StoreError::InvalidFieldName(_))
        ));
    }

    #[test]
    fn test_empty_filter_has_no_where() {
        let mut params = BTreeMap::new();
        assert_eq!(where_clause(&Filter::new(), &mut params).unwrap(), "");
        assert!(params.is_empty());
    }

    #[tokio::test]
    async fn test_embedded_roundtrip() {
        let connector = SurrealConnector::new(SurrealOpts::default());
        let store = connector.connect().await.unwrap();
        let key = Filter::new().equals("code", "A");
        let document = Document::from([
            ("code".to_string(), Value::from("A")),
            ("close".to_string(), Value::Int(10)),
        ]);

        store
            .apply(
                "bars",
                vec![WriteOp::Upsert {
                    filter: key.clone(),
                    document: document.clone(),
                }],
            )
            .await
            .unwrap();

        // A second connection sees the same embedded data
        let again = connector.connect().await.unwrap();
        let found = again.find("bars", &key, &[]).await.unwrap();
        assert_eq!(found, vec![document]);
    }
}
