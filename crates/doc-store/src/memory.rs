//! In-process document store.
//!
//! Collections live in memory behind a single lock. When opened with a
//! directory, every mutated collection is rewritten as
//! `<dir>/<collection>.json` after the mutation, and all collections found in
//! the directory are loaded on open.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::backend::{Connector, Document, DocumentStore, WriteOp, WriteSummary};
use crate::error::{ensure_valid_name, Result, StoreError};
use crate::filter::Filter;

#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, Vec<Document>>>,
    dir: Option<PathBuf>,
}

impl MemoryStore {
    /// Create a store that lives only as long as the process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted under `dir`, loading existing collections.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut collections = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = std::fs::read_to_string(&path)?;
            let documents: Vec<Document> = serde_json::from_str(&content)?;
            debug!("Loaded {} documents into '{name}'", documents.len());
            collections.insert(name.to_string(), documents);
        }

        info!(
            "Opened memory store at {} ({} collections)",
            dir.display(),
            collections.len()
        );
        Ok(Self {
            collections: RwLock::new(collections),
            dir: Some(dir),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Vec<Document>>>> {
        self.collections
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Vec<Document>>>> {
        self.collections
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn persist(&self, collection: &str, documents: &[Document]) -> Result<()> {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{collection}.json"));
            std::fs::write(&path, serde_json::to_string(documents)?)?;
        }
        Ok(())
    }
}

fn project(document: &Document, projection: &[String]) -> Document {
    if projection.is_empty() {
        return document.clone();
    }
    projection
        .iter()
        .filter_map(|f| document.get(f).map(|v| (f.clone(), v.clone())))
        .collect()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        projection: &[String],
    ) -> Result<Vec<Document>> {
        let guard = self.read()?;
        Ok(guard
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| filter.matches(d))
                    .map(|d| project(d, projection))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn apply(&self, collection: &str, ops: Vec<WriteOp>) -> Result<WriteSummary> {
        ensure_valid_name(collection)?;
        let mut guard = self.write()?;
        let documents = guard.entry(collection.to_string()).or_default();
        let mut summary = WriteSummary::default();

        for op in ops {
            match op {
                WriteOp::Insert(document) => {
                    documents.push(document);
                    summary.inserted += 1;
                }
                WriteOp::Upsert { filter, document } => {
                    if filter.is_empty() {
                        return Err(StoreError::Backend(
                            "refusing upsert with an empty filter".to_string(),
                        ));
                    }
                    let mut matched = 0;
                    for existing in documents.iter_mut().filter(|d| filter.matches(d)) {
                        for (field, value) in &document {
                            existing.insert(field.clone(), value.clone());
                        }
                        matched += 1;
                    }
                    if matched == 0 {
                        documents.push(document);
                        summary.inserted += 1;
                    } else {
                        summary.updated += matched;
                    }
                }
            }
        }

        self.persist(collection, documents)?;
        Ok(summary)
    }

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<usize> {
        let mut guard = self.write()?;
        let Some(documents) = guard.get_mut(collection) else {
            return Ok(0);
        };
        let before = documents.len();
        documents.retain(|d| !filter.matches(d));
        let removed = before - documents.len();
        if removed > 0 {
            self.persist(collection, documents)?;
        }
        Ok(removed)
    }

    async fn collections(&self) -> Result<Vec<String>> {
        let guard = self.read()?;
        Ok(guard
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }
}

/// Hands out handles to one shared [`MemoryStore`].
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// How many connections have been opened so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<Arc<dyn DocumentStore>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.store.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::Value;

    fn doc(code: &str, close: f64) -> Document {
        Document::from([
            ("code".to_string(), Value::from(code)),
            ("close".to_string(), Value::Float(close)),
        ])
    }

    #[tokio::test]
    async fn test_upsert_merges_or_inserts() {
        let store = MemoryStore::new();
        let key = Filter::new().equals("code", "A");
        store
            .apply(
                "bars",
                vec![
                    WriteOp::Upsert {
                        filter: key.clone(),
                        document: doc("A", 1.0),
                    },
                    WriteOp::Upsert {
                        filter: key.clone(),
                        document: doc("A", 2.0),
                    },
                ],
            )
            .await
            .unwrap();

        let found = store.find("bars", &key, &[]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("close"), Some(&Value::Float(2.0)));
    }

    #[tokio::test]
    async fn test_empty_upsert_filter_is_rejected() {
        let store = MemoryStore::new();
        let result = store
            .apply(
                "bars",
                vec![WriteOp::Upsert {
                    filter: Filter::new(),
                    document: doc("A", 1.0),
                }],
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_persisted_collections_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let store = MemoryStore::open(dir.path()).unwrap();
            store
                .apply("bars", vec![WriteOp::Insert(doc("A", 1.0))])
                .await
                .unwrap();
        }

        let reopened = MemoryStore::open(dir.path()).unwrap();
        let found = reopened.find("bars", &Filter::new(), &[]).await.unwrap();
        assert_eq!(found, vec![doc("A", 1.0)]);
        assert_eq!(reopened.collections().await.unwrap(), vec!["bars"]);
    }

    #[tokio::test]
    async fn test_connector_counts_connections() {
        let connector = MemoryConnector::default();
        connector.connect().await.unwrap();
        connector.connect().await.unwrap();
        assert_eq!(connector.connect_count(), 2);
    }
}
