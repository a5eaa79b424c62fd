//! Application configuration.
//!
//! Loaded from a TOML file; every section has defaults, so an empty (or
//! missing) file yields an in-memory setup with no source plugins.
//!
//! ```toml
//! declarations = "resources.yaml"
//! log_level = "info"
//!
//! [storage]
//! backend = "surreal"
//! endpoint = "ws://localhost:8000"
//! namespace = "fin"
//! database = "fin"
//!
//! [sync]
//! batch_size = 950
//! fetch_timeout = "30s"
//! epoch = "1990-01-01"
//!
//! [sources.jsonl]
//! dir = "data/"
//! ```

pub mod duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use doc_store::{Connector, MemoryConnector, MemoryStore, SurrealConnector, SurrealOpts};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::planner::DEFAULT_EPOCH;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Resource declaration file
    pub declarations: Option<PathBuf>,
    pub storage: StorageConfig,
    pub sync: SyncSettings,
    pub sources: SourcesConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            declarations: None,
            storage: StorageConfig::default(),
            sync: SyncSettings::default(),
            sources: SourcesConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path:?}"))?;
        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {path:?}"))?;

        // Relative paths are resolved against the config file's directory
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Load `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config file at {path:?}, using defaults");
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.sync.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(p) = self.declarations.as_mut() {
            resolve(p);
        }
        if let StorageConfig::Memory { dir: Some(p) } = &mut self.storage {
            resolve(p);
        }
        if let Some(jsonl) = self.sources.jsonl.as_mut() {
            resolve(&mut jsonl.dir);
        }
    }
}

/// Backing document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-process store, persisted as JSON files when `dir` is set
    Memory {
        #[serde(default)]
        dir: Option<PathBuf>,
    },
    /// SurrealDB v2
    Surreal {
        #[serde(default = "default_surreal_endpoint")]
        endpoint: String,
        #[serde(default = "default_surreal_name")]
        namespace: String,
        #[serde(default = "default_surreal_name")]
        database: String,
        #[serde(default = "default_surreal_credential")]
        username: String,
        #[serde(default = "default_surreal_credential")]
        password: String,
    },
}

fn default_surreal_endpoint() -> String {
    "ws://localhost:8000".to_string()
}

fn default_surreal_name() -> String {
    "fin".to_string()
}

fn default_surreal_credential() -> String {
    "root".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory { dir: None }
    }
}

impl StorageConfig {
    /// Open the configured backend.
    pub fn connector(&self) -> anyhow::Result<Arc<dyn Connector>> {
        match self {
            Self::Memory { dir: None } => Ok(Arc::new(MemoryConnector::default())),
            Self::Memory { dir: Some(dir) } => {
                let store = MemoryStore::open(dir)
                    .with_context(|| format!("Failed to open memory store at {dir:?}"))?;
                Ok(Arc::new(MemoryConnector::new(Arc::new(store))))
            }
            Self::Surreal {
                endpoint,
                namespace,
                database,
                username,
                password,
            } => Ok(Arc::new(SurrealConnector::new(SurrealOpts {
                endpoint: endpoint.clone(),
                username: username.clone(),
                password: password.clone(),
                namespace: namespace.clone(),
                database: database.clone(),
            }))),
        }
    }
}

/// Synchronization tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Rows buffered per bulk flush
    pub batch_size: usize,
    /// Operations served by one storage connection
    pub recycle_after: usize,
    /// Per-fetch timeout, e.g. "30s" or "5m"
    pub fetch_timeout: String,
    /// Start of the full synchronization window
    pub epoch: String,
    /// Merges larger than this recycle their connection eagerly
    pub large_identity_rows: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: doc_store::DEFAULT_BATCH_SIZE,
            recycle_after: doc_store::DEFAULT_RECYCLE_AFTER,
            fetch_timeout: "30s".to_string(),
            epoch: DEFAULT_EPOCH.to_string(),
            large_identity_rows: 50_000,
        }
    }
}

impl SyncSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("sync.batch_size must be greater than zero");
        }
        if self.recycle_after == 0 {
            anyhow::bail!("sync.recycle_after must be greater than zero");
        }
        self.fetch_timeout()?;
        self.epoch()?;
        Ok(())
    }

    pub fn fetch_timeout(&self) -> anyhow::Result<Duration> {
        duration::parse_duration(&self.fetch_timeout)
            .with_context(|| format!("Invalid sync.fetch_timeout '{}'", self.fetch_timeout))
    }

    pub fn epoch(&self) -> anyhow::Result<DateTime<Utc>> {
        sync_core::parse_timestamp(&self.epoch)
            .with_context(|| format!("Invalid sync.epoch '{}'", self.epoch))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourcesConfig {
    pub jsonl: Option<JsonlSourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonlSourceConfig {
    /// Directory holding `<uri>.jsonl` files
    pub dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.storage, StorageConfig::Memory { dir: None });
        assert_eq!(config.sync.batch_size, 950);
        assert_eq!(config.sync.recycle_after, 10_000);
        assert_eq!(config.sync.fetch_timeout().unwrap(), Duration::from_secs(30));
        assert_eq!(config.sync.epoch().unwrap().to_rfc3339(), "1990-01-01T00:00:00+00:00");
        assert_eq!(config.log_level, "info");
        assert!(config.sources.jsonl.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml_str(
            r#"
            declarations = "resources.yaml"
            log_level = "debug"

            [storage]
            backend = "surreal"
            endpoint = "mem://"
            database = "test"

            [sync]
            batch_size = 100
            fetch_timeout = "2m"
            epoch = "2000-01-01"

            [sources.jsonl]
            dir = "data"
            "#,
        )
        .unwrap();

        assert_eq!(config.declarations, Some(PathBuf::from("resources.yaml")));
        match &config.storage {
            StorageConfig::Surreal {
                endpoint,
                namespace,
                database,
                ..
            } => {
                assert_eq!(endpoint, "mem://");
                assert_eq!(namespace, "fin");
                assert_eq!(database, "test");
            }
            other => panic!("unexpected storage {other:?}"),
        }
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.sync.large_identity_rows, 50_000);
        assert_eq!(config.sync.fetch_timeout().unwrap(), Duration::from_secs(120));
        assert_eq!(
            config.sources.jsonl,
            Some(JsonlSourceConfig {
                dir: PathBuf::from("data")
            })
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::from_toml_str("[sync]\nbatch_size = 0").is_err());
        assert!(Config::from_toml_str("[sync]\nfetch_timeout = \"soon\"").is_err());
        assert!(Config::from_toml_str("[sync]\nepoch = \"yesterday\"").is_err());
        assert!(Config::from_toml_str("[storage]\nbackend = \"mongodb\"").is_err());
        assert!(Config::from_toml_str("unknown_key = 1").is_err());
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fin-sync.toml");
        std::fs::write(
            &path,
            "declarations = \"resources.yaml\"\n[storage]\nbackend = \"memory\"\ndir = \"store\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.declarations, Some(dir.path().join("resources.yaml")));
        assert_eq!(
            config.storage,
            StorageConfig::Memory {
                dir: Some(dir.path().join("store"))
            }
        );
        assert!(Config::load_or_default(&dir.path().join("missing.toml")).is_ok());
    }
}
