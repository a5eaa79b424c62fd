//! Resource declaration file.
//!
//! The declaration file is a YAML list. Each entry is either the positional
//! form
//!
//! ```yaml
//! - [Finance.BalanceSheet, fin, balance_sheet, code, end_date, {code: {types: [text], required: true}}, ~]
//! ```
//!
//! i.e. `(uri, storage_location, table_prefix, identity_field, time_field,
//! query_schema, result_schema)` with `~` for absent parts, or the mapping
//! form, which additionally accepts a partition strategy:
//!
//! ```yaml
//! - uri: Market.Daily
//!   storage_location: fin
//!   table_prefix: daily
//!   identity_field: code
//!   time_field: trade_date
//!   partition: per_identity
//!   result_schema:
//!     close: {types: [number], label: Close}
//! ```
//!
//! Malformed entries are logged and skipped; they never prevent the other
//! resources from loading.

use anyhow::Context;
use doc_store::{is_valid_name, PartitionStrategy};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use sync_core::FieldSpecMap;
use tracing::{debug, warn};

use crate::descriptor::ResourceDescriptor;
use crate::error::{Result, SyncError};

type TupleForm = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<FieldSpecMap>,
    Option<FieldSpecMap>,
);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MappingForm {
    uri: String,
    #[serde(alias = "location")]
    storage_location: String,
    #[serde(alias = "prefix")]
    table_prefix: String,
    #[serde(default, alias = "identity")]
    identity_field: Option<String>,
    #[serde(default, alias = "time")]
    time_field: Option<String>,
    #[serde(default, alias = "query")]
    query_schema: Option<FieldSpecMap>,
    #[serde(default, alias = "result")]
    result_schema: Option<FieldSpecMap>,
    #[serde(default)]
    partition: Option<String>,
}

impl From<TupleForm> for MappingForm {
    fn from(t: TupleForm) -> Self {
        Self {
            uri: t.0,
            storage_location: t.1,
            table_prefix: t.2,
            identity_field: t.3,
            time_field: t.4,
            query_schema: t.5,
            result_schema: t.6,
            partition: None,
        }
    }
}

fn check_name(uri: &str, what: &str, name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(SyncError::Config(format!(
            "'{uri}': {what} '{name}' must be non-empty and contain only letters, digits and '_'"
        )))
    }
}

impl MappingForm {
    fn into_descriptor(self) -> Result<ResourceDescriptor> {
        let uri = self.uri.trim().to_string();
        if uri.is_empty() {
            return Err(SyncError::Config("empty resource uri".to_string()));
        }
        for (what, name) in [
            ("storage location", &self.storage_location),
            ("table prefix", &self.table_prefix),
        ] {
            check_name(&uri, what, name)?;
            // Double underscores separate a partitioned table from its partitions
            if name.contains("__") {
                return Err(SyncError::Config(format!(
                    "'{uri}': {what} '{name}' must not contain '__'"
                )));
            }
        }
        let key_fields = self.identity_field.iter().chain(self.time_field.iter());
        for field in key_fields {
            check_name(&uri, "key field", field)?;
        }

        let mut descriptor = ResourceDescriptor::new(uri, self.storage_location, self.table_prefix)
            .with_query_schema(self.query_schema.unwrap_or_default())
            .with_result_schema(self.result_schema.unwrap_or_default());
        descriptor.identity_field = self.identity_field;
        descriptor.time_field = self.time_field;

        if let Some(name) = self.partition {
            let strategy = PartitionStrategy::by_name(&name).ok_or_else(|| {
                SyncError::Config(format!(
                    "'{}': unknown partition strategy '{name}'",
                    descriptor.uri
                ))
            })?;
            if descriptor.identity_field.is_none() {
                return Err(SyncError::Config(format!(
                    "'{}': partition '{name}' requires an identity field",
                    descriptor.uri
                )));
            }
            descriptor.partition = Some(strategy);
        }
        Ok(descriptor)
    }
}

fn parse_entry(entry: serde_yaml::Value) -> Result<ResourceDescriptor> {
    let form = match entry {
        serde_yaml::Value::Sequence(_) => serde_yaml::from_value::<TupleForm>(entry)
            .map(MappingForm::from)
            .map_err(|e| SyncError::Config(format!("invalid positional entry: {e}")))?,
        serde_yaml::Value::Mapping(_) => serde_yaml::from_value::<MappingForm>(entry)
            .map_err(|e| SyncError::Config(format!("invalid mapping entry: {e}")))?,
        other => {
            return Err(SyncError::Config(format!(
                "expected a list or mapping, found {other:?}"
            )))
        }
    };
    form.into_descriptor()
}

/// Parse a declaration document, skipping malformed or duplicate entries.
pub fn parse_declarations(content: &str) -> anyhow::Result<Vec<ResourceDescriptor>> {
    let entries: Vec<serde_yaml::Value> =
        serde_yaml::from_str(content).context("Declaration file must be a YAML list")?;

    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match parse_entry(entry) {
            Ok(descriptor) => {
                if !seen.insert(descriptor.uri.clone()) {
                    warn!(
                        "Skipping declaration #{index}: duplicate resource '{}'",
                        descriptor.uri
                    );
                    continue;
                }
                debug!(
                    "Declared '{}' -> {} ({:?})",
                    descriptor.uri,
                    descriptor.collection(),
                    descriptor.key_fields()
                );
                descriptors.push(descriptor);
            }
            Err(e) => warn!("Skipping declaration #{index}: {e}"),
        }
    }
    Ok(descriptors)
}

/// Load and parse a declaration file.
pub fn load_declarations(path: &Path) -> anyhow::Result<Vec<ResourceDescriptor>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read declaration file: {path:?}"))?;
    let descriptors = parse_declarations(&content)
        .with_context(|| format!("Failed to parse declaration file: {path:?}"))?;
    tracing::info!(
        "Loaded {} resource declarations from {path:?}",
        descriptors.len()
    );
    Ok(descriptors)
}
