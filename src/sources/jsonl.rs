//! JSONL source plugin.
//!
//! Serves every `<dir>/<uri>.jsonl` file, one JSON object per line. An
//! optional `<dir>/<uri>.fields.json` maps field keys to readable labels:
//!
//! ```json
//! { "total_assets": "Total Assets", "total_liab": "Total Liabilities" }
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use sync_core::{Record, Table, Value};
use tracing::{debug, info, warn};

use crate::plugin::{FieldLabels, Reference, Request, SourcePlugin};

const DATA_SUFFIX: &str = ".jsonl";
const FIELDS_SUFFIX: &str = ".fields.json";

pub struct JsonlSource {
    dir: PathBuf,
    capacities: Vec<String>,
    labels: FieldLabels,
}

impl JsonlSource {
    /// Scan `dir` for data files and label declarations.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read JSONL source directory {}", dir.display()))?;

        let mut capacities = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(uri) = name.strip_suffix(DATA_SUFFIX) {
                capacities.push(uri.to_string());
            }
        }
        capacities.sort();

        let mut labels = FieldLabels::new();
        for uri in &capacities {
            let path = dir.join(format!("{uri}{FIELDS_SUFFIX}"));
            if !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(fields) => {
                    labels.insert(uri.clone(), fields);
                }
                Err(e) => warn!("Ignoring malformed label file {}: {e}", path.display()),
            }
        }

        info!(
            "JSONL source at {} serves {} resources",
            dir.display(),
            capacities.len()
        );
        Ok(Self {
            dir,
            capacities,
            labels,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, uri: &str) -> Option<PathBuf> {
        self.capacities
            .iter()
            .find(|c| c.eq_ignore_ascii_case(uri))
            .map(|c| self.dir.join(format!("{c}{DATA_SUFFIX}")))
    }
}

/// Parse JSONL content, skipping blank and malformed lines.
fn parse_rows(content: &str, source: &str) -> Vec<Record> {
    let mut rows = Vec::new();
    for (line_number, line) in content.lines().enumerate() {
        let line_number = line_number + 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(object)) => rows.push(
                object
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
            Ok(_) => warn!("Skipping line {line_number} of {source}: not a JSON object"),
            Err(e) => warn!("Skipping line {line_number} of {source}: {e}"),
        }
    }
    rows
}

/// Whether `row` satisfies every key of `request`.
///
/// `<field>_since` / `<field>_until` bound `<field>`; every other key is an
/// equality check. Rows lacking a field are not filtered on it.
fn matches(row: &Record, request: &Request) -> bool {
    request.iter().all(|(key, wanted)| {
        let bound = key
            .strip_suffix("_since")
            .map(|field| (field, true))
            .or_else(|| key.strip_suffix("_until").map(|field| (field, false)));

        if let (Some((field, lower)), Some(limit)) = (bound, wanted.as_timestamp()) {
            if let Some(time) = row.get(field).and_then(Value::as_timestamp) {
                return if lower { time >= limit } else { time <= limit };
            }
            if row.contains_key(field) {
                return false;
            }
            if !row.contains_key(key.as_str()) {
                return true;
            }
        }

        match row.get(key.as_str()) {
            None => true,
            Some(value) => {
                value == wanted || value.compare(wanted) == Some(std::cmp::Ordering::Equal)
            }
        }
    })
}

#[async_trait]
impl SourcePlugin for JsonlSource {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn capacities(&self) -> Vec<String> {
        self.capacities.clone()
    }

    async fn query(&self, uri: &str, request: &Request) -> Result<Option<Table>> {
        let Some(path) = self.path_for(uri) else {
            return Ok(None);
        };
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let source = path.display().to_string();
        let rows: Vec<Record> = parse_rows(&content, &source)
            .into_iter()
            .filter(|row| matches(row, request))
            .collect();
        debug!("{source}: {} rows match {request:?}", rows.len());
        Ok(Some(Table::from_rows(rows)))
    }

    fn fields(&self) -> FieldLabels {
        self.labels.clone()
    }

    async fn reference(&self, uri: &str, _identity: Option<&str>) -> Result<Option<Reference>> {
        let Some(path) = self.path_for(uri) else {
            return Ok(None);
        };
        let modified = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        Ok(Some(Reference::Freshness(modified.into())))
    }
}
