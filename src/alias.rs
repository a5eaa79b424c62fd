//! Field alias index.
//!
//! Maps canonical field keys to the readable labels source plugins declare
//! for them, and back. Built once from every registered plugin.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::plugin::SourcePlugin;

/// Bucket collecting names no resource declares.
pub const UNRESOLVED: &str = "unresolved";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasEntry {
    pub canonical_key: String,
    pub label: String,
    pub owning_uri: String,
}

#[derive(Debug, Clone, Default)]
pub struct AliasIndex {
    key_to_label: HashMap<String, String>,
    label_to_key: HashMap<String, String>,
    key_to_uri: HashMap<String, String>,
}

impl AliasIndex {
    /// Index every field declaration of `plugins`.
    ///
    /// On conflicting declarations the first plugin wins.
    pub fn build(plugins: &[Arc<dyn SourcePlugin>]) -> Self {
        let entries = plugins.iter().flat_map(|plugin| {
            plugin.fields().into_iter().flat_map(|(uri, fields)| {
                fields.into_iter().map(move |(key, label)| AliasEntry {
                    canonical_key: key,
                    label,
                    owning_uri: uri.clone(),
                })
            })
        });
        let index = Self::from_entries(entries);
        debug!("Built alias index with {} fields", index.len());
        index
    }

    pub fn from_entries(entries: impl IntoIterator<Item = AliasEntry>) -> Self {
        let mut index = Self::default();
        for entry in entries {
            if index.key_to_label.contains_key(&entry.canonical_key) {
                continue;
            }
            index
                .label_to_key
                .entry(entry.label.clone())
                .or_insert_with(|| entry.canonical_key.clone());
            index
                .key_to_uri
                .insert(entry.canonical_key.clone(), entry.owning_uri);
            index.key_to_label.insert(entry.canonical_key, entry.label);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.key_to_label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_to_label.is_empty()
    }

    /// Every entry, ordered by key.
    pub fn entries(&self) -> Vec<AliasEntry> {
        let mut entries: Vec<AliasEntry> = self
            .key_to_label
            .iter()
            .map(|(key, label)| AliasEntry {
                canonical_key: key.clone(),
                label: label.clone(),
                owning_uri: self.key_to_uri.get(key).cloned().unwrap_or_default(),
            })
            .collect();
        entries.sort_by(|a, b| a.canonical_key.cmp(&b.canonical_key));
        entries
    }

    /// Canonical keys for `labels`; unknown names pass through.
    pub fn to_canonical(&self, labels: &[String]) -> Vec<String> {
        labels
            .iter()
            .map(|label| self.label_to_key.get(label).unwrap_or(label).clone())
            .collect()
    }

    /// Labels for `keys`; unknown names pass through.
    pub fn to_labels(&self, keys: &[String]) -> Vec<String> {
        keys.iter()
            .map(|key| self.key_to_label.get(key).unwrap_or(key).clone())
            .collect()
    }

    /// Key -> label mapping, for renaming result columns.
    pub fn label_map(&self) -> HashMap<String, String> {
        self.key_to_label.clone()
    }

    /// Group labels (or keys) by the resource declaring them.
    ///
    /// Names no resource declares land in the [`UNRESOLVED`] bucket.
    pub fn group_by_resource(&self, labels: &[String]) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for label in labels {
            let key = self.label_to_key.get(label).unwrap_or(label);
            let uri = self
                .key_to_uri
                .get(key)
                .map(String::as_str)
                .unwrap_or(UNRESOLVED);
            groups.entry(uri.to_string()).or_default().push(label.clone());
        }
        if let Some(unresolved) = groups.get(UNRESOLVED) {
            warn!("Unresolved fields: {unresolved:?}");
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::FieldLabels;
    use crate::router::tests::StaticPlugin;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn index() -> AliasIndex {
        let mut sheet = StaticPlugin::new("sheet", &["Finance.BalanceSheet"]);
        sheet.labels = FieldLabels::from([(
            "Finance.BalanceSheet".to_string(),
            BTreeMap::from([
                ("total_assets".to_string(), "Total Assets".to_string()),
                ("total_liab".to_string(), "Total Liabilities".to_string()),
            ]),
        )]);
        let mut daily = StaticPlugin::new("daily", &["Market.Daily"]);
        daily.labels = FieldLabels::from([(
            "Market.Daily".to_string(),
            BTreeMap::from([
                ("close".to_string(), "Close".to_string()),
                // Shadowed by the first plugin
                ("total_assets".to_string(), "Assets".to_string()),
            ]),
        )]);
        let plugins: Vec<Arc<dyn SourcePlugin>> = vec![Arc::new(sheet), Arc::new(daily)];
        AliasIndex::build(&plugins)
    }

    #[test]
    fn test_round_trip() {
        let index = index();
        let labels = strings(&["Total Assets", "Close", "Unknown Thing"]);
        let keys = index.to_canonical(&labels);
        assert_eq!(keys, strings(&["total_assets", "close", "Unknown Thing"]));
        assert_eq!(index.to_labels(&keys), labels);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_group_by_resource() {
        let groups = index().group_by_resource(&strings(&[
            "Total Assets",
            "close",
            "Mystery",
            "Total Liabilities",
        ]));
        assert_eq!(
            groups["Finance.BalanceSheet"],
            strings(&["Total Assets", "Total Liabilities"])
        );
        assert_eq!(groups["Market.Daily"], strings(&["close"]));
        assert_eq!(groups[UNRESOLVED], strings(&["Mystery"]));
    }

    #[test]
    fn test_entries_are_sorted() {
        let keys: Vec<String> = index()
            .entries()
            .into_iter()
            .map(|e| e.canonical_key)
            .collect();
        assert_eq!(keys, strings(&["close", "total_assets", "total_liab"]));
    }
}
