//! Tabular results.
//!
//! A [`Table`] is what source plugins return and what callers receive from a
//! query: an ordered column list plus rows. Rows may omit cells; a missing
//! cell reads as [`Value::Null`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::values::{Record, Value};

static NULL: Value = Value::Null;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Record>,
}

impl Table {
    /// Create an empty table with the given columns.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table from rows, collecting columns in first-seen order.
    pub fn from_rows(rows: Vec<Record>) -> Self {
        let mut table = Self::default();
        for row in rows {
            table.push(row);
        }
        table
    }

    /// Append a row, registering any column not seen before.
    pub fn push(&mut self, row: Record) {
        for key in row.keys() {
            if !self.columns.iter().any(|c| c == key) {
                self.columns.push(key.clone());
            }
        }
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Record> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Every cell of a column, missing cells reading as null.
    pub fn column<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows.iter().map(move |row| row.get(name).unwrap_or(&NULL))
    }

    /// Keep only the listed columns, in the listed order.
    ///
    /// Listed columns the table does not have are ignored.
    pub fn project(&self, fields: &[String]) -> Table {
        let columns: Vec<String> = fields
            .iter()
            .filter(|f| self.has_column(f))
            .cloned()
            .collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                    .collect()
            })
            .collect();
        Table { columns, rows }
    }

    /// Rename columns; names without a mapping are kept.
    pub fn rename_columns(&self, mapping: &HashMap<String, String>) -> Table {
        let rename = |name: &String| mapping.get(name).cloned().unwrap_or_else(|| name.clone());
        Table {
            columns: self.columns.iter().map(rename).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| row.iter().map(|(k, v)| (rename(k), v.clone())).collect())
                .collect(),
        }
    }

    /// Stable sort of rows by the given columns, nulls first.
    pub fn sort_by_columns(&mut self, columns: &[String]) {
        self.rows.sort_by(|a, b| {
            for column in columns {
                let left = a.get(column).unwrap_or(&NULL);
                let right = b.get(column).unwrap_or(&NULL);
                let ordering = left.total_cmp(right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    /// Left-preferring combine on key columns.
    ///
    /// Rows of `other` whose key matches a row of `self` only fill cells
    /// `self` does not have; unmatched rows (including rows missing a key
    /// column) are appended. Columns are the union, `self`'s first.
    pub fn combine(mut self, other: Table, keys: &[String]) -> Table {
        for column in other.columns {
            if !self.columns.contains(&column) {
                self.columns.push(column);
            }
        }

        let mut index: BTreeMap<String, usize> = BTreeMap::new();
        for (pos, row) in self.rows.iter().enumerate() {
            if let Some(key) = row_key(row, keys) {
                index.entry(key).or_insert(pos);
            }
        }

        for row in other.rows {
            match row_key(&row, keys).and_then(|k| index.get(&k).copied()) {
                Some(pos) => {
                    let target = &mut self.rows[pos];
                    for (field, value) in row {
                        target.entry(field).or_insert(value);
                    }
                }
                None => {
                    if let Some(key) = row_key(&row, keys) {
                        index.insert(key, self.rows.len());
                    }
                    self.rows.push(row);
                }
            }
        }
        self
    }
}

fn row_key(row: &Record, keys: &[String]) -> Option<String> {
    if keys.is_empty() {
        return None;
    }
    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        parts.push(row.get(key)?.key_fragment());
    }
    Some(parts.join("\u{1f}"))
}
