//! Conjunctive match filters.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use sync_core::{Record, Value};

static NULL: Value = Value::Null;

/// A single condition on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Eq(String, Value),
    In(String, Vec<Value>),
    Gte(String, Value),
    Lte(String, Value),
}

impl Clause {
    pub fn field(&self) -> &str {
        match self {
            Self::Eq(f, _) | Self::In(f, _) | Self::Gte(f, _) | Self::Lte(f, _) => f,
        }
    }

    fn matches(&self, record: &Record) -> bool {
        let value = record.get(self.field()).unwrap_or(&NULL);
        match self {
            Self::Eq(_, expected) => value.compare(expected) == Some(Ordering::Equal),
            Self::In(_, options) => options
                .iter()
                .any(|o| value.compare(o) == Some(Ordering::Equal)),
            Self::Gte(_, bound) => matches!(
                value.compare(bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lte(_, bound) => {
                matches!(value.compare(bound), Some(Ordering::Less | Ordering::Equal))
            }
        }
    }
}

/// Conjunction of clauses.
///
/// An empty filter matches every document. Callers that derive a filter
/// from optional key values must check [`Filter::is_empty`] before using it
/// to select documents for an overwrite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq(field.into(), value.into()));
        self
    }

    pub fn any_of(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.clauses.push(Clause::In(field.into(), values));
        self
    }

    pub fn gte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Gte(field.into(), value.into()));
        self
    }

    pub fn lte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Lte(field.into(), value.into()));
        self
    }

    /// Inclusive time window; open bounds add no clause.
    pub fn between(
        self,
        field: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        let filter = match since {
            Some(since) => self.gte(field, since),
            None => self,
        };
        match until {
            Some(until) => filter.lte(field, until),
            None => filter,
        }
    }

    /// Append every clause of `other`.
    pub fn and(mut self, other: &Filter) -> Self {
        self.clauses.extend(other.clauses.iter().cloned());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.clauses.iter().all(|c| c.matches(record))
    }
}
