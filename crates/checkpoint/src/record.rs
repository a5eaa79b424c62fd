//! Coverage records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_core::{Record, Value};

pub(crate) const SINCE_FIELD: &str = "since";
pub(crate) const UNTIL_FIELD: &str = "until";
pub(crate) const LAST_SYNCED_FIELD: &str = "last_synced_at";

/// What has been synchronized for one tag.
///
/// `since` only moves earlier, `until` and `last_synced_at` only move later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageRecord {
    /// Joined tag string
    pub tag: String,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

impl CoverageRecord {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            since: None,
            until: None,
            last_synced_at: None,
        }
    }

    /// Widen the record with a newly synchronized window.
    ///
    /// Returns whether anything changed.
    pub fn advance(
        &mut self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        synced_at: Option<DateTime<Utc>>,
    ) -> bool {
        let before = self.clone();
        self.since = earliest(self.since, since);
        self.until = latest(self.until, until);
        self.last_synced_at = latest(self.last_synced_at, synced_at);
        *self != before
    }

    /// Both window bounds are known.
    pub fn has_window(&self) -> bool {
        self.since.is_some() && self.until.is_some()
    }

    pub(crate) fn to_fields(&self) -> Record {
        [
            (SINCE_FIELD, self.since),
            (UNTIL_FIELD, self.until),
            (LAST_SYNCED_FIELD, self.last_synced_at),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.map(|ts| (field.to_string(), Value::Timestamp(ts))))
        .collect()
    }

    pub(crate) fn from_fields(tag: String, fields: &Record) -> Self {
        let read = |field: &str| fields.get(field).and_then(Value::as_timestamp);
        Self {
            tag,
            since: read(SINCE_FIELD),
            until: read(UNTIL_FIELD),
            last_synced_at: read(LAST_SYNCED_FIELD),
        }
    }
}
