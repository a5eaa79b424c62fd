//! Source plugin contract.
//!
//! A source plugin fetches rows for the resources it declares from one
//! upstream provider. Plugins are registered with the router in priority
//! order and held as trait objects.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use sync_core::{Record, Table};

/// A packed fetch request.
///
/// Keys are the resource's identity field (or `identity`) and
/// `{time}_since` / `{time}_until` for the window (with `time` the resource's
/// time field or `datetime`), plus any caller extras.
pub type Request = Record;

/// Resource URI -> (field key -> readable label).
pub type FieldLabels = BTreeMap<String, BTreeMap<String, String>>;

/// Upstream signal describing what the source currently holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    /// The source covers this window
    Range {
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    },
    /// The source changed at this instant
    Freshness(DateTime<Utc>),
}

/// Trait for upstream data providers.
#[async_trait::async_trait]
pub trait SourcePlugin: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Resource URIs this plugin can serve
    fn capacities(&self) -> Vec<String>;

    /// Whether this plugin serves `uri`.
    ///
    /// The default is a case-insensitive lookup in [`SourcePlugin::capacities`].
    fn adapt(&self, uri: &str) -> bool {
        self.capacities()
            .iter()
            .any(|capacity| capacity.eq_ignore_ascii_case(uri))
    }

    /// Fetch rows for `uri`.
    ///
    /// `Ok(None)` and an empty table both mean "nothing here"; the router
    /// moves on to the next plugin.
    async fn query(&self, uri: &str, request: &Request) -> anyhow::Result<Option<Table>>;

    /// Readable labels of the fields this plugin returns.
    fn fields(&self) -> FieldLabels {
        FieldLabels::new()
    }

    /// Upstream reference for planning; `None` when the plugin cannot tell.
    async fn reference(
        &self,
        _uri: &str,
        _identity: Option<&str>,
    ) -> anyhow::Result<Option<Reference>> {
        Ok(None)
    }
}
