//! Routing of fetch requests to source plugins.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use sync_core::{Record, Table, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::descriptor::ResourceDescriptor;
use crate::error::{Result, SyncError};
use crate::planner::TimeRange;
use crate::plugin::{Reference, Request, SourcePlugin};

/// Default per-fetch timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Text of a caught panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Tries capable plugins in registration order.
///
/// Every plugin call runs under the per-fetch timeout and stops early when
/// the router's cancellation token fires. A panicking plugin counts as a
/// failed one.
pub struct SourceRouter {
    plugins: Vec<Arc<dyn SourcePlugin>>,
    fetch_timeout: Duration,
    cancel: CancellationToken,
}

impl SourceRouter {
    pub fn new(plugins: Vec<Arc<dyn SourcePlugin>>, fetch_timeout: Duration) -> Self {
        Self {
            plugins,
            fetch_timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Use a caller-owned token, e.g. a child of an application-wide one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn plugins(&self) -> &[Arc<dyn SourcePlugin>] {
        &self.plugins
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Abort in-flight fetches and refuse new ones.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Plugins able to serve `uri`, in registration order.
    pub fn candidates(&self, uri: &str) -> Vec<Arc<dyn SourcePlugin>> {
        self.plugins
            .iter()
            .filter(|p| p.adapt(uri))
            .cloned()
            .collect()
    }

    /// Build the request mapping for one fetch.
    ///
    /// Caller extras are merged last and may override packed keys.
    pub fn pack_request(
        descriptor: &ResourceDescriptor,
        identity: Option<&str>,
        range: &TimeRange,
        extra: &Record,
    ) -> Request {
        let mut request = Request::new();
        if let Some(identity) = identity {
            request.insert(descriptor.identity_key().to_string(), Value::from(identity));
        }
        let time_key = descriptor.time_key();
        if let Some(since) = range.since {
            request.insert(format!("{time_key}_since"), Value::Timestamp(since));
        }
        if let Some(until) = range.until {
            request.insert(format!("{time_key}_until"), Value::Timestamp(until));
        }
        for (key, value) in extra {
            request.insert(key.clone(), value.clone());
        }
        request
    }

    async fn fetch_one(
        &self,
        plugin: &dyn SourcePlugin,
        uri: &str,
        request: &Request,
    ) -> Result<Option<Table>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled(uri.to_string())),
            result = tokio::time::timeout(
                self.fetch_timeout,
                AssertUnwindSafe(plugin.query(uri, request)).catch_unwind(),
            ) => {
                match result {
                    Err(_) => Err(SyncError::Timeout {
                        uri: uri.to_string(),
                        plugin: plugin.name().to_string(),
                        secs: self.fetch_timeout.as_secs(),
                    }),
                    Ok(Err(payload)) => Err(SyncError::Fetch {
                        uri: uri.to_string(),
                        reason: format!("{} panicked: {}", plugin.name(), panic_message(&*payload)),
                    }),
                    Ok(Ok(Err(e))) => Err(SyncError::Fetch {
                        uri: uri.to_string(),
                        reason: format!("{}: {e:#}", plugin.name()),
                    }),
                    Ok(Ok(Ok(table))) => Ok(table),
                }
            }
        }
    }

    /// Fetch rows for a resource from the first plugin that has any.
    ///
    /// Plugin errors, timeouts and empty results all move on to the next
    /// plugin; `Ok(None)` means every capable plugin came up empty.
    /// Cancellation aborts the whole route.
    pub async fn route(
        &self,
        descriptor: &ResourceDescriptor,
        identity: Option<&str>,
        range: &TimeRange,
        extra: &Record,
    ) -> Result<Option<Table>> {
        let uri = descriptor.uri.as_str();
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled(uri.to_string()));
        }

        let candidates = self.candidates(uri);
        if candidates.is_empty() {
            debug!("No source plugin serves '{uri}'");
            return Ok(None);
        }

        let request = Self::pack_request(descriptor, identity, range, extra);
        for plugin in candidates {
            match self.fetch_one(plugin.as_ref(), uri, &request).await {
                Ok(Some(table)) if !table.is_empty() => {
                    info!(
                        "Fetched {} rows for '{uri}' from '{}'",
                        table.len(),
                        plugin.name()
                    );
                    return Ok(Some(table));
                }
                Ok(_) => debug!("'{}' has no rows for '{uri}'", plugin.name()),
                Err(e @ SyncError::Cancelled(_)) => return Err(e),
                Err(e) => warn!("Skipping '{}': {e}", plugin.name()),
            }
        }
        Ok(None)
    }

    /// First reference signal offered by a capable plugin.
    pub async fn reference(
        &self,
        descriptor: &ResourceDescriptor,
        identity: Option<&str>,
    ) -> Option<Reference> {
        let uri = descriptor.uri.as_str();
        for plugin in self.candidates(uri) {
            if self.cancel.is_cancelled() {
                return None;
            }
            let lookup = AssertUnwindSafe(plugin.reference(uri, identity)).catch_unwind();
            match tokio::time::timeout(self.fetch_timeout, lookup).await {
                Ok(Ok(Ok(Some(reference)))) => {
                    debug!("Reference for '{uri}' from '{}': {reference:?}", plugin.name());
                    return Some(reference);
                }
                Ok(Ok(Ok(None))) => {}
                Ok(Ok(Err(e))) => warn!("Reference lookup for '{uri}' on '{}' failed: {e:#}", plugin.name()),
                Ok(Err(payload)) => warn!(
                    "Reference lookup for '{uri}' on '{}' panicked: {}",
                    plugin.name(),
                    panic_message(&*payload)
                ),
                Err(_) => warn!("Reference lookup for '{uri}' on '{}' timed out", plugin.name()),
            }
        }
        None
    }
}
