use std::{sync::Arc, time::Duration};

use http::{Extensions, HeaderMap};
use tokio_util::sync::CancellationToken;

use crate::core::{
    cache::CacheSnapshot,
    request::{HttpRequestView, RequestView},
};

/// Where the request will be forwarded, as decided by a routing plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    /// Scheme and authority, e.g. `http://10.0.0.5:8080`
    pub base_url: String,
    pub timeout: Duration,
    pub retries: u32,
    pub selector_id: String,
    pub rule_id: String,
}

/// Replacement for the request path when forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenPath(pub String);

/// Per-request state handed from plugin to plugin.
///
/// The snapshot is taken once when the request arrives, so every plugin of one
/// request sees the same configuration version.
pub struct Exchange {
    request: HttpRequestView,
    snapshot: Arc<CacheSnapshot>,
    request_id: String,
    cancel: CancellationToken,
    extensions: Extensions,
    forward_headers: HeaderMap,
    response_headers: HeaderMap,
    current_plugin: Option<String>,
}

impl Exchange {
    pub fn new(
        request: HttpRequestView,
        snapshot: Arc<CacheSnapshot>,
        request_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request,
            snapshot,
            request_id: request_id.into(),
            cancel,
            extensions: Extensions::new(),
            forward_headers: HeaderMap::new(),
            response_headers: HeaderMap::new(),
            current_plugin: None,
        }
    }

    pub fn request(&self) -> &HttpRequestView {
        &self.request
    }

    /// The request as seen by condition matching.
    pub fn view(&self) -> &dyn RequestView {
        &self.request
    }

    pub fn snapshot(&self) -> &CacheSnapshot {
        &self.snapshot
    }

    pub fn snapshot_arc(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.extensions.insert(value)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    /// Headers added to the upstream request on forwarding.
    pub fn forward_headers(&self) -> &HeaderMap {
        &self.forward_headers
    }

    pub fn forward_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.forward_headers
    }

    /// Headers stamped on whatever response the chain produces, errors included.
    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.response_headers
    }

    pub(crate) fn enter_plugin(&mut self, name: &str) {
        self.current_plugin = Some(name.to_string());
    }

    /// The plugin most recently handed control.
    pub fn current_plugin(&self) -> Option<&str> {
        self.current_plugin.as_deref()
    }
}
