use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::ConnectInfo,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use http_body_util::LengthLimitError;
use hyper::Request;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    core::{cache::ConfigCache, request::HttpRequestView},
    error::GatewayError,
    metrics,
    plugin::{Exchange, PluginChain, builtin::global::REQUEST_ID_HEADER},
    tracing_setup::create_request_span,
};

/// Entry point for inbound requests: buffers the body, pins a configuration
/// snapshot and runs the plugin chain.
pub struct HttpHandler {
    cache: Arc<ConfigCache>,
    chain: Arc<PluginChain>,
    max_body_bytes: usize,
    shutdown: CancellationToken,
}

impl HttpHandler {
    pub fn new(
        cache: Arc<ConfigCache>,
        chain: Arc<PluginChain>,
        max_body_bytes: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cache,
            chain,
            max_body_bytes,
            shutdown,
        }
    }

    /// Handle one request. Always yields a response; chain failures are
    /// rendered through [`GatewayError`]'s JSON body.
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response {
        let method = req.method().to_string();
        let _timer = metrics::RequestTimer::new(&method);
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let span = create_request_span(&method, req.uri().path(), &request_id);
        let response = self
            .dispatch(req, client_addr, request_id)
            .instrument(span.clone())
            .await;

        let status = response.status().as_u16();
        span.record("http.status_code", status);
        metrics::increment_request_total(&method, status);
        response
    }

    async fn dispatch(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
        request_id: String,
    ) -> Response {
        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, self.max_body_bytes).await {
            Ok(body) => body,
            Err(e) => {
                let inner = e.into_inner();
                return if inner.is::<LengthLimitError>() {
                    tracing::debug!(limit = self.max_body_bytes, "Request body over limit");
                    GatewayError::rejected(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
                        .into_response()
                } else {
                    tracing::debug!(error = %inner, "Failed to read request body");
                    GatewayError::rejected(StatusCode::BAD_REQUEST, "failed to read request body")
                        .into_response()
                };
            }
        };

        let view = HttpRequestView::new(parts, body, client_addr);
        // Dropping this future (client went away) cancels the chain's token
        let cancel = self.shutdown.child_token();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let mut exchange = Exchange::new(view, self.cache.snapshot(), request_id, cancel);

        let mut response = match self.chain.execute(&mut exchange).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    GatewayError::Upstream(_)
                    | GatewayError::ChainExecution { .. }
                    | GatewayError::HandleType { .. } => {
                        tracing::warn!(error = %e, kind = e.kind(), "Request failed")
                    }
                    _ => tracing::debug!(error = %e, kind = e.kind(), "Request not served"),
                }
                e.into_response()
            }
        };

        response
            .headers_mut()
            .extend(exchange.response_headers().clone());
        response
    }
}

/// Router sending every path through the handler. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(handler: Arc<HttpHandler>) -> Router {
    Router::new().fallback(
        move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request<AxumBody>| {
            let handler = Arc::clone(&handler);
            async move { handler.handle_request(req, Some(client_addr)).await }
        },
    )
}
