use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use http::{HeaderMap, HeaderName, HeaderValue, Request, header};

use crate::{
    core::{model::PluginRole, request::RequestView},
    error::GatewayError,
    plugin::{Exchange, Next, Plugin, PluginResult, RewrittenPath, UpstreamTarget},
    ports::http_client::{HttpClient, HttpClientError},
};

const NAME: &str = "forward";

/// Headers that describe one connection and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Sends the request to the upstream chosen earlier in the chain. Terminal:
/// never calls its continuation.
pub struct ForwardPlugin {
    client: Arc<dyn HttpClient>,
}

impl ForwardPlugin {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }

    fn build_request(exchange: &Exchange, target: &UpstreamTarget) -> Result<Request<Body>, GatewayError> {
        let request = exchange.request();
        let path = exchange
            .get::<RewrittenPath>()
            .map(|rewritten| rewritten.0.as_str())
            .unwrap_or_else(|| request.path());
        let uri = match request.query_string() {
            Some(query) if !query.is_empty() => format!("{}{path}?{query}", target.base_url),
            _ => format!("{}{path}", target.base_url),
        };

        let mut headers = HeaderMap::with_capacity(request.headers().len() + 2);
        for (name, value) in request.headers() {
            if name == header::HOST || HOP_BY_HOP.contains(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        for (name, value) in exchange.forward_headers() {
            headers.insert(name.clone(), value.clone());
        }
        if let Some(ip) = request.client_addr().map(|addr| addr.ip()) {
            let forwarded = match request.header("x-forwarded-for") {
                Some(existing) => format!("{existing}, {ip}"),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert("x-forwarded-for", value);
            }
        }

        let mut outgoing = Request::builder()
            .method(request.method().clone())
            .uri(&uri)
            .body(Body::from(request.body().clone()))
            .map_err(|e| {
                GatewayError::Upstream(HttpClientError::InvalidRequest(format!(
                    "cannot build upstream request for {uri}: {e}"
                )))
            })?;
        *outgoing.headers_mut() = headers;
        Ok(outgoing)
    }
}

#[async_trait]
impl Plugin for ForwardPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn role(&self) -> PluginRole {
        PluginRole::Last
    }

    fn order(&self) -> i32 {
        100
    }

    fn skip(&self, exchange: &Exchange) -> bool {
        exchange.get::<UpstreamTarget>().is_none()
    }

    async fn execute(&self, exchange: &mut Exchange, _next: Next<'_>) -> PluginResult {
        let Some(target) = exchange.get::<UpstreamTarget>().cloned() else {
            return Err(GatewayError::Unhandled);
        };

        let mut attempt = 0;
        loop {
            let outgoing = Self::build_request(exchange, &target)?;
            match self.client.send_request(outgoing, target.timeout).await {
                Ok(response) => return Ok(response),
                Err(HttpClientError::ConnectionError(reason)) if attempt < target.retries => {
                    attempt += 1;
                    tracing::warn!(upstream = %target.base_url, attempt, %reason, "Upstream connection failed; retrying");
                }
                Err(e) => {
                    tracing::warn!(upstream = %target.base_url, error = %e, "Upstream request failed");
                    return Err(GatewayError::Upstream(e));
                }
            }
        }
    }
}
