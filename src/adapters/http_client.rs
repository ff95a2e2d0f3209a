use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls::{ClientConfig, RootCertStore};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    metrics,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

/// Upstream client used by the `forward` plugin.
///
/// Plain HTTP and HTTPS (native roots) over HTTP/1.1. Sets `Host` and a
/// default `User-Agent`, and applies the timeout chosen by the matched rule.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

/// Trust anchors from the platform store. Unreadable entries are logged and skipped.
fn platform_roots() -> RootCertStore {
    let loaded = load_native_certs();
    if !loaded.errors.is_empty() {
        tracing::warn!(errors = ?loaded.errors, "Some platform certificates could not be read");
    }
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    tracing::debug!(added, ignored, "Loaded platform root certificates");
    roots
}

impl HttpClientAdapter {
    pub fn new() -> Result<Self> {
        // Another component may have installed a provider already
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut tcp = HttpConnector::new();
        tcp.enforce_http(false);

        let tls = ClientConfig::builder()
            .with_root_certificates(platform_roots())
            .with_no_client_auth();
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(tcp);

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }

    /// Inject `Host` from the outgoing URI and a default `User-Agent`.
    fn prepare_headers(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let Some(host) = req.uri().host() else {
            return Err(HttpClientError::InvalidRequest(format!(
                "Outgoing URI has no host: {}",
                req.uri()
            )));
        };
        let authority = match req.uri().port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let host_value = HeaderValue::from_str(&authority)
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        let headers = req.headers_mut();
        headers.insert(header::HOST, host_value);
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(
                header::USER_AGENT,
                HeaderValue::from_static(concat!("switchyard/", env!("CARGO_PKG_VERSION"))),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
        request_timeout: Duration,
    ) -> HttpClientResult<Response<AxumBody>> {
        Self::prepare_headers(&mut req)?;

        let upstream = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri()
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );
        let method = req.method().clone();
        let uri = req.uri().clone();

        let span = tracing::info_span!(
            "upstream_request",
            upstream.url = %upstream,
            http.method = %method,
            http.path = %uri.path(),
            http.status_code = tracing::field::Empty,
        );

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let outgoing = Request::from_parts(parts, body);

        let started = Instant::now();
        let client = self.client.clone();
        let result = timeout(request_timeout, client.request(outgoing))
            .instrument(span.clone())
            .await;
        metrics::record_upstream_request_duration(&upstream, started.elapsed());

        match result {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                span.record("http.status_code", status);
                metrics::increment_upstream_request_total(&upstream, method.as_str(), status);

                let (mut parts, hyper_body) = response.into_parts();
                // Axum re-frames the streamed body
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Ok(Err(e)) => {
                span.record("http.status_code", 502u16);
                metrics::increment_upstream_request_total(&upstream, method.as_str(), 502);
                tracing::warn!(parent: &span, error = %e, "Upstream request failed");
                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method} {uri} failed: {e}"
                )))
            }
            Err(_) => {
                span.record("http.status_code", 504u16);
                metrics::increment_upstream_request_total(&upstream, method.as_str(), 504);
                tracing::warn!(parent: &span, timeout = ?request_timeout, "Upstream request timed out");
                Err(HttpClientError::Timeout(request_timeout.as_millis() as u64))
            }
        }
    }
}
