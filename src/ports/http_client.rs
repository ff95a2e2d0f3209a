use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, StatusCode};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to the upstream fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0} ms")]
    Timeout(u64),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Error when the upstream returns an error status code
    #[error("Upstream returned error status: {status}, url: {url}")]
    BackendError {
        /// The URL that was requested
        url: String,
        /// The status code returned by the upstream
        status: StatusCode,
    },
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for forwarding requests to upstreams
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to an upstream, giving up after `timeout`
    ///
    /// # Returns
    /// A future that resolves to the upstream's response or an error
    async fn send_request(
        &self,
        req: Request<AxumBody>,
        timeout: Duration,
    ) -> HttpClientResult<Response<AxumBody>>;
}
