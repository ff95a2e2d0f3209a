//! Error types for the request path and the configuration plane.
use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::{core::handle::HandleError, ports::http_client::HttpClientError};

/// Nginx's non-standard "client closed request".
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// Errors surfaced while a request travels through the plugin chain.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// A selector claimed the request but none of its rules matched.
    #[error("no matching rule for plugin '{plugin}' in selector '{selector}'")]
    NoMatch { plugin: String, selector: String },

    /// A plugin's handle did not decode to the type it expects.
    #[error("plugin '{plugin}' has an unusable handle: {source}")]
    HandleType {
        plugin: String,
        #[source]
        source: HandleError,
    },

    /// A plugin failed or panicked.
    #[error("plugin '{plugin}' failed: {message}")]
    ChainExecution { plugin: String, message: String },

    #[error("request cancelled")]
    Cancelled,

    /// The chain ran off its end without any plugin producing a response.
    #[error("no plugin handled the request")]
    Unhandled,

    /// A plugin decided to stop the request with an explicit status.
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },

    /// No upstream was eligible for selection.
    #[error("no available upstream for selector '{selector}'")]
    NoUpstream { selector: String },

    #[error("upstream error: {0}")]
    Upstream(#[from] HttpClientError),
}

impl GatewayError {
    pub fn rejected(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoMatch { .. } | Self::Unhandled => StatusCode::NOT_FOUND,
            Self::HandleType { .. } | Self::ChainExecution { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Cancelled => StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST)
                .unwrap_or(StatusCode::BAD_REQUEST),
            Self::Rejected { status, .. } => *status,
            Self::NoUpstream { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(HttpClientError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoMatch { .. } => "no_match",
            Self::HandleType { .. } => "handle_type",
            Self::ChainExecution { .. } => "chain_execution",
            Self::Cancelled => "cancelled",
            Self::Unhandled => "unhandled",
            Self::Rejected { .. } => "rejected",
            Self::NoUpstream { .. } => "no_upstream",
            Self::Upstream(_) => "upstream",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal details stay in the logs
        let message = match &self {
            Self::HandleType { .. } | Self::ChainExecution { .. } => {
                "internal gateway error".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            code: status.as_u16(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// Errors raised while keeping the cache in sync with the store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error("failed to decode {kind} at '{path}': {source}")]
    Decode {
        kind: &'static str,
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unrecognised store path '{0}'")]
    Path(String),

    #[error("invalid {kind} '{id}': {reason}")]
    Validation {
        kind: &'static str,
        id: String,
        reason: String,
    },

    #[error("configuration store error: {0}")]
    Store(String),

    #[error("synchronizer is not running")]
    Stopped,
}
