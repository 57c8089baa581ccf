//! Error taxonomy for the proxy pipeline
//! Every variant is scoped to the request that produced it

use hyper::StatusCode;
use std::error::Error as StdError;
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("No proxy rule matched")]
    RouteNotFound,

    #[error("invalid target URL '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("failed to read request body: {0}")]
    RequestBody(String),

    #[error("{0}")]
    Upstream(String),

    #[error("upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    #[error("failed to rewrite response body: {0}")]
    RewriteIo(#[from] std::io::Error),
}

impl ProxyError {
    /// Build an upstream error whose detail carries the full source chain
    pub fn upstream(context: impl Display, err: &dyn StdError) -> Self {
        ProxyError::Upstream(format!("{}: {}", context, error_chain(err)))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyError::InvalidTarget { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::RequestBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::RewriteIo(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Plain-text body sent back to the client
    pub fn to_response_message(&self) -> String {
        match self {
            ProxyError::RouteNotFound => "No proxy rule matched".to_string(),
            ProxyError::InvalidTarget { .. } => "Invalid target URL".to_string(),
            ProxyError::RequestBody(_) => "Bad Request".to_string(),
            ProxyError::UpstreamTimeout(_) => "Gateway Timeout".to_string(),
            ProxyError::Upstream(_) | ProxyError::RewriteIo(_) => format!("Proxy error: {}", self),
        }
    }
}

fn error_chain(err: &dyn StdError) -> String {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    detail
}
