use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("HTTP {0}")]
    Status(StatusCode),
    #[error("transfer interrupted: {0}")]
    Body(String),
    #[error("server returned {content_type} instead of media")]
    HtmlResponse { content_type: String },
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("filesystem error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("run cancelled")]
    Cancelled,
}

impl FetchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying without operator intervention can succeed.
    ///
    /// Network trouble, throttling and server errors are transient; gone or
    /// forbidden resources, malformed URLs and local disk problems are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_)
            | Self::Connect(_)
            | Self::Body(_)
            | Self::HtmlResponse { .. }
            | Self::Cancelled => true,
            Self::Status(status) => is_retryable_status(*status),
            Self::InvalidUrl(_) | Self::Io { .. } => false,
        }
    }

    /// Short machine-friendly label for summaries.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Connect(_) => "connect",
            Self::Status(_) => "http_status",
            Self::Body(_) => "body",
            Self::HtmlResponse { .. } => "html_response",
            Self::InvalidUrl(_) => "invalid_url",
            Self::Io { .. } => "io",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            Self::InvalidUrl(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status(status)
        } else if e.is_connect() || e.is_request() {
            Self::Connect(e.to_string())
        } else {
            Self::Body(e.to_string())
        }
    }
}

/// 408, 429 and 5xx are worth retrying; every other 4xx means the resource
/// is gone or off-limits.
#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
        || !status.is_client_error()
}
