use std::fmt;

use reqwest::Method;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of a transport-level failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The connection could not be established.
    Connect,
    /// The transport's own deadline elapsed.
    Timeout,
    /// Sending or receiving the body failed.
    Body,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Body => "body",
            Self::Other => "other",
        };
        f.write_str(text)
    }
}

/// Failure reported by a [`Transport`](crate::Transport) when no response was obtained.
#[derive(Debug, thiserror::Error)]
#[error("{kind} failure: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }
}

/// Best-effort body captured from a response whose status was rejected.
#[derive(Clone, Debug, PartialEq)]
pub enum ErrorBody {
    /// The body parsed as JSON.
    Json(serde_json::Value),
    /// The body was not JSON but carried text.
    Text(String),
    /// The body was empty; holds the canonical status reason instead.
    StatusText(String),
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => write!(f, "{value}"),
            Self::Text(text) | Self::StatusText(text) => f.write_str(text),
        }
    }
}

/// One failing member of a fan-out.
#[derive(Debug)]
pub struct IndexedFailure {
    /// Position of the failing request in the input order.
    pub index: usize,
    pub error: CourierError,
}

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    /// Base URL, endpoint or query parameters did not form a valid URL.
    #[error("invalid request url '{url}': {message}")]
    InvalidUrl { url: String, message: String },
    /// Request body could not be serialized.
    #[error("failed to encode request body: {0}")]
    Encode(String),
    /// No response was obtained from the transport.
    #[error("network error for {method} {url}: {source}")]
    Network {
        method: Method,
        url: String,
        #[source]
        source: TransportError,
    },
    /// The configured deadline elapsed before the response was complete.
    #[error("request timed out after {timeout_ms}ms for {method} {url}")]
    Timeout {
        method: Method,
        url: String,
        timeout_ms: u64,
    },
    /// The request's cancel token fired.
    #[error("request cancelled: {reason}")]
    Cancelled { reason: String },
    /// Response status was rejected by the status validator.
    #[error("http error {status}: {body}")]
    Http { status: u16, body: ErrorBody },
    /// Response body could not be converted to the requested response type.
    #[error("decode error: {message}")]
    Decode {
        message: String,
        /// Raw response text the decoder was given.
        raw: String,
    },
    /// The active transport cannot produce the requested response type.
    #[error("unsupported capability: {0}")]
    Unsupported(String),
    /// Raised by a user-supplied interceptor.
    #[error("interceptor error: {0}")]
    Interceptor(String),
    /// More than one member of a fan-out failed.
    #[error("{} requests failed: {}", .failures.len(), summarize_failures(.failures))]
    Aggregate { failures: Vec<IndexedFailure> },
}

impl CourierError {
    /// Returns the HTTP status for [`CourierError::Http`].
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub(crate) fn from_transport(
        err: TransportError,
        method: &Method,
        url: &str,
        timeout_ms: Option<u64>,
    ) -> Self {
        match err.kind() {
            TransportErrorKind::Timeout => Self::Timeout {
                method: method.clone(),
                url: url.to_owned(),
                timeout_ms: timeout_ms.unwrap_or_default(),
            },
            _ => Self::Network {
                method: method.clone(),
                url: url.to_owned(),
                source: err,
            },
        }
    }
}

fn summarize_failures(failures: &[IndexedFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("[{}] {}", failure.index, failure.error))
        .collect::<Vec<_>>()
        .join("; ")
}
