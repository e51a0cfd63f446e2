use serde_json::Value;
use thiserror::Error;

/// Errors observed by callers of the cache engine.
///
/// Request-level failures are stored in the entry's `error` field and handed
/// to every promise joined onto the request, so the type is `Clone`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    #[error("failed to serialize query arguments: {message}")]
    Serialization { message: String },
    #[error("request aborted")]
    Aborted,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("cache entry was removed before a value was ever fulfilled")]
    NeverResolved,
    #[error("unknown endpoint `{name}`")]
    UnknownEndpoint { name: String },
    #[error("endpoint `{name}` is a {actual}, not a {expected}")]
    EndpointKind {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl QueryError {
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn unknown_endpoint(name: impl Into<String>) -> Self {
        Self::UnknownEndpoint { name: name.into() }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Failure reported by an endpoint's fetch function.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("fetch failed: {message}")]
pub struct FetchError {
    /// Transport status, when the underlying call produced one.
    pub status: Option<u16>,
    /// Error body, when the underlying call produced one.
    pub data: Option<Value>,
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            data: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Error type returned by lifecycle hook callbacks.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;
