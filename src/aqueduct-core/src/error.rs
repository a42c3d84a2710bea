//! Error taxonomy shared by the query builder and the client.
//!
//! Every failure a caller can observe is one of the [`Error`] variants, so
//! collaborators can ask "is this retryable" or "is this a not-found" without
//! knowing which transport produced it.

use std::time::Duration;

use thiserror::Error;

/// Server error number reported while a deployment is in maintenance mode.
pub const ERROR_ARANGO_MAINTENANCE_MODE: u32 = 503;

/// Server error number for write-write conflicts.
pub const ERROR_ARANGO_CONFLICT: u32 = 1200;

/// Server error number for unknown documents.
pub const ERROR_ARANGO_DOCUMENT_NOT_FOUND: u32 = 1202;

/// Server error number for unknown or expired cursors.
pub const ERROR_CURSOR_NOT_FOUND: u32 = 1600;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

/// Client errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Application(#[from] ApplicationError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error(transparent)]
    PropagationTimeout(#[from] PropagationTimeoutError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transaction {active} is already pinned to this connection")]
    TransactionInProgress { active: String },

    #[error("Async job error: {0}")]
    Job(String),
}

impl Error {
    /// Whether repeating the request elsewhere is known to be safe.
    ///
    /// `None` means the request may or may not have been processed.
    pub fn safe_to_retry(&self) -> Option<bool> {
        match self {
            Error::Application(e) => e.safe_to_retry(),
            Error::Http(e) => e.safe_to_retry(),
            Error::Network(e) => e.safe_to_retry(),
            Error::Builder(_) | Error::Config(_) | Error::TransactionInProgress { .. } => {
                Some(false)
            }
            _ => None,
        }
    }

    /// HTTP status code, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Application(e) => Some(e.code),
            Error::Http(e) => Some(e.code),
            _ => None,
        }
    }

    /// Server error number, for application errors.
    pub fn error_num(&self) -> Option<u32> {
        match self {
            Error::Application(e) => Some(e.error_num),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Application(e) => e.is_not_found(),
            Error::Http(e) => e.code == 404,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.error_num() == Some(ERROR_ARANGO_CONFLICT)
    }
}

/// The server understood the request and rejected it with a structured body.
#[derive(Debug, Clone, Error)]
#[error("{message} (HTTP {code}, errorNum {error_num})")]
pub struct ApplicationError {
    pub code: u16,
    pub error_num: u32,
    pub message: String,
}

impl ApplicationError {
    pub fn safe_to_retry(&self) -> Option<bool> {
        if self.error_num == ERROR_ARANGO_MAINTENANCE_MODE {
            Some(true)
        } else {
            None
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code == 404
            || self.error_num == ERROR_ARANGO_DOCUMENT_NOT_FOUND
            || self.error_num == ERROR_CURSOR_NOT_FOUND
    }
}

/// A non-2xx answer without a structured error body.
#[derive(Debug, Clone, Error)]
#[error("HTTP {code}")]
pub struct HttpError {
    pub code: u16,
    pub body: Option<String>,
}

impl HttpError {
    pub fn safe_to_retry(&self) -> Option<bool> {
        None
    }
}

/// Network-level failure causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionRefused,
    ConnectTimeout,
    ResponseTimeout,
    RequestAborted,
    FetchFailed,
}

impl NetworkErrorKind {
    fn default_safe_to_retry(self) -> Option<bool> {
        match self {
            NetworkErrorKind::ConnectionRefused | NetworkErrorKind::ConnectTimeout => Some(true),
            NetworkErrorKind::ResponseTimeout | NetworkErrorKind::RequestAborted => Some(false),
            NetworkErrorKind::FetchFailed => None,
        }
    }
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            NetworkErrorKind::ConnectionRefused => "connection refused",
            NetworkErrorKind::ConnectTimeout => "connect timed out",
            NetworkErrorKind::ResponseTimeout => "response timed out",
            NetworkErrorKind::RequestAborted => "request aborted",
            NetworkErrorKind::FetchFailed => "request failed",
        };
        f.write_str(label)
    }
}

/// The request never produced an HTTP response.
#[derive(Debug, Error)]
#[error("{kind} ({url})")]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub url: String,
    safe_to_retry: Option<bool>,
    #[source]
    source: Option<BoxError>,
}

impl NetworkError {
    pub fn new(kind: NetworkErrorKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            safe_to_retry: kind.default_safe_to_retry(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Tri-state retry hint: only `Some(true)` triggers failover.
    pub fn safe_to_retry(&self) -> Option<bool> {
        self.safe_to_retry
    }
}

/// Defects in query construction. Always fatal, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuilderError {
    #[error("bind variable `{name}` is bound to two different values")]
    BindVarConflict { name: String },

    #[error("bind parameter `{name}` is used in the query but never bound")]
    UnboundParameter { name: String },

    #[error("bind variable `{name}` is bound but never used in the query")]
    UnusedBindVar { name: String },

    #[error("collection bind variable `{name}` must be a string")]
    InvalidCollectionName { name: String },

    #[error("template has {segments} segments for {values} values")]
    TemplateArity { segments: usize, values: usize },
}

/// A bounded wait for every host to observe a change expired.
#[derive(Debug, Error)]
#[error("propagation to {} host(s) timed out after {elapsed:?}", pending.len())]
pub struct PropagationTimeoutError {
    pub elapsed: Duration,
    pub pending: Vec<String>,
    #[source]
    pub cause: Option<Box<Error>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_retry_hints() {
        let refused = NetworkError::new(NetworkErrorKind::ConnectionRefused, "http://a");
        let connect = NetworkError::new(NetworkErrorKind::ConnectTimeout, "http://a");
        let response = NetworkError::new(NetworkErrorKind::ResponseTimeout, "http://a");
        let fetch = NetworkError::new(NetworkErrorKind::FetchFailed, "http://a");

        assert_eq!(refused.safe_to_retry(), Some(true));
        assert_eq!(connect.safe_to_retry(), Some(true));
        assert_eq!(response.safe_to_retry(), Some(false));
        assert_eq!(fetch.safe_to_retry(), None);
    }

    #[test]
    fn test_maintenance_mode_is_retryable() {
        let err = ApplicationError {
            code: 503,
            error_num: ERROR_ARANGO_MAINTENANCE_MODE,
            message: "maintenance".to_string(),
        };
        assert_eq!(err.safe_to_retry(), Some(true));

        let conflict = Error::from(ApplicationError {
            code: 409,
            error_num: ERROR_ARANGO_CONFLICT,
            message: "conflict".to_string(),
        });
        assert_eq!(conflict.safe_to_retry(), None);
        assert!(conflict.is_conflict());
        assert_eq!(conflict.status(), Some(409));
    }

    #[test]
    fn test_not_found_detection() {
        let cursor = Error::from(ApplicationError {
            code: 404,
            error_num: ERROR_CURSOR_NOT_FOUND,
            message: "cursor not found".to_string(),
        });
        assert!(cursor.is_not_found());

        let http = Error::from(HttpError {
            code: 404,
            body: None,
        });
        assert!(http.is_not_found());
        assert_eq!(http.error_num(), None);
    }

    #[test]
    fn test_network_error_keeps_source() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = NetworkError::new(NetworkErrorKind::ConnectionRefused, "http://a").with_source(io);
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "connection refused (http://a)");
    }
}
