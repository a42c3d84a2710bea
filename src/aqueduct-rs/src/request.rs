//! Request descriptors and responses exchanged with the connection layer.

use std::collections::HashMap;
use std::time::Duration;

use aqueduct_core::{Error, Result};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub(crate) const HEADER_TRANSACTION_ID: &str = "x-arango-trx-id";
pub(crate) const HEADER_ASYNC: &str = "x-arango-async";
pub(crate) const HEADER_ASYNC_ID: &str = "x-arango-async-id";
pub(crate) const HEADER_DIRTY_READ: &str = "x-arango-allow-dirty-read";
pub(crate) const HEADER_QUEUE_TIME: &str = "x-arango-queue-time-seconds";

/// Request payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Text(String),
    Bytes { data: Vec<u8>, content_type: String },
}

/// A fully resolved request, independent of the host it will be sent to.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub allow_dirty_read: bool,
    /// Conflict retry budget for collaborators; the connection layer never acts on it
    pub retry_on_conflict: Option<u32>,
    pub timeout: Option<Duration>,
    /// Send to this host only, without failover
    pub host_hint: Option<String>,
    /// Stream transaction this request belongs to; overrides a pinned id
    pub transaction_id: Option<String>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            allow_dirty_read: false,
            retry_on_conflict: None,
            timeout: None,
            host_hint: None,
            transaction_id: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Serialize `body` as the JSON payload.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = RequestBody::Text(body.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_dirty_read(mut self, allow: bool) -> Self {
        self.allow_dirty_read = allow;
        self
    }

    pub fn with_retry_on_conflict(mut self, retries: u32) -> Self {
        self.retry_on_conflict = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_host(mut self, host: impl Into<String>) -> Self {
        self.host_hint = Some(host.into());
        self
    }

    pub fn in_transaction(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }
}

/// A successful server answer.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Base URL of the host that answered
    pub host: String,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.body.is_empty() {
            return Err(Error::InvalidResponse(format!(
                "empty body with status {}",
                self.status
            )));
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Queue time reported by the server, in seconds.
    pub fn queue_time(&self) -> Option<f64> {
        self.header(HEADER_QUEUE_TIME)
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|seconds| seconds.is_finite())
    }

    /// Job id assigned to a deferred request.
    pub fn async_job_id(&self) -> Option<&str> {
        self.header(HEADER_ASYNC_ID)
    }
}
