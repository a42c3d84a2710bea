use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::aql::AqlQuery;

/// One page of a query result set.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorBatch<T> {
    #[serde(default = "Vec::new")]
    pub result: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub extra: CursorExtra,
    #[serde(default)]
    pub cached: bool,
}

/// Statistics, warnings and profile data attached to a result set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CursorExtra {
    #[serde(default)]
    pub stats: Map<String, Value>,
    #[serde(default)]
    pub warnings: Vec<QueryWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Value>,
}

impl CursorExtra {
    /// `fullCount` statistic, when requested.
    pub fn full_count(&self) -> Option<u64> {
        self.stats.get("fullCount").and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QueryWarning {
    pub code: u32,
    pub message: String,
}

/// Client-side options for opening a query cursor.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub batch_size: Option<u32>,
    pub count: bool,
    /// Server-side cursor lifetime in seconds
    pub ttl: Option<u32>,
    pub cache: Option<bool>,
    pub memory_limit: Option<u64>,
    pub full_count: bool,
    pub stream: bool,
    pub fail_on_warning: Option<bool>,
    pub max_runtime: Option<f64>,
    pub profile: Option<u8>,
    /// Allow reads from followers; applies to every batch of the cursor
    pub allow_dirty_read: bool,
    pub timeout: Option<std::time::Duration>,
}

impl QueryOptions {
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_count(mut self, count: bool) -> Self {
        self.count = count;
        self
    }

    pub fn with_ttl(mut self, seconds: u32) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn with_full_count(mut self, full_count: bool) -> Self {
        self.full_count = full_count;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_dirty_read(mut self, allow: bool) -> Self {
        self.allow_dirty_read = allow;
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Body of `POST /_api/cursor`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest<'a> {
    pub query: &'a str,
    pub bind_vars: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    pub count: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
    pub options: QueryRequestOptions,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequestOptions {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub full_count: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_on_warning: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_runtime: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<u8>,
}

impl<'a> QueryRequest<'a> {
    pub fn new(query: &'a AqlQuery, options: &QueryOptions) -> Self {
        Self {
            query: query.query(),
            bind_vars: query.bind_vars(),
            batch_size: options.batch_size,
            count: options.count,
            ttl: options.ttl,
            cache: options.cache,
            memory_limit: options.memory_limit,
            options: QueryRequestOptions {
                full_count: options.full_count,
                stream: options.stream,
                fail_on_warning: options.fail_on_warning,
                max_runtime: options.max_runtime,
                profile: options.profile,
            },
        }
    }
}

/// Structured error body returned by the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerErrorBody {
    pub error: bool,
    #[serde(default)]
    pub code: Option<u16>,
    pub error_num: u32,
    #[serde(default)]
    pub error_message: String,
}

/// Server-reported time a request waited before being processed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueTimeSample {
    pub at: DateTime<Utc>,
    pub seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerVersion {
    pub server: String,
    pub version: String,
    #[serde(default)]
    pub license: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterEndpoints {
    pub endpoints: Vec<ClusterEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterEndpoint {
    pub endpoint: String,
}

/// Collections a stream transaction locks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionCollections {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub write: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclusive: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_implicit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_transaction_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_sync: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Running,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransactionStatus {
    pub id: String,
    pub status: TransactionState,
}

/// `{"result": ...}` envelope used by several endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultEnvelope<T> {
    pub result: T,
}
