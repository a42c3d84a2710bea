//! Database handle: the entry point for queries, jobs and transactions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use aqueduct_core::{
    AqlQuery, ClusterEndpoints, Config, CursorBatch, Error, QueryOptions, QueryRequest, Result, ResultEnvelope,
    ServerVersion, TransactionCollections, TransactionOptions, TransactionStatus,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::connection::ConnectionManager;
use crate::cursor::Cursor;
use crate::hosts::normalize_url;
use crate::job::{Job, TrappedRequest};
use crate::request::{Request, Response};
use crate::transaction::Transaction;

/// Interval between polls in [`Database::wait_for_propagation`].
const PROPAGATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bytes escaped in the `/_db/{name}` path segment.
const DATABASE_NAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// A named database reached through a shared connection.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Database {
    connection: Arc<ConnectionManager>,
    name: String,
    transaction_id: Option<String>,
}

impl Database {
    /// Connect using `config`, addressing `config.database_name`.
    pub fn new(config: &Config) -> Result<Self> {
        let connection = Arc::new(ConnectionManager::new(config)?);
        Ok(Self::with_connection(connection, config.database_name.clone()))
    }

    pub fn with_connection(connection: Arc<ConnectionManager>, name: impl Into<String>) -> Self {
        Self {
            connection,
            name: name.into(),
            transaction_id: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Another database on the same connection.
    pub fn database(&self, name: impl Into<String>) -> Database {
        Self::with_connection(self.connection.clone(), name)
    }

    /// Stream transaction every request of this handle belongs to.
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// A handle whose requests all run inside stream transaction `id`.
    pub fn in_transaction(&self, id: impl Into<String>) -> Database {
        Self {
            connection: self.connection.clone(),
            name: self.name.clone(),
            transaction_id: Some(id.into()),
        }
    }

    /// Request against `path` relative to this database.
    pub fn request(&self, method: Method, path: &str) -> Request {
        let name = utf8_percent_encode(&self.name, DATABASE_NAME);
        let request = Request::new(method, format!("/_db/{}{}", name, path));
        match &self.transaction_id {
            Some(id) => request.in_transaction(id.clone()),
            None => request,
        }
    }

    pub async fn execute(&self, request: &Request) -> Result<Response> {
        self.connection.execute(request).await
    }

    /// Run `query` and open a cursor over its results.
    pub async fn query<T: DeserializeOwned>(&self, query: &AqlQuery, options: QueryOptions) -> Result<Cursor<T>> {
        let body = QueryRequest::new(query, &options);
        let mut request = self
            .request(Method::POST, "/_api/cursor")
            .json(&body)?
            .with_dirty_read(options.allow_dirty_read);
        if let Some(timeout) = options.timeout {
            request = request.with_timeout(timeout);
        }

        let response = self.execute(&request).await?;
        let batch: CursorBatch<T> = response.json()?;
        debug!(
            cursor_id = ?batch.id,
            size = batch.result.len(),
            has_more = batch.has_more,
            "Opened cursor"
        );

        let transaction_id = self
            .transaction_id
            .clone()
            .or_else(|| self.connection.transaction_id());
        Ok(Cursor::new(
            self.clone(),
            batch,
            response.host,
            options.allow_dirty_read,
            transaction_id,
        ))
    }

    pub async fn version(&self) -> Result<ServerVersion> {
        self.execute(&self.request(Method::GET, "/_api/version"))
            .await?
            .json()
    }

    /// Ask the cluster for its coordinators and update the known hosts.
    ///
    /// With `overwrite` the reported list replaces the current one; otherwise
    /// new endpoints are appended. Returns the reported hosts.
    pub async fn acquire_host_list(&self, overwrite: bool) -> Result<Vec<String>> {
        let endpoints: ClusterEndpoints = self
            .execute(&self.request(Method::GET, "/_api/cluster/endpoints"))
            .await?
            .json()?;

        let urls = endpoints
            .endpoints
            .iter()
            .map(|e| normalize_url(&e.endpoint))
            .collect::<Result<Vec<_>>>()?;
        if urls.is_empty() {
            return Err(Error::InvalidResponse("cluster reported no endpoints".to_string()));
        }

        if overwrite {
            self.connection.replace_hosts(&urls)?;
        } else {
            self.connection.add_hosts(&urls)?;
        }
        info!("Acquired {} endpoint(s) from the cluster", urls.len());
        Ok(urls)
    }

    /// Wait until `request` succeeds on every known host.
    pub async fn wait_for_propagation(&self, request: &Request, timeout: Duration) -> Result<()> {
        self.connection
            .wait_for_propagation(request, timeout, PROPAGATION_POLL_INTERVAL)
            .await
    }

    /// Run `f` as an async job.
    ///
    /// The first request `f` issues is stored by the server instead of being
    /// answered; the returned [`Job`] delivers its result once loaded.
    pub async fn create_job<T, F, Fut>(&self, f: F) -> Result<Job<T>>
    where
        F: FnOnce(Database) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut trap = self.connection.arm_job_trap()?;
        let mut handle = tokio::spawn(f(self.clone()));

        tokio::select! {
            biased;
            trapped = &mut trap => match trapped {
                Ok(TrappedRequest::Deferred { job_id, completion }) => {
                    info!(job_id = %job_id, "Created async job");
                    Ok(Job::new(self.clone(), job_id, completion, handle))
                }
                Ok(TrappedRequest::Failed(err)) => {
                    handle.abort();
                    Err(err)
                }
                Err(_) => {
                    handle.abort();
                    Err(Error::Job("job trap was dropped".to_string()))
                }
            },
            joined = &mut handle => {
                self.connection.disarm_job_trap();
                match joined {
                    Ok(_) => Err(Error::Job("job callback finished without issuing a request".to_string())),
                    Err(e) => Err(Error::Job(format!("job callback failed: {}", e))),
                }
            }
        }
    }

    /// Begin a stream transaction over `collections`.
    pub async fn begin_transaction(
        &self,
        collections: TransactionCollections,
        options: TransactionOptions,
    ) -> Result<Transaction> {
        let mut body = serde_json::to_value(&options)?;
        body["collections"] = serde_json::to_value(&collections)?;

        let status: ResultEnvelope<TransactionStatus> = self
            .execute(&self.request(Method::POST, "/_api/transaction/begin").json(&body)?)
            .await?
            .json()?;
        info!(transaction_id = %status.result.id, "Began stream transaction");
        Ok(Transaction::new(self.database(self.name.clone()), status.result.id))
    }

    /// Handle for an existing stream transaction.
    pub fn transaction(&self, id: impl Into<String>) -> Transaction {
        Transaction::new(self.database(self.name.clone()), id.into())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("transaction_id", &self.transaction_id)
            .field("connection", &self.connection)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{body_json, config, header, json, path_of, MockTransport};
    use aqueduct_core::{aql, collection, LoadBalancingStrategy};
    use serde_json::json;

    fn database(transport: Arc<MockTransport>, urls: &[&str]) -> Database {
        let conn = ConnectionManager::with_transport(&config(urls), transport).unwrap();
        Database::with_connection(Arc::new(conn), "shop")
    }

    #[tokio::test]
    async fn test_query_body() {
        let transport = MockTransport::new(|_| json(201, json!({"result": [1], "hasMore": false})));
        let db = database(transport.clone(), &["http://a:8529"]);

        let query = aql(
            &["FOR x IN ", " FILTER x > ", " LIMIT 5"],
            [aqueduct_core::AqlValue::from(collection("docs")), 1.into()],
        )
        .unwrap();
        let mut cursor: Cursor<i64> = db
            .query(&query, QueryOptions::default().with_batch_size(10).with_full_count(true))
            .await
            .unwrap();
        assert_eq!(cursor.all().await.unwrap(), vec![1]);

        let sent = &transport.requests()[0];
        assert_eq!(path_of(sent), "/_db/shop/_api/cursor");
        assert_eq!(
            body_json(sent),
            json!({
                "query": "FOR x IN @@value0 FILTER x > @value1 LIMIT 5",
                "bindVars": {"@value0": "docs", "value1": 1},
                "batchSize": 10,
                "count": false,
                "options": {"fullCount": true}
            })
        );
    }

    #[tokio::test]
    async fn test_version() {
        let transport = MockTransport::new(|_| {
            json(200, json!({"server": "arango", "version": "3.12.0", "license": "community"}))
        });
        let db = database(transport.clone(), &["http://a:8529"]);

        let version = db.version().await.unwrap();
        assert_eq!(version.version, "3.12.0");
        assert_eq!(path_of(&transport.requests()[0]), "/_db/shop/_api/version");
    }

    #[tokio::test]
    async fn test_acquire_host_list() {
        let transport = MockTransport::new(|_| {
            json(
                200,
                json!({"error": false, "endpoints": [
                    {"endpoint": "tcp://10.0.0.1:8529"},
                    {"endpoint": "ssl://10.0.0.2:8530"}
                ]}),
            )
        });
        let db = database(transport.clone(), &["http://10.0.0.1:8529"]);

        let added = db.acquire_host_list(false).await.unwrap();
        assert_eq!(added, vec!["http://10.0.0.1:8529", "https://10.0.0.2:8530"]);
        assert_eq!(db.connection().hosts().len(), 2);

        let conn = ConnectionManager::with_transport(
            &config(&["http://seed:8529"]).with_load_balancing(LoadBalancingStrategy::RoundRobin),
            transport,
        )
        .unwrap();
        let db = Database::with_connection(Arc::new(conn), "_system");
        db.acquire_host_list(true).await.unwrap();
        assert_eq!(
            db.connection().hosts().hosts().to_vec(),
            vec!["http://10.0.0.1:8529".to_string(), "https://10.0.0.2:8530".to_string()]
        );
    }

    #[tokio::test]
    async fn test_wait_for_propagation_on_all_hosts() {
        let transport = MockTransport::new(|_| json(200, json!({})));
        let db = database(transport.clone(), &["http://a:8529", "http://b:8529"]);

        let request = db.request(Method::GET, "/_api/collection/c");
        db.wait_for_propagation(&request, Duration::from_secs(1)).await.unwrap();

        assert_eq!(transport.count(Method::GET, "/_db/shop/_api/collection/c"), 2);
    }

    #[tokio::test]
    async fn test_begin_transaction() {
        let transport = MockTransport::new(|req| {
            if path_of(req) == "/_db/shop/_api/transaction/begin" {
                json(201, json!({"error": false, "code": 201, "result": {"id": "1234", "status": "running"}}))
            } else {
                json(200, json!({"result": [], "hasMore": false}))
            }
        });
        let db = database(transport.clone(), &["http://a:8529"]);

        let trx = db
            .begin_transaction(
                TransactionCollections {
                    write: vec!["orders".to_string()],
                    ..Default::default()
                },
                TransactionOptions {
                    wait_for_sync: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(trx.id(), "1234");

        let sent = transport.requests();
        assert_eq!(
            body_json(&sent[0]),
            json!({"collections": {"write": ["orders"]}, "waitForSync": true})
        );
        assert_eq!(header(&sent[0], "x-arango-trx-id"), None);

        let bound = db.in_transaction("1234");
        let query = aql(&["RETURN 1"], Vec::<aqueduct_core::AqlValue>::new()).unwrap();
        let _cursor: Cursor<i64> = bound.query(&query, QueryOptions::default()).await.unwrap();
        assert_eq!(header(&transport.requests()[1], "x-arango-trx-id"), Some("1234"));
    }

    #[tokio::test]
    async fn test_dropped_job_trap_stops_callback() {
        let transport = MockTransport::new(|_| json(200, json!({})));
        let db = database(transport.clone(), &["http://a:8529"]);
        let marker = Arc::new(());

        let held = marker.clone();
        let result = db
            .create_job(|db| async move {
                let _held = held;
                db.connection().disarm_job_trap();
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, Error>(())
            })
            .await;

        assert!(matches!(result, Err(Error::Job(_))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(Arc::strong_count(&marker), 1);
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_extended_database_names_are_escaped() {
        let transport = MockTransport::new(|_| json(200, json!({})));
        let db = database(transport, &["http://a:8529"]).database("Gäste Büro");

        assert_eq!(
            db.request(Method::GET, "/_api/version").path,
            "/_db/G%C3%A4ste%20B%C3%BCro/_api/version"
        );
        assert_eq!(
            db.database("orders-2024_v1.x").request(Method::GET, "/x").path,
            "/_db/orders-2024_v1.x/x"
        );
    }

    #[test]
    fn test_database_switch_keeps_connection() {
        let transport = MockTransport::new(|_| json(200, json!({})));
        let db = database(transport, &["http://a:8529"]);
        let other = db.database("_system");

        assert_eq!(other.name(), "_system");
        assert!(Arc::ptr_eq(db.connection(), other.connection()));
        assert_eq!(db.request(Method::GET, "/_api/version").path, "/_db/shop/_api/version");
        assert_eq!(
            db.in_transaction("9").request(Method::GET, "/x").transaction_id.as_deref(),
            Some("9")
        );
    }
}
