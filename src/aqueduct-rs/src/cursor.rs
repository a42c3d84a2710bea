//! Batched query result sets.

use std::collections::VecDeque;

use aqueduct_core::{CursorBatch, CursorExtra, Error, Result};
use futures::Stream;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::database::Database;

/// Server-side cursor over the results of an AQL query.
///
/// Results arrive in batches; the cursor buffers one batch at a time and
/// fetches the next one from the host that answered the first request.
/// Every traversal consumes items one at a time, so a traversal that stops
/// early leaves the remaining results in the cursor.
pub struct Cursor<T> {
    db: Database,
    id: Option<String>,
    host: String,
    allow_dirty_read: bool,
    transaction_id: Option<String>,
    buffer: VecDeque<T>,
    has_more: bool,
    count: Option<u64>,
    extra: CursorExtra,
    cached: bool,
}

impl<T: DeserializeOwned> Cursor<T> {
    pub(crate) fn new(
        db: Database,
        batch: CursorBatch<T>,
        host: String,
        allow_dirty_read: bool,
        transaction_id: Option<String>,
    ) -> Self {
        Self {
            db,
            id: batch.id,
            host,
            allow_dirty_read,
            transaction_id,
            buffer: batch.result.into(),
            has_more: batch.has_more,
            count: batch.count,
            extra: batch.extra,
            cached: batch.cached,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Host every request of this cursor is sent to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Total number of results, when the query asked for it.
    pub fn count(&self) -> Option<u64> {
        self.count
    }

    pub fn extra(&self) -> &CursorExtra {
        &self.extra
    }

    pub fn cached(&self) -> bool {
        self.cached
    }

    /// Whether the server holds results not yet fetched.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Whether another item can be produced, buffered or not.
    pub fn has_next(&self) -> bool {
        !self.buffer.is_empty() || self.has_more
    }

    async fn fetch_batch(&mut self) -> Result<()> {
        if !self.has_more {
            return Ok(());
        }
        let id = self
            .id
            .clone()
            .ok_or_else(|| Error::InvalidResponse("cursor has more results but no id".to_string()))?;

        let request = self.cursor_request(Method::PUT, &id);
        let batch: CursorBatch<T> = self.db.execute(&request).await?.json()?;
        debug!(cursor_id = %id, size = batch.result.len(), has_more = batch.has_more, "Fetched batch");

        self.buffer.extend(batch.result);
        self.has_more = batch.has_more;
        if batch.id.is_some() {
            self.id = batch.id;
        }
        Ok(())
    }

    fn cursor_request(&self, method: Method, id: &str) -> crate::Request {
        let mut request = self
            .db
            .request(method, &format!("/_api/cursor/{}", id))
            .on_host(self.host.clone())
            .with_dirty_read(self.allow_dirty_read);
        if let Some(trx) = &self.transaction_id {
            request = request.in_transaction(trx.clone());
        }
        request
    }

    /// Next item, fetching a batch when the buffer is empty.
    pub async fn next(&mut self) -> Result<Option<T>> {
        while self.buffer.is_empty() && self.has_more {
            self.fetch_batch().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// The rest of the current batch, fetching at most one new batch.
    ///
    /// Streaming queries may answer with an empty batch that still has more
    /// results behind it; that yields `Some` of an empty vector. `None` means
    /// the cursor is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<T>>> {
        if self.buffer.is_empty() {
            self.fetch_batch().await?;
        }
        if self.buffer.is_empty() && !self.has_more {
            return Ok(None);
        }
        Ok(Some(self.buffer.drain(..).collect()))
    }

    /// Every remaining item, in order.
    pub async fn all(&mut self) -> Result<Vec<T>> {
        while self.has_more {
            self.fetch_batch().await?;
        }
        Ok(self.buffer.drain(..).collect())
    }

    /// Call `f` for each item until it returns `false`.
    ///
    /// Returns `false` when `f` stopped the traversal.
    pub async fn each<F>(&mut self, mut f: F) -> Result<bool>
    where
        F: FnMut(T) -> bool,
    {
        while let Some(item) = self.next().await? {
            if !f(item) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether `predicate` holds for every remaining item. Stops at the first miss.
    pub async fn every<F>(&mut self, mut predicate: F) -> Result<bool>
    where
        F: FnMut(&T) -> bool,
    {
        while let Some(item) = self.next().await? {
            if !predicate(&item) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether `predicate` holds for some remaining item. Stops at the first hit.
    pub async fn some<F>(&mut self, mut predicate: F) -> Result<bool>
    where
        F: FnMut(&T) -> bool,
    {
        while let Some(item) = self.next().await? {
            if predicate(&item) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn map<U, F>(&mut self, mut f: F) -> Result<Vec<U>>
    where
        F: FnMut(T) -> U,
    {
        let mut mapped = Vec::new();
        while let Some(item) = self.next().await? {
            mapped.push(f(item));
        }
        Ok(mapped)
    }

    pub async fn flat_map<U, I, F>(&mut self, mut f: F) -> Result<Vec<U>>
    where
        I: IntoIterator<Item = U>,
        F: FnMut(T) -> I,
    {
        let mut mapped = Vec::new();
        while let Some(item) = self.next().await? {
            mapped.extend(f(item));
        }
        Ok(mapped)
    }

    pub async fn reduce<A, F>(&mut self, init: A, mut f: F) -> Result<A>
    where
        F: FnMut(A, T) -> A,
    {
        let mut acc = init;
        while let Some(item) = self.next().await? {
            acc = f(acc, item);
        }
        Ok(acc)
    }

    /// Call `f` for each item, stopping at the first error.
    pub async fn try_for_each<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(T) -> Result<()>,
    {
        while let Some(item) = self.next().await? {
            f(item)?;
        }
        Ok(())
    }

    /// Release the server-side cursor and drop buffered results.
    ///
    /// Failures are logged; afterwards the cursor is always exhausted.
    pub async fn kill(&mut self) {
        if !self.has_more {
            return;
        }
        if let Some(id) = self.id.clone() {
            let request = self.cursor_request(Method::DELETE, &id);
            if let Err(err) = self.db.execute(&request).await {
                warn!(cursor_id = %id, "Failed to kill cursor: {}", err);
            }
        }
        self.has_more = false;
        self.buffer.clear();
    }

    /// Turn the cursor into a stream of items.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        futures::stream::try_unfold(self, |mut cursor| async move {
            Ok(cursor.next().await?.map(|item| (item, cursor)))
        })
    }
}

impl<T> std::fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("buffered", &self.buffer.len())
            .field("has_more", &self.has_more)
            .field("count", &self.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{config, header, host_of, json, path_of, MockTransport};
    use crate::ConnectionManager;
    use aqueduct_core::{aql, AqlValue, LoadBalancingStrategy, QueryOptions};
    use futures::TryStreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const CURSOR: &str = "/_db/_system/_api/cursor";

    /// Serves the numbers `1..=total` in batches of `batch_size`.
    fn paged(total: i64, batch_size: i64) -> Arc<MockTransport> {
        let offset = AtomicUsize::new(0);
        MockTransport::new(move |req| {
            if req.method == Method::DELETE {
                return json(202, json!({"id": "c1", "error": false}));
            }
            let start = offset.fetch_add(batch_size as usize, Ordering::SeqCst) as i64;
            let end = (start + batch_size).min(total);
            let result: Vec<i64> = (start + 1..=end).collect();
            let has_more = end < total;
            json(
                if req.method == Method::POST { 201 } else { 200 },
                json!({"result": result, "hasMore": has_more, "id": "c1", "count": total}),
            )
        })
    }

    async fn open(transport: Arc<MockTransport>, config: aqueduct_core::Config) -> Cursor<i64> {
        let conn = ConnectionManager::with_transport(&config, transport).unwrap();
        let db = Database::with_connection(Arc::new(conn), "_system");
        let query = aql(&["FOR x IN 1..10 RETURN x"], Vec::<AqlValue>::new()).unwrap();
        db.query(&query, QueryOptions::default().with_batch_size(3).with_count(true))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_next_fetches_each_batch_once() {
        let transport = paged(10, 3);
        let mut cursor = open(transport.clone(), config(&["http://a:8529"])).await;
        assert_eq!(cursor.count(), Some(10));

        let mut seen = Vec::new();
        while let Some(item) = cursor.next().await.unwrap() {
            seen.push(item);
        }

        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
        // ceil(10 / 3) batches: one POST and three PUTs
        assert_eq!(transport.count(Method::POST, CURSOR), 1);
        assert_eq!(transport.count(Method::PUT, CURSOR), 3);
        assert!(!cursor.has_next());
        assert_eq!(cursor.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_all_preserves_order() {
        let transport = paged(7, 3);
        let mut cursor = open(transport.clone(), config(&["http://a:8529"])).await;

        assert_eq!(cursor.all().await.unwrap(), vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(transport.requests().len(), 3);
        assert!(cursor.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_next_batch() {
        let transport = paged(5, 3);
        let mut cursor = open(transport, config(&["http://a:8529"])).await;

        assert_eq!(cursor.next().await.unwrap(), Some(1));
        assert_eq!(cursor.next_batch().await.unwrap(), Some(vec![2, 3]));
        assert_eq!(cursor.next_batch().await.unwrap(), Some(vec![4, 5]));
        assert_eq!(cursor.next_batch().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_next_batch_passes_over_empty_stream_batches() {
        let puts = AtomicUsize::new(0);
        let transport = MockTransport::new(move |req| {
            if req.method == Method::POST {
                return json(201, json!({"result": [], "hasMore": true, "id": "c1"}));
            }
            match puts.fetch_add(1, Ordering::SeqCst) {
                0 => json(200, json!({"result": [], "hasMore": true, "id": "c1"})),
                _ => json(200, json!({"result": [1, 2], "hasMore": false, "id": "c1"})),
            }
        });
        let mut cursor = open(transport.clone(), config(&["http://a:8529"])).await;

        let mut batches = Vec::new();
        while let Some(batch) = cursor.next_batch().await.unwrap() {
            batches.push(batch);
        }

        assert_eq!(batches, vec![vec![], vec![1, 2]]);
        assert_eq!(transport.count(Method::PUT, CURSOR), 2);
        assert!(!cursor.has_next());
    }

    #[tokio::test]
    async fn test_continuation_is_pinned_to_first_host() {
        let transport = paged(9, 3);
        let config = config(&["http://a:8529", "http://b:8529"])
            .with_load_balancing(LoadBalancingStrategy::RoundRobin);
        let mut cursor = open(transport.clone(), config).await;
        cursor.all().await.unwrap();

        let hosts: Vec<String> = transport
            .requests()
            .iter()
            .map(|r| host_of(r).to_string())
            .collect();
        assert_eq!(hosts, vec!["http://a:8529"; 3]);
        assert_eq!(cursor.host(), "http://a:8529");
    }

    #[tokio::test]
    async fn test_dirty_read_and_transaction_follow_the_cursor() {
        let transport = paged(4, 2);
        let conn = ConnectionManager::with_transport(&config(&["http://a:8529"]), transport.clone()).unwrap();
        let db = Database::with_connection(Arc::new(conn), "_system").in_transaction("trx-5");
        let query = aql(&["FOR x IN 1..4 RETURN x"], Vec::<AqlValue>::new()).unwrap();

        let mut cursor: Cursor<i64> = db
            .query(&query, QueryOptions::default().with_batch_size(2).with_dirty_read(true))
            .await
            .unwrap();
        cursor.all().await.unwrap();

        for sent in transport.requests() {
            assert_eq!(header(&sent, "x-arango-allow-dirty-read"), Some("true"));
            assert_eq!(header(&sent, "x-arango-trx-id"), Some("trx-5"));
        }
        assert_eq!(path_of(&transport.requests()[1]), "/_db/_system/_api/cursor/c1");
    }

    #[tokio::test]
    async fn test_traversals_are_resumable() {
        let transport = paged(10, 3);
        let mut cursor = open(transport, config(&["http://a:8529"])).await;

        let mut visited = Vec::new();
        let completed = cursor
            .each(|x| {
                visited.push(x);
                x < 2
            })
            .await
            .unwrap();
        assert!(!completed);
        assert_eq!(visited, vec![1, 2]);

        assert!(cursor.some(|x| *x == 4).await.unwrap());
        assert!(!cursor.every(|x| *x < 6).await.unwrap());

        let err = cursor
            .try_for_each(|x| {
                if x == 7 {
                    Err(Error::InvalidResponse("stop".to_string()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));

        assert_eq!(cursor.map(|x| x * 10).await.unwrap(), vec![80, 90, 100]);
    }

    #[tokio::test]
    async fn test_reduce_and_flat_map() {
        let mut cursor = open(paged(4, 3), config(&["http://a:8529"])).await;
        assert_eq!(cursor.reduce(0, |acc, x| acc + x).await.unwrap(), 10);

        let mut cursor = open(paged(3, 3), config(&["http://a:8529"])).await;
        assert_eq!(cursor.flat_map(|x| vec![x; x as usize]).await.unwrap(), vec![1, 2, 2, 3, 3, 3]);
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let transport = paged(10, 3);
        let mut cursor = open(transport.clone(), config(&["http://a:8529"])).await;

        cursor.kill().await;
        cursor.kill().await;

        assert_eq!(transport.count(Method::DELETE, CURSOR), 1);
        assert!(!cursor.has_more());
        assert_eq!(cursor.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_kill_swallows_errors() {
        let transport = MockTransport::new(|req| {
            if req.method == Method::DELETE {
                return json(404, json!({"error": true, "code": 404, "errorNum": 1600, "errorMessage": "cursor not found"}));
            }
            json(201, json!({"result": [1], "hasMore": true, "id": "c1"}))
        });
        let mut cursor = open(transport, config(&["http://a:8529"])).await;

        cursor.kill().await;
        assert!(!cursor.has_next());
    }

    #[tokio::test]
    async fn test_kill_without_more_results_sends_nothing() {
        let transport = paged(2, 3);
        let mut cursor = open(transport.clone(), config(&["http://a:8529"])).await;
        cursor.kill().await;
        assert_eq!(transport.count(Method::DELETE, CURSOR), 0);
    }

    #[tokio::test]
    async fn test_into_stream() {
        let transport = paged(5, 2);
        let cursor = open(transport, config(&["http://a:8529"])).await;
        let items: Vec<i64> = cursor.into_stream().try_collect().await.unwrap();
        assert_eq!(items, vec![1, 2, 3, 4, 5]);
    }
}
