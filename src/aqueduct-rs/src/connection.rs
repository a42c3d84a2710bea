//! Connection management: host selection, failover, admission control.
//!
//! A [`ConnectionManager`] owns everything shared between the requests of one
//! client: the host registry, the request executor, the pool of in-flight
//! slots and the queue-time samples. It is meant to live behind an `Arc` and
//! be shared by every [`Database`](crate::Database) handle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use aqueduct_core::{Config, Error, NetworkError, NetworkErrorKind, PropagationTimeoutError, QueueTimeSample, Result};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Semaphore};
use tracing::{debug, debug_span, info, warn, Instrument};
use uuid::Uuid;

use crate::executor::RequestExecutor;
use crate::hosts::HostRegistry;
use crate::job::TrappedRequest;
use crate::queue_time::QueueTimes;
use crate::request::{Request, Response};
use crate::transport::{ReqwestTransport, Transport};

pub struct ConnectionManager {
    hosts: HostRegistry,
    executor: RequestExecutor,
    permits: Semaphore,
    pool_size: usize,
    max_retries: Option<usize>,
    queue_times: Mutex<QueueTimes>,
    transaction: Mutex<Option<String>>,
    job_trap: Mutex<Option<oneshot::Sender<TrappedRequest>>>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Connect over HTTP using the reqwest transport.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(ReqwestTransport::new(config)?);
        Self::with_transport(config, transport)
    }

    /// Build a connection manager on top of a custom transport.
    pub fn with_transport(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let hosts = HostRegistry::new(&config.url, config.load_balancing_strategy)?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(
            "Connection configured with {} host(s), strategy {:?}, pool size {}",
            hosts.len(),
            config.load_balancing_strategy,
            config.pool_size
        );

        Ok(Self {
            hosts,
            executor: RequestExecutor::new(transport, config, shutdown_rx),
            permits: Semaphore::new(config.pool_size),
            pool_size: config.pool_size,
            max_retries: config.max_retries,
            queue_times: Mutex::new(QueueTimes::new(config.response_queue_time_samples)),
            transaction: Mutex::new(None),
            job_trap: Mutex::new(None),
            shutdown,
        })
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    pub fn replace_hosts<I, S>(&self, urls: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.hosts.replace_hosts(urls)
    }

    pub fn add_hosts<I, S>(&self, urls: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.hosts.add_hosts(urls)
    }

    /// Send a request, failing over to other hosts when that is known to be safe.
    pub async fn execute(&self, request: &Request) -> Result<Response> {
        let span = debug_span!(
            "request",
            id = %Uuid::new_v4(),
            method = %request.method,
            path = %request.path
        );
        self.execute_traced(request).instrument(span).await
    }

    async fn execute_traced(&self, request: &Request) -> Result<Response> {
        // The trap belongs to whichever request is issued first
        let trap = self.job_trap.lock().take();
        let transaction_id = request
            .transaction_id
            .clone()
            .or_else(|| self.transaction.lock().clone());

        let result = {
            let _permit = self.permits.acquire().await.map_err(|_| {
                Error::from(NetworkError::new(NetworkErrorKind::RequestAborted, &request.path))
            })?;
            self.dispatch(request, transaction_id.as_deref(), trap.is_some())
                .await
        };

        match trap {
            None => result,
            Some(trap) => hand_over(trap, result).await,
        }
    }

    async fn dispatch(
        &self,
        request: &Request,
        transaction_id: Option<&str>,
        deferred: bool,
    ) -> Result<Response> {
        if let Some(host) = &request.host_hint {
            let response = self
                .executor
                .execute(host, request, transaction_id, deferred)
                .await?;
            self.record_queue_time(&response);
            return Ok(response);
        }

        let mut host = self
            .hosts
            .select()
            .ok_or_else(|| Error::Config("no hosts configured".to_string()))?;
        let attempts = self.max_retries.unwrap_or_else(|| self.hosts.len()).max(1);
        let mut attempt = 1;

        loop {
            match self
                .executor
                .execute(&host, request, transaction_id, deferred)
                .await
            {
                Ok(response) => {
                    self.record_queue_time(&response);
                    return Ok(response);
                }
                Err(err) => {
                    let retryable = matches!(&err, Error::Network(e) if e.safe_to_retry() == Some(true));
                    if !retryable {
                        return Err(err);
                    }
                    if attempt >= attempts {
                        self.hosts.advance_from(&host);
                        warn!("Giving up after {} attempt(s): {}", attempt, err);
                        return Err(err);
                    }

                    let next = self
                        .hosts
                        .failover_target(&host)
                        .ok_or_else(|| Error::Config("no hosts configured".to_string()))?;
                    warn!(failed = %host, next = %next, attempt, "Retrying on next host: {}", err);
                    host = next;
                    attempt += 1;
                }
            }
        }
    }

    fn record_queue_time(&self, response: &Response) {
        if let Some(seconds) = response.queue_time() {
            self.queue_times.lock().push(seconds);
        }
    }

    pub fn queue_time_latest(&self) -> Option<QueueTimeSample> {
        self.queue_times.lock().latest()
    }

    pub fn queue_time_values(&self) -> Vec<QueueTimeSample> {
        self.queue_times.lock().values()
    }

    pub fn queue_time_average(&self) -> Option<f64> {
        self.queue_times.lock().average()
    }

    pub fn set_queue_time_samples(&self, samples: usize) {
        self.queue_times.lock().set_capacity(samples);
    }

    /// Attach `id` to every request until the returned guard is dropped.
    pub fn pin_transaction(&self, id: impl Into<String>) -> Result<TransactionPin<'_>> {
        let mut slot = self.transaction.lock();
        if let Some(active) = slot.as_ref() {
            return Err(Error::TransactionInProgress {
                active: active.clone(),
            });
        }
        *slot = Some(id.into());
        Ok(TransactionPin { connection: self })
    }

    pub fn transaction_id(&self) -> Option<String> {
        self.transaction.lock().clone()
    }

    /// Defer the next request as an async job.
    pub(crate) fn arm_job_trap(&self) -> Result<oneshot::Receiver<TrappedRequest>> {
        let mut trap = self.job_trap.lock();
        if trap.is_some() {
            return Err(Error::Job("another job is already being created".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        *trap = Some(tx);
        Ok(rx)
    }

    pub(crate) fn disarm_job_trap(&self) {
        self.job_trap.lock().take();
    }

    /// Repeat `request` on every known host until each has answered successfully.
    pub async fn wait_for_propagation(
        &self,
        request: &Request,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        let mut pending: Vec<String> = self.hosts.hosts().to_vec();
        let mut last_error: Option<Error> = None;

        loop {
            let mut remaining = Vec::new();
            for host in pending {
                let pinned = request.clone().on_host(host.clone());
                if let Err(err) = self.execute(&pinned).await {
                    debug!(host = %host, "Change not yet visible: {}", err);
                    last_error = Some(err);
                    remaining.push(host);
                }
            }
            pending = remaining;

            if pending.is_empty() {
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(PropagationTimeoutError {
                    elapsed,
                    pending,
                    cause: last_error.map(Box::new),
                }
                .into());
            }
            tokio::time::sleep(poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// Abort in-flight requests and reject new ones.
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Closing connection");
        }
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("hosts", &self.hosts)
            .field("pool_size", &self.pool_size)
            .field("available", &self.permits.available_permits())
            .field("max_retries", &self.max_retries)
            .field("transaction", &self.transaction_id())
            .finish()
    }
}

/// Keeps a transaction id attached to a connection.
pub struct TransactionPin<'a> {
    connection: &'a ConnectionManager,
}

impl Drop for TransactionPin<'_> {
    fn drop(&mut self) {
        self.connection.transaction.lock().take();
    }
}

/// Pass the outcome of a deferred request to the job owner, then wait for the
/// job's eventual result.
async fn hand_over(trap: oneshot::Sender<TrappedRequest>, result: Result<Response>) -> Result<Response> {
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            let message = err.to_string();
            let _ = trap.send(TrappedRequest::Failed(err));
            return Err(Error::Job(format!("deferred request failed: {}", message)));
        }
    };

    let Some(job_id) = response.async_job_id().map(str::to_string) else {
        let _ = trap.send(TrappedRequest::Failed(Error::InvalidResponse(
            "deferred request returned no job id".to_string(),
        )));
        return Err(Error::Job("server did not assign a job id".to_string()));
    };

    debug!(job_id = %job_id, "Request deferred as async job");
    let (completion, outcome) = oneshot::channel();
    if trap
        .send(TrappedRequest::Deferred { job_id, completion })
        .is_err()
    {
        return Err(Error::Job("job owner went away".to_string()));
    }

    outcome
        .await
        .unwrap_or_else(|_| Err(Error::Job("job was dropped before completion".to_string())))
}
