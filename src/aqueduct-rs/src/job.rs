//! Async jobs: requests the server stores and answers later.
//!
//! [`Database::create_job`](crate::Database::create_job) arms the connection
//! so the first request issued by the job callback is sent with
//! `x-arango-async: store`. The callback keeps waiting while the caller holds
//! a [`Job`] handle; every [`Job::load`] polls the server and, once the stored
//! result is available, feeds it back to the waiting callback.

use aqueduct_core::{Error, Result};
use reqwest::Method;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::database::Database;
use crate::request::Response;

/// What happened to the request captured by an armed connection.
#[derive(Debug)]
pub(crate) enum TrappedRequest {
    /// The server accepted the request as job `job_id`.
    Deferred {
        job_id: String,
        completion: oneshot::Sender<Result<Response>>,
    },
    /// The request never became a job.
    Failed(Error),
}

enum JobState<T> {
    Pending {
        completion: oneshot::Sender<Result<Response>>,
        handle: JoinHandle<Result<T>>,
    },
    Loaded(T),
    Failed(String),
}

/// Handle to a server-side async job whose callback produces a `T`.
pub struct Job<T> {
    db: Database,
    id: String,
    state: JobState<T>,
}

impl<T> Job<T> {
    pub(crate) fn new(
        db: Database,
        id: String,
        completion: oneshot::Sender<Result<Response>>,
        handle: JoinHandle<Result<T>>,
    ) -> Self {
        Self {
            db,
            id,
            state: JobState::Pending { completion, handle },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, JobState::Loaded(_))
    }

    /// Result of the callback, once loaded.
    pub fn result(&self) -> Option<&T> {
        match &self.state {
            JobState::Loaded(value) => Some(value),
            _ => None,
        }
    }

    /// Poll the server for the job result.
    ///
    /// Returns `Ok(None)` while the job is still running. Server errors for
    /// the stored request are handed to the callback and surface through its
    /// own result; network failures while polling are returned directly and
    /// leave the job pending.
    pub async fn load(&mut self) -> Result<Option<&T>> {
        match &self.state {
            JobState::Loaded(_) => return Ok(self.result()),
            JobState::Failed(message) => return Err(Error::Job(message.clone())),
            JobState::Pending { .. } => {}
        }

        let request = self.db.request(Method::PUT, &format!("/_api/job/{}", self.id));
        let outcome = match self.db.execute(&request).await {
            Ok(response) if response.status == 204 => {
                debug!(job_id = %self.id, "Job not finished yet");
                return Ok(None);
            }
            Err(Error::Network(err)) => return Err(err.into()),
            other => other,
        };

        let state = std::mem::replace(
            &mut self.state,
            JobState::Failed("job result is being loaded".to_string()),
        );
        let JobState::Pending { completion, handle } = state else {
            return Err(Error::Job("job is not pending".to_string()));
        };

        let _ = completion.send(outcome);
        let joined = handle
            .await
            .map_err(|e| Error::Job(format!("job callback did not finish: {}", e)));

        match joined.and_then(|result| result) {
            Ok(value) => {
                debug!(job_id = %self.id, "Job loaded");
                self.state = JobState::Loaded(value);
                Ok(self.result())
            }
            Err(err) => {
                self.state = JobState::Failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Ask the server to cancel the job.
    pub async fn cancel(&self) -> Result<()> {
        let request = self
            .db
            .request(Method::PUT, &format!("/_api/job/{}/cancel", self.id));
        self.db.execute(&request).await?;
        Ok(())
    }

    /// Remove the stored result from the server.
    pub async fn delete_result(&self) -> Result<()> {
        let request = self
            .db
            .request(Method::DELETE, &format!("/_api/job/{}", self.id));
        self.db.execute(&request).await?;
        Ok(())
    }
}

impl<T> std::fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
