//! Stream transactions.

use std::future::Future;

use aqueduct_core::{Result, ResultEnvelope, TransactionState, TransactionStatus};
use reqwest::Method;
use tracing::info;

use crate::database::Database;

/// A server-side stream transaction.
///
/// Requests join the transaction through a [`Database`] handle bound to its
/// id, either via [`Transaction::step`] or [`Transaction::database`].
#[derive(Debug, Clone)]
pub struct Transaction {
    db: Database,
    id: String,
}

impl Transaction {
    pub(crate) fn new(db: Database, id: String) -> Self {
        Self { db, id }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// A database handle whose requests run inside this transaction.
    pub fn database(&self) -> Database {
        self.db.in_transaction(self.id.clone())
    }

    /// Run `f` with a handle bound to this transaction.
    pub async fn step<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Database) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        f(self.database()).await
    }

    pub async fn status(&self) -> Result<TransactionState> {
        self.send(Method::GET).await
    }

    /// Whether the server still knows this transaction.
    pub async fn exists(&self) -> Result<bool> {
        match self.status().await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn commit(&self) -> Result<TransactionState> {
        let state = self.send(Method::PUT).await?;
        info!(transaction_id = %self.id, "Committed stream transaction");
        Ok(state)
    }

    pub async fn abort(&self) -> Result<TransactionState> {
        let state = self.send(Method::DELETE).await?;
        info!(transaction_id = %self.id, "Aborted stream transaction");
        Ok(state)
    }

    async fn send(&self, method: Method) -> Result<TransactionState> {
        let request = self
            .db
            .request(method, &format!("/_api/transaction/{}", self.id));
        let status: ResultEnvelope<TransactionStatus> = self.db.execute(&request).await?.json()?;
        Ok(status.result.status)
    }
}
