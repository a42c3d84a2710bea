//! Aqueduct client
//!
//! Async HTTP client for multi-host document database deployments.
//!
//! # Example
//!
//! ```no_run
//! use aqueduct_rs::{aql, collection, Config, Database, QueryOptions};
//!
//! #[tokio::main]
//! async fn main() -> aqueduct_rs::Result<()> {
//!     let db = Database::new(&Config::new("http://127.0.0.1:8529"))?;
//!
//!     let query = aql(&["FOR d IN ", " FILTER d.age > ", " RETURN d"], [
//!         aqueduct_rs::AqlValue::from(collection("users")),
//!         21.into(),
//!     ])?;
//!     let mut cursor = db.query::<serde_json::Value>(&query, QueryOptions::default()).await?;
//!
//!     while let Some(doc) = cursor.next().await? {
//!         println!("{}", doc);
//!     }
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod cursor;
pub mod database;
pub mod executor;
pub mod hosts;
pub mod job;
pub mod queue_time;
pub mod request;
pub mod transaction;
pub mod transport;

#[cfg(test)]
mod testing;

pub use connection::{ConnectionManager, TransactionPin};
pub use cursor::Cursor;
pub use database::Database;
pub use executor::RequestExecutor;
pub use hosts::{normalize_url, HostRegistry};
pub use job::Job;
pub use queue_time::QueueTimes;
pub use request::{Request, RequestBody, Response};
pub use transaction::Transaction;
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};

// Re-export core types for convenience
pub use aqueduct_core::*;
