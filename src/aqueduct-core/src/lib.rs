//! Aqueduct Core Library
//!
//! Transport-independent building blocks for the aqueduct client:
//! - AQL query composition with bind variables
//! - Error taxonomy shared by every layer
//! - Client configuration
//! - Wire models for cursors, transactions and cluster metadata

pub mod aql;
pub mod config;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use aql::{aql, collection, join, literal, AqlBuilder, AqlLiteral, AqlQuery, AqlValue, CollectionName, CollectionRef};
pub use config::{Auth, Config, LoadBalancingStrategy};
pub use error::{
    ApplicationError, BuilderError, Error, HttpError, NetworkError, NetworkErrorKind, PropagationTimeoutError, Result,
};
pub use models::*;
