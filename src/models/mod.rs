//! Data models for the lease broker.
//!
//! This module re-exports all model types used throughout the application.

pub mod connection;
pub mod lease;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectionConfig, ConnectionConfigError, DatabaseType};
pub use lease::{IsolationLevel, LeaseKey, LeaseMetadata, RetrieveOutput};
pub use query::{JsonRow, QueryParam, Rows, Statement};
