//! DB Lease Broker Library
//!
//! Leases pooled database connections (SQLite, PostgreSQL, MySQL) to
//! session-identified callers, tracks transaction state on each lease, and
//! reclaims leases that are never released.

pub mod config;
pub mod db;
pub mod error;
pub mod handle;
pub mod models;
pub mod session;
pub mod transport;

pub use config::Config;
pub use error::{DbError, DbResult};
pub use handle::{DatabaseHandle, InitErrorResponse};
