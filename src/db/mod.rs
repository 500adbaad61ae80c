//! Database layer.
//!
//! - Connection pools and the leased-connection capability
//! - The lease registry with time-bounded eviction
//! - Per-session connection lifecycle
//! - Transactions on leased connections
//! - Row decoding and parameter binding

pub mod lease_registry;
pub mod lifecycle;
pub mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use lease_registry::{LeaseGuard, LeaseRecord, LeaseRegistry, LeaseUpdate};
pub use lifecycle::ConnectionLifecycle;
pub use pool::{ConnectionPool, DbConnection, DbPool, LeasedConnection, PoolManager};
pub use transaction::{TransactionCoordinator, generate_reference_no};
