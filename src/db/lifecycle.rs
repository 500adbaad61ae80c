//! Per-session connection lifecycle.
//!
//! `UNBOUND -> LEASED -> (querying)* -> RELEASED | EVICTED`
//!
//! [`ConnectionLifecycle`] ties one caller session to one database target:
//! it leases a connection from the pool, records it in the shared
//! [`LeaseRegistry`], and binds the lease key into the session so later
//! requests find the same connection.

use crate::config::RebindPolicy;
use crate::db::lease_registry::{LeaseGuard, LeaseRegistry};
use crate::db::pool::{ConnectionPool, LeasedConnection};
use crate::error::{DbError, DbResult};
use crate::models::{LeaseKey, QueryParam, Rows, Statement};
use crate::session::{Session, SessionBinder};
use tracing::{debug, info, warn};

pub struct ConnectionLifecycle<S, P: ConnectionPool> {
    session: S,
    pool: P,
    binder: SessionBinder,
    registry: LeaseRegistry<P::Connection>,
    rebind_policy: RebindPolicy,
}

impl<S: Session, P: ConnectionPool> ConnectionLifecycle<S, P> {
    pub fn new(session: S, pool: P, target: &str, registry: LeaseRegistry<P::Connection>) -> Self {
        Self {
            session,
            pool,
            binder: SessionBinder::new(target),
            registry,
            rebind_policy: RebindPolicy::default(),
        }
    }

    pub fn with_rebind_policy(mut self, policy: RebindPolicy) -> Self {
        self.rebind_policy = policy;
        self
    }

    pub fn target(&self) -> &str {
        self.binder.target()
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn registry(&self) -> &LeaseRegistry<P::Connection> {
        &self.registry
    }

    /// The lease key bound to this session.
    pub fn lease_key(&self) -> DbResult<LeaseKey> {
        self.binder.resolve(&self.session)
    }

    /// Lock the session's lease record.
    pub async fn lease(&self) -> DbResult<LeaseGuard<P::Connection>> {
        let key = self.lease_key()?;
        self.registry.get(&key).await
    }

    /// Lease a connection from the pool and bind it to the session.
    ///
    /// On failure nothing is left behind: no registry record and no
    /// binding. The error is always `DbError::Init`.
    ///
    /// Concurrent initializations on the same session and target run one
    /// at a time, so the rebind policy always sees the latest binding.
    pub async fn initialize_connection(&self) -> DbResult<LeaseKey> {
        let init_lock = self.session.init_lock(self.binder.session_key());
        let _init = init_lock.lock().await;

        self.apply_rebind_policy().await?;

        let connection = self.pool.acquire().await.map_err(|e| {
            warn!(db_target = %self.target(), error = %e, "Failed to acquire connection");
            DbError::init(e.to_string())
        })?;

        let key = LeaseKey::new(self.target(), connection.identity());
        self.registry
            .create(key.clone(), connection)
            .await
            .map_err(|e| DbError::init(e.to_string()))?;

        if let Some(previous) = self.binder.bind(&self.session, &key) {
            if previous != key && self.registry.contains(&previous).await {
                warn!(
                    db_target = %self.target(),
                    lease_key = %previous,
                    "Session rebound; previous lease orphaned until it expires"
                );
            }
        }

        info!(db_target = %self.target(), lease_key = %key, "Connection initialized");
        Ok(key)
    }

    async fn apply_rebind_policy(&self) -> DbResult<()> {
        let Ok(previous) = self.lease_key() else {
            return Ok(());
        };
        if !self.registry.contains(&previous).await {
            return Ok(());
        }

        match self.rebind_policy {
            RebindPolicy::Orphan => Ok(()),
            RebindPolicy::Reject => Err(DbError::init(format!(
                "Session already holds lease '{}'",
                previous
            ))),
            RebindPolicy::Release => match self.release_lease(&previous).await {
                // Evicted or released concurrently
                Ok(()) | Err(DbError::LeaseNotFound { .. }) => {
                    self.binder.unbind(&self.session);
                    Ok(())
                }
                Err(e) => Err(DbError::init(e.to_string())),
            },
        }
    }

    /// Run one statement on the session's leased connection.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<Rows> {
        let key = self.lease_key()?;
        let mut record = self.registry.get(&key).await?;
        debug!(lease_key = %key, sql = %sql, "Query on leased connection");
        record.connection.execute(sql, params).await
    }

    pub async fn query_statement(&self, statement: &Statement) -> DbResult<Rows> {
        self.query(&statement.sql, &statement.params).await
    }

    /// Run statements in order on the session's leased connection.
    ///
    /// The lease stays locked for the whole batch. Execution stops at the
    /// first failing statement; statements before it are not undone unless
    /// the batch runs inside an open transaction.
    pub async fn query_batch(&self, statements: &[Statement]) -> DbResult<Vec<Rows>> {
        let key = self.lease_key()?;
        let mut record = self.registry.get(&key).await?;
        debug!(lease_key = %key, statements = statements.len(), "Batch on leased connection");

        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            results.push(
                record
                    .connection
                    .execute(&statement.sql, &statement.params)
                    .await?,
            );
        }
        Ok(results)
    }

    /// Retire the session's lease and return the connection to the pool.
    ///
    /// The session keeps its binding, so releasing twice fails with
    /// `LeaseNotFound`. If returning the connection fails, the lease is
    /// already gone from the registry.
    pub async fn release_connection(&self) -> DbResult<()> {
        let key = self.lease_key()?;
        self.release_lease(&key).await
    }

    async fn release_lease(&self, key: &LeaseKey) -> DbResult<()> {
        let mut record = self.registry.dispatch(key).await?;

        if record.in_transaction() {
            warn!(lease_key = %key, "Releasing lease with open transaction; rolling back");
            if let Err(e) = record.connection.rollback().await {
                // Transaction state unknown: never hand this connection out again
                warn!(lease_key = %key, error = %e, "Rollback before release failed; closing connection");
                record.connection.discard().await?;
                info!(lease_key = %key, "Connection closed instead of released");
                return Ok(());
            }
        }

        record.connection.release().await?;
        info!(lease_key = %key, "Connection released");
        Ok(())
    }

    /// Shut down the whole pool. Fails if it is already shut down.
    pub async fn terminate(&self) -> DbResult<()> {
        self.pool.end().await.map_err(|e| match e {
            DbError::Termination { .. } => e,
            other => DbError::termination(other.to_string()),
        })?;
        info!(db_target = %self.target(), "Connection pool terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::DbPool;
    use crate::models::ConnectionConfig;
    use crate::session::MemorySession;

    async fn sqlite_pool(max_connections: u32) -> DbPool {
        let config = ConnectionConfig::new(
            "mem",
            "sqlite::memory:",
            false,
            crate::config::PoolOptions {
                max_connections: Some(max_connections),
                ..Default::default()
            },
        )
        .unwrap();
        DbPool::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_initialize_and_query() {
        let pool = sqlite_pool(2).await;
        let lifecycle =
            ConnectionLifecycle::new(MemorySession::new(), pool, "mem", LeaseRegistry::new());

        let key = lifecycle.initialize_connection().await.unwrap();
        assert!(key.as_str().starts_with("mem:"));
        assert_eq!(lifecycle.lease_key().unwrap(), key);

        let rows = lifecycle
            .query("SELECT ? AS v", &[QueryParam::Int(42)])
            .await
            .unwrap();
        assert_eq!(rows[0]["v"], 42);
    }

    #[tokio::test]
    async fn test_query_before_initialize() {
        let pool = sqlite_pool(1).await;
        let lifecycle =
            ConnectionLifecycle::new(MemorySession::new(), pool, "mem", LeaseRegistry::new());
        let err = lifecycle.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::NotInitialized { .. }));
    }

    #[tokio::test]
    async fn test_release_twice() {
        let pool = sqlite_pool(1).await;
        let lifecycle =
            ConnectionLifecycle::new(MemorySession::new(), pool, "mem", LeaseRegistry::new());
        lifecycle.initialize_connection().await.unwrap();

        lifecycle.release_connection().await.unwrap();
        let err = lifecycle.release_connection().await.unwrap_err();
        assert!(matches!(err, DbError::LeaseNotFound { .. }));
        assert!(matches!(
            lifecycle.query("SELECT 1", &[]).await,
            Err(DbError::LeaseNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reject_policy() {
        let pool = sqlite_pool(2).await;
        let registry = LeaseRegistry::new();
        let lifecycle = ConnectionLifecycle::new(MemorySession::new(), pool, "mem", registry.clone())
            .with_rebind_policy(RebindPolicy::Reject);

        let key = lifecycle.initialize_connection().await.unwrap();
        let err = lifecycle.initialize_connection().await.unwrap_err();
        assert!(matches!(err, DbError::Init { .. }));
        assert_eq!(lifecycle.lease_key().unwrap(), key);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_release_policy() {
        let pool = sqlite_pool(1).await;
        let registry = LeaseRegistry::new();
        let lifecycle = ConnectionLifecycle::new(MemorySession::new(), pool, "mem", registry.clone())
            .with_rebind_policy(RebindPolicy::Release);

        let first = lifecycle.initialize_connection().await.unwrap();
        // With a single-connection pool this only succeeds if the first lease went back
        let second = lifecycle.initialize_connection().await.unwrap();
        assert!(!registry.contains(&first).await);
        assert!(registry.contains(&second).await);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_terminate_twice() {
        let pool = sqlite_pool(1).await;
        let lifecycle =
            ConnectionLifecycle::new(MemorySession::new(), pool, "mem", LeaseRegistry::new());
        lifecycle.terminate().await.unwrap();
        let err = lifecycle.terminate().await.unwrap_err();
        assert!(matches!(err, DbError::Termination { .. }));
    }
}
