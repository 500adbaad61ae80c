//! Request entry point.
//!
//! A [`DatabaseHandle`] is what a request handler sees for one database
//! target: it wraps the session's connection lifecycle and, when the target
//! has transactions enabled, hands out transaction coordinators.

use crate::config::RebindPolicy;
use crate::db::lease_registry::LeaseRegistry;
use crate::db::lifecycle::ConnectionLifecycle;
use crate::db::pool::ConnectionPool;
use crate::db::transaction::TransactionCoordinator;
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, LeaseKey, QueryParam, Rows, Statement};
use crate::session::Session;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

pub struct DatabaseHandle<S, P: ConnectionPool> {
    lifecycle: ConnectionLifecycle<S, P>,
    transactions_enabled: bool,
}

impl<S: Session, P: ConnectionPool> DatabaseHandle<S, P> {
    /// Attach a session to a database target.
    ///
    /// The registry is shared by every handle on the same pool.
    pub fn attach(
        session: S,
        pool: P,
        target: &str,
        enable_transactions: bool,
        registry: LeaseRegistry<P::Connection>,
    ) -> Self {
        Self {
            lifecycle: ConnectionLifecycle::new(session, pool, target, registry),
            transactions_enabled: enable_transactions,
        }
    }

    pub fn with_rebind_policy(mut self, policy: RebindPolicy) -> Self {
        self.lifecycle = self.lifecycle.with_rebind_policy(policy);
        self
    }

    pub fn target(&self) -> &str {
        self.lifecycle.target()
    }

    pub fn transactions_enabled(&self) -> bool {
        self.transactions_enabled
    }

    pub fn lifecycle(&self) -> &ConnectionLifecycle<S, P> {
        &self.lifecycle
    }

    pub async fn initialize_connection(&self) -> DbResult<LeaseKey> {
        self.lifecycle.initialize_connection().await
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<Rows> {
        self.lifecycle.query(sql, params).await
    }

    pub async fn query_batch(&self, statements: &[Statement]) -> DbResult<Vec<Rows>> {
        self.lifecycle.query_batch(statements).await
    }

    pub async fn release_connection(&self) -> DbResult<()> {
        self.lifecycle.release_connection().await
    }

    pub async fn terminate(&self) -> DbResult<()> {
        self.lifecycle.terminate().await
    }

    /// Transaction operations at the given isolation level.
    ///
    /// Only available on targets attached with transactions enabled.
    pub fn transaction(
        &self,
        isolation: IsolationLevel,
    ) -> DbResult<TransactionCoordinator<'_, S, P>> {
        if !self.transactions_enabled {
            return Err(DbError::invalid_input(format!(
                "Transactions are not enabled for '{}'",
                self.target()
            )));
        }
        Ok(TransactionCoordinator::new(&self.lifecycle, isolation))
    }
}

/// Fixed response for a failed connection initialization.
///
/// The cause is logged, never sent to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitErrorResponse {
    pub status: u16,
    pub code: &'static str,
    pub error: &'static str,
}

impl Default for InitErrorResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            code: "DATABASE_INIT_ERROR",
            error: "Error initializing database.",
        }
    }
}

impl From<DbError> for InitErrorResponse {
    fn from(err: DbError) -> Self {
        error!(error = %err, "Database initialization failed");
        Self::default()
    }
}

impl IntoResponse for InitErrorResponse {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}
