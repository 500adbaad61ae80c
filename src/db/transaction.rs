//! Transactions on a session's leased connection.
//!
//! A transaction spans requests: `init` opens it and runs a batch of
//! statements, and a later `commit` or `rollback` closes it. The open state
//! lives on the lease record, so it is dropped (and rolled back) together
//! with the lease when it is released or evicted.

use crate::db::lifecycle::ConnectionLifecycle;
use crate::db::lease_registry::LeaseUpdate;
use crate::db::pool::{ConnectionPool, LeasedConnection};
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, LeaseKey, RetrieveOutput, Rows, Statement};
use crate::session::Session;
use tracing::{info, warn};

/// Generate a unique reference number.
pub fn generate_reference_no() -> String {
    format!("ref_{}", uuid::Uuid::new_v4().simple())
}

/// Begin/commit/rollback on the lease bound to a lifecycle's session.
pub struct TransactionCoordinator<'a, S, P: ConnectionPool> {
    lifecycle: &'a ConnectionLifecycle<S, P>,
    isolation: IsolationLevel,
}

impl<'a, S: Session, P: ConnectionPool> TransactionCoordinator<'a, S, P> {
    pub fn new(lifecycle: &'a ConnectionLifecycle<S, P>, isolation: IsolationLevel) -> Self {
        Self {
            lifecycle,
            isolation,
        }
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Open a transaction and run `statements` in order.
    ///
    /// Returns one result set per statement. If any statement fails the
    /// transaction is rolled back before the error is returned.
    pub async fn init(&self, statements: Vec<Statement>) -> DbResult<Vec<Rows>> {
        let (_, results) = self.begin_and_run(&statements).await?;
        Ok(results)
    }

    /// Like [`init`](Self::init), then attach a reference number produced by
    /// `generate` to the lease. Nothing is attached when a statement fails.
    pub async fn init_with_reference<F>(
        &self,
        statements: Vec<Statement>,
        generate: F,
    ) -> DbResult<(Vec<Rows>, String)>
    where
        F: FnOnce() -> String,
    {
        let (key, results) = self.begin_and_run(&statements).await?;

        let reference_no = generate();
        self.lifecycle
            .registry()
            .update(&key, LeaseUpdate::reference_no(Some(reference_no.clone())))
            .await?;

        info!(lease_key = %key, reference_no = %reference_no, "Reference number attached");
        Ok((results, reference_no))
    }

    async fn begin_and_run(&self, statements: &[Statement]) -> DbResult<(LeaseKey, Vec<Rows>)> {
        let key = self.lifecycle.lease_key()?;
        let mut record = self.lifecycle.registry().get(&key).await?;

        if let Some(open) = record.transaction {
            return Err(DbError::transaction_state(
                format!("A {} transaction is already open", open),
                &key,
            ));
        }

        record.connection.begin(self.isolation).await?;
        record.transaction = Some(self.isolation);
        // A reference number belongs to the transaction that produced it
        record.reference_no = None;
        info!(
            lease_key = %key,
            isolation = %self.isolation,
            statements = statements.len(),
            "Transaction started"
        );

        let mut results = Vec::with_capacity(statements.len());
        for (index, statement) in statements.iter().enumerate() {
            match record
                .connection
                .execute(&statement.sql, &statement.params)
                .await
            {
                Ok(rows) => results.push(rows),
                Err(e) => {
                    warn!(
                        lease_key = %key,
                        statement = index,
                        error = %e,
                        "Statement failed; rolling back transaction"
                    );
                    if let Err(rollback_err) = record.connection.rollback().await {
                        warn!(lease_key = %key, error = %rollback_err, "Rollback failed");
                    }
                    record.transaction = None;
                    return Err(e);
                }
            }
        }

        Ok((key, results))
    }

    /// Commit the open transaction.
    ///
    /// On failure the transaction stays marked open so the caller can roll
    /// it back.
    pub async fn commit(&self) -> DbResult<()> {
        let key = self.lifecycle.lease_key()?;
        let mut record = self.lifecycle.registry().get(&key).await?;
        if record.transaction.is_none() {
            return Err(DbError::transaction_state("No open transaction to commit", &key));
        }

        record.connection.commit().await?;
        record.transaction = None;

        info!(lease_key = %key, "Transaction committed");
        Ok(())
    }

    /// Roll back the open transaction.
    pub async fn rollback(&self) -> DbResult<()> {
        let key = self.lifecycle.lease_key()?;
        let mut record = self.lifecycle.registry().get(&key).await?;
        if record.transaction.is_none() {
            return Err(DbError::transaction_state(
                "No open transaction to roll back",
                &key,
            ));
        }

        record.connection.rollback().await?;
        record.transaction = None;

        info!(lease_key = %key, "Transaction rolled back");
        Ok(())
    }

    /// The session's lease key and reference number, or the lookup error.
    pub async fn retrieve(&self) -> RetrieveOutput {
        let lookup = async {
            let key = self.lifecycle.lease_key()?;
            let record = self.lifecycle.registry().get(&key).await?;
            Ok::<_, DbError>((key, record.reference_no.clone()))
        };

        match lookup.await {
            Ok((key, reference_no)) => RetrieveOutput {
                connection: Some(key),
                reference_no,
                error: None,
            },
            Err(e) => RetrieveOutput {
                connection: None,
                reference_no: None,
                error: Some(e.to_string()),
            },
        }
    }
}
