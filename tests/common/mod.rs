//! Shared helpers for integration tests.
#![allow(dead_code)]

use db_lease_broker::config::PoolOptions;
use db_lease_broker::db::{ConnectionPool, DbPool, LeasedConnection};
use db_lease_broker::error::{DbError, DbResult};
use db_lease_broker::models::{ConnectionConfig, IsolationLevel, QueryParam, Rows};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Counters and switches shared by a [`FakePool`] and its connections.
#[derive(Debug, Default)]
pub struct FakeState {
    next_id: AtomicU64,
    pub fail_acquire: AtomicBool,
    pub fail_rollback: AtomicBool,
    /// Milliseconds every `acquire` sleeps before handing out a connection
    pub acquire_delay_ms: AtomicU64,
    pub closed: AtomicBool,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub discarded: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    /// (identity, sql) of every executed statement
    pub executed: Mutex<Vec<(String, String)>>,
}

impl FakeState {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().unwrap().clone()
    }
}

/// In-memory pool with observable side effects.
///
/// Statements containing `FAIL` return a database error. Every other
/// statement returns one row naming the connection and its parameters.
#[derive(Debug, Clone, Default)]
pub struct FakePool {
    pub state: Arc<FakeState>,
}

impl FakePool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
pub struct FakeConnection {
    identity: String,
    state: Arc<FakeState>,
}

impl LeasedConnection for FakeConnection {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Rows> {
        self.state
            .executed
            .lock()
            .unwrap()
            .push((self.identity.clone(), sql.to_string()));

        if sql.contains("FAIL") {
            return Err(DbError::database(
                format!("statement failed: {}", sql),
                Some("23000".to_string()),
                "Check the statement",
            ));
        }

        let mut row = serde_json::Map::new();
        row.insert("connection".to_string(), json!(self.identity));
        row.insert("params".to_string(), json!(params));
        Ok(vec![row])
    }

    async fn begin(&mut self, _isolation: IsolationLevel) -> DbResult<()> {
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_rollback.load(Ordering::SeqCst) {
            return Err(DbError::connection("Lost connection during rollback", "Reconnect"));
        }
        Ok(())
    }

    async fn release(self) -> DbResult<()> {
        self.state.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn discard(self) -> DbResult<()> {
        self.state.discarded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ConnectionPool for FakePool {
    type Connection = FakeConnection;

    async fn acquire(&self) -> DbResult<FakeConnection> {
        let delay = self.state.acquire_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(DbError::connection("Pool is closed", "Reconnect"));
        }
        if self.state.fail_acquire.load(Ordering::SeqCst) {
            return Err(DbError::connection("Too many connections", "Try again later"));
        }
        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeConnection {
            identity: id.to_string(),
            state: Arc::clone(&self.state),
        })
    }

    async fn end(&self) -> DbResult<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Err(DbError::termination("Pool is already closed"));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

/// Create a file-backed SQLite pool in a fresh temp directory.
///
/// Keep the returned `TempDir` alive for the duration of the test.
pub async fn sqlite_pool(
    target: &str,
    transactions: bool,
    max_connections: u32,
) -> (DbPool, ConnectionConfig, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let url = format!("sqlite:{}?mode=rwc", db_path.display());

    let config = ConnectionConfig::new(
        target,
        url,
        transactions,
        PoolOptions {
            max_connections: Some(max_connections),
            ..Default::default()
        },
    )
    .unwrap();
    let pool = DbPool::connect(&config).await.unwrap();
    (pool, config, temp_dir)
}
