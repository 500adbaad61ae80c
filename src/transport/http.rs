//! HTTP transport for the lease broker.
//!
//! Every `/db/{target}/...` request carries the caller's session id in the
//! `x-session-id` header. The [`DatabaseHandle`] extractor resolves the
//! session and the target's pool before the handler runs.

use crate::config::RebindPolicy;
use crate::db::{DbConnection, DbPool, LeaseRegistry, PoolManager, generate_reference_no};
use crate::error::{DbError, DbResult};
use crate::handle::{DatabaseHandle, InitErrorResponse};
use crate::models::{IsolationLevel, QueryParam, RetrieveOutput, Rows, Statement};
use crate::session::{MemorySession, SessionStore};
use crate::transport::Transport;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// Header carrying the caller's session id.
pub const SESSION_HEADER: &str = "x-session-id";

/// Handle type used by the HTTP handlers.
pub type Db = DatabaseHandle<MemorySession, DbPool>;

/// Shared state behind every request.
#[derive(Clone)]
pub struct AppState {
    pub pools: PoolManager,
    pub registry: LeaseRegistry<DbConnection>,
    pub sessions: SessionStore,
    pub rebind_policy: RebindPolicy,
}

impl AppState {
    pub fn new(
        pools: PoolManager,
        registry: LeaseRegistry<DbConnection>,
        rebind_policy: RebindPolicy,
    ) -> Self {
        Self {
            pools,
            registry,
            sessions: SessionStore::new(),
            rebind_policy,
        }
    }

    pub fn with_sessions(mut self, sessions: SessionStore) -> Self {
        self.sessions = sessions;
        self
    }
}

impl FromRequestParts<AppState> for Db {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Response> {
        let session_id = parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                DbError::invalid_input(format!("Missing '{}' header", SESSION_HEADER))
                    .into_response()
            })?
            .to_string();

        let Path(target) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(IntoResponse::into_response)?;

        let (pool, transactions) = state
            .pools
            .get(&target)
            .await
            .map_err(IntoResponse::into_response)?;
        let session = state.sessions.get_or_create(&session_id).await;

        Ok(DatabaseHandle::attach(
            session,
            pool,
            &target,
            transactions,
            state.registry.clone(),
        )
        .with_rebind_policy(state.rebind_policy))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectResponse {
    connection_id: String,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    sql: String,
    #[serde(default)]
    params: Vec<QueryParam>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    rows: Rows,
    row_count: usize,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    statements: Vec<Statement>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    results: Vec<Rows>,
}

#[derive(Debug, Deserialize)]
struct TransactionRequest {
    #[serde(default)]
    statements: Vec<Statement>,
    #[serde(default)]
    isolation_level: Option<IsolationLevel>,
    #[serde(default)]
    generate_reference: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionResponse {
    results: Vec<Rows>,
    reference_no: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

async fn connect(db: Db) -> Result<Json<ConnectResponse>, InitErrorResponse> {
    let key = db.initialize_connection().await?;
    Ok(Json(ConnectResponse {
        connection_id: key.to_string(),
    }))
}

async fn query(db: Db, Json(request): Json<QueryRequest>) -> DbResult<Json<QueryResponse>> {
    let rows = db.query(&request.sql, &request.params).await?;
    Ok(Json(QueryResponse {
        row_count: rows.len(),
        rows,
    }))
}

async fn query_batch(db: Db, Json(request): Json<BatchRequest>) -> DbResult<Json<BatchResponse>> {
    let results = db.query_batch(&request.statements).await?;
    Ok(Json(BatchResponse { results }))
}

async fn release(db: Db) -> DbResult<Json<StatusResponse>> {
    db.release_connection().await?;
    Ok(Json(StatusResponse { status: "released" }))
}

async fn begin_transaction(
    db: Db,
    Json(request): Json<TransactionRequest>,
) -> DbResult<Json<TransactionResponse>> {
    let tx = db.transaction(request.isolation_level.unwrap_or_default())?;
    let (results, reference_no) = if request.generate_reference {
        let (results, reference_no) = tx
            .init_with_reference(request.statements, generate_reference_no)
            .await?;
        (results, Some(reference_no))
    } else {
        (tx.init(request.statements).await?, None)
    };
    Ok(Json(TransactionResponse {
        results,
        reference_no,
    }))
}

async fn commit(db: Db) -> DbResult<Json<StatusResponse>> {
    db.transaction(IsolationLevel::default())?.commit().await?;
    Ok(Json(StatusResponse {
        status: "committed",
    }))
}

async fn rollback(db: Db) -> DbResult<Json<StatusResponse>> {
    db.transaction(IsolationLevel::default())?.rollback().await?;
    Ok(Json(StatusResponse {
        status: "rolled_back",
    }))
}

async fn retrieve(db: Db) -> DbResult<Json<RetrieveOutput>> {
    let output = db.transaction(IsolationLevel::default())?.retrieve().await;
    Ok(Json(output))
}

async fn list_leases(State(state): State<AppState>) -> Json<serde_json::Value> {
    let leases = state.registry.list_all().await;
    Json(serde_json::json!({
        "count": leases.len(),
        "ttl_secs": state.registry.ttl().as_secs(),
        "leases": leases,
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "targets": state.pools.targets().await,
        "leases": state.registry.count().await,
    }))
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/db/{target}/connect", post(connect))
        .route("/db/{target}/query", post(query))
        .route("/db/{target}/batch", post(query_batch))
        .route("/db/{target}/release", post(release))
        .route(
            "/db/{target}/transaction",
            post(begin_transaction).get(retrieve),
        )
        .route("/db/{target}/commit", post(commit))
        .route("/db/{target}/rollback", post(rollback))
        .route("/leases", get(list_leases))
        .route("/health", get(health))
        .with_state(state)
}

/// HTTP transport serving the lease broker API.
pub struct HttpTransport {
    state: AppState,
    /// Host to bind to
    host: String,
    /// Port to bind to
    port: u16,
}

impl HttpTransport {
    pub fn new(state: AppState, host: impl Into<String>, port: u16) -> Self {
        Self {
            state,
            host: host.into(),
            port,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Transport for HttpTransport {
    async fn run(&self) -> DbResult<()> {
        let bind_addr = self.bind_addr();
        info!("Starting lease broker with HTTP transport on {}", bind_addr);

        let app = router(self.state.clone());

        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            DbError::connection(
                format!("Failed to bind to {}: {}", bind_addr, e),
                "Check that the port is available",
            )
        })?;

        // Requests blocked on a busy lease may hold shutdown up, so force
        // exit after a timeout once the signal is received
        const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

        let shutdown_notify = Arc::new(tokio::sync::Notify::new());
        let shutdown_notify_clone = shutdown_notify.clone();

        let shutdown_signal = async move {
            wait_for_signal().await;
            shutdown_notify_clone.notify_one();
        };

        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

        tokio::select! {
            result = server => {
                match result {
                    Ok(()) => info!("HTTP server stopped"),
                    Err(e) => {
                        error!(error = %e, "HTTP server error");
                        return Err(DbError::internal(format!("HTTP server error: {}", e)));
                    }
                }
            }
            _ = async {
                shutdown_notify.notified().await;
                info!(
                    timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                    "Waiting for requests to finish (send signal again to force exit)..."
                );

                tokio::select! {
                    _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                        warn!("Graceful shutdown timeout, forcing exit");
                    }
                    _ = wait_for_signal() => {
                        warn!("Received second signal, forcing immediate exit");
                    }
                }
            } => {}
        }

        let leases = self.state.registry.count().await;
        if leases > 0 {
            warn!(leases = leases, "Shutting down with live leases");
        }

        info!("Closing database connections");
        self.state.pools.close_all().await;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
