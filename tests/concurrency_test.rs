//! Concurrent sessions sharing one registry and one pool.

mod common;

use common::{FakePool, FakeState};
use db_lease_broker::DatabaseHandle;
use db_lease_broker::db::LeaseRegistry;
use db_lease_broker::models::{IsolationLevel, QueryParam, Statement};
use db_lease_broker::session::MemorySession;
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;

const SESSIONS: usize = 32;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sessions_never_see_each_others_leases() {
    let pool = FakePool::new();
    let registry = LeaseRegistry::new();

    let mut tasks = Vec::with_capacity(SESSIONS);
    for session_no in 0..SESSIONS {
        let handle = DatabaseHandle::attach(
            MemorySession::new(),
            pool.clone(),
            "orders",
            true,
            registry.clone(),
        );
        tasks.push(tokio::spawn(async move {
            let key = handle.initialize_connection().await.unwrap();
            let identity = key.as_str().trim_start_matches("orders:").to_string();

            for round in 0..5i64 {
                let jitter = rand::thread_rng().gen_range(0..3);
                tokio::time::sleep(Duration::from_millis(jitter)).await;

                let rows = handle
                    .query("SELECT ?, ?", &[QueryParam::Int(session_no as i64), QueryParam::Int(round)])
                    .await
                    .unwrap();
                assert_eq!(rows[0]["connection"], identity.as_str());
                assert_eq!(rows[0]["params"], serde_json::json!([session_no, round]));
            }

            let tx = handle.transaction(IsolationLevel::default()).unwrap();
            let (_, reference_no) = tx
                .init_with_reference(vec![Statement::new("UPDATE t SET n = n + 1")], || {
                    format!("ref_session_{}", session_no)
                })
                .await
                .unwrap();
            assert_eq!(tx.retrieve().await.reference_no, Some(reference_no.clone()));
            tx.commit().await.unwrap();

            handle.release_connection().await.unwrap();
            (key, reference_no)
        }));
    }

    let mut keys = HashSet::new();
    let mut references = HashSet::new();
    for (session_no, task) in tasks.into_iter().enumerate() {
        let (key, reference_no) = task.await.unwrap();
        assert_eq!(reference_no, format!("ref_session_{}", session_no));
        keys.insert(key);
        references.insert(reference_no);
    }

    assert_eq!(keys.len(), SESSIONS);
    assert_eq!(references.len(), SESSIONS);
    assert_eq!(registry.count().await, 0);
    assert_eq!(FakeState::count(&pool.state.released), SESSIONS);
    assert_eq!(FakeState::count(&pool.state.commits), SESSIONS);
    assert_eq!(FakeState::count(&pool.state.discarded), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_on_one_session_are_serialized() {
    let pool = FakePool::new();
    let registry = LeaseRegistry::new();
    let session = MemorySession::new();

    let first = DatabaseHandle::attach(session.clone(), pool.clone(), "orders", false, registry.clone());
    first.initialize_connection().await.unwrap();

    let mut tasks = Vec::new();
    for n in 0..16i64 {
        let handle = DatabaseHandle::attach(
            session.clone(),
            pool.clone(),
            "orders",
            false,
            registry.clone(),
        );
        tasks.push(tokio::spawn(async move {
            handle.query("SELECT ?", &[QueryParam::Int(n)]).await
        }));
    }
    for task in tasks {
        let rows = task.await.unwrap().unwrap();
        assert_eq!(rows[0]["connection"], "1");
    }

    assert_eq!(pool.state.executed().len(), 16);
    assert_eq!(registry.count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sqlite_sessions_get_their_own_rows() {
    let (pool, _, _dir) = common::sqlite_pool("shop", false, 8).await;
    let registry = LeaseRegistry::new();

    let mut tasks = Vec::new();
    for session_no in 0..8i64 {
        let handle = DatabaseHandle::attach(
            MemorySession::new(),
            pool.clone(),
            "shop",
            false,
            registry.clone(),
        );
        tasks.push(tokio::spawn(async move {
            handle.initialize_connection().await.unwrap();
            for _ in 0..10 {
                let rows = handle
                    .query("SELECT ? AS session_no", &[QueryParam::Int(session_no)])
                    .await
                    .unwrap();
                assert_eq!(rows[0]["session_no"], session_no);
            }
            handle.release_connection().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(registry.count().await, 0);
}
