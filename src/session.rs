//! Caller sessions and the lease bindings stored in them.
//!
//! A session is a small per-caller key/value store. The binder writes the
//! caller's current lease key into it as `{"connectionId": "<key>"}` under a
//! per-target name, so one session can hold leases on several targets.

use crate::config::DEFAULT_SESSION_IDLE_SECS;
use crate::error::{DbError, DbResult};
use crate::models::LeaseKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info};

/// Prefix of the session entry that holds a target's binding.
const SESSION_KEY_PREFIX: &str = "db_lease_broker";

/// Per-caller key/value store.
pub trait Session: Send + Sync + 'static {
    fn get(&self, name: &str) -> Option<Value>;

    fn insert(&self, name: &str, value: Value);

    fn remove(&self, name: &str) -> Option<Value>;

    /// Lock serializing connection initialization for the entry `name`.
    ///
    /// Every call with the same name on the same session returns the same
    /// lock.
    fn init_lock(&self, name: &str) -> Arc<AsyncMutex<()>>;
}

/// In-process session backed by a shared map.
///
/// Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemorySession {
    values: Arc<Mutex<HashMap<String, Value>>>,
    init_locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        // A panic while holding the lock cannot leave the map half-written
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Session for MemorySession {
    fn get(&self, name: &str) -> Option<Value> {
        self.values().get(name).cloned()
    }

    fn insert(&self, name: &str, value: Value) {
        self.values().insert(name.to_string(), value);
    }

    fn remove(&self, name: &str) -> Option<Value> {
        self.values().remove(name)
    }

    fn init_lock(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.init_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(name.to_string()).or_default())
    }
}

/// Interval between idle-session sweeps.
const CLEANUP_INTERVAL_SECS: u64 = 30;

#[derive(Debug)]
struct StoredSession {
    session: MemorySession,
    last_seen: Instant,
}

/// Sessions by caller-supplied session id.
///
/// Session ids come from callers, so entries that go unused for the idle
/// TTL are dropped. The idle TTL should not be shorter than the lease TTL:
/// by the time a session is dropped every lease it bound has expired.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, StoredSession>>>,
    idle_ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_idle_ttl(Duration::from_secs(DEFAULT_SESSION_IDLE_SECS))
    }

    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            idle_ttl,
        }
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    /// Get the session for an id, creating it on first use.
    ///
    /// Marks the session as seen.
    pub async fn get_or_create(&self, session_id: &str) -> MemorySession {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id = %session_id, "Session created");
                StoredSession {
                    session: MemorySession::new(),
                    last_seen: Instant::now(),
                }
            });
        stored.last_seen = Instant::now();
        stored.session.clone()
    }

    pub async fn remove(&self, session_id: &str) -> Option<MemorySession> {
        self.sessions
            .write()
            .await
            .remove(session_id)
            .map(|stored| stored.session)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions not seen within the idle TTL. Returns how many were dropped.
    pub async fn remove_idle(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, stored| stored.last_seen.elapsed() < self.idle_ttl);
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed = removed, remaining = sessions.len(), "Dropped idle sessions");
        }
        removed
    }

    /// Start a background task that drops idle sessions.
    ///
    /// The task stops once every clone of the store is gone.
    pub fn start_cleanup_task(&self) {
        let sessions = Arc::downgrade(&self.sessions);
        let idle_ttl = self.idle_ttl;
        let period = Duration::from_secs(CLEANUP_INTERVAL_SECS).min(idle_ttl);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(sessions) = sessions.upgrade() else {
                    break;
                };
                let store = SessionStore { sessions, idle_ttl };
                store.remove_idle().await;
            }
        });
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Binding {
    #[serde(rename = "connectionId")]
    connection_id: LeaseKey,
}

/// Reads and writes a session's lease binding for one database target.
#[derive(Debug, Clone)]
pub struct SessionBinder {
    target: String,
    session_key: String,
}

impl SessionBinder {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            session_key: format!("{}:{}", SESSION_KEY_PREFIX, target),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Name of the session entry holding the binding.
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Bind the session to a lease key, returning the key it replaced.
    pub fn bind<S: Session + ?Sized>(&self, session: &S, key: &LeaseKey) -> Option<LeaseKey> {
        let previous = self.current(session);
        session.insert(
            &self.session_key,
            serde_json::json!({ "connectionId": key }),
        );
        previous
    }

    /// Get the lease key bound to the session.
    pub fn resolve<S: Session + ?Sized>(&self, session: &S) -> DbResult<LeaseKey> {
        self.current(session)
            .ok_or_else(|| DbError::not_initialized(&self.target))
    }

    /// Remove the binding, returning the key it held.
    pub fn unbind<S: Session + ?Sized>(&self, session: &S) -> Option<LeaseKey> {
        session
            .remove(&self.session_key)
            .and_then(|value| serde_json::from_value::<Binding>(value).ok())
            .map(|binding| binding.connection_id)
    }

    /// Malformed entries count as unbound.
    fn current<S: Session + ?Sized>(&self, session: &S) -> Option<LeaseKey> {
        session
            .get(&self.session_key)
            .and_then(|value| serde_json::from_value::<Binding>(value).ok())
            .map(|binding| binding.connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_resolve() {
        let session = MemorySession::new();
        let binder = SessionBinder::new("orders");

        assert!(binder.bind(&session, &LeaseKey::new("orders", 7)).is_none());
        assert_eq!(
            binder.resolve(&session).unwrap(),
            LeaseKey::from_raw("orders:7")
        );
        assert_eq!(
            session.get("db_lease_broker:orders").unwrap(),
            serde_json::json!({ "connectionId": "orders:7" })
        );
    }

    #[test]
    fn test_bind_returns_previous_key() {
        let session = MemorySession::new();
        let binder = SessionBinder::new("orders");
        binder.bind(&session, &LeaseKey::new("orders", 1));
        let previous = binder.bind(&session, &LeaseKey::new("orders", 2));
        assert_eq!(previous, Some(LeaseKey::new("orders", 1)));
        assert_eq!(binder.resolve(&session).unwrap(), LeaseKey::new("orders", 2));
    }

    #[test]
    fn test_resolve_unbound_session() {
        let session = MemorySession::new();
        let err = SessionBinder::new("orders").resolve(&session).unwrap_err();
        assert!(matches!(err, DbError::NotInitialized { ref target } if target == "orders"));
    }

    #[test]
    fn test_bindings_are_per_target() {
        let session = MemorySession::new();
        let orders = SessionBinder::new("orders");
        let users = SessionBinder::new("users");
        orders.bind(&session, &LeaseKey::new("orders", 1));

        assert!(users.resolve(&session).is_err());
        users.bind(&session, &LeaseKey::new("users", 1));
        assert_eq!(orders.resolve(&session).unwrap(), LeaseKey::new("orders", 1));
    }

    #[test]
    fn test_unbind() {
        let session = MemorySession::new();
        let binder = SessionBinder::new("orders");
        binder.bind(&session, &LeaseKey::new("orders", 1));
        assert_eq!(binder.unbind(&session), Some(LeaseKey::new("orders", 1)));
        assert!(binder.resolve(&session).is_err());
        assert!(binder.unbind(&session).is_none());
    }

    #[test]
    fn test_malformed_binding_counts_as_unbound() {
        let session = MemorySession::new();
        session.insert("db_lease_broker:orders", serde_json::json!("garbage"));
        assert!(SessionBinder::new("orders").resolve(&session).is_err());
    }

    #[tokio::test]
    async fn test_session_store_reuses_sessions() {
        let store = SessionStore::new();
        let a = store.get_or_create("abc").await;
        a.insert("k", serde_json::json!(1));

        let again = store.get_or_create("abc").await;
        assert_eq!(again.get("k"), Some(serde_json::json!(1)));
        assert!(store.get_or_create("other").await.get("k").is_none());
        assert_eq!(store.count().await, 2);

        assert!(store.remove("abc").await.is_some());
        assert_eq!(store.count().await, 1);
    }

    #[test]
    fn test_init_lock_shared_per_name() {
        let session = MemorySession::new();
        let clone = session.clone();
        let a = session.init_lock("db_lease_broker:orders");
        assert!(Arc::ptr_eq(&a, &clone.init_lock("db_lease_broker:orders")));
        assert!(!Arc::ptr_eq(&a, &session.init_lock("db_lease_broker:users")));
        assert!(!Arc::ptr_eq(&a, &MemorySession::new().init_lock("db_lease_broker:orders")));
    }

    #[tokio::test]
    async fn test_idle_sessions_are_removed() {
        let store = SessionStore::with_idle_ttl(Duration::from_millis(100));
        for id in ["a", "b", "c"] {
            store.get_or_create(id).await;
        }
        assert_eq!(store.count().await, 3);

        tokio::time::sleep(Duration::from_millis(60)).await;
        store.get_or_create("a").await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(store.remove_idle().await, 2);
        assert_eq!(store.count().await, 1);
        assert!(store.remove("a").await.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_task_shrinks_store() {
        let store = SessionStore::with_idle_ttl(Duration::from_millis(40));
        store.start_cleanup_task();
        for n in 0..20 {
            store.get_or_create(&format!("caller-{}", n)).await;
        }
        assert_eq!(store.count().await, 20);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.count().await, 0);
    }
}
