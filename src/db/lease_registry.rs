//! Lease registry for connections checked out across requests.
//!
//! Each leased connection lives here until it is dispatched (explicit
//! release) or evicted by its expiry timer. The registry owns the connection
//! exclusively; callers borrow it through a [`LeaseGuard`] that serializes
//! operations on the same key.

use crate::config::DEFAULT_LEASE_TTL_SECS;
use crate::db::pool::LeasedConnection;
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, LeaseKey, LeaseMetadata};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// A leased connection and the state tracked alongside it.
#[derive(Debug)]
pub struct LeaseRecord<C> {
    pub connection: C,
    /// Caller-visible reference number of the last successful transaction init
    pub reference_no: Option<String>,
    /// Isolation level of the open transaction, `None` when idle
    pub transaction: Option<IsolationLevel>,
    pub created_at: Instant,
}

impl<C> LeaseRecord<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            reference_no: None,
            transaction: None,
            created_at: Instant::now(),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }
}

/// Fields to merge into an existing record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct LeaseUpdate {
    pub reference_no: Option<Option<String>>,
}

impl LeaseUpdate {
    pub fn reference_no(reference_no: Option<String>) -> Self {
        Self {
            reference_no: Some(reference_no),
        }
    }
}

/// Exclusive access to a live lease record.
pub type LeaseGuard<C> = OwnedMappedMutexGuard<Option<LeaseRecord<C>>, LeaseRecord<C>>;

/// The slot is emptied when the lease is retired; waiters then see `None`.
type LeaseSlot<C> = Arc<Mutex<Option<LeaseRecord<C>>>>;

type LeaseMap<C> = RwLock<HashMap<LeaseKey, LeaseEntry<C>>>;

struct LeaseEntry<C> {
    slot: LeaseSlot<C>,
    expiry: AbortHandle,
    generation: u64,
    created_at: Instant,
}

/// Registry of leased connections, keyed by [`LeaseKey`].
///
/// Cloning is cheap and every clone shares the same leases.
pub struct LeaseRegistry<C> {
    leases: Arc<LeaseMap<C>>,
    next_generation: Arc<AtomicU64>,
    ttl: Duration,
    /// System start time for converting Instant to DateTime
    system_start_instant: Instant,
    /// System start time as UTC DateTime
    system_start_datetime: DateTime<Utc>,
}

impl<C> Clone for LeaseRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            leases: Arc::clone(&self.leases),
            next_generation: Arc::clone(&self.next_generation),
            ttl: self.ttl,
            system_start_instant: self.system_start_instant,
            system_start_datetime: self.system_start_datetime,
        }
    }
}

impl<C: LeasedConnection> LeaseRegistry<C> {
    /// Create a registry with the default 60 second lease TTL.
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(DEFAULT_LEASE_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            leases: Arc::new(RwLock::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(1)),
            ttl,
            system_start_instant: Instant::now(),
            system_start_datetime: Utc::now(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a freshly acquired connection and arm its expiry timer.
    ///
    /// A duplicate key is a programming error: the existing lease is left
    /// alone and the new connection is dropped, which hands it back to its
    /// pool.
    pub async fn create(&self, key: LeaseKey, connection: C) -> DbResult<()> {
        let mut leases = self.leases.write().await;
        if leases.contains_key(&key) {
            return Err(DbError::internal(format!(
                "Lease '{}' is already registered",
                key
            )));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let record = LeaseRecord::new(connection);
        let created_at = record.created_at;
        let expiry = self.arm_expiry(key.clone(), generation);

        leases.insert(
            key.clone(),
            LeaseEntry {
                slot: Arc::new(Mutex::new(Some(record))),
                expiry,
                generation,
                created_at,
            },
        );

        info!(
            lease_key = %key,
            ttl_secs = self.ttl.as_secs(),
            "Lease created"
        );
        Ok(())
    }

    /// Lock a lease record for exclusive use.
    ///
    /// Waits while another caller holds the same record. Fails with
    /// `LeaseNotFound` if the key is unknown or the lease was retired while
    /// waiting.
    pub async fn get(&self, key: &LeaseKey) -> DbResult<LeaseGuard<C>> {
        let slot = {
            let leases = self.leases.read().await;
            leases.get(key).map(|entry| Arc::clone(&entry.slot))
        }
        .ok_or_else(|| DbError::lease_not_found(key))?;

        let guard = slot.lock_owned().await;
        OwnedMutexGuard::try_map(guard, |record| record.as_mut())
            .map_err(|_| DbError::lease_not_found(key))
    }

    /// Merge fields into a lease record.
    pub async fn update(&self, key: &LeaseKey, update: LeaseUpdate) -> DbResult<()> {
        let mut record = self.get(key).await?;
        if let Some(reference_no) = update.reference_no {
            record.reference_no = reference_no;
        }
        debug!(lease_key = %key, "Lease updated");
        Ok(())
    }

    /// Retire a lease explicitly and hand its record back.
    ///
    /// Cancels the expiry timer. The caller is responsible for returning the
    /// connection to its pool.
    pub async fn dispatch(&self, key: &LeaseKey) -> DbResult<LeaseRecord<C>> {
        let entry = {
            let mut leases = self.leases.write().await;
            leases.remove(key)
        }
        .ok_or_else(|| DbError::lease_not_found(key))?;

        entry.expiry.abort();

        let record = entry
            .slot
            .lock()
            .await
            .take()
            .ok_or_else(|| DbError::lease_not_found(key))?;

        info!(
            lease_key = %key,
            held_ms = record.created_at.elapsed().as_millis() as u64,
            "Lease dispatched"
        );
        Ok(record)
    }

    pub async fn contains(&self, key: &LeaseKey) -> bool {
        self.leases.read().await.contains_key(key)
    }

    /// Get the number of live leases.
    pub async fn count(&self) -> usize {
        self.leases.read().await.len()
    }

    /// List all live leases with their metadata.
    ///
    /// Never waits on a record: one that is locked by a request is reported
    /// as busy, without its transaction state.
    pub async fn list_all(&self) -> Vec<LeaseMetadata> {
        let entries: Vec<(LeaseKey, LeaseSlot<C>, Instant)> = {
            let leases = self.leases.read().await;
            leases
                .iter()
                .map(|(key, entry)| (key.clone(), Arc::clone(&entry.slot), entry.created_at))
                .collect()
        };

        let mut list = Vec::with_capacity(entries.len());
        for (lease_key, slot, created_at) in entries {
            let (transaction, reference_no, busy) = match slot.try_lock() {
                Ok(slot) => match slot.as_ref() {
                    Some(record) => (record.transaction, record.reference_no.clone(), false),
                    // Retired since the map was read
                    None => continue,
                },
                Err(_) => (None, None, true),
            };

            // Convert Instant to DateTime by calculating offset from system start
            let offset_from_start = created_at.duration_since(self.system_start_instant);
            let started_at = self.system_start_datetime + offset_from_start;

            list.push(LeaseMetadata {
                lease_key,
                started_at,
                age_secs: created_at.elapsed().as_secs(),
                ttl_secs: self.ttl.as_secs(),
                busy,
                transaction,
                reference_no,
            });
        }
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    fn arm_expiry(&self, key: LeaseKey, generation: u64) -> AbortHandle {
        let leases = Arc::downgrade(&self.leases);
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            evict(leases, key, generation).await;
        })
        .abort_handle()
    }
}

impl<C: LeasedConnection> Default for LeaseRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Expiry timer body: retire the lease unless it was already replaced.
async fn evict<C: LeasedConnection>(leases: Weak<LeaseMap<C>>, key: LeaseKey, generation: u64) {
    let Some(leases) = leases.upgrade() else {
        return;
    };

    let entry = {
        let mut leases = leases.write().await;
        match leases.get(&key) {
            Some(entry) if entry.generation == generation => leases.remove(&key),
            _ => None,
        }
    };
    let Some(entry) = entry else {
        return;
    };

    let Some(mut record) = entry.slot.lock().await.take() else {
        return;
    };

    warn!(
        lease_key = %key,
        age_secs = record.created_at.elapsed().as_secs(),
        in_transaction = record.in_transaction(),
        "Evicting expired lease"
    );

    if record.in_transaction() {
        // Best effort rollback - the connection is closed either way
        if let Err(e) = record.connection.rollback().await {
            warn!(lease_key = %key, error = %e, "Rollback of expired lease failed");
        }
    }

    if let Err(e) = record.connection.discard().await {
        warn!(lease_key = %key, error = %e, "Failed to close expired connection");
    }
}
