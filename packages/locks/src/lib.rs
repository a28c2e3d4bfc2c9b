//! LedgerGate: Distributed Lock Service
//!
//! Named advisory locks backed by the store's compare-and-set primitive.
//! Used for leader election of maintenance tasks and for singleton
//! coordinator ownership.
//!
//! Features:
//! - Atomic acquire: absent, expired, or same-holder rows succeed
//! - Holder-checked release
//! - TTL as the safety valve against dead holders
//! - Expired-row garbage collection
//!
//! # Example
//!
//! ```rust,ignore
//! use ledgergate_locks::{DistributedLockService, worker_holder_id};
//!
//! let locks = DistributedLockService::new(store);
//! let holder = worker_holder_id();
//! if locks.acquire("maintenance:outbox", &holder, 300).await? {
//!     // ... do the work ...
//!     locks.release("maintenance:outbox", &holder).await?;
//! }
//! ```

use chrono::{DateTime, Duration, Utc};
use ledgergate_store::{LockRow, MemoryStore, StoreError};
use rand::Rng;

/// Errors surfaced by the lock service.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("store failure during lock operation: {0}")]
    Store(#[from] StoreError),
}

/// Build a holder identity in the `worker:<host>:<pid>:<nonce>` format.
pub fn worker_holder_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let pid = std::process::id();
    let nonce: u32 = rand::thread_rng().gen();
    format!("worker:{host}:{pid}:{nonce:08x}")
}

/// Advisory named locks over the store.
#[derive(Debug, Clone)]
pub struct DistributedLockService {
    store: MemoryStore,
}

impl DistributedLockService {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    /// Try to acquire (or extend) a named lock.
    ///
    /// Succeeds if no row exists, the existing row is expired, or the
    /// existing holder matches. At most one holder per name at any instant
    /// where clocks agree within drift tolerance; the TTL is the safety
    /// valve.
    pub async fn acquire(
        &self,
        name: &str,
        holder_id: &str,
        ttl_seconds: i64,
    ) -> Result<bool, LockError> {
        let acquired = self
            .store
            .lock_cas_acquire(name, holder_id, Duration::seconds(ttl_seconds))
            .await?;

        if acquired {
            tracing::debug!(lock = %name, holder = %holder_id, ttl_seconds, "lock acquired");
        } else {
            tracing::debug!(lock = %name, holder = %holder_id, "lock held by another worker");
        }
        Ok(acquired)
    }

    /// Release a named lock. Returns `false` when the holder does not match
    /// (the row is left untouched).
    pub async fn release(&self, name: &str, holder_id: &str) -> Result<bool, LockError> {
        let released = self.store.lock_release(name, holder_id).await?;
        if released {
            tracing::debug!(lock = %name, holder = %holder_id, "lock released");
        }
        Ok(released)
    }

    /// Current lock row for a name, if any.
    pub async fn status(&self, name: &str) -> Option<LockRow> {
        self.store.lock_get(name).await
    }

    /// Delete expired lock rows. Returns how many were removed.
    pub async fn gc_expired(&self, now: DateTime<Utc>) -> Result<usize, LockError> {
        let removed = self.store.lock_gc_expired(now).await?;
        if removed > 0 {
            tracing::info!(removed, "expired lock rows collected");
        }
        Ok(removed)
    }
}
