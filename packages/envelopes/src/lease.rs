//! Singleton coordinator ownership.
//!
//! One coordinator instance per tenant wins a named lock; losers stand down
//! rather than coordinate concurrently.

use ledgergate_locks::{DistributedLockService, LockError};

/// A tenant-scoped coordination lease over the lock service.
#[derive(Debug, Clone)]
pub struct CoordinatorLease {
    locks: DistributedLockService,
    tenant_id: String,
    holder_id: String,
    ttl_seconds: i64,
}

impl CoordinatorLease {
    pub fn new(
        locks: DistributedLockService,
        tenant_id: impl Into<String>,
        holder_id: impl Into<String>,
        ttl_seconds: i64,
    ) -> Self {
        Self {
            locks,
            tenant_id: tenant_id.into(),
            holder_id: holder_id.into(),
            ttl_seconds,
        }
    }

    fn lock_name(&self) -> String {
        format!("coordinator:{}", self.tenant_id)
    }

    /// Try to take (or extend) coordination ownership for the tenant.
    pub async fn try_acquire(&self) -> Result<bool, LockError> {
        self.locks
            .acquire(&self.lock_name(), &self.holder_id, self.ttl_seconds)
            .await
    }

    /// Give up ownership.
    pub async fn release(&self) -> Result<bool, LockError> {
        self.locks.release(&self.lock_name(), &self.holder_id).await
    }
}
