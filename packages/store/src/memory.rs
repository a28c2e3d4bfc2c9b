//! In-memory store.
//!
//! Backs the control plane with plain maps behind an async `RwLock`. Writes
//! go through a [`StoreScope`](crate::scope::StoreScope); lock rows are the
//! one exception and use an immediate compare-and-set, because they are the
//! serialization primitive everything else leans on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::rows::*;
use crate::scope::StoreScope;

/// All control-plane tables. Cloned wholesale on commit so a failing staged
/// write leaves the published state untouched.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    pub tenants: HashMap<String, TenantRow>,
    /// Keyed by `(tenant_id, integration_id)`.
    pub integrations: HashMap<(String, String), IntegrationRow>,
    pub usage_records: Vec<UsageRecordRow>,
    /// Uniqueness index for `(tenant_id, call_id)`.
    pub usage_call_ids: HashSet<(String, String)>,
    /// Keyed by `(tenant_id, integration_id, date)`.
    pub usage_daily: HashMap<(String, String, NaiveDate), DailyAggregateRow>,
    /// Keyed by `(tenant_id, snapshot_type, period_start)`.
    pub cost_snapshots: HashMap<(String, SnapshotType, DateTime<Utc>), CostSnapshotRow>,
    /// Keyed by `(snapshot_id, entity_type, entity_id)`.
    pub snapshot_aggregates: HashMap<(String, EntityType, Option<String>), SnapshotAggregateRow>,
    pub baselines: Vec<BaselineRow>,
    pub anomaly_evaluations: Vec<AnomalyEvaluationRow>,
    pub anomalies: Vec<AnomalyRow>,
    pub incidents: HashMap<String, IncidentRow>,
    pub incident_events: Vec<IncidentEventRow>,
    pub locks: HashMap<String, LockRow>,
    pub coordination_audits: Vec<CoordinationAuditRow>,
    pub killswitch_events: Vec<KillSwitchEventRow>,
    pub replay_log: HashMap<String, ReplayLogRow>,
    pub dead_letters: HashMap<String, DeadLetterRow>,
    pub outbox: Vec<OutboxRow>,
    pub matviews: HashMap<String, MatviewRow>,
}

/// In-memory store handing out transactional scopes.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    pub(crate) tables: Arc<RwLock<Tables>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
        }
    }

    /// Begin a transactional scope. The scope buffers writes; nothing is
    /// visible store-wide until `commit`.
    pub async fn begin(&self) -> StoreScope {
        StoreScope::new(Arc::clone(&self.tables))
    }

    // -------------------------------------------------------------------
    // Lock rows: immediate compare-and-set, never staged.
    // -------------------------------------------------------------------

    /// Acquire or extend a named lock. Succeeds when the row is absent,
    /// expired, or already held by `holder_id`.
    pub async fn lock_cas_acquire(
        &self,
        name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;

        if let Some(existing) = tables.locks.get(name) {
            if !existing.is_expired_at(now) && existing.holder_id != holder_id {
                return Ok(false);
            }
        }

        tables.locks.insert(
            name.to_string(),
            LockRow {
                lock_name: name.to_string(),
                holder_id: holder_id.to_string(),
                acquired_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    /// Release a named lock; deletes the row only if the holder matches.
    pub async fn lock_release(&self, name: &str, holder_id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.locks.get(name) {
            Some(row) if row.holder_id == holder_id => {
                tables.locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Current lock row, if any.
    pub async fn lock_get(&self, name: &str) -> Option<LockRow> {
        self.tables.read().await.locks.get(name).cloned()
    }

    /// Delete expired lock rows. Returns how many were removed.
    pub async fn lock_gc_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().await;
        let before = tables.locks.len();
        tables.locks.retain(|_, row| !row.is_expired_at(now));
        Ok(before - tables.locks.len())
    }
}
