//! Transactional scope.
//!
//! The scope buffers typed writes and publishes them atomically on `commit`.
//! The adapter never decides when to commit; the dispatcher (or the
//! maintenance orchestrator, for its own work) owns that call. `flush`
//! validates the staged writes without publishing and is idempotent within a
//! scope.
//!
//! Reads observe committed state. The handful of checks that must see the
//! scope's own staged writes (usage uniqueness, snapshot version resolution,
//! open-incident lookup, replay/dead-letter idempotence) consult a small
//! overlay kept alongside the staged operations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::memory::Tables;
use crate::rows::*;

type WriteOp = Box<dyn Fn(&mut Tables) -> Result<(), StoreError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeState {
    Active,
    Committed,
    RolledBack,
}

impl ScopeState {
    fn name(self) -> &'static str {
        match self {
            ScopeState::Active => "active",
            ScopeState::Committed => "committed",
            ScopeState::RolledBack => "rolled_back",
        }
    }
}

/// A buffered transactional scope over the store.
pub struct StoreScope {
    tables: Arc<RwLock<Tables>>,
    staged: Vec<WriteOp>,
    state: ScopeState,
    staged_usage_keys: HashSet<(String, String)>,
    staged_snapshots: HashMap<(String, SnapshotType, DateTime<Utc>), CostSnapshotRow>,
    staged_incidents: HashMap<String, IncidentRow>,
    staged_replays: HashSet<String>,
    staged_dead_letters: HashSet<String>,
}

impl StoreScope {
    pub(crate) fn new(tables: Arc<RwLock<Tables>>) -> Self {
        Self {
            tables,
            staged: Vec::new(),
            state: ScopeState::Active,
            staged_usage_keys: HashSet::new(),
            staged_snapshots: HashMap::new(),
            staged_incidents: HashMap::new(),
            staged_replays: HashSet::new(),
            staged_dead_letters: HashSet::new(),
        }
    }

    fn ensure_active(&self) -> Result<(), StoreError> {
        if self.state != ScopeState::Active {
            return Err(StoreError::ScopeFinished {
                state: self.state.name().to_string(),
            });
        }
        Ok(())
    }

    fn stage(&mut self, op: WriteOp) {
        self.staged.push(op);
    }

    /// Number of writes currently staged.
    pub fn staged_writes(&self) -> usize {
        self.staged.len()
    }

    // -------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------

    /// Validate the staged writes against the current committed state
    /// without publishing them. Idempotent within the scope.
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        self.ensure_active()?;
        let tables = self.tables.read().await;
        let mut probe = tables.clone();
        drop(tables);
        for op in &self.staged {
            op(&mut probe)?;
        }
        Ok(())
    }

    /// Atomically publish every staged write. All-or-nothing: a failing
    /// write leaves the store untouched and the scope active for rollback.
    pub async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_active()?;
        let mut tables = self.tables.write().await;
        let mut next = tables.clone();
        for op in &self.staged {
            op(&mut next)?;
        }
        *tables = next;
        self.state = ScopeState::Committed;
        self.staged.clear();
        Ok(())
    }

    /// Discard every staged write.
    pub async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.staged.clear();
        self.state = ScopeState::RolledBack;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Tenants and integrations
    // -------------------------------------------------------------------

    pub async fn upsert_tenant(&mut self, row: TenantRow) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.stage(Box::new(move |t| {
            t.tenants.insert(row.tenant_id.clone(), row.clone());
            Ok(())
        }));
        Ok(())
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantRow>, StoreError> {
        Ok(self.tables.read().await.tenants.get(tenant_id).cloned())
    }

    pub async fn upsert_integration(&mut self, row: IntegrationRow) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.stage(Box::new(move |t| {
            t.integrations
                .insert((row.tenant_id.clone(), row.id.clone()), row.clone());
            Ok(())
        }));
        Ok(())
    }

    pub async fn get_integration(
        &self,
        tenant_id: &str,
        integration_id: &str,
    ) -> Result<Option<IntegrationRow>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .integrations
            .get(&(tenant_id.to_string(), integration_id.to_string()))
            .filter(|row| !row.is_deleted())
            .cloned())
    }

    pub async fn list_integrations(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<IntegrationRow>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<IntegrationRow> = tables
            .integrations
            .values()
            .filter(|row| row.tenant_id == tenant_id && !row.is_deleted())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    // -------------------------------------------------------------------
    // Usage records
    // -------------------------------------------------------------------

    /// Append a usage record. Returns `false` when the `(tenant, call_id)`
    /// pair was already ingested (at-most-once).
    pub async fn insert_usage_record(
        &mut self,
        row: UsageRecordRow,
    ) -> Result<bool, StoreError> {
        self.ensure_active()?;
        let key = (row.tenant_id.clone(), row.call_id.clone());
        if self.staged_usage_keys.contains(&key) {
            return Ok(false);
        }
        if self.tables.read().await.usage_call_ids.contains(&key) {
            return Ok(false);
        }
        self.staged_usage_keys.insert(key);
        self.stage(Box::new(move |t| {
            let key = (row.tenant_id.clone(), row.call_id.clone());
            // Another scope may have committed the same call between stage
            // and commit; at-most-once means the duplicate is dropped, not
            // an error.
            if t.usage_call_ids.contains(&key) {
                return Ok(());
            }
            t.usage_call_ids.insert(key);
            t.usage_records.push(row.clone());
            Ok(())
        }));
        Ok(true)
    }

    pub async fn list_usage_since(
        &self,
        tenant_id: &str,
        integration_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRecordRow>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .usage_records
            .iter()
            .filter(|r| {
                r.tenant_id == tenant_id
                    && r.created_at >= since
                    && integration_id.is_none_or(|id| r.integration_id == id)
            })
            .cloned()
            .collect())
    }

    pub async fn list_usage_in_range(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageRecordRow>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .usage_records
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.created_at >= start && r.created_at < end)
            .cloned()
            .collect())
    }

    pub async fn list_usage_history(
        &self,
        tenant_id: &str,
        integration_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UsageRecordRow>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<UsageRecordRow> = tables
            .usage_records
            .iter()
            .filter(|r| {
                r.tenant_id == tenant_id && integration_id.is_none_or(|id| r.integration_id == id)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn count_usage_since(
        &self,
        tenant_id: &str,
        integration_id: &str,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .usage_records
            .iter()
            .filter(|r| {
                r.tenant_id == tenant_id
                    && r.integration_id == integration_id
                    && r.created_at >= since
            })
            .count())
    }

    // -------------------------------------------------------------------
    // Daily aggregates
    // -------------------------------------------------------------------

    pub async fn upsert_daily_aggregate(
        &mut self,
        row: DailyAggregateRow,
    ) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.stage(Box::new(move |t| {
            t.usage_daily.insert(
                (row.tenant_id.clone(), row.integration_id.clone(), row.date),
                row.clone(),
            );
            Ok(())
        }));
        Ok(())
    }

    pub async fn list_daily_aggregates(
        &self,
        tenant_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregateRow>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<DailyAggregateRow> = tables
            .usage_daily
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.date >= from && r.date <= to)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.date, &a.integration_id).cmp(&(b.date, &b.integration_id)));
        Ok(rows)
    }

    // -------------------------------------------------------------------
    // Cost snapshots
    // -------------------------------------------------------------------

    /// Insert a snapshot, or bump the version of the existing row for the
    /// same `(tenant, type, period_start)`. Returns the resolved row.
    pub async fn upsert_snapshot(
        &mut self,
        row: CostSnapshotRow,
    ) -> Result<CostSnapshotRow, StoreError> {
        self.ensure_active()?;
        let key = (row.tenant_id.clone(), row.snapshot_type, row.period_start);

        let existing = match self.staged_snapshots.get(&key) {
            Some(staged) => Some(staged.clone()),
            None => self.tables.read().await.cost_snapshots.get(&key).cloned(),
        };

        let resolved = match existing {
            Some(prior) => CostSnapshotRow {
                id: prior.id.clone(),
                version: prior.version + 1,
                created_at: prior.created_at,
                status: row.status,
                ..row.clone()
            },
            None => row.clone(),
        };

        self.staged_snapshots.insert(key, resolved.clone());
        self.stage(Box::new(move |t| {
            let key = (row.tenant_id.clone(), row.snapshot_type, row.period_start);
            match t.cost_snapshots.get(&key) {
                Some(prior) => {
                    let bumped = CostSnapshotRow {
                        id: prior.id.clone(),
                        version: prior.version + 1,
                        created_at: prior.created_at,
                        status: row.status,
                        ..row.clone()
                    };
                    t.cost_snapshots.insert(key, bumped);
                }
                None => {
                    t.cost_snapshots.insert(key, row.clone());
                }
            }
            Ok(())
        }));
        Ok(resolved)
    }

    /// Update snapshot progress fields by id.
    pub async fn update_snapshot(&mut self, row: CostSnapshotRow) -> Result<(), StoreError> {
        self.ensure_active()?;
        let key = (row.tenant_id.clone(), row.snapshot_type, row.period_start);
        if let Some(staged) = self.staged_snapshots.get_mut(&key) {
            staged.status = row.status;
            staged.records_processed = row.records_processed;
            staged.computation_ms = row.computation_ms;
            staged.completed_at = row.completed_at;
            staged.error_message = row.error_message.clone();
        }
        self.stage(Box::new(move |t| {
            if let Some(target) = t
                .cost_snapshots
                .values_mut()
                .find(|snapshot| snapshot.id == row.id)
            {
                target.status = row.status;
                target.records_processed = row.records_processed;
                target.computation_ms = row.computation_ms;
                target.completed_at = row.completed_at;
                target.error_message = row.error_message.clone();
            }
            Ok(())
        }));
        Ok(())
    }

    pub async fn get_snapshot_by_key(
        &self,
        tenant_id: &str,
        snapshot_type: SnapshotType,
        period_start: DateTime<Utc>,
    ) -> Result<Option<CostSnapshotRow>, StoreError> {
        let key = (tenant_id.to_string(), snapshot_type, period_start);
        if let Some(staged) = self.staged_snapshots.get(&key) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.tables.read().await.cost_snapshots.get(&key).cloned())
    }

    pub async fn get_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Result<Option<CostSnapshotRow>, StoreError> {
        if let Some(staged) = self
            .staged_snapshots
            .values()
            .find(|row| row.id == snapshot_id)
        {
            return Ok(Some(staged.clone()));
        }
        Ok(self
            .tables
            .read()
            .await
            .cost_snapshots
            .values()
            .find(|row| row.id == snapshot_id)
            .cloned())
    }

    /// Most recent complete daily snapshots for a tenant, newest first.
    pub async fn list_complete_daily_snapshots(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<CostSnapshotRow>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<CostSnapshotRow> = tables
            .cost_snapshots
            .values()
            .filter(|r| {
                r.tenant_id == tenant_id
                    && r.snapshot_type == SnapshotType::Daily
                    && r.status == SnapshotStatus::Complete
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.period_start.cmp(&a.period_start));
        rows.truncate(limit);
        Ok(rows)
    }

    // -------------------------------------------------------------------
    // Snapshot aggregates, baselines, anomalies
    // -------------------------------------------------------------------

    pub async fn upsert_snapshot_aggregate(
        &mut self,
        row: SnapshotAggregateRow,
    ) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.stage(Box::new(move |t| {
            t.snapshot_aggregates.insert(
                (row.snapshot_id.clone(), row.entity_type, row.entity_id.clone()),
                row.clone(),
            );
            Ok(())
        }));
        Ok(())
    }

    pub async fn list_snapshot_aggregates(
        &self,
        snapshot_id: &str,
    ) -> Result<Vec<SnapshotAggregateRow>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<SnapshotAggregateRow> = tables
            .snapshot_aggregates
            .values()
            .filter(|r| r.snapshot_id == snapshot_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.entity_type as u8, &a.entity_id).cmp(&(b.entity_type as u8, &b.entity_id))
        });
        Ok(rows)
    }

    /// Insert a baseline and flip the previous `is_current` row for the same
    /// `(tenant, entity, window)` in the same write.
    pub async fn insert_baseline(&mut self, row: BaselineRow) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.stage(Box::new(move |t| {
            for existing in t.baselines.iter_mut() {
                if existing.tenant_id == row.tenant_id
                    && existing.entity_type == row.entity_type
                    && existing.entity_id == row.entity_id
                    && existing.window_days == row.window_days
                {
                    existing.is_current = false;
                }
            }
            t.baselines.push(row.clone());
            Ok(())
        }));
        Ok(())
    }

    pub async fn get_current_baseline(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        entity_id: Option<&str>,
        window_days: u32,
    ) -> Result<Option<BaselineRow>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .baselines
            .iter()
            .find(|r| {
                r.is_current
                    && r.tenant_id == tenant_id
                    && r.entity_type == entity_type
                    && r.entity_id.as_deref() == entity_id
                    && r.window_days == window_days
            })
            .cloned())
    }

    pub async fn insert_anomaly_evaluation(
        &mut self,
        row: AnomalyEvaluationRow,
    ) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.stage(Box::new(move |t| {
            t.anomaly_evaluations.push(row.clone());
            Ok(())
        }));
        Ok(())
    }

    pub async fn insert_anomaly(&mut self, row: AnomalyRow) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.stage(Box::new(move |t| {
            t.anomalies.push(row.clone());
            Ok(())
        }));
        Ok(())
    }

    pub async fn list_anomalies(&self, tenant_id: &str) -> Result<Vec<AnomalyRow>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .anomalies
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    pub async fn list_anomaly_evaluations(
        &self,
        snapshot_id: &str,
    ) -> Result<Vec<AnomalyEvaluationRow>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .anomaly_evaluations
            .iter()
            .filter(|r| r.snapshot_id == snapshot_id)
            .cloned()
            .collect())
    }

    // -------------------------------------------------------------------
    // Incidents
    // -------------------------------------------------------------------

    pub async fn insert_incident(&mut self, row: IncidentRow) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.staged_incidents.insert(row.id.clone(), row.clone());
        self.stage(Box::new(move |t| {
            t.incidents.insert(row.id.clone(), row.clone());
            Ok(())
        }));
        Ok(())
    }

    pub async fn update_incident(&mut self, row: IncidentRow) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.staged_incidents.insert(row.id.clone(), row.clone());
        self.stage(Box::new(move |t| {
            t.incidents.insert(row.id.clone(), row.clone());
            Ok(())
        }));
        Ok(())
    }

    /// Open incident matching the aggregation window key, observing staged
    /// writes so a burst within one scope lands in one incident.
    pub async fn find_open_incident(
        &self,
        tenant_id: &str,
        trigger_type: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<IncidentRow>, StoreError> {
        let matches = |r: &IncidentRow| {
            r.tenant_id == tenant_id
                && r.trigger_type == trigger_type
                && r.window_start == window_start
                && r.status == IncidentStatus::Open
        };
        if let Some(staged) = self.staged_incidents.values().find(|r| matches(r)) {
            return Ok(Some(staged.clone()));
        }
        Ok(self
            .tables
            .read()
            .await
            .incidents
            .values()
            .find(|r| matches(r))
            .cloned())
    }

    pub async fn get_incident(
        &self,
        tenant_id: &str,
        incident_id: &str,
    ) -> Result<Option<IncidentRow>, StoreError> {
        if let Some(staged) = self.staged_incidents.get(incident_id) {
            if staged.tenant_id == tenant_id {
                return Ok(Some(staged.clone()));
            }
        }
        Ok(self
            .tables
            .read()
            .await
            .incidents
            .get(incident_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    pub async fn list_incidents(&self, tenant_id: &str) -> Result<Vec<IncidentRow>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<IncidentRow> = tables
            .incidents
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(rows)
    }

    /// Incidents started since a cutoff, including staged creations.
    pub async fn count_incidents_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let tables = self.tables.read().await;
        let committed = tables
            .incidents
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.started_at >= since)
            .count();
        let staged_only = self
            .staged_incidents
            .values()
            .filter(|r| {
                r.tenant_id == tenant_id
                    && r.started_at >= since
                    && !tables.incidents.contains_key(&r.id)
            })
            .count();
        Ok(committed + staged_only)
    }

    pub async fn list_open_incidents_idle_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<IncidentRow>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .incidents
            .values()
            .filter(|r| r.status == IncidentStatus::Open && r.updated_at < cutoff)
            .cloned()
            .collect())
    }

    pub async fn insert_incident_event(
        &mut self,
        row: IncidentEventRow,
    ) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.stage(Box::new(move |t| {
            t.incident_events.push(row.clone());
            Ok(())
        }));
        Ok(())
    }

    pub async fn list_incident_events(
        &self,
        incident_id: &str,
    ) -> Result<Vec<IncidentEventRow>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .incident_events
            .iter()
            .filter(|r| r.incident_id == incident_id)
            .cloned()
            .collect())
    }

    // -------------------------------------------------------------------
    // Coordination audit + kill-switch events
    // -------------------------------------------------------------------

    pub async fn insert_coordination_audit(
        &mut self,
        row: CoordinationAuditRow,
    ) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.stage(Box::new(move |t| {
            t.coordination_audits.push(row.clone());
            Ok(())
        }));
        Ok(())
    }

    pub async fn list_coordination_audits(
        &self,
        envelope_id: Option<&str>,
    ) -> Result<Vec<CoordinationAuditRow>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .coordination_audits
            .iter()
            .filter(|r| envelope_id.is_none_or(|id| r.envelope_id == id))
            .cloned()
            .collect())
    }

    pub async fn insert_killswitch_event(
        &mut self,
        row: KillSwitchEventRow,
    ) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.stage(Box::new(move |t| {
            t.killswitch_events.push(row.clone());
            Ok(())
        }));
        Ok(())
    }

    pub async fn list_killswitch_events(&self) -> Result<Vec<KillSwitchEventRow>, StoreError> {
        Ok(self.tables.read().await.killswitch_events.clone())
    }

    // -------------------------------------------------------------------
    // Replay log, dead letters, outbox, matviews
    // -------------------------------------------------------------------

    /// Record a replay marker. Returns `false` when the original message was
    /// already replayed (idempotent).
    pub async fn record_replay(
        &mut self,
        original_msg_id: &str,
        stream: &str,
    ) -> Result<bool, StoreError> {
        self.ensure_active()?;
        if self.staged_replays.contains(original_msg_id) {
            return Ok(false);
        }
        if self
            .tables
            .read()
            .await
            .replay_log
            .contains_key(original_msg_id)
        {
            return Ok(false);
        }
        self.staged_replays.insert(original_msg_id.to_string());
        let row = ReplayLogRow {
            original_msg_id: original_msg_id.to_string(),
            stream: stream.to_string(),
            replayed_at: Utc::now(),
        };
        self.stage(Box::new(move |t| {
            t.replay_log
                .entry(row.original_msg_id.clone())
                .or_insert_with(|| row.clone());
            Ok(())
        }));
        Ok(true)
    }

    /// Archive a dead-lettered message. Returns `false` on duplicate.
    pub async fn archive_dead_letter(&mut self, row: DeadLetterRow) -> Result<bool, StoreError> {
        self.ensure_active()?;
        if self.staged_dead_letters.contains(&row.dl_msg_id) {
            return Ok(false);
        }
        if self
            .tables
            .read()
            .await
            .dead_letters
            .contains_key(&row.dl_msg_id)
        {
            return Ok(false);
        }
        self.staged_dead_letters.insert(row.dl_msg_id.clone());
        self.stage(Box::new(move |t| {
            t.dead_letters
                .entry(row.dl_msg_id.clone())
                .or_insert_with(|| row.clone());
            Ok(())
        }));
        Ok(true)
    }

    /// Delete replay rows older than the cutoff. Returns the count visible
    /// at call time.
    pub async fn purge_replay_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.ensure_active()?;
        let count = self
            .tables
            .read()
            .await
            .replay_log
            .values()
            .filter(|r| r.replayed_at < cutoff)
            .count();
        self.stage(Box::new(move |t| {
            t.replay_log.retain(|_, r| r.replayed_at >= cutoff);
            Ok(())
        }));
        Ok(count)
    }

    /// Delete dead-letter rows older than the cutoff.
    pub async fn purge_dead_letters_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.ensure_active()?;
        let count = self
            .tables
            .read()
            .await
            .dead_letters
            .values()
            .filter(|r| r.archived_at < cutoff)
            .count();
        self.stage(Box::new(move |t| {
            t.dead_letters.retain(|_, r| r.archived_at >= cutoff);
            Ok(())
        }));
        Ok(count)
    }

    pub async fn count_replay_rows(&self) -> Result<usize, StoreError> {
        Ok(self.tables.read().await.replay_log.len())
    }

    pub async fn count_dead_letters(&self) -> Result<usize, StoreError> {
        Ok(self.tables.read().await.dead_letters.len())
    }

    pub async fn enqueue_outbox(&mut self, row: OutboxRow) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.stage(Box::new(move |t| {
            t.outbox.push(row.clone());
            Ok(())
        }));
        Ok(())
    }

    pub async fn list_pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRow>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .outbox
            .iter()
            .filter(|r| r.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    pub async fn mark_outbox_delivered(
        &mut self,
        ids: Vec<String>,
        delivered_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.stage(Box::new(move |t| {
            for row in t.outbox.iter_mut() {
                if ids.contains(&row.id) {
                    row.status = OutboxStatus::Delivered;
                    row.delivered_at = Some(delivered_at);
                }
            }
            Ok(())
        }));
        Ok(())
    }

    /// Bump the attempt counter on entries that failed delivery; they stay
    /// pending for the next run.
    pub async fn requeue_outbox(&mut self, ids: Vec<String>) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.stage(Box::new(move |t| {
            for row in t.outbox.iter_mut() {
                if ids.contains(&row.id) {
                    row.attempts += 1;
                }
            }
            Ok(())
        }));
        Ok(())
    }

    pub async fn touch_matview(
        &mut self,
        name: &str,
        refreshed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_active()?;
        let name = name.to_string();
        self.stage(Box::new(move |t| {
            let entry = t.matviews.entry(name.clone()).or_insert_with(|| MatviewRow {
                name: name.clone(),
                refreshed_at,
                refresh_count: 0,
            });
            entry.refreshed_at = refreshed_at;
            entry.refresh_count += 1;
            Ok(())
        }));
        Ok(())
    }

    pub async fn list_matviews(&self) -> Result<Vec<MatviewRow>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<MatviewRow> = tables.matviews.values().cloned().collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }
}
