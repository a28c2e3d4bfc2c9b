//! The ordered task chain.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, Utc};
use ledgergate_envelopes::Coordinator;
use ledgergate_events::{EventEmitter, EventPayload};
use ledgergate_incidents::IncidentAggregator;
use ledgergate_locks::DistributedLockService;
use ledgergate_store::{DeadLetterRow, MemoryStore, StoreError};

use crate::delivery::DeliverySink;
use crate::report::{TaskReport, TaskStatus};

/// Task names in execution order.
pub const TASK_ORDER: [&str; 5] = ["outbox", "dl_reconcile", "matview", "retention", "lock_gc"];

/// Maintenance configuration.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Per-task deadline.
    pub task_timeout_ms: u64,
    /// Outbox entries drained per run.
    pub outbox_batch_size: usize,
    /// Pending entries with at least this many failed attempts are
    /// reconciled into the dead-letter archive.
    pub dead_letter_after_attempts: u32,
    /// Materialized views refreshed when older than this.
    pub matview_stale_after_seconds: i64,
    pub matview_names: Vec<String>,
    /// Replay/dead-letter rows older than this are purged.
    pub retention_days: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: 300_000,
            outbox_batch_size: 100,
            dead_letter_after_attempts: 3,
            matview_stale_after_seconds: 600,
            matview_names: vec![
                "usage_rollup_mv".to_string(),
                "cost_daily_mv".to_string(),
            ],
            retention_days: 30,
        }
    }
}

/// Lock TTL per task, in seconds.
fn task_lock_ttl(task: &str) -> i64 {
    match task {
        "matview" => 120,
        "retention" => 600,
        _ => 300,
    }
}

/// Runs the ordered maintenance chain under lock election.
pub struct MaintenanceOrchestrator {
    store: MemoryStore,
    locks: DistributedLockService,
    sink: Arc<dyn DeliverySink>,
    emitter: EventEmitter,
    config: MaintenanceConfig,
    holder_id: String,
}

impl MaintenanceOrchestrator {
    pub fn new(
        store: MemoryStore,
        locks: DistributedLockService,
        sink: Arc<dyn DeliverySink>,
        config: MaintenanceConfig,
        holder_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            locks,
            sink,
            emitter: EventEmitter::new(),
            config,
            holder_id: holder_id.into(),
        }
    }

    /// Run every task in order. A lock miss skips, a timeout fails, and
    /// neither stops the chain.
    pub async fn run_all(&self) -> Vec<TaskReport> {
        let mut reports = Vec::with_capacity(TASK_ORDER.len());
        for task in TASK_ORDER {
            reports.push(self.run_task(task).await);
        }

        let failed = reports.iter().filter(|r| r.status == TaskStatus::Failed).count();
        let skipped = reports.iter().filter(|r| r.status == TaskStatus::Skipped).count();
        tracing::info!(
            total = reports.len(),
            failed,
            skipped,
            "maintenance chain finished"
        );

        self.emit_outcomes(&reports).await;
        reports
    }

    /// Every task outcome becomes a structured event. Emission failures are
    /// logged, never fatal; the chain already finished.
    async fn emit_outcomes(&self, reports: &[TaskReport]) {
        let mut scope = self.store.begin().await;
        for report in reports {
            let event = EventPayload::new("maintenance.task_finished", "system", "maintenance")
                .with_actor("worker")
                .with_context(serde_json::json!({
                    "task": report.name,
                    "status": report.status,
                    "detail": report.detail,
                    "items_processed": report.items_processed,
                    "duration_ms": report.duration_ms,
                }));
            if let Err(err) = self.emitter.emit(&mut scope, event).await {
                tracing::error!(task = %report.name, error = %err, "task outcome event dropped");
            }
        }
        if let Err(err) = scope.commit().await {
            tracing::error!(error = %err, "task outcome events not persisted");
        }
    }

    async fn run_task(&self, task: &str) -> TaskReport {
        let lock_name = format!("maintenance:{task}");
        let started = Instant::now();

        match self
            .locks
            .acquire(&lock_name, &self.holder_id, task_lock_ttl(task))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(task = %task, "maintenance task skipped, lock held");
                return TaskReport::skipped(task, "lock_held");
            }
            Err(err) => {
                return TaskReport::failed(task, format!("lock acquire failed: {err}"));
            }
        }

        let deadline = StdDuration::from_millis(self.config.task_timeout_ms);
        let outcome = tokio::time::timeout(deadline, self.execute(task)).await;

        // Guaranteed cleanup: release no matter how the task ended.
        if let Err(err) = self.locks.release(&lock_name, &self.holder_id).await {
            tracing::error!(task = %task, error = %err, "lock release failed");
        }

        let mut report = match outcome {
            Ok(Ok(report)) => report,
            Ok(Err(err)) => {
                tracing::error!(task = %task, error = %err, "maintenance task failed");
                TaskReport::failed(task, err.to_string())
            }
            Err(_) => {
                tracing::error!(task = %task, timeout_ms = self.config.task_timeout_ms, "maintenance task timed out");
                TaskReport::failed(task, "timeout")
            }
        };
        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }

    async fn execute(&self, task: &str) -> Result<TaskReport, StoreError> {
        match task {
            "outbox" => self.run_outbox().await,
            "dl_reconcile" => self.run_dl_reconcile().await,
            "matview" => self.run_matview().await,
            "retention" => self.run_retention().await,
            "lock_gc" => self.run_lock_gc().await,
            other => Ok(TaskReport::failed(other, "unknown task")),
        }
    }

    /// Drain pending outbox entries into the delivery sink. Partial failure
    /// re-queues the remainder for the next run.
    async fn run_outbox(&self) -> Result<TaskReport, StoreError> {
        let mut scope = self.store.begin().await;
        let pending = scope.list_pending_outbox(self.config.outbox_batch_size).await?;

        let mut delivered = Vec::new();
        let mut requeued = Vec::new();
        for entry in &pending {
            match self.sink.deliver(entry).await {
                Ok(()) => delivered.push(entry.id.clone()),
                Err(err) => {
                    tracing::warn!(outbox_id = %entry.id, error = %err, "delivery failed, requeueing");
                    requeued.push(entry.id.clone());
                }
            }
        }

        let delivered_count = delivered.len();
        let requeued_count = requeued.len();
        if !delivered.is_empty() {
            scope.mark_outbox_delivered(delivered, Utc::now()).await?;
        }
        if !requeued.is_empty() {
            scope.requeue_outbox(requeued).await?;
        }
        scope.commit().await?;

        Ok(TaskReport::success(
            "outbox",
            format!("delivered {delivered_count}, requeued {requeued_count}"),
            delivered_count,
        ))
    }

    /// Reconcile entries that keep failing delivery: archive them to the
    /// dead-letter table and acknowledge them. `record_replay` keys the
    /// reconciliation so a retried run stays idempotent.
    async fn run_dl_reconcile(&self) -> Result<TaskReport, StoreError> {
        let mut scope = self.store.begin().await;
        let pending = scope.list_pending_outbox(usize::MAX).await?;

        let mut reconciled = Vec::new();
        for entry in pending {
            if entry.attempts < self.config.dead_letter_after_attempts {
                continue;
            }
            if scope.record_replay(&entry.id, "outbox").await? {
                scope
                    .archive_dead_letter(DeadLetterRow {
                        dl_msg_id: entry.id.clone(),
                        stream: "outbox".to_string(),
                        payload: entry.payload.clone(),
                        archived_at: Utc::now(),
                    })
                    .await?;
            }
            reconciled.push(entry.id);
        }

        let count = reconciled.len();
        if !reconciled.is_empty() {
            scope.mark_outbox_delivered(reconciled, Utc::now()).await?;
        }
        scope.commit().await?;

        Ok(TaskReport::success(
            "dl_reconcile",
            format!("reconciled {count}"),
            count,
        ))
    }

    /// Refresh stale materialized views, one per-view lock each.
    async fn run_matview(&self) -> Result<TaskReport, StoreError> {
        let mut scope = self.store.begin().await;
        let existing = scope.list_matviews().await?;
        let now = Utc::now();
        let stale_cutoff = now - Duration::seconds(self.config.matview_stale_after_seconds);

        let mut refreshed = 0usize;
        let mut details = Vec::new();
        for view in &self.config.matview_names {
            let fresh = existing
                .iter()
                .find(|row| &row.name == view)
                .is_some_and(|row| row.refreshed_at >= stale_cutoff);
            if fresh {
                continue;
            }

            let view_lock = format!("matview:{view}");
            match self.locks.acquire(&view_lock, &self.holder_id, task_lock_ttl("matview")).await {
                Ok(true) => {
                    scope.touch_matview(view, now).await?;
                    refreshed += 1;
                    if let Err(err) = self.locks.release(&view_lock, &self.holder_id).await {
                        tracing::error!(view = %view, error = %err, "matview lock release failed");
                    }
                }
                Ok(false) => details.push(format!("{view}: lock_held")),
                Err(err) => details.push(format!("{view}: {err}")),
            }
        }
        scope.commit().await?;

        Ok(TaskReport::success(
            "matview",
            if details.is_empty() {
                format!("refreshed {refreshed}")
            } else {
                format!("refreshed {refreshed}; {}", details.join(", "))
            },
            refreshed,
        ))
    }

    /// Purge replay-log and dead-letter rows past retention.
    async fn run_retention(&self) -> Result<TaskReport, StoreError> {
        let mut scope = self.store.begin().await;
        let cutoff = Utc::now() - Duration::days(self.config.retention_days);
        let replays = scope.purge_replay_before(cutoff).await?;
        let dead_letters = scope.purge_dead_letters_before(cutoff).await?;
        scope.commit().await?;

        Ok(TaskReport::success(
            "retention",
            format!("purged {replays} replay rows, {dead_letters} dead letters"),
            replays + dead_letters,
        ))
    }

    /// Delete expired lock rows.
    async fn run_lock_gc(&self) -> Result<TaskReport, StoreError> {
        let removed = self
            .locks
            .gc_expired(Utc::now())
            .await
            .map_err(|err| StoreError::permanent(err.to_string()))?;
        Ok(TaskReport::success(
            "lock_gc",
            format!("removed {removed} expired locks"),
            removed,
        ))
    }

    /// Sweep hook: expire envelopes whose timebox lapsed. Hard expiry fires
    /// here without manual intervention.
    pub async fn sweep_envelopes(&self, coordinator: &Coordinator) -> TaskReport {
        let expired = coordinator.expire_due(Utc::now()).await;
        TaskReport::success(
            "envelope_expiry",
            format!("expired {}", expired.len()),
            expired.len(),
        )
    }

    /// Sweep hook: auto-resolve idle incidents.
    pub async fn sweep_incidents(&self, aggregator: &IncidentAggregator) -> TaskReport {
        let mut scope = self.store.begin().await;
        let resolved = match aggregator.auto_resolve_idle(&mut scope, Utc::now()).await {
            Ok(resolved) => resolved,
            Err(err) => return TaskReport::failed("incident_sweep", err.to_string()),
        };
        if let Err(err) = scope.commit().await {
            return TaskReport::failed("incident_sweep", err.to_string());
        }
        TaskReport::success(
            "incident_sweep",
            format!("auto-resolved {}", resolved.len()),
            resolved.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryError, DeliverySink, LogDeliverySink};
    use crate::report::all_succeeded;
    use async_trait::async_trait;
    use ledgergate_store::{OutboxRow, OutboxStatus};

    fn outbox_entry(id: &str, attempts: u32) -> OutboxRow {
        OutboxRow {
            id: id.to_string(),
            tenant_id: "t-1".to_string(),
            event_type: "incidents.created".to_string(),
            payload: serde_json::json!({ "incident_id": id }),
            status: OutboxStatus::Pending,
            attempts,
            enqueued_at: Utc::now(),
            delivered_at: None,
        }
    }

    fn orchestrator(store: &MemoryStore, sink: Arc<dyn DeliverySink>) -> MaintenanceOrchestrator {
        MaintenanceOrchestrator::new(
            store.clone(),
            DistributedLockService::new(store.clone()),
            sink,
            MaintenanceConfig::default(),
            "worker:test:1:abcd",
        )
    }

    struct FailingSink;

    #[async_trait]
    impl DeliverySink for FailingSink {
        async fn deliver(&self, _entry: &OutboxRow) -> Result<(), DeliveryError> {
            Err(DeliveryError::Downstream("sink offline".to_string()))
        }
    }

    struct SlowSink;

    #[async_trait]
    impl DeliverySink for SlowSink {
        async fn deliver(&self, _entry: &OutboxRow) -> Result<(), DeliveryError> {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_all_happy_path() {
        let store = MemoryStore::new();
        let mut scope = store.begin().await;
        scope.enqueue_outbox(outbox_entry("evt-1", 0)).await.unwrap();
        scope.enqueue_outbox(outbox_entry("evt-2", 0)).await.unwrap();
        scope.commit().await.unwrap();

        let orchestrator = orchestrator(&store, Arc::new(LogDeliverySink));
        let reports = orchestrator.run_all().await;

        assert_eq!(reports.len(), 5);
        assert!(all_succeeded(&reports));
        assert_eq!(reports[0].name, "outbox");
        assert_eq!(reports[0].items_processed, 2);

        // The seeded entries were delivered; what remains pending is only
        // the chain's own task-outcome events.
        let probe = store.begin().await;
        let pending = probe.list_pending_outbox(20).await.unwrap();
        assert!(pending.iter().all(|e| e.event_type == "maintenance.task_finished"));
        assert_eq!(pending.len(), 5);
    }

    #[tokio::test]
    async fn test_lock_held_skips_but_chain_continues() {
        let store = MemoryStore::new();
        let locks = DistributedLockService::new(store.clone());
        locks
            .acquire("maintenance:outbox", "worker:other:2:zzzz", 300)
            .await
            .unwrap();

        let orchestrator = orchestrator(&store, Arc::new(LogDeliverySink));
        let reports = orchestrator.run_all().await;

        assert_eq!(reports[0].status, TaskStatus::Skipped);
        assert_eq!(reports[0].detail, "lock_held");
        // The rest of the chain still ran.
        for report in &reports[1..] {
            assert_eq!(report.status, TaskStatus::Success);
        }
    }

    #[tokio::test]
    async fn test_failed_delivery_requeues_remainder() {
        let store = MemoryStore::new();
        let mut scope = store.begin().await;
        scope.enqueue_outbox(outbox_entry("evt-1", 0)).await.unwrap();
        scope.commit().await.unwrap();

        let orchestrator = orchestrator(&store, Arc::new(FailingSink));
        let reports = orchestrator.run_all().await;
        assert_eq!(reports[0].status, TaskStatus::Success);
        assert_eq!(reports[0].items_processed, 0);

        let probe = store.begin().await;
        let pending = probe.list_pending_outbox(20).await.unwrap();
        let entry = pending.iter().find(|e| e.id == "evt-1").expect("still pending");
        assert_eq!(entry.attempts, 1);
    }

    #[tokio::test]
    async fn test_dl_reconcile_archives_poison_entries_idempotently() {
        let store = MemoryStore::new();
        let mut scope = store.begin().await;
        scope.enqueue_outbox(outbox_entry("poison-1", 3)).await.unwrap();
        scope.enqueue_outbox(outbox_entry("fresh-1", 0)).await.unwrap();
        scope.commit().await.unwrap();

        // Failing sink keeps fresh-1 pending; reconcile archives poison-1.
        let orchestrator = orchestrator(&store, Arc::new(FailingSink));
        orchestrator.run_all().await;

        let probe = store.begin().await;
        assert_eq!(probe.count_dead_letters().await.unwrap(), 1);
        let pending = probe.list_pending_outbox(20).await.unwrap();
        assert!(pending.iter().any(|e| e.id == "fresh-1"));
        assert!(pending.iter().all(|e| e.id != "poison-1"));

        // Second run finds nothing new to archive.
        orchestrator.run_all().await;
        let probe = store.begin().await;
        assert_eq!(probe.count_dead_letters().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_matview_refresh_and_retention_and_gc() {
        let store = MemoryStore::new();

        // An expired foreign lock for gc to collect.
        let locks = DistributedLockService::new(store.clone());
        locks.acquire("stale:lock", "worker:dead:9:ffff", -10).await.unwrap();

        let orchestrator = orchestrator(&store, Arc::new(LogDeliverySink));
        let reports = orchestrator.run_all().await;

        let matview = reports.iter().find(|r| r.name == "matview").unwrap();
        assert_eq!(matview.items_processed, 2);

        let lock_gc = reports.iter().find(|r| r.name == "lock_gc").unwrap();
        assert_eq!(lock_gc.status, TaskStatus::Success);
        assert!(locks.status("stale:lock").await.is_none());

        // A second immediate run refreshes nothing: both views are fresh.
        let reports = orchestrator.run_all().await;
        let matview = reports.iter().find(|r| r.name == "matview").unwrap();
        assert_eq!(matview.items_processed, 0);
    }

    #[tokio::test]
    async fn test_timeout_marks_failed_without_stopping_chain() {
        let store = MemoryStore::new();
        let mut scope = store.begin().await;
        scope.enqueue_outbox(outbox_entry("evt-1", 0)).await.unwrap();
        scope.commit().await.unwrap();

        let orchestrator = MaintenanceOrchestrator::new(
            store.clone(),
            DistributedLockService::new(store.clone()),
            Arc::new(SlowSink),
            MaintenanceConfig {
                task_timeout_ms: 5,
                ..MaintenanceConfig::default()
            },
            "worker:test:1:abcd",
        );

        let reports = orchestrator.run_all().await;
        assert_eq!(reports[0].status, TaskStatus::Failed);
        assert_eq!(reports[0].detail, "timeout");
        // Later tasks still ran, and the task lock was released.
        assert!(reports[1..].iter().all(|r| r.status != TaskStatus::Skipped));

        let locks = DistributedLockService::new(store);
        assert!(locks.status("maintenance:outbox").await.is_none());
    }

    #[tokio::test]
    async fn test_envelope_and_incident_sweep_hooks() {
        let store = MemoryStore::new();
        let orchestrator = orchestrator(&store, Arc::new(LogDeliverySink));

        let coordinator = Coordinator::new();
        let report = orchestrator.sweep_envelopes(&coordinator).await;
        assert_eq!(report.status, TaskStatus::Success);
        assert_eq!(report.items_processed, 0);

        let aggregator = IncidentAggregator::default();
        let report = orchestrator.sweep_incidents(&aggregator).await;
        assert_eq!(report.status, TaskStatus::Success);
    }
}
