//! Snapshot computation, baselines, and anomaly detection.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use ledgergate_store::{
    AnomalyEvaluationRow, AnomalyRow, AnomalySeverity, BaselineRow, CostSnapshotRow, EntityType,
    SnapshotAggregateRow, SnapshotStatus, SnapshotType, StoreError, StoreScope, UsageRecordRow,
};
use uuid::Uuid;

use crate::types::{SnapshotConfig, SnapshotOutcome};

/// Interim per-entity totals during aggregation.
#[derive(Debug, Clone, Default)]
struct Totals {
    cost_cents: i64,
    requests: i64,
    tokens_in: i64,
    tokens_out: i64,
}

/// Cost snapshot engine.
#[derive(Debug, Clone, Default)]
pub struct SnapshotEngine {
    config: SnapshotConfig,
}

impl SnapshotEngine {
    pub fn new(config: SnapshotConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Severity from deviation magnitude. Bands are monotonic in |deviation|.
    pub fn severity_for_deviation(deviation_pct: f64) -> AnomalySeverity {
        let magnitude = deviation_pct.abs();
        if magnitude < 100.0 {
            AnomalySeverity::Low
        } else if magnitude < 200.0 {
            AnomalySeverity::Medium
        } else if magnitude < 400.0 {
            AnomalySeverity::High
        } else {
            AnomalySeverity::Critical
        }
    }

    /// Run one snapshot for `(tenant, type, period)`.
    ///
    /// Re-running for the same key bumps the row version and converges to
    /// the same rollups modulo append-only input. All writes land in the
    /// caller's scope; the caller commits.
    pub async fn run_snapshot(
        &self,
        scope: &mut StoreScope,
        tenant_id: &str,
        snapshot_type: SnapshotType,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<SnapshotOutcome, StoreError> {
        let started = Instant::now();
        let now = Utc::now();

        let snapshot = scope
            .upsert_snapshot(CostSnapshotRow {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                snapshot_type,
                period_start,
                period_end,
                status: SnapshotStatus::Pending,
                version: 1,
                records_processed: 0,
                computation_ms: 0,
                created_at: now,
                completed_at: None,
                error_message: None,
            })
            .await?;

        if period_end <= period_start {
            let mut failed = snapshot.clone();
            failed.status = SnapshotStatus::Failed;
            failed.error_message = Some("period_end must be after period_start".to_string());
            failed.completed_at = Some(Utc::now());
            scope.update_snapshot(failed.clone()).await?;
            tracing::warn!(
                tenant_id = %tenant_id,
                snapshot_id = %failed.id,
                "snapshot failed validation"
            );
            return Ok(SnapshotOutcome {
                snapshot: failed,
                aggregates: Vec::new(),
                evaluations: Vec::new(),
                anomalies: Vec::new(),
            });
        }

        let mut running = snapshot.clone();
        running.status = SnapshotStatus::Running;
        scope.update_snapshot(running.clone()).await?;

        let usage = scope
            .list_usage_in_range(tenant_id, period_start, period_end)
            .await?;
        let records_processed = usage.len() as i64;

        let aggregates = self
            .build_aggregates(scope, tenant_id, &running.id, &usage)
            .await?;
        for aggregate in &aggregates {
            scope.upsert_snapshot_aggregate(aggregate.clone()).await?;
        }

        let (evaluations, anomalies) = self
            .detect_anomalies(scope, tenant_id, &running.id, &aggregates)
            .await?;

        let mut complete = running;
        complete.status = SnapshotStatus::Complete;
        complete.records_processed = records_processed;
        complete.computation_ms = started.elapsed().as_millis() as i64;
        complete.completed_at = Some(Utc::now());
        scope.update_snapshot(complete.clone()).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            snapshot_id = %complete.id,
            version = complete.version,
            records_processed,
            aggregates = aggregates.len(),
            anomalies = anomalies.len(),
            "snapshot complete"
        );

        Ok(SnapshotOutcome {
            snapshot: complete,
            aggregates,
            evaluations,
            anomalies,
        })
    }

    /// One aggregate per `(entity_type, entity_id)` across the four levels:
    /// tenant-wide, per user (session), per feature (agent), per model.
    async fn build_aggregates(
        &self,
        scope: &StoreScope,
        tenant_id: &str,
        snapshot_id: &str,
        usage: &[UsageRecordRow],
    ) -> Result<Vec<SnapshotAggregateRow>, StoreError> {
        let mut grouped: BTreeMap<(EntityType, Option<String>), Totals> = BTreeMap::new();

        for row in usage {
            let mut keys: Vec<(EntityType, Option<String>)> =
                vec![(EntityType::Tenant, None), (EntityType::Model, Some(row.model.clone()))];
            if let Some(session) = &row.session_id {
                keys.push((EntityType::User, Some(session.clone())));
            }
            if let Some(agent) = &row.agent_id {
                keys.push((EntityType::Feature, Some(agent.clone())));
            }

            for key in keys {
                let totals = grouped.entry(key).or_default();
                totals.cost_cents += row.cost_cents;
                totals.requests += 1;
                totals.tokens_in += row.tokens_in;
                totals.tokens_out += row.tokens_out;
            }
        }

        // The tenant-level row exists even for an empty period, so baselines
        // and anomaly checks see an explicit zero rather than a gap.
        grouped.entry((EntityType::Tenant, None)).or_default();

        let mut aggregates = Vec::with_capacity(grouped.len());
        for ((entity_type, entity_id), totals) in grouped {
            let requests = totals.requests.max(0);
            let (avg_cost, avg_tokens) = if requests > 0 {
                (
                    totals.cost_cents as f64 / requests as f64,
                    (totals.tokens_in + totals.tokens_out) as f64 / requests as f64,
                )
            } else {
                (0.0, 0.0)
            };

            let baseline_7d = scope
                .get_current_baseline(tenant_id, entity_type, entity_id.as_deref(), 7)
                .await?;
            let baseline_30d = scope
                .get_current_baseline(tenant_id, entity_type, entity_id.as_deref(), 30)
                .await?;

            let deviation = |baseline: &Option<BaselineRow>| -> Option<f64> {
                baseline.as_ref().and_then(|b| {
                    if b.avg_daily_cost_cents > 0.0 {
                        Some(
                            (totals.cost_cents as f64 - b.avg_daily_cost_cents)
                                / b.avg_daily_cost_cents
                                * 100.0,
                        )
                    } else {
                        None
                    }
                })
            };

            aggregates.push(SnapshotAggregateRow {
                id: Uuid::new_v4().to_string(),
                snapshot_id: snapshot_id.to_string(),
                tenant_id: tenant_id.to_string(),
                entity_type,
                entity_id,
                total_cost_cents: totals.cost_cents,
                request_count: requests,
                total_input_tokens: totals.tokens_in,
                total_output_tokens: totals.tokens_out,
                avg_cost_per_request_cents: avg_cost,
                avg_tokens_per_request: avg_tokens,
                baseline_7d_avg_cents: baseline_7d.as_ref().map(|b| b.avg_daily_cost_cents),
                baseline_30d_avg_cents: baseline_30d.as_ref().map(|b| b.avg_daily_cost_cents),
                deviation_from_7d_pct: deviation(&baseline_7d),
                deviation_from_30d_pct: deviation(&baseline_30d),
                created_at: Utc::now(),
            });
        }
        Ok(aggregates)
    }

    /// Evaluate every aggregate with a positive 7-day baseline. Evaluations
    /// are written for non-triggering checks too; a zero baseline disables
    /// detection and a missing baseline produces no evaluation.
    async fn detect_anomalies(
        &self,
        scope: &mut StoreScope,
        tenant_id: &str,
        snapshot_id: &str,
        aggregates: &[SnapshotAggregateRow],
    ) -> Result<(Vec<AnomalyEvaluationRow>, Vec<AnomalyRow>), StoreError> {
        let mut evaluations = Vec::new();
        let mut anomalies = Vec::new();

        for aggregate in aggregates {
            let Some(baseline) = aggregate.baseline_7d_avg_cents else {
                continue;
            };
            if baseline <= 0.0 {
                continue;
            }

            let deviation_pct = (aggregate.total_cost_cents as f64 - baseline) / baseline * 100.0;
            let triggered = deviation_pct.abs() >= self.config.anomaly_threshold_pct;

            let evaluation = AnomalyEvaluationRow {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
                entity_type: aggregate.entity_type,
                entity_id: aggregate.entity_id.clone(),
                current_cost_cents: aggregate.total_cost_cents,
                baseline_cents: baseline,
                deviation_pct,
                threshold_pct: self.config.anomaly_threshold_pct,
                triggered,
                evaluated_at: Utc::now(),
            };
            scope.insert_anomaly_evaluation(evaluation.clone()).await?;
            evaluations.push(evaluation);

            if triggered {
                let severity = Self::severity_for_deviation(deviation_pct);
                let anomaly = AnomalyRow {
                    id: Uuid::new_v4().to_string(),
                    tenant_id: tenant_id.to_string(),
                    snapshot_id: snapshot_id.to_string(),
                    entity_type: aggregate.entity_type,
                    entity_id: aggregate.entity_id.clone(),
                    deviation_pct,
                    severity,
                    detected_at: Utc::now(),
                };
                scope.insert_anomaly(anomaly.clone()).await?;
                tracing::warn!(
                    tenant_id = %tenant_id,
                    snapshot_id = %snapshot_id,
                    entity_type = ?aggregate.entity_type,
                    deviation_pct,
                    severity = ?severity,
                    "cost anomaly detected"
                );
                anomalies.push(anomaly);
            }
        }

        Ok((evaluations, anomalies))
    }

    /// Compute baselines for one window from the most recent complete daily
    /// snapshots. Writing the new baseline flips the previous `is_current`
    /// row in the same scope. A baseline with fewer than three samples is
    /// accepted but low-confidence.
    pub async fn compute_baselines(
        &self,
        scope: &mut StoreScope,
        tenant_id: &str,
        window_days: u32,
    ) -> Result<Vec<BaselineRow>, StoreError> {
        let snapshots = scope
            .list_complete_daily_snapshots(tenant_id, window_days as usize)
            .await?;

        // Daily cost series per entity across the window's snapshots.
        let mut series: BTreeMap<(EntityType, Option<String>), Vec<f64>> = BTreeMap::new();
        for snapshot in &snapshots {
            for aggregate in scope.list_snapshot_aggregates(&snapshot.id).await? {
                series
                    .entry((aggregate.entity_type, aggregate.entity_id.clone()))
                    .or_default()
                    .push(aggregate.total_cost_cents as f64);
            }
        }

        let now = Utc::now();
        let mut baselines = Vec::with_capacity(series.len());
        for ((entity_type, entity_id), values) in series {
            if values.is_empty() {
                continue;
            }
            let samples = values.len() as u32;
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let variance =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

            let baseline = BaselineRow {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                entity_type,
                entity_id,
                window_days,
                avg_daily_cost_cents: mean,
                stddev_cents: variance.sqrt(),
                min_cents: min,
                max_cents: max,
                samples_count: samples,
                computed_at: now,
                valid_until: now + Duration::days(1),
                is_current: true,
            };
            scope.insert_baseline(baseline.clone()).await?;

            if !self.config.is_high_confidence(&baseline) {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    entity_type = ?baseline.entity_type,
                    samples,
                    "baseline is low-confidence"
                );
            }
            baselines.push(baseline);
        }
        Ok(baselines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgergate_store::MemoryStore;

    fn usage(
        tenant: &str,
        call: &str,
        cost: i64,
        session: Option<&str>,
        agent: Option<&str>,
        model: &str,
        at: DateTime<Utc>,
    ) -> UsageRecordRow {
        UsageRecordRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.to_string(),
            integration_id: "int-1".to_string(),
            call_id: call.to_string(),
            session_id: session.map(str::to_string),
            agent_id: agent.map(str::to_string),
            provider: "openai".to_string(),
            model: model.to_string(),
            tokens_in: 100,
            tokens_out: 50,
            cost_cents: cost,
            latency_ms: None,
            policy_result: None,
            error_code: None,
            error_message: None,
            created_at: at,
        }
    }

    async fn seed_day(store: &MemoryStore, tenant: &str, day_start: DateTime<Utc>, cost: i64) {
        let mut scope = store.begin().await;
        scope
            .insert_usage_record(usage(
                tenant,
                &format!("call-{}", Uuid::new_v4()),
                cost,
                Some("sess-1"),
                Some("agent-1"),
                "gpt-4o",
                day_start + Duration::hours(1),
            ))
            .await
            .unwrap();
        scope.commit().await.unwrap();
    }

    fn day(offset_days_ago: i64) -> DateTime<Utc> {
        (Utc::now() - Duration::days(offset_days_ago))
            .date_naive()
            .and_time(chrono::NaiveTime::MIN)
            .and_utc()
    }

    #[tokio::test]
    async fn test_snapshot_aggregates_four_levels() {
        let store = MemoryStore::new();
        let engine = SnapshotEngine::default();
        let start = day(0);

        seed_day(&store, "t-1", start, 40).await;

        let mut scope = store.begin().await;
        let outcome = engine
            .run_snapshot(&mut scope, "t-1", SnapshotType::Daily, start, start + Duration::days(1))
            .await
            .unwrap();
        scope.commit().await.unwrap();

        assert_eq!(outcome.snapshot.status, SnapshotStatus::Complete);
        assert_eq!(outcome.snapshot.records_processed, 1);
        let types: Vec<EntityType> = outcome.aggregates.iter().map(|a| a.entity_type).collect();
        assert!(types.contains(&EntityType::Tenant));
        assert!(types.contains(&EntityType::User));
        assert!(types.contains(&EntityType::Feature));
        assert!(types.contains(&EntityType::Model));
    }

    #[tokio::test]
    async fn test_rerun_bumps_version_and_converges() {
        let store = MemoryStore::new();
        let engine = SnapshotEngine::default();
        let start = day(0);

        seed_day(&store, "t-1", start, 40).await;

        let mut scope = store.begin().await;
        let first = engine
            .run_snapshot(&mut scope, "t-1", SnapshotType::Daily, start, start + Duration::days(1))
            .await
            .unwrap();
        scope.commit().await.unwrap();

        let mut scope = store.begin().await;
        let second = engine
            .run_snapshot(&mut scope, "t-1", SnapshotType::Daily, start, start + Duration::days(1))
            .await
            .unwrap();
        scope.commit().await.unwrap();

        assert_eq!(second.snapshot.id, first.snapshot.id);
        assert_eq!(second.snapshot.version, first.snapshot.version + 1);

        let tenant_total = |outcome: &SnapshotOutcome| {
            outcome
                .aggregates
                .iter()
                .find(|a| a.entity_type == EntityType::Tenant)
                .map(|a| a.total_cost_cents)
        };
        assert_eq!(tenant_total(&first), tenant_total(&second));
    }

    #[tokio::test]
    async fn test_invalid_period_marks_failed() {
        let store = MemoryStore::new();
        let engine = SnapshotEngine::default();
        let start = day(0);

        let mut scope = store.begin().await;
        let outcome = engine
            .run_snapshot(&mut scope, "t-1", SnapshotType::Daily, start, start)
            .await
            .unwrap();
        scope.commit().await.unwrap();

        assert_eq!(outcome.snapshot.status, SnapshotStatus::Failed);
        assert!(outcome.snapshot.error_message.is_some());
    }

    #[tokio::test]
    async fn test_baselines_flip_current_and_count_samples() {
        let store = MemoryStore::new();
        let engine = SnapshotEngine::default();

        for offset in 1..=3 {
            let start = day(offset);
            seed_day(&store, "t-1", start, 100).await;
            let mut scope = store.begin().await;
            engine
                .run_snapshot(&mut scope, "t-1", SnapshotType::Daily, start, start + Duration::days(1))
                .await
                .unwrap();
            scope.commit().await.unwrap();
        }

        let mut scope = store.begin().await;
        engine.compute_baselines(&mut scope, "t-1", 7).await.unwrap();
        scope.commit().await.unwrap();

        // Second computation replaces the current row.
        let mut scope = store.begin().await;
        let second = engine.compute_baselines(&mut scope, "t-1", 7).await.unwrap();
        scope.commit().await.unwrap();

        let probe = store.begin().await;
        let current = probe
            .get_current_baseline("t-1", EntityType::Tenant, None, 7)
            .await
            .unwrap()
            .expect("current baseline exists");
        let latest = second
            .iter()
            .find(|b| b.entity_type == EntityType::Tenant)
            .unwrap();
        assert_eq!(current.id, latest.id);
        assert_eq!(current.samples_count, 3);
        assert!((current.avg_daily_cost_cents - 100.0).abs() < 0.01);
        assert!(engine.config().is_high_confidence(&current));
    }

    #[tokio::test]
    async fn test_anomaly_triggers_above_threshold_with_evaluations() {
        let store = MemoryStore::new();
        let engine = SnapshotEngine::default();

        // Three quiet days at 100¢ build the baseline.
        for offset in 1..=3 {
            let start = day(offset);
            seed_day(&store, "t-1", start, 100).await;
            let mut scope = store.begin().await;
            engine
                .run_snapshot(&mut scope, "t-1", SnapshotType::Daily, start, start + Duration::days(1))
                .await
                .unwrap();
            scope.commit().await.unwrap();
        }
        let mut scope = store.begin().await;
        engine.compute_baselines(&mut scope, "t-1", 7).await.unwrap();
        scope.commit().await.unwrap();

        // Today triples the spend: +200% deviation, above the 50% threshold.
        let today = day(0);
        seed_day(&store, "t-1", today, 300).await;
        let mut scope = store.begin().await;
        let outcome = engine
            .run_snapshot(&mut scope, "t-1", SnapshotType::Daily, today, today + Duration::days(1))
            .await
            .unwrap();
        scope.commit().await.unwrap();

        let tenant_anomaly = outcome
            .anomalies
            .iter()
            .find(|a| a.entity_type == EntityType::Tenant)
            .expect("tenant anomaly fired");
        assert!((tenant_anomaly.deviation_pct - 200.0).abs() < 0.01);
        assert_eq!(tenant_anomaly.severity, AnomalySeverity::High);

        // Evaluations exist for every aggregate with a positive baseline,
        // triggered or not.
        assert!(!outcome.evaluations.is_empty());
        assert!(outcome.evaluations.iter().all(|e| e.baseline_cents > 0.0));
    }

    #[tokio::test]
    async fn test_no_baseline_means_no_evaluation() {
        let store = MemoryStore::new();
        let engine = SnapshotEngine::default();
        let start = day(0);

        seed_day(&store, "t-1", start, 500).await;
        let mut scope = store.begin().await;
        let outcome = engine
            .run_snapshot(&mut scope, "t-1", SnapshotType::Daily, start, start + Duration::days(1))
            .await
            .unwrap();
        scope.commit().await.unwrap();

        assert!(outcome.evaluations.is_empty());
        assert!(outcome.anomalies.is_empty());
    }

    #[tokio::test]
    async fn test_zero_baseline_disables_detection() {
        let store = MemoryStore::new();
        let engine = SnapshotEngine::default();

        // Three zero-cost days make a zero baseline.
        for offset in 1..=3 {
            let start = day(offset);
            seed_day(&store, "t-1", start, 0).await;
            let mut scope = store.begin().await;
            engine
                .run_snapshot(&mut scope, "t-1", SnapshotType::Daily, start, start + Duration::days(1))
                .await
                .unwrap();
            scope.commit().await.unwrap();
        }
        let mut scope = store.begin().await;
        engine.compute_baselines(&mut scope, "t-1", 7).await.unwrap();
        scope.commit().await.unwrap();

        // A spike over a zero baseline produces no evaluation and no anomaly.
        let today = day(0);
        seed_day(&store, "t-1", today, 500).await;
        let mut scope = store.begin().await;
        let outcome = engine
            .run_snapshot(&mut scope, "t-1", SnapshotType::Daily, today, today + Duration::days(1))
            .await
            .unwrap();
        scope.commit().await.unwrap();

        assert!(outcome.evaluations.is_empty());
        assert!(outcome.anomalies.is_empty());
    }

    #[test]
    fn test_severity_bands_are_monotonic() {
        assert_eq!(SnapshotEngine::severity_for_deviation(60.0), AnomalySeverity::Low);
        assert_eq!(SnapshotEngine::severity_for_deviation(-150.0), AnomalySeverity::Medium);
        assert_eq!(SnapshotEngine::severity_for_deviation(250.0), AnomalySeverity::High);
        assert_eq!(SnapshotEngine::severity_for_deviation(500.0), AnomalySeverity::Critical);
    }
}
