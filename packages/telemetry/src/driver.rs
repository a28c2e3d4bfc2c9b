//! Usage record writes and derived reads.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use ledgergate_store::{DailyAggregateRow, StoreError, StoreScope, UsageRecordRow};
use uuid::Uuid;

use crate::types::{BatchIngestOutcome, IntegrationUsage, UsageDraft, UsageSummary};

/// Append-only usage writes and aggregate/historical reads. Stateless; every
/// call flushes into the caller's scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryDriver;

impl TelemetryDriver {
    pub fn new() -> Self {
        Self
    }

    fn row_from_draft(&self, draft: UsageDraft) -> UsageRecordRow {
        UsageRecordRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: draft.tenant_id,
            integration_id: draft.integration_id,
            call_id: draft.call_id,
            session_id: draft.session_id,
            agent_id: draft.agent_id,
            provider: draft.provider,
            model: draft.model,
            tokens_in: draft.tokens_in,
            tokens_out: draft.tokens_out,
            cost_cents: draft.cost_cents,
            latency_ms: draft.latency_ms,
            policy_result: draft.policy_result,
            error_code: draft.error_code,
            error_message: draft.error_message,
            created_at: draft.created_at.unwrap_or_else(Utc::now),
        }
    }

    /// Append a single usage record. Returns `false` when the call id was
    /// already ingested for this tenant.
    pub async fn create_usage(
        &self,
        scope: &mut StoreScope,
        draft: UsageDraft,
    ) -> Result<bool, StoreError> {
        let tenant_id = draft.tenant_id.clone();
        let call_id = draft.call_id.clone();
        let accepted = scope.insert_usage_record(self.row_from_draft(draft)).await?;
        if !accepted {
            tracing::debug!(tenant_id = %tenant_id, call_id = %call_id, "duplicate usage record dropped");
        }
        Ok(accepted)
    }

    /// Append a batch, splitting call ids into accepted and duplicates.
    pub async fn create_usage_batch(
        &self,
        scope: &mut StoreScope,
        drafts: Vec<UsageDraft>,
    ) -> Result<BatchIngestOutcome, StoreError> {
        let mut outcome = BatchIngestOutcome::default();
        for draft in drafts {
            let call_id = draft.call_id.clone();
            if self.create_usage(scope, draft).await? {
                outcome.accepted.push(call_id);
            } else {
                outcome.duplicates.push(call_id);
            }
        }
        Ok(outcome)
    }

    /// Tenant-wide rollup over `[start, end)`.
    pub async fn fetch_usage_summary(
        &self,
        scope: &StoreScope,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageSummary, StoreError> {
        let rows = scope.list_usage_in_range(tenant_id, start, end).await?;
        let mut summary = UsageSummary::default();
        for row in rows {
            summary.request_count += 1;
            summary.tokens_in += row.tokens_in;
            summary.tokens_out += row.tokens_out;
            summary.cost_cents += row.cost_cents;
            if row.error_code.is_some() {
                summary.error_count += 1;
            }
        }
        Ok(summary)
    }

    /// Per-integration rollups over `[start, end)`, ordered by integration.
    pub async fn fetch_per_integration_usage(
        &self,
        scope: &StoreScope,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<IntegrationUsage>, StoreError> {
        let rows = scope.list_usage_in_range(tenant_id, start, end).await?;
        let mut grouped: BTreeMap<String, IntegrationUsage> = BTreeMap::new();
        for row in rows {
            let entry = grouped
                .entry(row.integration_id.clone())
                .or_insert_with(|| IntegrationUsage {
                    integration_id: row.integration_id.clone(),
                    request_count: 0,
                    tokens_in: 0,
                    tokens_out: 0,
                    cost_cents: 0,
                    error_count: 0,
                });
            entry.request_count += 1;
            entry.tokens_in += row.tokens_in;
            entry.tokens_out += row.tokens_out;
            entry.cost_cents += row.cost_cents;
            if row.error_code.is_some() {
                entry.error_count += 1;
            }
        }
        Ok(grouped.into_values().collect())
    }

    /// Paged history, newest first.
    pub async fn fetch_usage_history(
        &self,
        scope: &StoreScope,
        tenant_id: &str,
        integration_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UsageRecordRow>, StoreError> {
        scope
            .list_usage_history(tenant_id, integration_id, limit, offset)
            .await
    }

    pub async fn fetch_daily_aggregates(
        &self,
        scope: &StoreScope,
        tenant_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregateRow>, StoreError> {
        scope.list_daily_aggregates(tenant_id, from, to).await
    }

    /// Month-to-date spend for an integration, in cents.
    pub async fn fetch_budget_usage(
        &self,
        scope: &StoreScope,
        tenant_id: &str,
        integration_id: &str,
        period_start: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let rows = scope
            .list_usage_since(tenant_id, Some(integration_id), period_start)
            .await?;
        Ok(rows.iter().map(|r| r.cost_cents).sum())
    }

    /// Month-to-date token consumption for an integration.
    pub async fn fetch_token_usage(
        &self,
        scope: &StoreScope,
        tenant_id: &str,
        integration_id: &str,
        period_start: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let rows = scope
            .list_usage_since(tenant_id, Some(integration_id), period_start)
            .await?;
        Ok(rows.iter().map(|r| r.tokens_in + r.tokens_out).sum())
    }

    /// Calls recorded for an integration since the window start. Append +
    /// windowed count admits brief overshoot near window edges; that is
    /// bounded by a single requester's insert rate.
    pub async fn fetch_rate_count(
        &self,
        scope: &StoreScope,
        tenant_id: &str,
        integration_id: &str,
        window_start: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        scope
            .count_usage_since(tenant_id, integration_id, window_start)
            .await
    }

    /// Idempotent upsert on `(tenant_id, integration_id, date)`.
    pub async fn upsert_daily_aggregate(
        &self,
        scope: &mut StoreScope,
        row: DailyAggregateRow,
    ) -> Result<(), StoreError> {
        scope.upsert_daily_aggregate(row).await
    }

    /// Recompute the daily aggregates for one tenant-day from the raw usage
    /// records. Deterministic: re-running over the same (append-only) input
    /// converges to the same rollups.
    pub async fn compute_daily_aggregates(
        &self,
        scope: &StoreScope,
        tenant_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<DailyAggregateRow>, StoreError> {
        let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
        let end = start + chrono::Duration::days(1);
        let rows = scope.list_usage_in_range(tenant_id, start, end).await?;

        let mut grouped: BTreeMap<String, DailyAggregateRow> = BTreeMap::new();
        for row in rows {
            let entry = grouped
                .entry(row.integration_id.clone())
                .or_insert_with(|| DailyAggregateRow {
                    tenant_id: tenant_id.to_string(),
                    integration_id: row.integration_id.clone(),
                    date,
                    request_count: 0,
                    tokens_in: 0,
                    tokens_out: 0,
                    cost_cents: 0,
                    error_count: 0,
                    updated_at: Utc::now(),
                });
            entry.request_count += 1;
            entry.tokens_in += row.tokens_in;
            entry.tokens_out += row.tokens_out;
            entry.cost_cents += row.cost_cents;
            if row.error_code.is_some() {
                entry.error_count += 1;
            }
        }
        Ok(grouped.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgergate_store::MemoryStore;

    fn draft(tenant: &str, call: &str, cost: i64) -> UsageDraft {
        UsageDraft {
            tenant_id: tenant.to_string(),
            integration_id: "int-1".to_string(),
            call_id: call.to_string(),
            session_id: Some("sess-1".to_string()),
            agent_id: None,
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            tokens_in: 120,
            tokens_out: 80,
            cost_cents: cost,
            latency_ms: Some(300),
            policy_result: None,
            error_code: None,
            error_message: None,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_usage_is_at_most_once() {
        let store = MemoryStore::new();
        let driver = TelemetryDriver::new();

        let mut scope = store.begin().await;
        assert!(driver.create_usage(&mut scope, draft("t-1", "c-1", 5)).await.unwrap());
        assert!(!driver.create_usage(&mut scope, draft("t-1", "c-1", 5)).await.unwrap());
        scope.commit().await.unwrap();

        let probe = store.begin().await;
        let summary = driver
            .fetch_usage_summary(
                &probe,
                "t-1",
                Utc::now() - chrono::Duration::hours(1),
                Utc::now() + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(summary.request_count, 1);
        assert_eq!(summary.cost_cents, 5);
    }

    #[tokio::test]
    async fn test_batch_splits_accepted_and_duplicates() {
        let store = MemoryStore::new();
        let driver = TelemetryDriver::new();

        let mut scope = store.begin().await;
        driver.create_usage(&mut scope, draft("t-1", "c-1", 5)).await.unwrap();
        scope.commit().await.unwrap();

        let mut scope = store.begin().await;
        let outcome = driver
            .create_usage_batch(
                &mut scope,
                vec![draft("t-1", "c-1", 5), draft("t-1", "c-2", 7), draft("t-1", "c-3", 9)],
            )
            .await
            .unwrap();
        scope.commit().await.unwrap();

        assert_eq!(outcome.accepted, vec!["c-2", "c-3"]);
        assert_eq!(outcome.duplicates, vec!["c-1"]);
    }

    #[tokio::test]
    async fn test_budget_token_and_rate_reads() {
        let store = MemoryStore::new();
        let driver = TelemetryDriver::new();

        let mut scope = store.begin().await;
        for i in 0..4 {
            driver
                .create_usage(&mut scope, draft("t-1", &format!("c-{i}"), 25))
                .await
                .unwrap();
        }
        scope.commit().await.unwrap();

        let probe = store.begin().await;
        let since = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(
            driver.fetch_budget_usage(&probe, "t-1", "int-1", since).await.unwrap(),
            100
        );
        assert_eq!(
            driver.fetch_token_usage(&probe, "t-1", "int-1", since).await.unwrap(),
            4 * 200
        );
        assert_eq!(
            driver.fetch_rate_count(&probe, "t-1", "int-1", since).await.unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn test_compute_daily_aggregates_is_deterministic() {
        let store = MemoryStore::new();
        let driver = TelemetryDriver::new();
        let date = Utc::now().date_naive();

        let mut scope = store.begin().await;
        let mut errored = draft("t-1", "c-err", 3);
        errored.error_code = Some("timeout".to_string());
        driver.create_usage(&mut scope, draft("t-1", "c-1", 5)).await.unwrap();
        driver.create_usage(&mut scope, draft("t-1", "c-2", 7)).await.unwrap();
        driver.create_usage(&mut scope, errored).await.unwrap();
        scope.commit().await.unwrap();

        let probe = store.begin().await;
        let first = driver.compute_daily_aggregates(&probe, "t-1", date).await.unwrap();
        let second = driver.compute_daily_aggregates(&probe, "t-1", date).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].request_count, 3);
        assert_eq!(first[0].cost_cents, 15);
        assert_eq!(first[0].error_count, 1);
        assert_eq!(first[0].request_count, second[0].request_count);
        assert_eq!(first[0].cost_cents, second[0].cost_cents);
    }

    #[tokio::test]
    async fn test_history_is_paged_newest_first() {
        let store = MemoryStore::new();
        let driver = TelemetryDriver::new();

        let mut scope = store.begin().await;
        for i in 0..5 {
            let mut d = draft("t-1", &format!("c-{i}"), 1);
            d.created_at = Some(Utc::now() - chrono::Duration::minutes(5 - i));
            driver.create_usage(&mut scope, d).await.unwrap();
        }
        scope.commit().await.unwrap();

        let probe = store.begin().await;
        let page = driver
            .fetch_usage_history(&probe, "t-1", None, 2, 0)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].call_id, "c-4");
        assert_eq!(page[1].call_id, "c-3");
    }
}
