//! Typed rows for the control-plane tables.
//!
//! Every row carries its `tenant_id`; the store never exposes a read that
//! crosses tenants in a single call.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Tenant status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
}

/// Top-level isolation unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRow {
    pub tenant_id: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
}

/// Integration lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Active,
    Disabled,
    Error,
}

/// Credential health as observed by background checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Failing,
}

/// A configured LLM provider integration. Soft-deleted, never hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationRow {
    pub id: String,
    pub tenant_id: String,
    pub provider_type: String,
    pub name: String,
    pub status: IntegrationStatus,
    pub health_state: HealthState,
    pub health_message: Option<String>,
    /// 0 means no budget limit configured.
    pub budget_limit_cents: i64,
    /// 0 means no monthly token limit configured.
    pub token_limit_month: i64,
    /// 0 means no rate limit configured.
    pub rate_limit_rpm: i64,
    pub credential_ref: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl IntegrationRow {
    pub fn has_budget_limit(&self) -> bool {
        self.budget_limit_cents > 0
    }

    pub fn has_token_limit(&self) -> bool {
        self.token_limit_month > 0
    }

    pub fn has_rate_limit(&self) -> bool {
        self.rate_limit_rpm > 0
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Immutable append-only usage record. Unique on `(tenant_id, call_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecordRow {
    pub id: String,
    pub tenant_id: String,
    pub integration_id: String,
    pub call_id: String,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_cents: i64,
    pub latency_ms: Option<i64>,
    pub policy_result: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Idempotent daily rollup. Unique on `(tenant_id, integration_id, date)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyAggregateRow {
    pub tenant_id: String,
    pub integration_id: String,
    pub date: NaiveDate,
    pub request_count: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_cents: i64,
    pub error_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Daily,
    Hourly,
}

/// Snapshot computation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

/// Aggregated cost view over a period.
/// Unique on `(tenant_id, snapshot_type, period_start)`; re-insertion bumps
/// `version` and reuses the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSnapshotRow {
    pub id: String,
    pub tenant_id: String,
    pub snapshot_type: SnapshotType,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: SnapshotStatus,
    pub version: i64,
    pub records_processed: i64,
    pub computation_ms: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Entity granularity for snapshot rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Tenant,
    User,
    Feature,
    Model,
}

/// Per-entity rollup within a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotAggregateRow {
    pub id: String,
    pub snapshot_id: String,
    pub tenant_id: String,
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
    pub total_cost_cents: i64,
    pub request_count: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub avg_cost_per_request_cents: f64,
    pub avg_tokens_per_request: f64,
    pub baseline_7d_avg_cents: Option<f64>,
    pub baseline_30d_avg_cents: Option<f64>,
    pub deviation_from_7d_pct: Option<f64>,
    pub deviation_from_30d_pct: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Historical cost baseline. Exactly one `is_current` row per
/// `(tenant, entity_type, entity_id, window_days)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineRow {
    pub id: String,
    pub tenant_id: String,
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
    pub window_days: u32,
    pub avg_daily_cost_cents: f64,
    pub stddev_cents: f64,
    pub min_cents: f64,
    pub max_cents: f64,
    pub samples_count: u32,
    pub computed_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub is_current: bool,
}

/// One row per anomaly threshold check, triggered or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvaluationRow {
    pub id: String,
    pub tenant_id: String,
    pub snapshot_id: String,
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
    pub current_cost_cents: i64,
    pub baseline_cents: f64,
    pub deviation_pct: f64,
    pub threshold_pct: f64,
    pub triggered: bool,
    pub evaluated_at: DateTime<Utc>,
}

/// Anomaly severity, computed from deviation magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// The triggered subset of evaluations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRow {
    pub id: String,
    pub tenant_id: String,
    pub snapshot_id: String,
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
    pub deviation_pct: f64,
    pub severity: AnomalySeverity,
    pub detected_at: DateTime<Utc>,
}

/// Incident severity ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Incident lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
}

/// A grouped record of failures within a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRow {
    pub id: String,
    pub tenant_id: String,
    pub trigger_type: String,
    pub trigger_value: String,
    pub title: String,
    pub severity: IncidentSeverity,
    pub status: IncidentStatus,
    pub calls_affected: i64,
    pub cost_delta_cents: i64,
    pub window_start: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Bounded; the aggregator caps growth.
    pub related_call_ids: Vec<String>,
    pub auto_action: Option<String>,
}

/// Incident timeline entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentEventRow {
    pub id: String,
    pub incident_id: String,
    pub event_type: String,
    pub description: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Advisory named lock row. `lock_name` is the primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRow {
    pub lock_name: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRow {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// One append-only row per coordination decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationAuditRow {
    pub audit_id: String,
    pub envelope_id: String,
    pub envelope_class: String,
    pub decision: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub conflicting_envelope_id: Option<String>,
    pub preempting_envelope_id: Option<String>,
    pub active_envelopes_count: usize,
}

/// Append-only kill-switch activation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchEventRow {
    pub event_id: String,
    pub triggered_by: String,
    pub trigger_reason: String,
    pub activated_at: DateTime<Utc>,
    pub rollback_status: String,
    pub rollback_completed_at: Option<DateTime<Utc>>,
    pub active_envelopes_count: usize,
}

/// Idempotent replay marker, keyed by the original message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayLogRow {
    pub original_msg_id: String,
    pub stream: String,
    pub replayed_at: DateTime<Utc>,
}

/// Idempotent dead-letter archive entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRow {
    pub dl_msg_id: String,
    pub stream: String,
    pub payload: serde_json::Value,
    pub archived_at: DateTime<Utc>,
}

/// Outbox delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Delivered,
}

/// A structured event awaiting downstream delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Materialized-view refresh bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatviewRow {
    pub name: String,
    pub refreshed_at: DateTime<Utc>,
    pub refresh_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_integration_limit_flags() {
        let row = IntegrationRow {
            id: "int-1".to_string(),
            tenant_id: "t-1".to_string(),
            provider_type: "openai".to_string(),
            name: "prod".to_string(),
            status: IntegrationStatus::Active,
            health_state: HealthState::Healthy,
            health_message: None,
            budget_limit_cents: 10_000,
            token_limit_month: 0,
            rate_limit_rpm: 60,
            credential_ref: "cus-vault://t-1/prod".to_string(),
            created_at: Utc::now(),
            deleted_at: None,
        };

        assert!(row.has_budget_limit());
        assert!(!row.has_token_limit());
        assert!(row.has_rate_limit());
        assert!(!row.is_deleted());
    }

    #[test]
    fn test_lock_row_expiry() {
        let now = Utc::now();
        let lock = LockRow {
            lock_name: "maintenance:outbox".to_string(),
            holder_id: "worker:host:1:abcd".to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(60),
        };

        assert!(!lock.is_expired_at(now));
        assert!(lock.is_expired_at(now + Duration::seconds(61)));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AnomalySeverity::Critical > AnomalySeverity::High);
        assert!(IncidentSeverity::Medium > IncidentSeverity::Low);
    }
}
