//! Telemetry input and read shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Input for a single usage record. The driver assigns the row id and, when
/// absent, the ingest timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageDraft {
    pub tenant_id: String,
    pub integration_id: String,
    /// Unique per logical call within the tenant.
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
    pub created_at: Option<DateTime<Utc>>,
}

/// Tenant-wide rollup over a time range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub request_count: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_cents: i64,
    pub error_count: i64,
}

/// Per-integration rollup over a time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationUsage {
    pub integration_id: String,
    pub request_count: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_cents: i64,
    pub error_count: i64,
}

/// Outcome of a batch ingest: which call ids were appended and which were
/// already present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchIngestOutcome {
    pub accepted: Vec<String>,
    pub duplicates: Vec<String>,
}

impl BatchIngestOutcome {
    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }

    pub fn duplicate_count(&self) -> usize {
        self.duplicates.len()
    }
}
