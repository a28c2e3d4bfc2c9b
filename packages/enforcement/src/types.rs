//! Enforcement decision shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Enforcement decision result, ordered least to most restrictive so that
/// the most restrictive outcome always wins a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementResult {
    /// Normal execution.
    Allowed,
    /// Approaching a limit.
    Warned,
    /// Rate limit exceeded.
    Throttled,
    /// Budget or token limit exceeded.
    Blocked,
    /// System-level denial (status, credentials).
    HardBlocked,
}

/// Explanation for an enforcement decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementReason {
    pub code: String,
    pub message: String,
    pub limit_type: Option<String>,
    pub limit_value: Option<i64>,
    pub current_value: Option<i64>,
    pub threshold_percent: Option<f64>,
    pub retry_after_seconds: Option<i64>,
}

impl EnforcementReason {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            limit_type: None,
            limit_value: None,
            current_value: None,
            threshold_percent: None,
            retry_after_seconds: None,
        }
    }

    pub fn with_limit_type(mut self, limit_type: impl Into<String>) -> Self {
        self.limit_type = Some(limit_type.into());
        self
    }

    pub fn with_values(mut self, limit: i64, current: i64) -> Self {
        self.limit_value = Some(limit);
        self.current_value = Some(current);
        self
    }

    pub fn with_threshold_percent(mut self, pct: f64) -> Self {
        self.threshold_percent = Some(pct);
        self
    }

    pub fn with_retry_after(mut self, seconds: i64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }
}

/// Complete enforcement decision with explainability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementDecision {
    pub result: EnforcementResult,
    pub integration_id: String,
    pub tenant_id: String,
    pub reasons: Vec<EnforcementReason>,
    /// True when the decision was taken despite a data-source error.
    pub degraded: bool,
    pub evaluated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl EnforcementDecision {
    pub fn new(
        result: EnforcementResult,
        tenant_id: impl Into<String>,
        integration_id: impl Into<String>,
    ) -> Self {
        Self {
            result,
            integration_id: integration_id.into(),
            tenant_id: tenant_id.into(),
            reasons: Vec::new(),
            degraded: false,
            evaluated_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_reason(mut self, reason: EnforcementReason) -> Self {
        self.reasons.push(reason);
        self
    }

    /// Whether the call may proceed (possibly with warnings).
    pub fn is_permitted(&self) -> bool {
        matches!(
            self.result,
            EnforcementResult::Allowed | EnforcementResult::Warned
        )
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// Warning threshold as a fraction of the limit consumed.
    pub warning_threshold_pct: f64,
    /// Rate limit window length.
    pub rate_window_seconds: i64,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            warning_threshold_pct: 80.0,
            rate_window_seconds: 60,
        }
    }
}

/// One limit's current position, for the status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitStatus {
    pub limit: i64,
    pub used: i64,
    pub remaining: i64,
    pub percent_used: f64,
    pub has_limit: bool,
}

/// Rate limit position, for the status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateStatus {
    pub limit_rpm: i64,
    pub current_rpm: i64,
    pub percent_used: f64,
    pub has_limit: bool,
}

/// Current enforcement position without making a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementStatus {
    pub integration_id: String,
    pub integration_status: String,
    pub health_state: String,
    pub budget: LimitStatus,
    pub tokens: LimitStatus,
    pub rate: RateStatus,
    pub period_start: DateTime<Utc>,
    pub evaluated_at: DateTime<Utc>,
}
