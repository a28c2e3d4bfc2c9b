//! The enforcement decision ladder.

use chrono::{DateTime, Datelike, Duration, Utc};
use ledgergate_store::{HealthState, IntegrationRow, IntegrationStatus, StoreError};

use crate::reads::EnforcementReads;
use crate::types::{
    EnforcementConfig, EnforcementDecision, EnforcementReason, EnforcementResult,
    EnforcementStatus, LimitStatus, RateStatus,
};

/// A batch evaluation request.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub integration_id: String,
    pub estimated_cost_cents: i64,
    pub estimated_tokens: i64,
}

/// Outcome of one limit check inside the ladder.
enum CheckOutcome {
    /// Terminal: the reason decides the call.
    Exceeded(EnforcementReason),
    /// Non-terminal: accumulate and keep checking.
    Warning(EnforcementReason),
    /// Data source failed; fail open, mark degraded.
    Degraded(EnforcementReason),
    Clear,
}

/// Quota gating for governed LLM calls.
#[derive(Debug, Clone, Default)]
pub struct EnforcementEngine {
    config: EnforcementConfig,
}

impl EnforcementEngine {
    pub fn new(config: EnforcementConfig) -> Self {
        Self { config }
    }

    fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        today
            .with_day(1)
            .unwrap_or(today)
            .and_time(chrono::NaiveTime::MIN)
            .and_utc()
    }

    /// Evaluate enforcement policy for an LLM call.
    ///
    /// Strict order, earliest decisive check returns:
    /// integration present → status → credentials → budget → tokens → rate.
    /// Errors from the integration row read propagate; limit-read errors
    /// fail open with `degraded = true`.
    pub async fn evaluate<R: EnforcementReads + ?Sized>(
        &self,
        reads: &R,
        tenant_id: &str,
        integration_id: &str,
        estimated_cost_cents: i64,
        estimated_tokens: i64,
    ) -> Result<EnforcementDecision, StoreError> {
        let now = Utc::now();
        let mut reasons: Vec<EnforcementReason> = Vec::new();
        let mut degraded = false;

        let Some(integration) = reads.fetch_integration(tenant_id, integration_id).await? else {
            return Ok(self.hard_block(
                tenant_id,
                integration_id,
                EnforcementReason::new(
                    "integration_not_found",
                    "Integration does not exist or does not belong to this tenant",
                )
                .with_limit_type("status"),
            ));
        };

        if integration.status == IntegrationStatus::Disabled {
            return Ok(self.hard_block(
                tenant_id,
                integration_id,
                EnforcementReason::new(
                    "integration_disabled",
                    "Integration is disabled. Enable it to make LLM calls.",
                )
                .with_limit_type("status"),
            ));
        }

        if integration.status == IntegrationStatus::Error {
            let detail = integration
                .health_message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());
            return Ok(self.hard_block(
                tenant_id,
                integration_id,
                EnforcementReason::new(
                    "integration_error",
                    format!("Integration is in error state: {detail}"),
                )
                .with_limit_type("status"),
            ));
        }

        if integration.health_state == HealthState::Failing {
            let detail = integration
                .health_message
                .clone()
                .unwrap_or_else(|| "Health check failed".to_string());
            return Ok(self.hard_block(
                tenant_id,
                integration_id,
                EnforcementReason::new(
                    "credentials_invalid",
                    format!("Credentials appear invalid: {detail}"),
                )
                .with_limit_type("status"),
            ));
        }

        if integration.has_budget_limit() {
            match self
                .check_budget(reads, &integration, estimated_cost_cents, now)
                .await
            {
                CheckOutcome::Exceeded(reason) => {
                    return Ok(EnforcementDecision::new(
                        EnforcementResult::Blocked,
                        tenant_id,
                        integration_id,
                    )
                    .with_reason(reason));
                }
                CheckOutcome::Warning(reason) => reasons.push(reason),
                CheckOutcome::Degraded(reason) => {
                    degraded = true;
                    reasons.push(reason);
                }
                CheckOutcome::Clear => {}
            }
        }

        if integration.has_token_limit() {
            match self
                .check_tokens(reads, &integration, estimated_tokens, now)
                .await
            {
                CheckOutcome::Exceeded(reason) => {
                    return Ok(EnforcementDecision::new(
                        EnforcementResult::Blocked,
                        tenant_id,
                        integration_id,
                    )
                    .with_reason(reason));
                }
                CheckOutcome::Warning(reason) => reasons.push(reason),
                CheckOutcome::Degraded(reason) => {
                    degraded = true;
                    reasons.push(reason);
                }
                CheckOutcome::Clear => {}
            }
        }

        if integration.has_rate_limit() {
            match self.check_rate(reads, &integration, now).await {
                CheckOutcome::Exceeded(reason) => {
                    return Ok(EnforcementDecision::new(
                        EnforcementResult::Throttled,
                        tenant_id,
                        integration_id,
                    )
                    .with_reason(reason));
                }
                CheckOutcome::Degraded(reason) => {
                    degraded = true;
                    reasons.push(reason);
                }
                CheckOutcome::Warning(reason) => reasons.push(reason),
                CheckOutcome::Clear => {}
            }
        }

        if !reasons.is_empty() {
            let mut decision =
                EnforcementDecision::new(EnforcementResult::Warned, tenant_id, integration_id);
            decision.reasons = reasons;
            decision.degraded = degraded;
            tracing::info!(
                tenant_id = %tenant_id,
                integration_id = %integration_id,
                reasons = decision.reasons.len(),
                degraded,
                "enforcement warned"
            );
            return Ok(decision);
        }

        let mut decision =
            EnforcementDecision::new(EnforcementResult::Allowed, tenant_id, integration_id)
                .with_reason(EnforcementReason::new(
                    "all_checks_passed",
                    "All enforcement checks passed",
                ));
        decision.degraded = degraded;
        Ok(decision)
    }

    /// Evaluate multiple requests, preserving order.
    pub async fn evaluate_batch<R: EnforcementReads + ?Sized>(
        &self,
        reads: &R,
        tenant_id: &str,
        requests: Vec<EvaluationRequest>,
    ) -> Result<Vec<EnforcementDecision>, StoreError> {
        let mut decisions = Vec::with_capacity(requests.len());
        for request in requests {
            decisions.push(
                self.evaluate(
                    reads,
                    tenant_id,
                    &request.integration_id,
                    request.estimated_cost_cents,
                    request.estimated_tokens,
                )
                .await?,
            );
        }
        Ok(decisions)
    }

    /// Current limits and usage without making a decision.
    pub async fn enforcement_status<R: EnforcementReads + ?Sized>(
        &self,
        reads: &R,
        tenant_id: &str,
        integration_id: &str,
    ) -> Result<Option<EnforcementStatus>, StoreError> {
        let now = Utc::now();
        let Some(integration) = reads.fetch_integration(tenant_id, integration_id).await? else {
            return Ok(None);
        };

        let period_start = Self::month_start(now);
        let window_start = now - Duration::seconds(self.config.rate_window_seconds);

        let budget_used = reads
            .fetch_budget_usage(tenant_id, integration_id, period_start)
            .await?;
        let tokens_used = reads
            .fetch_token_usage(tenant_id, integration_id, period_start)
            .await?;
        let current_rpm = reads
            .fetch_rate_count(tenant_id, integration_id, window_start)
            .await? as i64;

        let percent = |used: i64, limit: i64| {
            if limit > 0 {
                used as f64 / limit as f64 * 100.0
            } else {
                0.0
            }
        };

        Ok(Some(EnforcementStatus {
            integration_id: integration_id.to_string(),
            integration_status: format!("{:?}", integration.status).to_lowercase(),
            health_state: format!("{:?}", integration.health_state).to_lowercase(),
            budget: LimitStatus {
                limit: integration.budget_limit_cents,
                used: budget_used,
                remaining: (integration.budget_limit_cents - budget_used).max(0),
                percent_used: percent(budget_used, integration.budget_limit_cents),
                has_limit: integration.has_budget_limit(),
            },
            tokens: LimitStatus {
                limit: integration.token_limit_month,
                used: tokens_used,
                remaining: (integration.token_limit_month - tokens_used).max(0),
                percent_used: percent(tokens_used, integration.token_limit_month),
                has_limit: integration.has_token_limit(),
            },
            rate: RateStatus {
                limit_rpm: integration.rate_limit_rpm,
                current_rpm,
                percent_used: percent(current_rpm, integration.rate_limit_rpm),
                has_limit: integration.has_rate_limit(),
            },
            period_start,
            evaluated_at: now,
        }))
    }

    fn hard_block(
        &self,
        tenant_id: &str,
        integration_id: &str,
        reason: EnforcementReason,
    ) -> EnforcementDecision {
        tracing::warn!(
            tenant_id = %tenant_id,
            integration_id = %integration_id,
            code = %reason.code,
            "enforcement hard block"
        );
        EnforcementDecision::new(EnforcementResult::HardBlocked, tenant_id, integration_id)
            .with_reason(reason)
    }

    async fn check_budget<R: EnforcementReads + ?Sized>(
        &self,
        reads: &R,
        integration: &IntegrationRow,
        estimated_cost_cents: i64,
        now: DateTime<Utc>,
    ) -> CheckOutcome {
        let period_start = Self::month_start(now);
        let current = match reads
            .fetch_budget_usage(&integration.tenant_id, &integration.id, period_start)
            .await
        {
            Ok(cents) => cents,
            Err(err) => {
                tracing::warn!(error = %err, "budget check unavailable, allowing with degraded status");
                return CheckOutcome::Degraded(
                    EnforcementReason::new(
                        "budget_degraded",
                        "Budget check unavailable - allowing with degraded status",
                    )
                    .with_limit_type("budget"),
                );
            }
        };

        let limit = integration.budget_limit_cents;
        let projected = current + estimated_cost_cents;

        if projected >= limit {
            return CheckOutcome::Exceeded(
                EnforcementReason::new(
                    "budget_exceeded",
                    format!("Monthly budget limit exceeded: {current}¢ used, limit is {limit}¢"),
                )
                .with_limit_type("budget")
                .with_values(limit, current)
                .with_threshold_percent((current as f64 / limit as f64 * 100.0).min(100.0)),
            );
        }

        let warning_floor = limit as f64 * (self.config.warning_threshold_pct / 100.0);
        if current as f64 >= warning_floor {
            let projected_pct = projected as f64 / limit as f64 * 100.0;
            return CheckOutcome::Warning(
                EnforcementReason::new(
                    "budget_warning",
                    format!(
                        "Approaching budget limit: {current}¢ of {limit}¢ ({projected_pct:.1}% projected)"
                    ),
                )
                .with_limit_type("budget")
                .with_values(limit, current)
                .with_threshold_percent(projected_pct),
            );
        }

        CheckOutcome::Clear
    }

    async fn check_tokens<R: EnforcementReads + ?Sized>(
        &self,
        reads: &R,
        integration: &IntegrationRow,
        estimated_tokens: i64,
        now: DateTime<Utc>,
    ) -> CheckOutcome {
        let period_start = Self::month_start(now);
        let current = match reads
            .fetch_token_usage(&integration.tenant_id, &integration.id, period_start)
            .await
        {
            Ok(tokens) => tokens,
            Err(err) => {
                tracing::warn!(error = %err, "token check unavailable, allowing with degraded status");
                return CheckOutcome::Degraded(
                    EnforcementReason::new(
                        "token_degraded",
                        "Token check unavailable - allowing with degraded status",
                    )
                    .with_limit_type("tokens"),
                );
            }
        };

        let limit = integration.token_limit_month;
        let projected = current + estimated_tokens;

        if projected >= limit {
            return CheckOutcome::Exceeded(
                EnforcementReason::new(
                    "token_limit_exceeded",
                    format!("Monthly token limit exceeded: {current} tokens used, limit is {limit}"),
                )
                .with_limit_type("tokens")
                .with_values(limit, current)
                .with_threshold_percent((current as f64 / limit as f64 * 100.0).min(100.0)),
            );
        }

        let warning_floor = limit as f64 * (self.config.warning_threshold_pct / 100.0);
        if current as f64 >= warning_floor {
            let projected_pct = projected as f64 / limit as f64 * 100.0;
            return CheckOutcome::Warning(
                EnforcementReason::new(
                    "token_warning",
                    format!(
                        "Approaching token limit: {current} of {limit} ({projected_pct:.1}% projected)"
                    ),
                )
                .with_limit_type("tokens")
                .with_values(limit, current)
                .with_threshold_percent(projected_pct),
            );
        }

        CheckOutcome::Clear
    }

    async fn check_rate<R: EnforcementReads + ?Sized>(
        &self,
        reads: &R,
        integration: &IntegrationRow,
        now: DateTime<Utc>,
    ) -> CheckOutcome {
        let window_start = now - Duration::seconds(self.config.rate_window_seconds);
        let current = match reads
            .fetch_rate_count(&integration.tenant_id, &integration.id, window_start)
            .await
        {
            Ok(count) => count as i64,
            Err(err) => {
                tracing::warn!(error = %err, "rate check unavailable, allowing with degraded status");
                return CheckOutcome::Degraded(
                    EnforcementReason::new(
                        "rate_degraded",
                        "Rate check unavailable - allowing with degraded status",
                    )
                    .with_limit_type("rate"),
                );
            }
        };

        let limit = integration.rate_limit_rpm;
        if current >= limit {
            return CheckOutcome::Exceeded(
                EnforcementReason::new(
                    "rate_limit_exceeded",
                    format!(
                        "Rate limit exceeded: {current} requests in last minute, limit is {limit} RPM"
                    ),
                )
                .with_limit_type("rate")
                .with_values(limit, current)
                .with_threshold_percent((current as f64 / limit as f64 * 100.0).min(100.0))
                .with_retry_after(self.config.rate_window_seconds),
            );
        }

        CheckOutcome::Clear
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ledgergate_store::{HealthState, IntegrationStatus};

    /// Injectable reads for ladder tests.
    struct MockReads {
        integration: Option<IntegrationRow>,
        budget_cents: i64,
        budget_fails: bool,
        tokens: i64,
        tokens_fail: bool,
        rate_count: usize,
        rate_fails: bool,
    }

    impl MockReads {
        fn with(integration: IntegrationRow) -> Self {
            Self {
                integration: Some(integration),
                budget_cents: 0,
                budget_fails: false,
                tokens: 0,
                tokens_fail: false,
                rate_count: 0,
                rate_fails: false,
            }
        }

        fn missing() -> Self {
            Self {
                integration: None,
                budget_cents: 0,
                budget_fails: false,
                tokens: 0,
                tokens_fail: false,
                rate_count: 0,
                rate_fails: false,
            }
        }
    }

    #[async_trait]
    impl EnforcementReads for MockReads {
        async fn fetch_integration(
            &self,
            _tenant_id: &str,
            _integration_id: &str,
        ) -> Result<Option<IntegrationRow>, StoreError> {
            Ok(self.integration.clone())
        }

        async fn fetch_budget_usage(
            &self,
            _tenant_id: &str,
            _integration_id: &str,
            _period_start: DateTime<Utc>,
        ) -> Result<i64, StoreError> {
            if self.budget_fails {
                return Err(StoreError::transient("budget read timed out"));
            }
            Ok(self.budget_cents)
        }

        async fn fetch_token_usage(
            &self,
            _tenant_id: &str,
            _integration_id: &str,
            _period_start: DateTime<Utc>,
        ) -> Result<i64, StoreError> {
            if self.tokens_fail {
                return Err(StoreError::transient("token read timed out"));
            }
            Ok(self.tokens)
        }

        async fn fetch_rate_count(
            &self,
            _tenant_id: &str,
            _integration_id: &str,
            _window_start: DateTime<Utc>,
        ) -> Result<usize, StoreError> {
            if self.rate_fails {
                return Err(StoreError::transient("rate read timed out"));
            }
            Ok(self.rate_count)
        }
    }

    fn integration() -> IntegrationRow {
        IntegrationRow {
            id: "int-1".to_string(),
            tenant_id: "t-1".to_string(),
            provider_type: "openai".to_string(),
            name: "prod".to_string(),
            status: IntegrationStatus::Active,
            health_state: HealthState::Healthy,
            health_message: None,
            budget_limit_cents: 0,
            token_limit_month: 0,
            rate_limit_rpm: 0,
            credential_ref: "cus-vault://t-1/prod".to_string(),
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_missing_integration_hard_blocks() {
        let engine = EnforcementEngine::default();
        let decision = engine
            .evaluate(&MockReads::missing(), "t-1", "int-1", 0, 0)
            .await
            .unwrap();

        assert_eq!(decision.result, EnforcementResult::HardBlocked);
        assert_eq!(decision.reasons.len(), 1);
        assert_eq!(decision.reasons[0].code, "integration_not_found");
    }

    #[tokio::test]
    async fn test_terminal_order_status_beats_credentials_and_budget() {
        // Integration simultaneously in error state, failing health, and
        // over budget: the status check wins and only one reason surfaces.
        let mut row = integration();
        row.status = IntegrationStatus::Error;
        row.health_state = HealthState::Failing;
        row.budget_limit_cents = 100;
        let mut reads = MockReads::with(row);
        reads.budget_cents = 500;

        let engine = EnforcementEngine::default();
        let decision = engine.evaluate(&reads, "t-1", "int-1", 10, 0).await.unwrap();

        assert_eq!(decision.result, EnforcementResult::HardBlocked);
        assert_eq!(decision.reasons.len(), 1);
        assert_eq!(decision.reasons[0].code, "integration_error");
    }

    #[tokio::test]
    async fn test_disabled_and_failing_credentials() {
        let mut disabled = integration();
        disabled.status = IntegrationStatus::Disabled;
        let engine = EnforcementEngine::default();
        let decision = engine
            .evaluate(&MockReads::with(disabled), "t-1", "int-1", 0, 0)
            .await
            .unwrap();
        assert_eq!(decision.reasons[0].code, "integration_disabled");

        let mut failing = integration();
        failing.health_state = HealthState::Failing;
        let decision = engine
            .evaluate(&MockReads::with(failing), "t-1", "int-1", 0, 0)
            .await
            .unwrap();
        assert_eq!(decision.result, EnforcementResult::HardBlocked);
        assert_eq!(decision.reasons[0].code, "credentials_invalid");
    }

    #[tokio::test]
    async fn test_budget_warning_not_block() {
        let mut row = integration();
        row.budget_limit_cents = 100;
        let mut reads = MockReads::with(row);
        reads.budget_cents = 82;

        let engine = EnforcementEngine::default();
        let decision = engine.evaluate(&reads, "t-1", "int-1", 5, 0).await.unwrap();

        assert_eq!(decision.result, EnforcementResult::Warned);
        assert!(!decision.degraded);
        assert_eq!(decision.reasons.len(), 1);
        assert_eq!(decision.reasons[0].code, "budget_warning");
        let pct = decision.reasons[0].threshold_percent.unwrap();
        assert!((pct - 87.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_budget_projected_at_limit_blocks_inclusive() {
        let mut row = integration();
        row.budget_limit_cents = 100;
        let mut reads = MockReads::with(row);
        reads.budget_cents = 95;

        let engine = EnforcementEngine::default();
        let decision = engine.evaluate(&reads, "t-1", "int-1", 5, 0).await.unwrap();

        assert_eq!(decision.result, EnforcementResult::Blocked);
        assert_eq!(decision.reasons[0].code, "budget_exceeded");
    }

    #[tokio::test]
    async fn test_rate_boundary_59_allows_60_throttles() {
        let mut row = integration();
        row.rate_limit_rpm = 60;

        let mut under = MockReads::with(row.clone());
        under.rate_count = 59;
        let engine = EnforcementEngine::default();
        let decision = engine.evaluate(&under, "t-1", "int-1", 0, 0).await.unwrap();
        assert_eq!(decision.result, EnforcementResult::Allowed);

        let mut at = MockReads::with(row);
        at.rate_count = 60;
        let decision = engine.evaluate(&at, "t-1", "int-1", 0, 0).await.unwrap();
        assert_eq!(decision.result, EnforcementResult::Throttled);
        assert_eq!(decision.reasons[0].code, "rate_limit_exceeded");
        assert_eq!(decision.reasons[0].retry_after_seconds, Some(60));
    }

    #[tokio::test]
    async fn test_read_error_fails_open_as_degraded() {
        let mut row = integration();
        row.budget_limit_cents = 100;
        let mut reads = MockReads::with(row);
        reads.budget_fails = true;

        let engine = EnforcementEngine::default();
        let decision = engine.evaluate(&reads, "t-1", "int-1", 5, 0).await.unwrap();

        assert_eq!(decision.result, EnforcementResult::Warned);
        assert!(decision.degraded);
        assert_eq!(decision.reasons[0].code, "budget_degraded");
    }

    #[tokio::test]
    async fn test_token_limit_blocks() {
        let mut row = integration();
        row.token_limit_month = 1_000;
        let mut reads = MockReads::with(row);
        reads.tokens = 900;

        let engine = EnforcementEngine::default();
        let decision = engine.evaluate(&reads, "t-1", "int-1", 0, 200).await.unwrap();

        assert_eq!(decision.result, EnforcementResult::Blocked);
        assert_eq!(decision.reasons[0].code, "token_limit_exceeded");
    }

    #[tokio::test]
    async fn test_all_clear_is_allowed() {
        let mut row = integration();
        row.budget_limit_cents = 10_000;
        row.token_limit_month = 1_000_000;
        row.rate_limit_rpm = 100;
        let reads = MockReads::with(row);

        let engine = EnforcementEngine::default();
        let decision = engine.evaluate(&reads, "t-1", "int-1", 5, 100).await.unwrap();

        assert_eq!(decision.result, EnforcementResult::Allowed);
        assert_eq!(decision.reasons[0].code, "all_checks_passed");
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let mut row = integration();
        row.budget_limit_cents = 100;
        let mut reads = MockReads::with(row);
        reads.budget_cents = 99;

        let engine = EnforcementEngine::default();
        let decisions = engine
            .evaluate_batch(
                &reads,
                "t-1",
                vec![
                    EvaluationRequest {
                        integration_id: "int-1".to_string(),
                        estimated_cost_cents: 50,
                        estimated_tokens: 0,
                    },
                    EvaluationRequest {
                        integration_id: "int-1".to_string(),
                        estimated_cost_cents: 0,
                        estimated_tokens: 0,
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].result, EnforcementResult::Blocked);
        assert_eq!(decisions[1].result, EnforcementResult::Warned);
    }

    #[tokio::test]
    async fn test_status_query_reports_positions() {
        let mut row = integration();
        row.budget_limit_cents = 200;
        row.token_limit_month = 1_000;
        row.rate_limit_rpm = 60;
        let mut reads = MockReads::with(row);
        reads.budget_cents = 50;
        reads.tokens = 400;
        reads.rate_count = 6;

        let engine = EnforcementEngine::default();
        let status = engine
            .enforcement_status(&reads, "t-1", "int-1")
            .await
            .unwrap()
            .expect("integration exists");

        assert_eq!(status.budget.remaining, 150);
        assert!((status.budget.percent_used - 25.0).abs() < 0.01);
        assert_eq!(status.tokens.remaining, 600);
        assert_eq!(status.rate.current_rpm, 6);
    }
}
