//! Activity operations: usage ingestion and telemetry reads.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ledgergate_events::EventPayload;
use ledgergate_incidents::{FailureEvent, IncidentOutcome};
use ledgergate_telemetry::UsageDraft;

use crate::handlers::{param_fail, store_fail, unknown_method};
use crate::params::{i64_or, opt_str, require_datetime, require_method, require_str};
use crate::registry::OperationHandler;
use crate::types::{codes, OperationContext, OperationResult};

fn draft_from_params(
    tenant_id: &str,
    params: &serde_json::Value,
) -> Result<UsageDraft, OperationResult> {
    let integration_id = require_str(params, "integration_id").map_err(param_fail)?;
    let call_id = require_str(params, "call_id").map_err(param_fail)?;
    let provider = require_str(params, "provider").map_err(param_fail)?;
    let model = require_str(params, "model").map_err(param_fail)?;

    Ok(UsageDraft {
        tenant_id: tenant_id.to_string(),
        integration_id: integration_id.to_string(),
        call_id: call_id.to_string(),
        session_id: opt_str(params, "session_id").map(str::to_string),
        agent_id: opt_str(params, "agent_id").map(str::to_string),
        provider: provider.to_string(),
        model: model.to_string(),
        tokens_in: i64_or(params, "tokens_in", 0),
        tokens_out: i64_or(params, "tokens_out", 0),
        cost_cents: i64_or(params, "cost_cents", 0),
        latency_ms: params.get("latency_ms").and_then(|v| v.as_i64()),
        policy_result: opt_str(params, "policy_result").map(str::to_string),
        error_code: opt_str(params, "error_code").map(str::to_string),
        error_message: opt_str(params, "error_message").map(str::to_string),
        created_at: opt_str(params, "created_at")
            .and_then(|raw| raw.parse::<DateTime<Utc>>().ok()),
    })
}

/// `activity.ingest`: append usage records; failing calls also feed the
/// incident aggregator.
pub struct ActivityIngestHandler;

impl ActivityIngestHandler {
    async fn ingest_one(
        ctx: &mut OperationContext<'_>,
        record: &serde_json::Value,
    ) -> Result<(String, bool), OperationResult> {
        let draft = draft_from_params(&ctx.tenant_id, record)?;
        let call_id = draft.call_id.clone();
        let failed_call = draft.error_code.clone();
        let cost = draft.cost_cents;
        let occurred_at = draft.created_at.unwrap_or_else(Utc::now);

        let accepted = ctx
            .state
            .telemetry
            .create_usage(ctx.scope, draft)
            .await
            .map_err(store_fail)?;

        // A failing call becomes incident-aggregator input, but only once
        // per logical call.
        if accepted {
            if let Some(error_code) = failed_call {
                let outcome = ctx
                    .state
                    .aggregator
                    .record_failure(
                        ctx.scope,
                        FailureEvent {
                            tenant_id: ctx.tenant_id.clone(),
                            trigger_type: "failure_spike".to_string(),
                            trigger_value: error_code,
                            call_id: call_id.clone(),
                            cost_delta_cents: cost,
                            occurred_at,
                        },
                    )
                    .await
                    .map_err(store_fail)?;
                if let IncidentOutcome::Created { incident } = &outcome {
                    ctx.state
                        .emitter
                        .emit(
                            ctx.scope,
                            EventPayload::new("incidents.created", &ctx.tenant_id, "aggregator")
                                .with_context(serde_json::json!({
                                    "incident_id": incident.id,
                                    "trigger_type": incident.trigger_type,
                                })),
                        )
                        .await
                        .map_err(|err| {
                            OperationResult::fail(codes::SERVICE_ERROR, err.to_string())
                        })?;
                }
            }
        }
        Ok((call_id, accepted))
    }
}

#[async_trait]
impl OperationHandler for ActivityIngestHandler {
    fn name(&self) -> &'static str {
        "activity.ingest"
    }

    fn requires_session(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut OperationContext<'_>) -> OperationResult {
        let method = match require_method(&ctx.params) {
            Ok(method) => method.to_string(),
            Err(err) => return param_fail(err),
        };

        match method.as_str() {
            "ingest" => {
                let params = ctx.params.clone();
                match Self::ingest_one(ctx, &params).await {
                    Ok((call_id, accepted)) => OperationResult::ok(serde_json::json!({
                        "call_id": call_id,
                        "accepted": accepted,
                    })),
                    Err(result) => result,
                }
            }
            "ingest_batch" => {
                let Some(records) = ctx.params.get("records").and_then(|v| v.as_array()).cloned()
                else {
                    return OperationResult::fail(codes::MISSING_PARAM, "Missing 'records' in params");
                };
                let mut accepted = Vec::new();
                let mut duplicates = Vec::new();
                for record in &records {
                    match Self::ingest_one(ctx, record).await {
                        Ok((call_id, true)) => accepted.push(call_id),
                        Ok((call_id, false)) => duplicates.push(call_id),
                        Err(result) => return result,
                    }
                }
                OperationResult::ok(serde_json::json!({
                    "accepted": accepted,
                    "duplicates": duplicates,
                }))
            }
            other => unknown_method("activity.ingest", other),
        }
    }
}

/// `activity.query`: telemetry reads.
pub struct ActivityQueryHandler;

#[async_trait]
impl OperationHandler for ActivityQueryHandler {
    fn name(&self) -> &'static str {
        "activity.query"
    }

    async fn execute(&self, ctx: &mut OperationContext<'_>) -> OperationResult {
        let method = match require_method(&ctx.params) {
            Ok(method) => method.to_string(),
            Err(err) => return param_fail(err),
        };

        match method.as_str() {
            "summary" | "per_integration" => {
                let start = match require_datetime(&ctx.params, "start") {
                    Ok(value) => value,
                    Err(err) => return param_fail(err),
                };
                let end = match require_datetime(&ctx.params, "end") {
                    Ok(value) => value,
                    Err(err) => return param_fail(err),
                };
                if method == "summary" {
                    match ctx
                        .state
                        .telemetry
                        .fetch_usage_summary(ctx.scope, &ctx.tenant_id, start, end)
                        .await
                    {
                        Ok(summary) => OperationResult::ok(
                            serde_json::to_value(summary).unwrap_or_default(),
                        ),
                        Err(err) => store_fail(err),
                    }
                } else {
                    match ctx
                        .state
                        .telemetry
                        .fetch_per_integration_usage(ctx.scope, &ctx.tenant_id, start, end)
                        .await
                    {
                        Ok(rows) => {
                            OperationResult::ok(serde_json::to_value(rows).unwrap_or_default())
                        }
                        Err(err) => store_fail(err),
                    }
                }
            }
            "history" => {
                let limit = i64_or(&ctx.params, "limit", 50).max(0) as usize;
                let offset = i64_or(&ctx.params, "offset", 0).max(0) as usize;
                let integration_id = opt_str(&ctx.params, "integration_id").map(str::to_string);
                match ctx
                    .state
                    .telemetry
                    .fetch_usage_history(
                        ctx.scope,
                        &ctx.tenant_id,
                        integration_id.as_deref(),
                        limit,
                        offset,
                    )
                    .await
                {
                    Ok(rows) => OperationResult::ok(serde_json::to_value(rows).unwrap_or_default()),
                    Err(err) => store_fail(err),
                }
            }
            "daily" => {
                let parse_date = |key: &'static str| -> Result<NaiveDate, OperationResult> {
                    let raw = require_str(&ctx.params, key).map_err(param_fail)?;
                    raw.parse::<NaiveDate>().map_err(|_| {
                        OperationResult::fail(
                            codes::VALIDATION_ERROR,
                            format!("Param '{key}' must be an ISO date"),
                        )
                    })
                };
                let from = match parse_date("from") {
                    Ok(value) => value,
                    Err(result) => return result,
                };
                let to = match parse_date("to") {
                    Ok(value) => value,
                    Err(result) => return result,
                };
                match ctx
                    .state
                    .telemetry
                    .fetch_daily_aggregates(ctx.scope, &ctx.tenant_id, from, to)
                    .await
                {
                    Ok(rows) => OperationResult::ok(serde_json::to_value(rows).unwrap_or_default()),
                    Err(err) => store_fail(err),
                }
            }
            other => unknown_method("activity.query", other),
        }
    }
}
