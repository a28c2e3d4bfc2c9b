//! Enforcement operations: pre-flight quota checks.

use async_trait::async_trait;
use ledgergate_enforcement::{EvaluationRequest, ScopeReads};
use ledgergate_events::EventPayload;

use crate::handlers::{param_fail, store_fail, unknown_method};
use crate::params::{i64_or, require_method, require_str};
use crate::registry::OperationHandler;
use crate::types::{codes, OperationContext, OperationResult};

/// `enforcement.check`: evaluate, batch-evaluate, or read status.
pub struct EnforcementCheckHandler;

#[async_trait]
impl OperationHandler for EnforcementCheckHandler {
    fn name(&self) -> &'static str {
        "enforcement.check"
    }

    async fn execute(&self, ctx: &mut OperationContext<'_>) -> OperationResult {
        let method = match require_method(&ctx.params) {
            Ok(method) => method.to_string(),
            Err(err) => return param_fail(err),
        };

        match method.as_str() {
            "evaluate" => {
                let integration_id = match require_str(&ctx.params, "integration_id") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                let estimated_cost = i64_or(&ctx.params, "estimated_cost_cents", 0);
                let estimated_tokens = i64_or(&ctx.params, "estimated_tokens", 0);

                let decision = {
                    let reads = ScopeReads::new(ctx.scope);
                    match ctx
                        .state
                        .enforcement
                        .evaluate(
                            &reads,
                            &ctx.tenant_id,
                            &integration_id,
                            estimated_cost,
                            estimated_tokens,
                        )
                        .await
                    {
                        Ok(decision) => decision,
                        Err(err) => return store_fail(err),
                    }
                };

                // Every terminal block surfaces as a structured event.
                if !decision.is_permitted() {
                    let emit = ctx
                        .state
                        .emitter
                        .emit(
                            ctx.scope,
                            EventPayload::new("enforcement.blocked", &ctx.tenant_id, "enforcement")
                                .with_context(serde_json::json!({
                                    "integration_id": integration_id,
                                    "result": decision.result,
                                    "reasons": decision.reasons,
                                })),
                        )
                        .await;
                    if let Err(err) = emit {
                        return OperationResult::fail(codes::SERVICE_ERROR, err.to_string());
                    }
                }

                OperationResult::ok(serde_json::to_value(&decision).unwrap_or_default())
            }
            "batch" => {
                let Some(raw_requests) =
                    ctx.params.get("requests").and_then(|v| v.as_array()).cloned()
                else {
                    return OperationResult::fail(
                        codes::MISSING_PARAM,
                        "Missing 'requests' in params",
                    );
                };
                let mut requests = Vec::with_capacity(raw_requests.len());
                for raw in &raw_requests {
                    let integration_id = match require_str(raw, "integration_id") {
                        Ok(value) => value.to_string(),
                        Err(err) => return param_fail(err),
                    };
                    requests.push(EvaluationRequest {
                        integration_id,
                        estimated_cost_cents: i64_or(raw, "estimated_cost_cents", 0),
                        estimated_tokens: i64_or(raw, "estimated_tokens", 0),
                    });
                }

                let reads = ScopeReads::new(ctx.scope);
                match ctx
                    .state
                    .enforcement
                    .evaluate_batch(&reads, &ctx.tenant_id, requests)
                    .await
                {
                    Ok(decisions) => {
                        OperationResult::ok(serde_json::to_value(decisions).unwrap_or_default())
                    }
                    Err(err) => store_fail(err),
                }
            }
            "status" => {
                let integration_id = match require_str(&ctx.params, "integration_id") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                let reads = ScopeReads::new(ctx.scope);
                match ctx
                    .state
                    .enforcement
                    .enforcement_status(&reads, &ctx.tenant_id, &integration_id)
                    .await
                {
                    Ok(Some(status)) => {
                        OperationResult::ok(serde_json::to_value(status).unwrap_or_default())
                    }
                    Ok(None) => OperationResult::fail(
                        codes::NOT_FOUND,
                        format!("Integration {integration_id} not found"),
                    ),
                    Err(err) => store_fail(err),
                }
            }
            other => unknown_method("enforcement.check", other),
        }
    }
}
