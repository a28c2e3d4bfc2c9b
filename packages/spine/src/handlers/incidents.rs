//! Incident operations: failure signals, lifecycle, and reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgergate_events::EventPayload;
use ledgergate_incidents::{FailureEvent, IncidentOutcome};
use ledgergate_store::IncidentStatus;

use crate::handlers::{param_fail, store_fail, unknown_method};
use crate::params::{i64_or, opt_str, require_method, require_str};
use crate::registry::OperationHandler;
use crate::types::{codes, OperationContext, OperationResult};

/// `incidents.write`: signal failures, acknowledge, resolve, sweep.
pub struct IncidentsWriteHandler;

#[async_trait]
impl OperationHandler for IncidentsWriteHandler {
    fn name(&self) -> &'static str {
        "incidents.write"
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
            "signal" => {
                let trigger_type = match require_str(&ctx.params, "trigger_type") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                let call_id = match require_str(&ctx.params, "call_id") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                let occurred_at = opt_str(&ctx.params, "occurred_at")
                    .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
                    .unwrap_or_else(Utc::now);

                let event = FailureEvent {
                    tenant_id: ctx.tenant_id.clone(),
                    trigger_type,
                    trigger_value: opt_str(&ctx.params, "trigger_value")
                        .unwrap_or_default()
                        .to_string(),
                    call_id,
                    cost_delta_cents: i64_or(&ctx.params, "cost_delta_cents", 0),
                    occurred_at,
                };

                let outcome = match ctx.state.aggregator.record_failure(ctx.scope, event).await {
                    Ok(outcome) => outcome,
                    Err(err) => return store_fail(err),
                };

                if let IncidentOutcome::Created { incident } = &outcome {
                    let emit = ctx
                        .state
                        .emitter
                        .emit(
                            ctx.scope,
                            EventPayload::new("incidents.created", &ctx.tenant_id, "aggregator")
                                .with_context(serde_json::json!({
                                    "incident_id": incident.id,
                                    "trigger_type": incident.trigger_type,
                                    "severity": incident.severity,
                                })),
                        )
                        .await;
                    if let Err(err) = emit {
                        return OperationResult::fail(codes::SERVICE_ERROR, err.to_string());
                    }
                }

                let (disposition, incident) = match &outcome {
                    IncidentOutcome::Created { incident } => ("created", incident),
                    IncidentOutcome::Merged { incident, .. } => ("merged", incident),
                    IncidentOutcome::Reopened { incident } => ("reopened", incident),
                    IncidentOutcome::Overflow { incident } => ("overflow", incident),
                };
                OperationResult::ok(serde_json::json!({
                    "disposition": disposition,
                    "incident": incident,
                }))
            }
            "acknowledge" | "resolve" => {
                let incident_id = match require_str(&ctx.params, "incident_id") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                let existing = match ctx.scope.get_incident(&ctx.tenant_id, &incident_id).await {
                    Ok(Some(incident)) => incident,
                    Ok(None) => {
                        return OperationResult::fail(
                            codes::NOT_FOUND,
                            format!("Incident {incident_id} not found"),
                        )
                    }
                    Err(err) => return store_fail(err),
                };
                if existing.status == IncidentStatus::Resolved {
                    return OperationResult::fail(
                        codes::ALREADY_RESOLVED,
                        format!("Incident {incident_id} is already resolved"),
                    );
                }

                let tenant_id = ctx.tenant_id.clone();
                let updated = if method == "acknowledge" {
                    ctx.state
                        .aggregator
                        .acknowledge(ctx.scope, &tenant_id, &incident_id)
                        .await
                } else {
                    ctx.state
                        .aggregator
                        .resolve(ctx.scope, &tenant_id, &incident_id)
                        .await
                };
                match updated {
                    Ok(Some(incident)) => {
                        OperationResult::ok(serde_json::to_value(incident).unwrap_or_default())
                    }
                    Ok(None) => OperationResult::fail(codes::NOT_FOUND, "Incident vanished"),
                    Err(err) => store_fail(err),
                }
            }
            "sweep" => {
                let resolved = match ctx
                    .state
                    .aggregator
                    .auto_resolve_idle(ctx.scope, Utc::now())
                    .await
                {
                    Ok(resolved) => resolved,
                    Err(err) => return store_fail(err),
                };
                OperationResult::ok(serde_json::json!({ "auto_resolved": resolved }))
            }
            other => unknown_method("incidents.write", other),
        }
    }
}

/// `incidents.query`: list, fetch, and read timelines.
pub struct IncidentsQueryHandler;

#[async_trait]
impl OperationHandler for IncidentsQueryHandler {
    fn name(&self) -> &'static str {
        "incidents.query"
    }

    async fn execute(&self, ctx: &mut OperationContext<'_>) -> OperationResult {
        let method = match require_method(&ctx.params) {
            Ok(method) => method.to_string(),
            Err(err) => return param_fail(err),
        };

        match method.as_str() {
            "list" => match ctx.scope.list_incidents(&ctx.tenant_id).await {
                Ok(rows) => OperationResult::ok(serde_json::to_value(rows).unwrap_or_default()),
                Err(err) => store_fail(err),
            },
            "get" | "timeline" => {
                let incident_id = match require_str(&ctx.params, "incident_id") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                let incident = match ctx.scope.get_incident(&ctx.tenant_id, &incident_id).await {
                    Ok(Some(incident)) => incident,
                    Ok(None) => {
                        return OperationResult::fail(
                            codes::NOT_FOUND,
                            format!("Incident {incident_id} not found"),
                        )
                    }
                    Err(err) => return store_fail(err),
                };
                if method == "get" {
                    OperationResult::ok(serde_json::to_value(incident).unwrap_or_default())
                } else {
                    match ctx.scope.list_incident_events(&incident_id).await {
                        Ok(events) => {
                            OperationResult::ok(serde_json::to_value(events).unwrap_or_default())
                        }
                        Err(err) => store_fail(err),
                    }
                }
            }
            other => unknown_method("incidents.query", other),
        }
    }
}
