//! Controls operations: coordination surfaces, envelopes, kill-switch.

use async_trait::async_trait;
use chrono::Utc;
use ledgergate_envelopes::{
    ApplyContext, CoordinationAuditRecord, Envelope, EnvelopeLifecycle, KillSwitchEvent,
    KillSwitchTrigger, RevertReason,
};
use ledgergate_events::EventPayload;
use ledgergate_store::{CoordinationAuditRow, KillSwitchEventRow};

use crate::handlers::{param_fail, store_fail, unknown_method};
use crate::params::{i64_or, opt_f64, opt_str, require_method, require_str};
use crate::registry::OperationHandler;
use crate::types::{codes, OperationContext, OperationResult};

fn audit_row(record: &CoordinationAuditRecord) -> CoordinationAuditRow {
    CoordinationAuditRow {
        audit_id: record.audit_id.clone(),
        envelope_id: record.envelope_id.clone(),
        envelope_class: record
            .envelope_class
            .map(|class| class.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        decision: record.decision.as_str().to_string(),
        reason: record.reason.clone(),
        timestamp: record.timestamp,
        conflicting_envelope_id: record.conflicting_envelope_id.clone(),
        preempting_envelope_id: record.preempting_envelope_id.clone(),
        active_envelopes_count: record.active_envelopes_count,
    }
}

/// Stage every audit record emitted since `from_len` into the scope so the
/// request commit persists the decision trail.
async fn persist_new_audits(
    ctx: &mut OperationContext<'_>,
    from_len: usize,
) -> Result<usize, OperationResult> {
    let records = ctx.state.coordinator.audit_trail_since(from_len).await;
    let count = records.len();
    for record in &records {
        ctx.scope
            .insert_coordination_audit(audit_row(record))
            .await
            .map_err(store_fail)?;
    }
    Ok(count)
}

/// Gate a coordinator mutation on the tenant's coordination lease. One
/// instance wins the named lock; everyone else stands down until the TTL
/// lapses.
async fn acquire_coordination(ctx: &OperationContext<'_>) -> Result<(), OperationResult> {
    match ctx
        .state
        .coordination_lease(&ctx.tenant_id)
        .try_acquire()
        .await
    {
        Ok(true) => Ok(()),
        Ok(false) => {
            tracing::warn!(
                tenant_id = %ctx.tenant_id,
                holder = %ctx.state.coordination_holder_id,
                "coordination for tenant is owned by another instance"
            );
            Err(OperationResult::fail(
                codes::CONFLICT,
                format!(
                    "Coordination for tenant {} is owned by another instance",
                    ctx.tenant_id
                ),
            ))
        }
        Err(err) => {
            tracing::error!(error = %err, "coordination lease acquire failed");
            Err(OperationResult::fail(
                codes::SERVICE_ERROR,
                "Lock service failure",
            ))
        }
    }
}

fn killswitch_row(event: &KillSwitchEvent) -> KillSwitchEventRow {
    KillSwitchEventRow {
        event_id: event.event_id.clone(),
        triggered_by: event.triggered_by.as_str().to_string(),
        trigger_reason: event.trigger_reason.clone(),
        activated_at: event.activated_at,
        rollback_status: event.rollback_status.as_str().to_string(),
        rollback_completed_at: event.rollback_completed_at,
        active_envelopes_count: event.active_envelopes_count,
    }
}

/// `controls.query`: coordination stats, active envelopes, drift
/// suggestions.
pub struct ControlsQueryHandler;

#[async_trait]
impl OperationHandler for ControlsQueryHandler {
    fn name(&self) -> &'static str {
        "controls.query"
    }

    async fn execute(&self, ctx: &mut OperationContext<'_>) -> OperationResult {
        let method = match require_method(&ctx.params) {
            Ok(method) => method.to_string(),
            Err(err) => return param_fail(err),
        };

        match method.as_str() {
            "stats" => {
                let stats = ctx.state.coordinator.stats().await;
                OperationResult::ok(serde_json::to_value(stats).unwrap_or_default())
            }
            "active_envelopes" => {
                let envelopes = ctx.state.coordinator.get_active_envelopes().await;
                OperationResult::ok(serde_json::to_value(envelopes).unwrap_or_default())
            }
            "envelope_for_parameter" => {
                let subsystem = match require_str(&ctx.params, "subsystem") {
                    Ok(value) => value,
                    Err(err) => return param_fail(err),
                };
                let parameter = match require_str(&ctx.params, "parameter") {
                    Ok(value) => value,
                    Err(err) => return param_fail(err),
                };
                match ctx
                    .state
                    .coordinator
                    .envelope_for_parameter(subsystem, parameter)
                    .await
                {
                    Some(envelope) => {
                        OperationResult::ok(serde_json::to_value(envelope).unwrap_or_default())
                    }
                    None => OperationResult::fail(
                        codes::NOT_FOUND,
                        format!("No active envelope on {subsystem}.{parameter}"),
                    ),
                }
            }
            "audit_trail" => {
                let trail = ctx.state.coordinator.audit_trail().await;
                OperationResult::ok(serde_json::to_value(trail).unwrap_or_default())
            }
            "suggestions" => {
                let window_hours = i64_or(&ctx.params, "window_hours", 24).max(1) as u32;
                let trail = ctx.state.coordinator.audit_trail().await;
                let suggestions = ctx
                    .state
                    .drift
                    .observe_rollback_frequency(&trail, window_hours);
                OperationResult::ok(serde_json::json!({
                    "learning_enabled": ctx.state.drift.is_enabled(),
                    "suggestions": suggestions,
                }))
            }
            other => unknown_method("controls.query", other),
        }
    }
}

/// `controls.killswitch.read`: switch state and activation history.
pub struct KillswitchReadHandler;

#[async_trait]
impl OperationHandler for KillswitchReadHandler {
    fn name(&self) -> &'static str {
        "controls.killswitch.read"
    }

    async fn execute(&self, ctx: &mut OperationContext<'_>) -> OperationResult {
        let method = match require_method(&ctx.params) {
            Ok(method) => method.to_string(),
            Err(err) => return param_fail(err),
        };

        match method.as_str() {
            "get_state" => OperationResult::ok(serde_json::json!({
                "active": ctx.state.coordinator.is_kill_switch_active().await,
                "active_envelopes": ctx.state.coordinator.active_count().await,
            })),
            "events" => {
                let events = ctx.state.coordinator.killswitch_events().await;
                OperationResult::ok(serde_json::to_value(events).unwrap_or_default())
            }
            other => unknown_method("controls.killswitch.read", other),
        }
    }
}

/// `controls.killswitch.write`: activate or re-arm.
pub struct KillswitchWriteHandler;

#[async_trait]
impl OperationHandler for KillswitchWriteHandler {
    fn name(&self) -> &'static str {
        "controls.killswitch.write"
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
            "activate" => {
                let reason = match require_str(&ctx.params, "reason") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                let triggered_by = match opt_str(&ctx.params, "triggered_by") {
                    Some("human") | None => KillSwitchTrigger::Human,
                    Some("system") => KillSwitchTrigger::System,
                    Some(other) => {
                        return OperationResult::fail(
                            codes::VALIDATION_ERROR,
                            format!("triggered_by must be human or system, got {other}"),
                        )
                    }
                };

                if let Err(result) = acquire_coordination(ctx).await {
                    return result;
                }

                let audit_mark = ctx.state.coordinator.audit_trail_len().await;
                let outcome = ctx
                    .state
                    .coordinator
                    .activate_kill_switch(&reason, triggered_by)
                    .await;

                if let Err(result) = persist_new_audits(ctx, audit_mark).await {
                    return result;
                }
                if let Err(err) = ctx
                    .scope
                    .insert_killswitch_event(killswitch_row(&outcome.event))
                    .await
                {
                    return store_fail(err);
                }
                let emit = ctx
                    .state
                    .emitter
                    .emit(
                        ctx.scope,
                        EventPayload::new(
                            "controls.killswitch_activated",
                            &ctx.tenant_id,
                            "coordinator",
                        )
                        .with_actor(triggered_by.as_str())
                        .with_context(serde_json::json!({
                            "event_id": outcome.event.event_id,
                            "reverted_ids": outcome.reverted_ids,
                            "active_envelopes_count": outcome.event.active_envelopes_count,
                        })),
                    )
                    .await;
                if let Err(err) = emit {
                    return OperationResult::fail(codes::SERVICE_ERROR, err.to_string());
                }

                OperationResult::ok(serde_json::json!({
                    "event": outcome.event,
                    "reverted_ids": outcome.reverted_ids,
                }))
            }
            "rearm" => {
                if let Err(result) = acquire_coordination(ctx).await {
                    return result;
                }
                let audit_mark = ctx.state.coordinator.audit_trail_len().await;
                ctx.state.coordinator.rearm().await;
                if let Err(result) = persist_new_audits(ctx, audit_mark).await {
                    return result;
                }
                let emit = ctx
                    .state
                    .emitter
                    .emit(
                        ctx.scope,
                        EventPayload::new(
                            "controls.killswitch_rearmed",
                            &ctx.tenant_id,
                            "coordinator",
                        )
                        .with_actor("human"),
                    )
                    .await;
                if let Err(err) = emit {
                    return OperationResult::fail(codes::SERVICE_ERROR, err.to_string());
                }
                OperationResult::ok(serde_json::json!({ "rearmed": true }))
            }
            other => unknown_method("controls.killswitch.write", other),
        }
    }
}

/// `controls.envelope.write`: apply, revert, and expire envelopes through
/// the coordinator. The only legal entry into envelope state.
pub struct EnvelopeWriteHandler;

#[async_trait]
impl OperationHandler for EnvelopeWriteHandler {
    fn name(&self) -> &'static str {
        "controls.envelope.write"
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
            "apply" => {
                let Some(raw_envelope) = ctx.params.get("envelope").cloned() else {
                    return OperationResult::fail(
                        codes::MISSING_PARAM,
                        "Missing 'envelope' in params",
                    );
                };
                let mut envelope: Envelope = match serde_json::from_value(raw_envelope) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        return OperationResult::fail(
                            codes::VALIDATION_ERROR,
                            format!("Malformed envelope: {err}"),
                        )
                    }
                };

                // The handler is the trust boundary: wire lifecycle claims
                // are discarded and the gates re-run here.
                envelope.lifecycle = EnvelopeLifecycle::Proposed;
                envelope.applied_at = None;
                envelope.reverted_at = None;
                envelope.revert_reason = None;
                if let Err(err) = envelope.validate() {
                    return OperationResult::fail(codes::VALIDATION_ERROR, err.to_string());
                }

                let apply_ctx = ApplyContext {
                    prediction_id: opt_str(&ctx.params, "prediction_id").map(str::to_string),
                    prediction_confidence: opt_f64(&ctx.params, "prediction_confidence"),
                };

                if let Err(result) = acquire_coordination(ctx).await {
                    return result;
                }

                let audit_mark = ctx.state.coordinator.audit_trail_len().await;
                let outcome = match ctx
                    .state
                    .coordinator
                    .apply(envelope, apply_ctx, None)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        // Invariant violation: fatal log, surfaced as 5xx.
                        tracing::error!(error = %err, "envelope apply contract violated");
                        return OperationResult::fail(codes::SERVICE_ERROR, err.to_string());
                    }
                };
                if let Err(result) = persist_new_audits(ctx, audit_mark).await {
                    return result;
                }

                OperationResult::ok(serde_json::json!({
                    "applied": outcome.applied,
                    "applied_value": outcome.applied_value,
                    "preempted_ids": outcome.preempted_ids,
                    "rejection_code": outcome.rejection_code,
                    "conflicting_envelope_id": outcome.conflicting_envelope_id,
                }))
            }
            "revert" => {
                let envelope_id = match require_str(&ctx.params, "envelope_id") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                let reason = match opt_str(&ctx.params, "reason").unwrap_or("manual") {
                    "manual" => RevertReason::Manual,
                    "prediction_expired" => RevertReason::PredictionExpired,
                    "prediction_deleted" => RevertReason::PredictionDeleted,
                    other => {
                        return OperationResult::fail(
                            codes::VALIDATION_ERROR,
                            format!("Unsupported revert reason: {other}"),
                        )
                    }
                };

                if let Err(result) = acquire_coordination(ctx).await {
                    return result;
                }

                let audit_mark = ctx.state.coordinator.audit_trail_len().await;
                let reverted = ctx.state.coordinator.revert(&envelope_id, reason).await;
                if let Err(result) = persist_new_audits(ctx, audit_mark).await {
                    return result;
                }
                OperationResult::ok(serde_json::json!({
                    "reverted": reverted.is_some(),
                    "envelope": reverted,
                }))
            }
            "expire_due" => {
                if let Err(result) = acquire_coordination(ctx).await {
                    return result;
                }
                let audit_mark = ctx.state.coordinator.audit_trail_len().await;
                let expired = ctx.state.coordinator.expire_due(Utc::now()).await;
                if let Err(result) = persist_new_audits(ctx, audit_mark).await {
                    return result;
                }
                OperationResult::ok(serde_json::json!({ "expired": expired }))
            }
            other => unknown_method("controls.envelope.write", other),
        }
    }
}
