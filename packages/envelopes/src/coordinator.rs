//! Multi-envelope coordination.
//!
//! Every state change serializes on one mutex protecting the active-envelope
//! map, the parameter index, the kill-switch flag, and audit emission.
//! Across instances, singleton ownership comes from a named lock
//! (see [`crate::lease`]); dual writers are prevented by the lock layer, not
//! by optimistic CAS.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::audit::{CoordinationAuditRecord, CoordinationDecisionType};
use crate::killswitch::{KillSwitchEvent, KillSwitchTrigger, RollbackStatus};
use crate::types::{
    has_higher_priority, Envelope, EnvelopeClass, EnvelopeLifecycle, RevertReason,
};

/// Callback invoked with the baseline value when an envelope reverts. The
/// observer sees the authoritative baseline before state cleanup.
pub type RevertCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Unrecoverable coordination failures. These are programmer errors: the
/// caller violated the apply contract.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("envelope {envelope_id} must be validated before apply, lifecycle is {lifecycle:?}")]
    NotValidated {
        envelope_id: String,
        lifecycle: EnvelopeLifecycle,
    },
}

/// Prediction context presented at apply time.
#[derive(Debug, Clone, Default)]
pub struct ApplyContext {
    pub prediction_id: Option<String>,
    pub prediction_confidence: Option<f64>,
}

/// Result of one apply attempt.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub applied: bool,
    /// The bounded value now in effect, when applied.
    pub applied_value: Option<f64>,
    /// Envelopes this application preempted, in registration order.
    pub preempted_ids: Vec<String>,
    pub rejection_code: Option<String>,
    pub conflicting_envelope_id: Option<String>,
}

impl ApplyOutcome {
    fn applied(value: f64, preempted_ids: Vec<String>) -> Self {
        Self {
            applied: true,
            applied_value: Some(value),
            preempted_ids,
            rejection_code: None,
            conflicting_envelope_id: None,
        }
    }

    fn rejected(code: &str) -> Self {
        Self {
            applied: false,
            applied_value: None,
            preempted_ids: Vec::new(),
            rejection_code: Some(code.to_string()),
            conflicting_envelope_id: None,
        }
    }
}

/// Result of a kill-switch activation.
#[derive(Debug, Clone)]
pub struct KillSwitchOutcome {
    pub event: KillSwitchEvent,
    /// Envelopes reverted by this activation, in registration order.
    pub reverted_ids: Vec<String>,
}

/// Point-in-time coordination statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CoordinationStats {
    pub active_envelopes: usize,
    pub kill_switch_active: bool,
    pub audit_trail_size: usize,
    pub envelopes_by_class: HashMap<String, usize>,
    pub controlled_parameters: Vec<String>,
}

struct CoordState {
    active: HashMap<String, Envelope>,
    /// Registration order; kill-switch reverts walk this front to back.
    order: Vec<String>,
    /// `subsystem.parameter` → envelope id, for same-parameter conflicts.
    parameter_index: HashMap<String, String>,
    callbacks: HashMap<String, RevertCallback>,
    audit_trail: Vec<CoordinationAuditRecord>,
    kill_switch_active: bool,
    killswitch_events: Vec<KillSwitchEvent>,
}

impl CoordState {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
            order: Vec::new(),
            parameter_index: HashMap::new(),
            callbacks: HashMap::new(),
            audit_trail: Vec::new(),
            kill_switch_active: false,
            killswitch_events: Vec::new(),
        }
    }

    fn emit_audit(&mut self, record: CoordinationAuditRecord) {
        tracing::info!(
            audit_id = %record.audit_id,
            envelope_id = %record.envelope_id,
            decision = %record.decision.as_str(),
            reason = %record.reason,
            active_count = record.active_envelopes_count,
            "coordination decision"
        );
        self.audit_trail.push(record);
    }

    /// Revert one envelope. The callback runs before state cleanup so the
    /// observer sees the authoritative baseline. Idempotent: a second revert
    /// returns `None`.
    fn revert_envelope(
        &mut self,
        envelope_id: &str,
        reason: RevertReason,
        preempting_envelope_id: Option<&str>,
    ) -> Option<Envelope> {
        let mut envelope = self.active.get(envelope_id)?.clone();

        if let Some(callback) = self.callbacks.get(envelope_id) {
            callback(envelope.baseline.value);
        }

        self.active.remove(envelope_id);
        self.order.retain(|id| id != envelope_id);
        self.parameter_index.remove(&envelope.parameter_key());
        self.callbacks.remove(envelope_id);

        envelope.lifecycle = if reason == RevertReason::TimeboxExpired {
            EnvelopeLifecycle::Expired
        } else {
            EnvelopeLifecycle::Reverted
        };
        envelope.reverted_at = Some(Utc::now());
        envelope.revert_reason = Some(reason);

        let record = match reason {
            RevertReason::Preempted => {
                let mut record = CoordinationAuditRecord::new(
                    envelope_id,
                    envelope.class,
                    CoordinationDecisionType::Preempted,
                    "Preempted by higher-priority envelope",
                    self.active.len(),
                );
                if let Some(preempting) = preempting_envelope_id {
                    record = record.with_preempting(preempting);
                }
                record
            }
            _ => CoordinationAuditRecord::new(
                envelope_id,
                envelope.class,
                CoordinationDecisionType::Expired,
                reason.as_str(),
                self.active.len(),
            ),
        };
        self.emit_audit(record);

        tracing::info!(
            envelope_id = %envelope_id,
            reason = %reason.as_str(),
            "envelope reverted"
        );
        Some(envelope)
    }

    /// Active envelopes on the same subsystem with lower-priority classes,
    /// in registration order. Same-parameter never lands here; it rejects.
    fn preemption_targets(&self, incoming: &Envelope, incoming_class: EnvelopeClass) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.active.get(*id).is_some_and(|active| {
                    active.scope.target_subsystem == incoming.scope.target_subsystem
                        && active
                            .class
                            .is_some_and(|class| has_higher_priority(incoming_class, class))
                })
            })
            .cloned()
            .collect()
    }
}

/// The only legal path through which envelopes apply.
pub struct Coordinator {
    state: Mutex<CoordState>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CoordState::new()),
        }
    }

    /// Apply an envelope after the coordination check.
    ///
    /// The envelope must be `validated`; anything else is a programmer
    /// error. Preemption and application happen in one serialized step
    /// behind the coordinator mutex.
    pub async fn apply(
        &self,
        mut envelope: Envelope,
        ctx: ApplyContext,
        revert_callback: Option<RevertCallback>,
    ) -> Result<ApplyOutcome, CoordinationError> {
        if envelope.lifecycle != EnvelopeLifecycle::Validated {
            return Err(CoordinationError::NotValidated {
                envelope_id: envelope.envelope_id.clone(),
                lifecycle: envelope.lifecycle,
            });
        }

        let mut state = self.state.lock().await;

        if state.kill_switch_active {
            let count = state.active.len();
            state.emit_audit(CoordinationAuditRecord::new(
                &envelope.envelope_id,
                envelope.class,
                CoordinationDecisionType::Rejected,
                "Kill-switch active",
                count,
            ));
            return Ok(ApplyOutcome::rejected("kill_switch_active"));
        }

        let Some(class) = envelope.class else {
            let count = state.active.len();
            state.emit_audit(CoordinationAuditRecord::new(
                &envelope.envelope_id,
                None,
                CoordinationDecisionType::Rejected,
                "No envelope class declared",
                count,
            ));
            return Ok(ApplyOutcome::rejected("missing_class"));
        };

        // Trigger gating: a missing or under-confidence prediction is a safe
        // no-op, never an error.
        if envelope.trigger.min_confidence > 0.0 {
            let confident = ctx
                .prediction_confidence
                .is_some_and(|confidence| confidence >= envelope.trigger.min_confidence);
            if !confident {
                let count = state.active.len();
                state.emit_audit(CoordinationAuditRecord::new(
                    &envelope.envelope_id,
                    envelope.class,
                    CoordinationDecisionType::Rejected,
                    "Prediction missing or below confidence threshold",
                    count,
                ));
                return Ok(ApplyOutcome::rejected("prediction_unavailable"));
            }
        }

        let param_key = envelope.parameter_key();
        if let Some(existing_id) = state.parameter_index.get(&param_key).cloned() {
            let count = state.active.len();
            state.emit_audit(
                CoordinationAuditRecord::new(
                    &envelope.envelope_id,
                    envelope.class,
                    CoordinationDecisionType::Rejected,
                    format!("Same-parameter conflict: {param_key} already controlled by {existing_id}"),
                    count,
                )
                .with_conflicting(&existing_id),
            );
            let mut outcome = ApplyOutcome::rejected("conflict");
            outcome.conflicting_envelope_id = Some(existing_id);
            return Ok(outcome);
        }

        let preempted_ids = state.preemption_targets(&envelope, class);
        for target in &preempted_ids {
            state.revert_envelope(target, RevertReason::Preempted, Some(&envelope.envelope_id));
        }

        envelope.lifecycle = EnvelopeLifecycle::Active;
        envelope.applied_at = Some(Utc::now());
        let applied_value = envelope.bounded_applied_value();
        let envelope_id = envelope.envelope_id.clone();

        state.order.push(envelope_id.clone());
        state.parameter_index.insert(param_key.clone(), envelope_id.clone());
        if let Some(callback) = revert_callback {
            state.callbacks.insert(envelope_id.clone(), callback);
        }
        state.active.insert(envelope_id.clone(), envelope.clone());

        let count = state.active.len();
        state.emit_audit(CoordinationAuditRecord::new(
            &envelope_id,
            envelope.class,
            CoordinationDecisionType::Applied,
            format!("Applied successfully, preempted {} envelope(s)", preempted_ids.len()),
            count,
        ));

        tracing::info!(
            envelope_id = %envelope_id,
            class = %class.as_str(),
            parameter = %param_key,
            applied_value,
            preempted = preempted_ids.len(),
            "envelope applied"
        );

        Ok(ApplyOutcome::applied(applied_value, preempted_ids))
    }

    /// Explicitly revert one envelope. Returns the reverted envelope, or
    /// `None` when it is not active (idempotent).
    pub async fn revert(&self, envelope_id: &str, reason: RevertReason) -> Option<Envelope> {
        let mut state = self.state.lock().await;
        let reverted = state.revert_envelope(envelope_id, reason, None);
        if reverted.is_none() {
            tracing::warn!(envelope_id = %envelope_id, "revert target not active");
        }
        reverted
    }

    /// Expire an envelope whose timebox lapsed. Returns `false` when it is
    /// not active.
    pub async fn expire(&self, envelope_id: &str) -> bool {
        let mut state = self.state.lock().await;
        state
            .revert_envelope(envelope_id, RevertReason::TimeboxExpired, None)
            .is_some()
    }

    /// Expire every active envelope whose timebox has lapsed at `now`.
    /// Returns the expired ids. Drives hard-expiry without manual
    /// intervention.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.state.lock().await;
        let due: Vec<String> = state
            .order
            .iter()
            .filter(|id| {
                state.active.get(*id).is_some_and(|envelope| {
                    envelope.applied_at.is_some_and(|applied_at| {
                        applied_at + Duration::seconds(envelope.timebox.max_duration_seconds) <= now
                    })
                })
            })
            .cloned()
            .collect();
        for id in &due {
            state.revert_envelope(id, RevertReason::TimeboxExpired, None);
        }
        due
    }

    /// Activate the kill-switch: revert every active envelope atomically and
    /// block new applications until re-armed.
    ///
    /// Idempotent: a second activation reverts nothing but still emits an
    /// event. Requires no prediction or external signal. Fail-safe: the flag
    /// stays set no matter what the rollback reports.
    pub async fn activate_kill_switch(
        &self,
        reason: &str,
        triggered_by: KillSwitchTrigger,
    ) -> KillSwitchOutcome {
        let mut state = self.state.lock().await;

        if state.kill_switch_active {
            let mut event = KillSwitchEvent::new(triggered_by, reason, 0);
            event.rollback_completed_at = Some(Utc::now());
            state.killswitch_events.push(event.clone());
            tracing::warn!(reason = %reason, "kill-switch already active");
            return KillSwitchOutcome {
                event,
                reverted_ids: Vec::new(),
            };
        }

        state.kill_switch_active = true;
        let active_count = state.active.len();
        let to_revert = state.order.clone();

        let mut reverted_ids = Vec::with_capacity(to_revert.len());
        for envelope_id in to_revert {
            if state
                .revert_envelope(&envelope_id, RevertReason::KillSwitch, None)
                .is_some()
            {
                reverted_ids.push(envelope_id);
            }
        }

        let mut event = KillSwitchEvent::new(triggered_by, reason, active_count);
        event.rollback_status = if reverted_ids.len() == active_count {
            RollbackStatus::Success
        } else {
            RollbackStatus::Partial
        };
        event.rollback_completed_at = Some(Utc::now());
        state.killswitch_events.push(event.clone());

        tracing::warn!(
            reason = %reason,
            triggered_by = %triggered_by.as_str(),
            reverted = reverted_ids.len(),
            "kill-switch activated"
        );

        KillSwitchOutcome {
            event,
            reverted_ids,
        }
    }

    /// Explicitly re-arm after a kill-switch activation. Audited.
    pub async fn rearm(&self) {
        let mut state = self.state.lock().await;
        state.kill_switch_active = false;
        let count = state.active.len();
        state.emit_audit(CoordinationAuditRecord::new(
            "kill-switch",
            None,
            CoordinationDecisionType::Applied,
            "kill_switch_rearmed",
            count,
        ));
        tracing::warn!("kill-switch re-armed, envelope applications may resume");
    }

    pub async fn is_kill_switch_active(&self) -> bool {
        self.state.lock().await.kill_switch_active
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn get_active_envelopes(&self) -> Vec<Envelope> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.active.get(id).cloned())
            .collect()
    }

    /// The active envelope controlling a specific parameter, if any.
    pub async fn envelope_for_parameter(
        &self,
        subsystem: &str,
        parameter: &str,
    ) -> Option<Envelope> {
        let state = self.state.lock().await;
        let key = format!("{subsystem}.{parameter}");
        state
            .parameter_index
            .get(&key)
            .and_then(|id| state.active.get(id).cloned())
    }

    pub async fn audit_trail(&self) -> Vec<CoordinationAuditRecord> {
        self.state.lock().await.audit_trail.clone()
    }

    /// Audit records appended after `index`. Lets the caller persist the
    /// decisions of a single call.
    pub async fn audit_trail_since(&self, index: usize) -> Vec<CoordinationAuditRecord> {
        let state = self.state.lock().await;
        state.audit_trail.iter().skip(index).cloned().collect()
    }

    pub async fn audit_trail_len(&self) -> usize {
        self.state.lock().await.audit_trail.len()
    }

    pub async fn killswitch_events(&self) -> Vec<KillSwitchEvent> {
        self.state.lock().await.killswitch_events.clone()
    }

    pub async fn stats(&self) -> CoordinationStats {
        let state = self.state.lock().await;
        let mut by_class: HashMap<String, usize> = HashMap::new();
        for class in EnvelopeClass::all() {
            let count = state
                .active
                .values()
                .filter(|envelope| envelope.class == Some(class))
                .count();
            by_class.insert(class.as_str().to_string(), count);
        }
        let mut parameters: Vec<String> = state.parameter_index.keys().cloned().collect();
        parameters.sort();
        CoordinationStats {
            active_envelopes: state.active.len(),
            kill_switch_active: state.kill_switch_active,
            audit_trail_size: state.audit_trail.len(),
            envelopes_by_class: by_class,
            controlled_parameters: parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        BaselineSource, DeltaType, EnvelopeBaseline, EnvelopeBounds, EnvelopeScope,
        EnvelopeTimebox, EnvelopeTrigger,
    };
    use parking_lot::Mutex as PlMutex;

    fn envelope(
        id: &str,
        class: EnvelopeClass,
        subsystem: &str,
        parameter: &str,
        baseline_value: f64,
    ) -> Envelope {
        let mut envelope = Envelope {
            envelope_id: id.to_string(),
            envelope_version: "1.0.0".to_string(),
            class: Some(class),
            scope: EnvelopeScope {
                target_subsystem: subsystem.to_string(),
                target_parameter: parameter.to_string(),
            },
            bounds: EnvelopeBounds {
                delta_type: DeltaType::Percent,
                max_increase: 20.0,
                max_decrease: 0.0,
                absolute_ceiling: None,
            },
            timebox: EnvelopeTimebox {
                max_duration_seconds: 600,
                hard_expiry: true,
            },
            baseline: EnvelopeBaseline {
                source: BaselineSource::ConfigDefault,
                reference_id: "v1".to_string(),
                value: baseline_value,
            },
            revert_on: vec![
                RevertReason::PredictionExpired,
                RevertReason::PredictionDeleted,
                RevertReason::KillSwitch,
            ],
            trigger: EnvelopeTrigger {
                prediction_type: "incident_risk".to_string(),
                min_confidence: 0.5,
            },
            lifecycle: EnvelopeLifecycle::Proposed,
            applied_at: None,
            reverted_at: None,
            revert_reason: None,
        };
        envelope.validate().unwrap();
        envelope
    }

    fn confident() -> ApplyContext {
        ApplyContext {
            prediction_id: Some("pred-1".to_string()),
            prediction_confidence: Some(0.85),
        }
    }

    fn recorder() -> (RevertCallback, Arc<PlMutex<Vec<f64>>>) {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: RevertCallback = Arc::new(move |value| sink.lock().push(value));
        (callback, seen)
    }

    #[tokio::test]
    async fn test_apply_requires_validated_lifecycle() {
        let coordinator = Coordinator::new();
        let mut raw = envelope("env-1", EnvelopeClass::Cost, "router", "weights", 1.0);
        raw.lifecycle = EnvelopeLifecycle::Proposed;

        let result = coordinator.apply(raw, confident(), None).await;
        assert!(matches!(
            result,
            Err(CoordinationError::NotValidated { .. })
        ));
    }

    #[tokio::test]
    async fn test_same_parameter_conflict_rejects_second() {
        let coordinator = Coordinator::new();

        let first = coordinator
            .apply(
                envelope("env-1", EnvelopeClass::Reliability, "retry_policy", "initial_backoff_ms", 100.0),
                confident(),
                None,
            )
            .await
            .unwrap();
        assert!(first.applied);

        let second = coordinator
            .apply(
                envelope("env-2", EnvelopeClass::Cost, "retry_policy", "initial_backoff_ms", 100.0),
                confident(),
                None,
            )
            .await
            .unwrap();

        assert!(!second.applied);
        assert_eq!(second.rejection_code.as_deref(), Some("conflict"));
        assert_eq!(second.conflicting_envelope_id.as_deref(), Some("env-1"));
        assert_eq!(coordinator.active_count().await, 1);

        let trail = coordinator.audit_trail().await;
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].decision, CoordinationDecisionType::Applied);
        assert_eq!(trail[1].decision, CoordinationDecisionType::Rejected);
        assert_eq!(trail[1].conflicting_envelope_id.as_deref(), Some("env-1"));
    }

    #[tokio::test]
    async fn test_priority_preemption_within_subsystem() {
        let coordinator = Coordinator::new();
        let (callback, reverted_values) = recorder();

        coordinator
            .apply(
                envelope("env-1", EnvelopeClass::Reliability, "retry_policy", "initial_backoff_ms", 100.0),
                confident(),
                Some(callback),
            )
            .await
            .unwrap();

        let outcome = coordinator
            .apply(
                envelope("env-2", EnvelopeClass::Cost, "retry_policy", "max_retries", 3.0),
                confident(),
                None,
            )
            .await
            .unwrap();

        assert!(outcome.applied);
        assert_eq!(outcome.preempted_ids, vec!["env-1"]);
        assert_eq!(coordinator.active_count().await, 1);
        // Callback restored the preempted envelope's baseline.
        assert_eq!(reverted_values.lock().as_slice(), &[100.0]);

        let trail = coordinator.audit_trail().await;
        let preempted = trail
            .iter()
            .find(|r| r.decision == CoordinationDecisionType::Preempted)
            .expect("preemption audited");
        assert_eq!(preempted.envelope_id, "env-1");
        assert_eq!(preempted.preempting_envelope_id.as_deref(), Some("env-2"));
        assert!(trail
            .iter()
            .any(|r| r.decision == CoordinationDecisionType::Applied && r.envelope_id == "env-2"));
    }

    #[tokio::test]
    async fn test_lower_priority_does_not_preempt() {
        let coordinator = Coordinator::new();

        coordinator
            .apply(
                envelope("env-1", EnvelopeClass::Cost, "retry_policy", "max_retries", 3.0),
                confident(),
                None,
            )
            .await
            .unwrap();

        let outcome = coordinator
            .apply(
                envelope("env-2", EnvelopeClass::Reliability, "retry_policy", "initial_backoff_ms", 100.0),
                confident(),
                None,
            )
            .await
            .unwrap();

        // Different parameter, lower priority: coexists without preemption.
        assert!(outcome.applied);
        assert!(outcome.preempted_ids.is_empty());
        assert_eq!(coordinator.active_count().await, 2);
    }

    #[tokio::test]
    async fn test_kill_switch_reverts_all_in_registration_order() {
        let coordinator = Coordinator::new();
        let (callback, reverted_values) = recorder();

        for (i, (subsystem, parameter)) in [
            ("retry_policy", "initial_backoff_ms"),
            ("router", "fanout"),
            ("cache", "ttl_seconds"),
        ]
        .into_iter()
        .enumerate()
        {
            coordinator
                .apply(
                    envelope(
                        &format!("env-{i}"),
                        EnvelopeClass::Reliability,
                        subsystem,
                        parameter,
                        100.0 + i as f64 * 10.0,
                    ),
                    confident(),
                    Some(Arc::clone(&callback)),
                )
                .await
                .unwrap();
        }
        assert_eq!(coordinator.active_count().await, 3);

        let outcome = coordinator
            .activate_kill_switch("mass kill", KillSwitchTrigger::Human)
            .await;

        assert_eq!(coordinator.active_count().await, 0);
        assert_eq!(outcome.reverted_ids, vec!["env-0", "env-1", "env-2"]);
        assert_eq!(outcome.event.active_envelopes_count, 3);
        assert_eq!(outcome.event.rollback_status, RollbackStatus::Success);
        assert!(outcome.event.rollback_completed_at.is_some());
        // Each baseline restored exactly once, in registration order.
        assert_eq!(reverted_values.lock().as_slice(), &[100.0, 110.0, 120.0]);

        // New applications are blocked until re-arm.
        let blocked = coordinator
            .apply(
                envelope("env-9", EnvelopeClass::Safety, "router", "fanout", 2.0),
                confident(),
                None,
            )
            .await
            .unwrap();
        assert!(!blocked.applied);
        assert_eq!(blocked.rejection_code.as_deref(), Some("kill_switch_active"));
    }

    #[tokio::test]
    async fn test_kill_switch_idempotent_and_empty_activation() {
        let coordinator = Coordinator::new();

        // Activation with nothing active still emits an event.
        let first = coordinator
            .activate_kill_switch("pre-emptive", KillSwitchTrigger::System)
            .await;
        assert_eq!(first.event.active_envelopes_count, 0);
        assert_eq!(first.event.rollback_status, RollbackStatus::Success);

        // Second activation is a no-op that still emits an event.
        let second = coordinator
            .activate_kill_switch("again", KillSwitchTrigger::Human)
            .await;
        assert!(second.reverted_ids.is_empty());
        assert_eq!(coordinator.killswitch_events().await.len(), 2);
        assert!(coordinator.is_kill_switch_active().await);
    }

    #[tokio::test]
    async fn test_rearm_unblocks_apply() {
        let coordinator = Coordinator::new();
        coordinator
            .activate_kill_switch("stop", KillSwitchTrigger::Human)
            .await;
        coordinator.rearm().await;
        assert!(!coordinator.is_kill_switch_active().await);

        let outcome = coordinator
            .apply(
                envelope("env-1", EnvelopeClass::Cost, "router", "fanout", 2.0),
                confident(),
                None,
            )
            .await
            .unwrap();
        assert!(outcome.applied);
    }

    #[tokio::test]
    async fn test_revert_is_idempotent() {
        let coordinator = Coordinator::new();
        let (callback, reverted_values) = recorder();

        coordinator
            .apply(
                envelope("env-1", EnvelopeClass::Cost, "router", "fanout", 2.0),
                confident(),
                Some(callback),
            )
            .await
            .unwrap();

        let first = coordinator.revert("env-1", RevertReason::Manual).await;
        assert!(first.is_some());
        assert_eq!(first.unwrap().lifecycle, EnvelopeLifecycle::Reverted);
        assert_eq!(reverted_values.lock().len(), 1);

        // Second revert returns the sentinel without error or callback.
        let second = coordinator.revert("env-1", RevertReason::Manual).await;
        assert!(second.is_none());
        assert_eq!(reverted_values.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_revert_then_reapply_reaches_identical_active_state() {
        let coordinator = Coordinator::new();
        let template = envelope("env-1", EnvelopeClass::Cost, "router", "fanout", 2.0);

        let first = coordinator
            .apply(template.clone(), confident(), None)
            .await
            .unwrap();
        coordinator.revert("env-1", RevertReason::Manual).await;

        let second = coordinator
            .apply(template.clone(), confident(), None)
            .await
            .unwrap();

        assert_eq!(first.applied_value, second.applied_value);
        let active = coordinator
            .envelope_for_parameter("router", "fanout")
            .await
            .expect("active again");
        assert_eq!(active.lifecycle, EnvelopeLifecycle::Active);
        assert_eq!(active.envelope_id, template.envelope_id);
    }

    #[tokio::test]
    async fn test_low_confidence_is_safe_noop() {
        let coordinator = Coordinator::new();

        let outcome = coordinator
            .apply(
                envelope("env-1", EnvelopeClass::Cost, "router", "fanout", 2.0),
                ApplyContext {
                    prediction_id: None,
                    prediction_confidence: Some(0.2),
                },
                None,
            )
            .await
            .unwrap();

        assert!(!outcome.applied);
        assert_eq!(outcome.rejection_code.as_deref(), Some("prediction_unavailable"));
        assert_eq!(coordinator.active_count().await, 0);

        // Missing prediction entirely is the same safe no-op.
        let outcome = coordinator
            .apply(
                envelope("env-2", EnvelopeClass::Cost, "router", "fanout", 2.0),
                ApplyContext::default(),
                None,
            )
            .await
            .unwrap();
        assert!(!outcome.applied);
    }

    #[tokio::test]
    async fn test_expire_due_honors_timebox() {
        let coordinator = Coordinator::new();
        let mut short = envelope("env-1", EnvelopeClass::Cost, "router", "fanout", 2.0);
        short.timebox.max_duration_seconds = 1;
        coordinator.apply(short, confident(), None).await.unwrap();

        // Not yet due.
        assert!(coordinator.expire_due(Utc::now()).await.is_empty());

        let expired = coordinator
            .expire_due(Utc::now() + Duration::seconds(2))
            .await;
        assert_eq!(expired, vec!["env-1"]);
        assert_eq!(coordinator.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_audit_replay_reproduces_decision_sequence() {
        let coordinator = Coordinator::new();

        coordinator
            .apply(
                envelope("env-1", EnvelopeClass::Reliability, "retry_policy", "initial_backoff_ms", 100.0),
                confident(),
                None,
            )
            .await
            .unwrap();
        coordinator
            .apply(
                envelope("env-2", EnvelopeClass::Cost, "retry_policy", "initial_backoff_ms", 100.0),
                confident(),
                None,
            )
            .await
            .unwrap();
        coordinator
            .apply(
                envelope("env-3", EnvelopeClass::Cost, "retry_policy", "max_retries", 3.0),
                confident(),
                None,
            )
            .await
            .unwrap();
        coordinator
            .activate_kill_switch("replay test", KillSwitchTrigger::System)
            .await;

        let decisions: Vec<(String, CoordinationDecisionType)> = coordinator
            .audit_trail()
            .await
            .into_iter()
            .map(|r| (r.envelope_id, r.decision))
            .collect();

        // env-3 (cost) outranks env-1 (reliability) on the same subsystem,
        // so the third apply preempts env-1 before registering env-3; the
        // kill-switch then only has env-3 left to revert.
        assert_eq!(
            decisions,
            vec![
                ("env-1".to_string(), CoordinationDecisionType::Applied),
                ("env-2".to_string(), CoordinationDecisionType::Rejected),
                ("env-1".to_string(), CoordinationDecisionType::Preempted),
                ("env-3".to_string(), CoordinationDecisionType::Applied),
                ("env-3".to_string(), CoordinationDecisionType::Expired),
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_same_parameter_applies_admit_exactly_one() {
        let coordinator = Arc::new(Coordinator::new());

        let mut handles = Vec::new();
        for i in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                coordinator
                    .apply(
                        envelope(
                            &format!("env-{i}"),
                            EnvelopeClass::Cost,
                            "router",
                            "fanout",
                            2.0,
                        ),
                        confident(),
                        None,
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut applied = 0;
        let mut conflicts = 0;
        for handle in handles {
            let outcome = handle.await.unwrap();
            if outcome.applied {
                applied += 1;
            } else {
                assert_eq!(outcome.rejection_code.as_deref(), Some("conflict"));
                assert!(outcome.conflicting_envelope_id.is_some());
                conflicts += 1;
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(coordinator.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_stats_surface() {
        let coordinator = Coordinator::new();
        coordinator
            .apply(
                envelope("env-1", EnvelopeClass::Cost, "router", "fanout", 2.0),
                confident(),
                None,
            )
            .await
            .unwrap();

        let stats = coordinator.stats().await;
        assert_eq!(stats.active_envelopes, 1);
        assert!(!stats.kill_switch_active);
        assert_eq!(stats.envelopes_by_class.get("cost"), Some(&1));
        assert_eq!(stats.controlled_parameters, vec!["router.fanout"]);
    }
}
