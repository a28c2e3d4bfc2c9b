//! Hard validation gates an envelope must pass before it may apply.

use crate::types::{DeltaType, Envelope, EnvelopeLifecycle, RevertReason};

/// Validation failures. Each maps to exactly one gate.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("envelope must declare exactly one non-empty target_parameter")]
    EmptyTargetParameter,

    #[error("bounds must be finite numerics; adaptive bounds are rejected")]
    InvalidBounds,

    #[error("timebox.max_duration_seconds must be positive, got {0}")]
    InvalidTimebox(i64),

    #[error("baseline must carry a non-empty reference_id")]
    MissingBaselineReference,

    #[error("revert_on must include prediction_expired, prediction_deleted, and kill_switch")]
    MissingRevertReasons,

    #[error("envelope must declare a class")]
    MissingClass,

    #[error("only proposed envelopes can be validated, lifecycle is {0:?}")]
    NotProposed(EnvelopeLifecycle),
}

const REQUIRED_REVERT_REASONS: [RevertReason; 3] = [
    RevertReason::PredictionExpired,
    RevertReason::PredictionDeleted,
    RevertReason::KillSwitch,
];

impl Envelope {
    /// Run every gate and transition `proposed → validated`.
    pub fn validate(&mut self) -> Result<(), ValidationError> {
        if self.lifecycle != EnvelopeLifecycle::Proposed {
            return Err(ValidationError::NotProposed(self.lifecycle));
        }

        if self.class.is_none() {
            return Err(ValidationError::MissingClass);
        }

        if self.scope.target_parameter.trim().is_empty()
            || self.scope.target_subsystem.trim().is_empty()
        {
            return Err(ValidationError::EmptyTargetParameter);
        }

        if self.bounds.delta_type == DeltaType::Adaptive
            || !self.bounds.max_increase.is_finite()
            || !self.bounds.max_decrease.is_finite()
        {
            return Err(ValidationError::InvalidBounds);
        }

        if self.timebox.max_duration_seconds <= 0 {
            return Err(ValidationError::InvalidTimebox(
                self.timebox.max_duration_seconds,
            ));
        }

        if self.baseline.reference_id.trim().is_empty() {
            return Err(ValidationError::MissingBaselineReference);
        }

        if REQUIRED_REVERT_REASONS
            .iter()
            .any(|required| !self.revert_on.contains(required))
        {
            return Err(ValidationError::MissingRevertReasons);
        }

        self.lifecycle = EnvelopeLifecycle::Validated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        BaselineSource, EnvelopeBaseline, EnvelopeBounds, EnvelopeClass, EnvelopeScope,
        EnvelopeTimebox, EnvelopeTrigger,
    };

    fn proposed() -> Envelope {
        Envelope {
            envelope_id: "env-1".to_string(),
            envelope_version: "1.0.0".to_string(),
            class: Some(EnvelopeClass::Reliability),
            scope: EnvelopeScope {
                target_subsystem: "retry_policy".to_string(),
                target_parameter: "initial_backoff_ms".to_string(),
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
                value: 100.0,
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
        }
    }

    #[test]
    fn test_valid_envelope_transitions_to_validated() {
        let mut envelope = proposed();
        envelope.validate().unwrap();
        assert_eq!(envelope.lifecycle, EnvelopeLifecycle::Validated);
    }

    #[test]
    fn test_empty_parameter_rejected() {
        let mut envelope = proposed();
        envelope.scope.target_parameter = "  ".to_string();
        assert_eq!(envelope.validate(), Err(ValidationError::EmptyTargetParameter));
    }

    #[test]
    fn test_adaptive_and_non_finite_bounds_rejected() {
        let mut envelope = proposed();
        envelope.bounds.delta_type = DeltaType::Adaptive;
        assert_eq!(envelope.validate(), Err(ValidationError::InvalidBounds));

        let mut envelope = proposed();
        envelope.bounds.max_increase = f64::NAN;
        assert_eq!(envelope.validate(), Err(ValidationError::InvalidBounds));

        let mut envelope = proposed();
        envelope.bounds.max_decrease = f64::INFINITY;
        assert_eq!(envelope.validate(), Err(ValidationError::InvalidBounds));
    }

    #[test]
    fn test_non_positive_timebox_rejected() {
        let mut envelope = proposed();
        envelope.timebox.max_duration_seconds = 0;
        assert_eq!(envelope.validate(), Err(ValidationError::InvalidTimebox(0)));
    }

    #[test]
    fn test_missing_baseline_reference_rejected() {
        let mut envelope = proposed();
        envelope.baseline.reference_id = String::new();
        assert_eq!(envelope.validate(), Err(ValidationError::MissingBaselineReference));
    }

    #[test]
    fn test_required_revert_reasons_enforced() {
        let mut envelope = proposed();
        envelope.revert_on = vec![RevertReason::PredictionExpired, RevertReason::KillSwitch];
        assert_eq!(envelope.validate(), Err(ValidationError::MissingRevertReasons));
    }

    #[test]
    fn test_missing_class_rejected() {
        let mut envelope = proposed();
        envelope.class = None;
        assert_eq!(envelope.validate(), Err(ValidationError::MissingClass));
    }

    #[test]
    fn test_already_validated_rejected() {
        let mut envelope = proposed();
        envelope.validate().unwrap();
        assert!(matches!(envelope.validate(), Err(ValidationError::NotProposed(_))));
    }
}
