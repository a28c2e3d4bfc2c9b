//! Envelope model: class, scope, bounds, timebox, baseline, trigger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority class. The order is global and immutable: safety outranks cost,
/// cost outranks performance, performance outranks reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeClass {
    Safety,
    Cost,
    Performance,
    Reliability,
}

impl EnvelopeClass {
    /// Numeric priority, higher wins.
    pub fn priority(self) -> u8 {
        match self {
            EnvelopeClass::Safety => 3,
            EnvelopeClass::Cost => 2,
            EnvelopeClass::Performance => 1,
            EnvelopeClass::Reliability => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeClass::Safety => "safety",
            EnvelopeClass::Cost => "cost",
            EnvelopeClass::Performance => "performance",
            EnvelopeClass::Reliability => "reliability",
        }
    }

    pub fn all() -> [EnvelopeClass; 4] {
        [
            EnvelopeClass::Safety,
            EnvelopeClass::Cost,
            EnvelopeClass::Performance,
            EnvelopeClass::Reliability,
        ]
    }
}

/// Whether `a` preempts `b`.
pub fn has_higher_priority(a: EnvelopeClass, b: EnvelopeClass) -> bool {
    a.priority() > b.priority()
}

/// How bound deltas are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaType {
    /// Delta bounds as a percentage of the baseline value.
    Percent,
    /// Delta bounds as absolute offsets.
    Absolute,
    /// Self-adjusting bounds. Rejected at validation; kept in the model so
    /// malformed proposals deserialize instead of panicking upstream.
    Adaptive,
}

/// What the envelope may touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeScope {
    pub target_subsystem: String,
    pub target_parameter: String,
}

/// How far the envelope may move the parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeBounds {
    pub delta_type: DeltaType,
    pub max_increase: f64,
    pub max_decrease: f64,
    /// Hard ceiling on the applied value, regardless of delta.
    pub absolute_ceiling: Option<f64>,
}

/// How long the envelope may live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeTimebox {
    pub max_duration_seconds: i64,
    /// When true, a scheduled expiry must fire without manual intervention.
    pub hard_expiry: bool,
}

/// Where the baseline value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineSource {
    ConfigDefault,
    Observed,
    Manual,
}

/// The authoritative pre-envelope value, versioned by reference id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeBaseline {
    pub source: BaselineSource,
    pub reference_id: String,
    pub value: f64,
}

/// Why an envelope reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertReason {
    PredictionExpired,
    PredictionDeleted,
    KillSwitch,
    Preempted,
    TimeboxExpired,
    Manual,
}

impl RevertReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RevertReason::PredictionExpired => "prediction_expired",
            RevertReason::PredictionDeleted => "prediction_deleted",
            RevertReason::KillSwitch => "kill_switch",
            RevertReason::Preempted => "preempted",
            RevertReason::TimeboxExpired => "timebox_expired",
            RevertReason::Manual => "manual",
        }
    }
}

/// Predictive trigger gating application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeTrigger {
    pub prediction_type: String,
    pub min_confidence: f64,
}

/// Envelope lifecycle. Transitions only move forward:
/// proposed → validated → active → (reverted | expired).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeLifecycle {
    Proposed,
    Validated,
    Active,
    Reverted,
    Expired,
}

/// A bounded, time-limited override of a named runtime parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub envelope_id: String,
    pub envelope_version: String,
    pub class: Option<EnvelopeClass>,
    pub scope: EnvelopeScope,
    pub bounds: EnvelopeBounds,
    pub timebox: EnvelopeTimebox,
    pub baseline: EnvelopeBaseline,
    pub revert_on: Vec<RevertReason>,
    pub trigger: EnvelopeTrigger,
    pub lifecycle: EnvelopeLifecycle,
    pub applied_at: Option<DateTime<Utc>>,
    pub reverted_at: Option<DateTime<Utc>>,
    pub revert_reason: Option<RevertReason>,
}

impl Envelope {
    /// Canonical `subsystem.parameter` key used for conflict detection.
    pub fn parameter_key(&self) -> String {
        format!(
            "{}.{}",
            self.scope.target_subsystem, self.scope.target_parameter
        )
    }

    /// The bounded value this envelope applies: the maximum allowed increase
    /// over the baseline, clamped by the absolute ceiling.
    pub fn bounded_applied_value(&self) -> f64 {
        let raised = match self.bounds.delta_type {
            DeltaType::Percent => {
                self.baseline.value * (1.0 + self.bounds.max_increase / 100.0)
            }
            DeltaType::Absolute => self.baseline.value + self.bounds.max_increase,
            // Adaptive never survives validation; treat as no delta.
            DeltaType::Adaptive => self.baseline.value,
        };
        match self.bounds.absolute_ceiling {
            Some(ceiling) => raised.min(ceiling),
            None => raised,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_is_total() {
        assert!(has_higher_priority(EnvelopeClass::Safety, EnvelopeClass::Cost));
        assert!(has_higher_priority(EnvelopeClass::Cost, EnvelopeClass::Performance));
        assert!(has_higher_priority(EnvelopeClass::Cost, EnvelopeClass::Reliability));
        assert!(has_higher_priority(EnvelopeClass::Performance, EnvelopeClass::Reliability));
        assert!(!has_higher_priority(EnvelopeClass::Reliability, EnvelopeClass::Cost));
        assert!(!has_higher_priority(EnvelopeClass::Cost, EnvelopeClass::Cost));
    }

    #[test]
    fn test_bounded_applied_value_percent_and_ceiling() {
        let mut envelope = Envelope {
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
        };

        assert!((envelope.bounded_applied_value() - 120.0).abs() < f64::EPSILON);

        envelope.bounds.absolute_ceiling = Some(110.0);
        assert!((envelope.bounded_applied_value() - 110.0).abs() < f64::EPSILON);

        envelope.bounds.delta_type = DeltaType::Absolute;
        envelope.bounds.absolute_ceiling = None;
        assert!((envelope.bounded_applied_value() - 120.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parameter_key_format() {
        let scope = EnvelopeScope {
            target_subsystem: "retry_policy".to_string(),
            target_parameter: "max_retries".to_string(),
        };
        let envelope = Envelope {
            envelope_id: "env-1".to_string(),
            envelope_version: "1.0.0".to_string(),
            class: Some(EnvelopeClass::Cost),
            scope,
            bounds: EnvelopeBounds {
                delta_type: DeltaType::Absolute,
                max_increase: 2.0,
                max_decrease: 0.0,
                absolute_ceiling: None,
            },
            timebox: EnvelopeTimebox {
                max_duration_seconds: 60,
                hard_expiry: false,
            },
            baseline: EnvelopeBaseline {
                source: BaselineSource::Observed,
                reference_id: "obs-3".to_string(),
                value: 3.0,
            },
            revert_on: vec![],
            trigger: EnvelopeTrigger {
                prediction_type: "cost_spike".to_string(),
                min_confidence: 0.7,
            },
            lifecycle: EnvelopeLifecycle::Proposed,
            applied_at: None,
            reverted_at: None,
            revert_reason: None,
        };
        assert_eq!(envelope.parameter_key(), "retry_policy.max_retries");
    }
}
