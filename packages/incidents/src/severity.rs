//! Incident severity decisions.
//!
//! Pure policy: band the affected-call count, escalate only upward.

use ledgergate_store::IncidentSeverity;
use serde::{Deserialize, Serialize};

/// Call-count bands for severity selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityConfig {
    /// Up to this many affected calls stays low.
    pub low_max_calls: i64,
    /// Up to this many affected calls is medium.
    pub medium_max_calls: i64,
    /// Up to this many affected calls is high; above is critical.
    pub high_max_calls: i64,
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self {
            low_max_calls: 10,
            medium_max_calls: 100,
            high_max_calls: 500,
        }
    }
}

/// Severity selection and escalation.
#[derive(Debug, Clone, Default)]
pub struct IncidentSeverityEngine {
    config: SeverityConfig,
}

impl IncidentSeverityEngine {
    pub fn new(config: SeverityConfig) -> Self {
        Self { config }
    }

    /// Severity for an incident with this many affected calls.
    pub fn severity_for_calls(&self, calls_affected: i64) -> IncidentSeverity {
        if calls_affected <= self.config.low_max_calls {
            IncidentSeverity::Low
        } else if calls_affected <= self.config.medium_max_calls {
            IncidentSeverity::Medium
        } else if calls_affected <= self.config.high_max_calls {
            IncidentSeverity::High
        } else {
            IncidentSeverity::Critical
        }
    }

    /// Escalation target, if the current count pushes past the current
    /// severity. Severity never de-escalates.
    pub fn escalation(
        &self,
        current: IncidentSeverity,
        calls_affected: i64,
    ) -> Option<IncidentSeverity> {
        let banded = self.severity_for_calls(calls_affected);
        (banded > current).then_some(banded)
    }
}

/// Human-readable incident title.
pub fn generate_incident_title(trigger_type: &str, trigger_value: &str) -> String {
    match trigger_type {
        "failure_spike" => format!("Failure spike: {trigger_value}"),
        "budget_breach" => format!("Budget breach: {trigger_value}"),
        "rate_limit_overflow" => "Incident creation rate limit reached".to_string(),
        other => format!("{other}: {trigger_value}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_bands() {
        let engine = IncidentSeverityEngine::default();
        assert_eq!(engine.severity_for_calls(1), IncidentSeverity::Low);
        assert_eq!(engine.severity_for_calls(10), IncidentSeverity::Low);
        assert_eq!(engine.severity_for_calls(11), IncidentSeverity::Medium);
        assert_eq!(engine.severity_for_calls(100), IncidentSeverity::Medium);
        assert_eq!(engine.severity_for_calls(101), IncidentSeverity::High);
        assert_eq!(engine.severity_for_calls(501), IncidentSeverity::Critical);
    }

    #[test]
    fn test_escalation_only_upward() {
        let engine = IncidentSeverityEngine::default();
        assert_eq!(
            engine.escalation(IncidentSeverity::Low, 50),
            Some(IncidentSeverity::Medium)
        );
        assert_eq!(engine.escalation(IncidentSeverity::High, 50), None);
        assert_eq!(engine.escalation(IncidentSeverity::Low, 5), None);
    }

    #[test]
    fn test_title_generation() {
        assert_eq!(
            generate_incident_title("failure_spike", "provider timeouts"),
            "Failure spike: provider timeouts"
        );
        assert_eq!(
            generate_incident_title("rate_limit_overflow", ""),
            "Incident creation rate limit reached"
        );
    }
}
