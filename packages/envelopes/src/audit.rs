//! Coordination audit records.
//!
//! One immutable record per decision. Replaying the trail in order
//! reproduces the decision sequence; every input is deterministic except
//! wall-clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::EnvelopeClass;

/// What the coordinator decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationDecisionType {
    Applied,
    Rejected,
    Preempted,
    Expired,
}

impl CoordinationDecisionType {
    pub fn as_str(self) -> &'static str {
        match self {
            CoordinationDecisionType::Applied => "applied",
            CoordinationDecisionType::Rejected => "rejected",
            CoordinationDecisionType::Preempted => "preempted",
            CoordinationDecisionType::Expired => "expired",
        }
    }
}

/// One coordination decision, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationAuditRecord {
    pub audit_id: String,
    pub envelope_id: String,
    pub envelope_class: Option<EnvelopeClass>,
    pub decision: CoordinationDecisionType,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub conflicting_envelope_id: Option<String>,
    pub preempting_envelope_id: Option<String>,
    pub active_envelopes_count: usize,
}

impl CoordinationAuditRecord {
    pub fn new(
        envelope_id: impl Into<String>,
        envelope_class: Option<EnvelopeClass>,
        decision: CoordinationDecisionType,
        reason: impl Into<String>,
        active_envelopes_count: usize,
    ) -> Self {
        Self {
            audit_id: Uuid::new_v4().to_string(),
            envelope_id: envelope_id.into(),
            envelope_class,
            decision,
            reason: reason.into(),
            timestamp: Utc::now(),
            conflicting_envelope_id: None,
            preempting_envelope_id: None,
            active_envelopes_count,
        }
    }

    pub fn with_conflicting(mut self, envelope_id: impl Into<String>) -> Self {
        self.conflicting_envelope_id = Some(envelope_id.into());
        self
    }

    pub fn with_preempting(mut self, envelope_id: impl Into<String>) -> Self {
        self.preempting_envelope_id = Some(envelope_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_record_builders() {
        let record = CoordinationAuditRecord::new(
            "env-2",
            Some(EnvelopeClass::Cost),
            CoordinationDecisionType::Rejected,
            "same-parameter conflict",
            1,
        )
        .with_conflicting("env-1");

        assert_eq!(record.decision.as_str(), "rejected");
        assert_eq!(record.conflicting_envelope_id.as_deref(), Some("env-1"));
        assert_eq!(record.active_envelopes_count, 1);
    }
}
