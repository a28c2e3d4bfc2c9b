//! Kill-switch event model.
//!
//! The switch itself lives inside the coordinator state so activation and
//! envelope reverts serialize on the same lock. These types describe who
//! pulled it and what the rollback did.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who activated the kill-switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchTrigger {
    Human,
    System,
}

impl KillSwitchTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            KillSwitchTrigger::Human => "human",
            KillSwitchTrigger::System => "system",
        }
    }
}

/// Outcome of the all-revert rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Success,
    Partial,
    Failed,
}

impl RollbackStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RollbackStatus::Success => "success",
            RollbackStatus::Partial => "partial",
            RollbackStatus::Failed => "failed",
        }
    }
}

/// Append-only record of one kill-switch activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchEvent {
    pub event_id: String,
    pub triggered_by: KillSwitchTrigger,
    pub trigger_reason: String,
    pub activated_at: DateTime<Utc>,
    pub rollback_status: RollbackStatus,
    pub rollback_completed_at: Option<DateTime<Utc>>,
    pub active_envelopes_count: usize,
}

impl KillSwitchEvent {
    pub fn new(
        triggered_by: KillSwitchTrigger,
        trigger_reason: impl Into<String>,
        active_envelopes_count: usize,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            triggered_by,
            trigger_reason: trigger_reason.into(),
            activated_at: Utc::now(),
            rollback_status: RollbackStatus::Success,
            rollback_completed_at: None,
            active_envelopes_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_defaults() {
        let event = KillSwitchEvent::new(KillSwitchTrigger::Human, "operator request", 3);
        assert_eq!(event.rollback_status, RollbackStatus::Success);
        assert_eq!(event.active_envelopes_count, 3);
        assert_eq!(event.triggered_by.as_str(), "human");
    }
}
