//! Advisory drift observation.
//!
//! Watches rollback frequency per envelope class over a rolling window and
//! produces suggestions for human review. Output stays observational: no
//! code path applies a suggestion automatically, and a global disable
//! silently short-circuits observation.

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{CoordinationAuditRecord, CoordinationDecisionType};
use crate::types::EnvelopeClass;

/// Review status of a suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    PendingReview,
    Accepted,
    Dismissed,
}

/// A versioned, advisory-only observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningSuggestion {
    pub id: String,
    pub version: u32,
    pub suggestion_type: String,
    pub status: SuggestionStatus,
    pub envelope_class: EnvelopeClass,
    pub rollback_rate: f64,
    pub window_hours: u32,
    pub text: String,
    pub created_at: chrono::DateTime<Utc>,
    /// Always false; nothing in this crate applies suggestions.
    pub applied: bool,
}

/// Suggestion text must stay observational. Imperative phrasing is rejected
/// before a suggestion is surfaced.
pub fn validate_suggestion_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    let observational = lowered.contains("suggests");
    let imperative = ["apply ", "set ", "must ", "change ", "enable "]
        .iter()
        .any(|marker| lowered.starts_with(marker.trim_end()) || lowered.contains(marker));
    observational && !imperative
}

/// Rollback-frequency observer. Disabled by default.
#[derive(Debug)]
pub struct DriftObserver {
    enabled: RwLock<bool>,
    /// Revert share above which a class draws a suggestion.
    rollback_rate_threshold: f64,
}

impl Default for DriftObserver {
    fn default() -> Self {
        Self::new(false)
    }
}

impl DriftObserver {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: RwLock::new(enabled),
            rollback_rate_threshold: 0.30,
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.read()
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.write() = enabled;
        tracing::info!(enabled, "drift observation toggled");
    }

    /// Observe rollback frequency per class over the rolling window.
    ///
    /// Returns suggestions for classes whose revert share crosses the
    /// threshold. When observation is disabled this silently returns
    /// nothing.
    pub fn observe_rollback_frequency(
        &self,
        records: &[CoordinationAuditRecord],
        window_hours: u32,
    ) -> Vec<LearningSuggestion> {
        if !self.is_enabled() {
            return Vec::new();
        }

        let cutoff = Utc::now() - Duration::hours(window_hours as i64);
        let mut suggestions = Vec::new();

        for class in EnvelopeClass::all() {
            let in_window: Vec<&CoordinationAuditRecord> = records
                .iter()
                .filter(|r| r.timestamp >= cutoff && r.envelope_class == Some(class))
                .collect();
            if in_window.is_empty() {
                continue;
            }

            let rollbacks = in_window
                .iter()
                .filter(|r| {
                    matches!(
                        r.decision,
                        CoordinationDecisionType::Preempted | CoordinationDecisionType::Expired
                    )
                })
                .count();
            let rate = rollbacks as f64 / in_window.len() as f64;
            if rollbacks == 0 || rate < self.rollback_rate_threshold {
                continue;
            }

            let text = format!(
                "Rollback frequency for class {} suggests its envelope bounds are drifting: \
                 {:.0}% of the last {} coordination decisions in {}h were reverts",
                class.as_str(),
                rate * 100.0,
                in_window.len(),
                window_hours,
            );
            if !validate_suggestion_text(&text) {
                tracing::error!(class = %class.as_str(), "suggestion text failed validation, dropped");
                continue;
            }

            tracing::info!(
                class = %class.as_str(),
                rollback_rate = rate,
                "drift observation produced a suggestion"
            );
            suggestions.push(LearningSuggestion {
                id: Uuid::new_v4().to_string(),
                version: 1,
                suggestion_type: "advisory".to_string(),
                status: SuggestionStatus::PendingReview,
                envelope_class: class,
                rollback_rate: rate,
                window_hours,
                text,
                created_at: Utc::now(),
                applied: false,
            });
        }
        suggestions
    }
}
