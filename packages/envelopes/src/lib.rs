//! LedgerGate: Optimization Envelope Coordinator
//!
//! Bounded, auditable, reversible mutation of runtime parameters under
//! predictive triggers, with kill-switch supremacy.
//!
//! The [`Coordinator`] is the ONLY legal path through which envelopes may
//! apply. No envelope bypasses the coordination check.
//!
//! Coordination invariants:
//! - No envelope applies without a coordination check
//! - Every envelope declares exactly one class
//! - Priority order over classes is global and immutable
//! - Same-parameter conflict always rejects the second envelope
//! - Higher-priority envelopes preempt lower-priority within a subsystem
//! - Kill-switch reverts ALL envelopes atomically
//! - Every coordination decision is audited
//! - Replaying the audit trail reproduces the decision sequence

pub mod audit;
pub mod coordinator;
pub mod drift;
pub mod killswitch;
pub mod lease;
pub mod types;
pub mod validate;

pub use audit::{CoordinationAuditRecord, CoordinationDecisionType};
pub use coordinator::{
    ApplyContext, ApplyOutcome, CoordinationError, CoordinationStats, Coordinator,
    KillSwitchOutcome, RevertCallback,
};
pub use drift::{validate_suggestion_text, DriftObserver, LearningSuggestion, SuggestionStatus};
pub use killswitch::{KillSwitchEvent, KillSwitchTrigger, RollbackStatus};
pub use lease::CoordinatorLease;
pub use types::{
    BaselineSource, DeltaType, Envelope, EnvelopeBaseline, EnvelopeBounds, EnvelopeClass,
    EnvelopeLifecycle, EnvelopeScope, EnvelopeTimebox, EnvelopeTrigger, RevertReason,
    has_higher_priority,
};
pub use validate::ValidationError;
