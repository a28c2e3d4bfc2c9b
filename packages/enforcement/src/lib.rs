//! LedgerGate: Enforcement Engine
//!
//! Per-call quota gating for governed LLM integrations.
//!
//! Decides: integration status, budget limits, token limits, rate limits.
//! Delegates: all data access to the reads seam (telemetry driver + store).
//!
//! ENFORCEMENT RESULT HIERARCHY:
//!     HardBlocked > Blocked > Throttled > Warned > Allowed
//!
//! Checks run in a strict order and the earliest decisive check returns;
//! warning reasons only elevate the result after every terminal check has
//! passed. Quota checks fail closed on policy violations and fail open on
//! data-source read errors (the decision is marked `degraded`).

pub mod engine;
pub mod reads;
pub mod types;

pub use engine::{EnforcementEngine, EvaluationRequest};
pub use reads::{EnforcementReads, ScopeReads};
pub use types::{
    EnforcementConfig, EnforcementDecision, EnforcementReason, EnforcementResult,
    EnforcementStatus, LimitStatus, RateStatus,
};
