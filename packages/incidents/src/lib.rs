//! LedgerGate: Incident Aggregator
//!
//! Groups failures into incidents instead of creating one incident per
//! failing call. During a thousand-request outage there is one incident,
//! not a thousand.
//!
//! Features:
//! - Time-window aggregation (default 5 minutes) keyed by
//!   `(tenant, trigger_type, window_start)`
//! - Bounded related-call lists and cost deltas on merge
//! - Tenant-hour rate limiting with a synthetic overflow incident
//! - Severity escalation by affected-call count, with timeline events
//! - Idle auto-resolution sweep

pub mod aggregator;
pub mod severity;

pub use aggregator::{AggregatorConfig, FailureEvent, IncidentAggregator, IncidentOutcome};
pub use severity::{generate_incident_title, IncidentSeverityEngine, SeverityConfig};
