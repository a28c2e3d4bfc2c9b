//! LedgerGate: Snapshot & Anomaly Engine
//!
//! Aggregates usage into cost snapshots, maintains rolling baselines, and
//! detects cost anomalies against them.
//!
//! Features:
//! - Snapshot lifecycle: pending → running → (complete | failed)
//! - Duplicate `(tenant, type, period_start)` runs bump the version and
//!   reuse the row
//! - Four aggregation levels: tenant, user, feature, model
//! - 7/30-day baselines with an exactly-one-current guarantee
//! - Anomaly evaluations recorded for non-triggering checks too

pub mod engine;
pub mod types;

pub use engine::SnapshotEngine;
pub use types::{SnapshotConfig, SnapshotOutcome};
