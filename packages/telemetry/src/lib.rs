//! LedgerGate: Telemetry Driver
//!
//! Pure I/O over usage and cost records. The driver writes into the scope
//! provided by the caller and never commits; the dispatcher owns the
//! transaction boundary. No business semantics live here.
//!
//! Features:
//! - At-most-once ingestion on `(tenant_id, call_id)`
//! - Batch ingestion with per-record accepted/duplicate split
//! - Summary, per-integration, and paged history reads
//! - Idempotent daily aggregate upsert with deterministic recompute

pub mod driver;
pub mod types;

pub use driver::TelemetryDriver;
pub use types::{BatchIngestOutcome, IntegrationUsage, UsageDraft, UsageSummary};
