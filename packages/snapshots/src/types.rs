//! Snapshot engine configuration and outcomes.

use ledgergate_store::{
    AnomalyEvaluationRow, AnomalyRow, BaselineRow, CostSnapshotRow, SnapshotAggregateRow,
};
use serde::{Deserialize, Serialize};

/// Snapshot and anomaly configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Deviation magnitude that fires an anomaly, in percent.
    pub anomaly_threshold_pct: f64,
    /// Baseline windows to maintain, in days.
    pub baseline_windows: Vec<u32>,
    /// Baselines built from fewer samples are low-confidence.
    pub min_samples_high_confidence: u32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold_pct: 50.0,
            baseline_windows: vec![7, 30],
            min_samples_high_confidence: 3,
        }
    }
}

impl SnapshotConfig {
    /// Whether a baseline carries enough samples to act on.
    pub fn is_high_confidence(&self, baseline: &BaselineRow) -> bool {
        baseline.samples_count >= self.min_samples_high_confidence
    }
}

/// Everything one snapshot run produced.
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub snapshot: CostSnapshotRow,
    pub aggregates: Vec<SnapshotAggregateRow>,
    pub evaluations: Vec<AnomalyEvaluationRow>,
    pub anomalies: Vec<AnomalyRow>,
}
