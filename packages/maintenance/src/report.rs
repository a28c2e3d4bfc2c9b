//! Task execution reports.

use serde::{Deserialize, Serialize};

/// How a maintenance task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    /// Another worker holds the task lock.
    Skipped,
    Failed,
}

/// Result of one maintenance task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub name: String,
    pub status: TaskStatus,
    pub detail: String,
    pub items_processed: usize,
    pub duration_ms: u64,
}

impl TaskReport {
    pub fn success(name: &str, detail: impl Into<String>, items_processed: usize) -> Self {
        Self {
            name: name.to_string(),
            status: TaskStatus::Success,
            detail: detail.into(),
            items_processed,
            duration_ms: 0,
        }
    }

    pub fn skipped(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: TaskStatus::Skipped,
            detail: detail.into(),
            items_processed: 0,
            duration_ms: 0,
        }
    }

    pub fn failed(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: TaskStatus::Failed,
            detail: detail.into(),
            items_processed: 0,
            duration_ms: 0,
        }
    }
}

/// Whether every report ended in success. Operator visibility only; a false
/// here never gates the next run.
pub fn all_succeeded(reports: &[TaskReport]) -> bool {
    reports.iter().all(|r| r.status == TaskStatus::Success)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_constructors() {
        let ok = TaskReport::success("outbox", "delivered", 5);
        assert_eq!(ok.status, TaskStatus::Success);
        assert_eq!(ok.items_processed, 5);

        let skipped = TaskReport::skipped("matview", "lock_held");
        assert_eq!(skipped.status, TaskStatus::Skipped);

        assert!(!all_succeeded(&[ok, skipped]));
    }
}
