//! Aggregate counters over the run history (`performance_metrics.json`).

use serde::{Deserialize, Serialize};

use crate::core::types::{HistoryEntry, TaskStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: u64,
    pub failure: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_tasks: u64,
    pub by_status: StatusCounts,
    pub success_rate: f64,
    pub average_quality_score: f64,
    pub average_execution_time_secs: f64,
    pub pending_tasks: u64,
}

impl PerformanceMetrics {
    /// Summarize `history` plus the current pending count.
    ///
    /// Averages cover execution results only; creation entries carry no
    /// quality or timing signal.
    pub fn from_history(history: &[HistoryEntry], pending_tasks: usize) -> Self {
        let mut metrics = Self {
            total_tasks: history.len() as u64,
            pending_tasks: pending_tasks as u64,
            ..Self::default()
        };

        let mut quality_sum = 0.0;
        let mut time_sum = 0.0;
        let mut measured = 0u64;
        for entry in history {
            match entry.result.status {
                TaskStatus::Success => metrics.by_status.success += 1,
                TaskStatus::Failure => metrics.by_status.failure += 1,
                TaskStatus::Skipped => metrics.by_status.skipped += 1,
            }
            if !entry.task.is_creation() {
                quality_sum += entry.result.metrics.quality_score;
                time_sum += entry.result.metrics.execution_time_secs;
                measured += 1;
            }
        }

        if metrics.total_tasks > 0 {
            metrics.success_rate = metrics.by_status.success as f64 / metrics.total_tasks as f64;
        }
        if measured > 0 {
            metrics.average_quality_score = quality_sum / measured as f64;
            metrics.average_execution_time_secs = time_sum / measured as f64;
        }
        metrics
    }
}
