//! Rolling run metrics

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::pipeline::StreamingEtlResult;

pub const METRICS_WINDOW: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub runs: usize,
    pub avg_duration_ms: f64,
    pub avg_rows_per_second: f64,
    pub total_attempted_rows: u64,
    pub total_rejected_rows: u64,
    /// Rejected over attempted across the window, 0 when nothing was attempted
    pub rejection_ratio: f64,
}

/// Keeps the most recent [`METRICS_WINDOW`] run results
pub struct RunMetrics {
    window: usize,
    runs: Mutex<VecDeque<StreamingEtlResult>>,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new(METRICS_WINDOW)
    }
}

impl RunMetrics {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            runs: Mutex::new(VecDeque::with_capacity(window)),
        }
    }

    pub fn record(&self, result: StreamingEtlResult) {
        let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        if runs.len() == self.window {
            runs.pop_front();
        }
        runs.push_back(result);
    }

    /// Newest last
    pub fn recent(&self) -> Vec<StreamingEtlResult> {
        let runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        runs.iter().cloned().collect()
    }

    pub fn summary(&self) -> MetricsSummary {
        let runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        if runs.is_empty() {
            return MetricsSummary::default();
        }

        let n = runs.len() as f64;
        let attempted: u64 = runs.iter().map(|r| r.attempted_rows).sum();
        let rejected: u64 = runs.iter().map(|r| r.rejected_rows).sum();

        MetricsSummary {
            runs: runs.len(),
            avg_duration_ms: runs.iter().map(|r| r.duration_ms as f64).sum::<f64>() / n,
            avg_rows_per_second: runs.iter().map(|r| r.rows_per_second).sum::<f64>() / n,
            total_attempted_rows: attempted,
            total_rejected_rows: rejected,
            rejection_ratio: if attempted == 0 {
                0.0
            } else {
                rejected as f64 / attempted as f64
            },
        }
    }
}
