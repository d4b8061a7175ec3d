use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

use crate::types::ErrorCode;

/// One processed frame as seen by a worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionRecord {
    pub frame_index: u64,
    pub elapsed: Duration,
    pub error_code: ErrorCode,
}

/// Bounded execution log supplied by whoever runs a worker.
/// Oldest records are dropped once `capacity` is reached; totals keep counting.
#[derive(Debug, Clone)]
pub struct ExecutionHistory {
    records: VecDeque<ExecutionRecord>,
    capacity: usize,
    total: u64,
    failures: u64,
    max_elapsed: Duration,
    sum_elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistorySummary {
    pub frames: u64,
    pub failures: u64,
    pub mean_latency_us: f64,
    pub max_latency_us: u128,
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ExecutionHistory {
            records: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
            failures: 0,
            max_elapsed: Duration::ZERO,
            sum_elapsed: Duration::ZERO,
        }
    }

    pub fn record(&mut self, record: ExecutionRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.total += 1;
        if !record.error_code.is_ok() {
            self.failures += 1;
        }
        self.max_elapsed = self.max_elapsed.max(record.elapsed);
        self.sum_elapsed += record.elapsed;
        self.records.push_back(record);
    }

    /// Retained records, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.records.iter()
    }

    pub fn last(&self) -> Option<&ExecutionRecord> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Totals over every record ever seen, not just the retained window.
    pub fn summary(&self) -> HistorySummary {
        let mean = if self.total == 0 {
            0.0
        } else {
            self.sum_elapsed.as_secs_f64() * 1e6 / self.total as f64
        };
        HistorySummary {
            frames: self.total,
            failures: self.failures,
            mean_latency_us: mean,
            max_latency_us: self.max_elapsed.as_micros(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(i: u64, micros: u64, code: ErrorCode) -> ExecutionRecord {
        ExecutionRecord {
            frame_index: i,
            elapsed: Duration::from_micros(micros),
            error_code: code,
        }
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let mut history = ExecutionHistory::new(3);
        for i in 0..5 {
            history.record(rec(i, 10, ErrorCode::OK));
        }
        assert_eq!(history.len(), 3);
        let kept: Vec<u64> = history.iter().map(|r| r.frame_index).collect();
        assert_eq!(kept, vec![2, 3, 4]);
        assert_eq!(history.last().unwrap().frame_index, 4);
    }

    #[test]
    fn test_summary_counts_all_frames() {
        let mut history = ExecutionHistory::new(2);
        history.record(rec(0, 100, ErrorCode::OK));
        history.record(rec(1, 300, ErrorCode::SENSOR_FAULT));
        history.record(rec(2, 200, ErrorCode::OK));
        let summary = history.summary();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.max_latency_us, 300);
        assert!((summary.mean_latency_us - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let mut history = ExecutionHistory::new(0);
        history.record(rec(0, 1, ErrorCode::OK));
        assert_eq!(history.capacity(), 1);
        assert_eq!(history.len(), 1);
        assert_eq!(ExecutionHistory::new(4).summary().mean_latency_us, 0.0);
    }
}
