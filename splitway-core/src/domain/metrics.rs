//! Metric readings and their bounded history.

use std::collections::VecDeque;
use std::time::SystemTime;

/// Number of snapshots retained for trend analysis.
pub const HISTORY_CAPACITY: usize = 10;

/// One set of metric readings for a route, taken at a single instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    /// Requests per second.
    pub request_rate: f64,
    /// Average latency in milliseconds.
    pub avg_latency: f64,
    /// Error rate in percent.
    pub error_rate: f64,
    /// CPU utilisation in percent.
    pub cpu_utilization: f64,
    /// Memory utilisation in percent.
    pub memory_utilization: f64,
    /// When the readings were taken.
    pub timestamp: SystemTime,
}

/// The most recent snapshots of one route, oldest first.
#[derive(Debug, Clone, Default)]
pub struct SnapshotHistory {
    entries: VecDeque<MetricsSnapshot>,
}

impl SnapshotHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Append a snapshot, evicting the oldest once the history is full.
    pub fn push(&mut self, snapshot: MetricsSnapshot) {
        if self.entries.len() == HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
    }

    /// The most recent snapshot.
    pub fn latest(&self) -> Option<&MetricsSnapshot> {
        self.entries.back()
    }

    /// Snapshots from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &MetricsSnapshot> {
        self.entries.iter()
    }

    /// Number of retained snapshots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no snapshot has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(cpu: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            request_rate: 0.0,
            avg_latency: 0.0,
            error_rate: 0.0,
            cpu_utilization: cpu,
            memory_utilization: 0.0,
            timestamp: SystemTime::now(),
        }
    }

    #[test]
    fn history_is_bounded_and_fifo() {
        let mut history = SnapshotHistory::new();
        for i in 0..(HISTORY_CAPACITY + 3) {
            history.push(snap(i as f64));
        }

        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history.iter().next().unwrap().cpu_utilization, 3.0);
        assert_eq!(
            history.latest().unwrap().cpu_utilization,
            (HISTORY_CAPACITY + 2) as f64
        );
    }
}
