//! Resource usage trend analysis over a route's snapshot history.

use crate::domain::metrics::SnapshotHistory;

/// Composite score above which usage is considered to be changing rapidly.
pub const RAPID_CHANGE_THRESHOLD: f64 = 10.0;

/// Direction and speed of resource usage change.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Trend {
    /// Whether `|score|` exceeds [`RAPID_CHANGE_THRESHOLD`].
    pub rapid_change: bool,
    /// Mean per-tick change of CPU, memory and request rate, averaged together.
    pub score: f64,
}

impl Trend {
    /// Usage is climbing fast enough to migrate before a threshold is crossed.
    pub fn is_rising_fast(&self) -> bool {
        self.rapid_change && self.score > 0.0
    }
}

/// Compute the usage trend of a history.
///
/// Fewer than two snapshots carry no trend.
pub fn analyze(history: &SnapshotHistory) -> Trend {
    if history.len() < 2 {
        return Trend::default();
    }

    let (mut cpu, mut mem, mut req) = (0.0, 0.0, 0.0);
    for (prev, next) in history.iter().zip(history.iter().skip(1)) {
        cpu += next.cpu_utilization - prev.cpu_utilization;
        mem += next.memory_utilization - prev.memory_utilization;
        req += next.request_rate - prev.request_rate;
    }

    let steps = (history.len() - 1) as f64;
    let score = (cpu / steps + mem / steps + req / steps) / 3.0;

    Trend {
        rapid_change: score.abs() > RAPID_CHANGE_THRESHOLD,
        score,
    }
}
