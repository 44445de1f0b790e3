//! Hard resource thresholds that force a route onto the elastic pool.

use std::fmt;

use crate::domain::config::RoutingConfig;
use crate::domain::metrics::MetricsSnapshot;

/// Why a route was forced onto the elastic pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    /// CPU utilisation exceeded its threshold.
    Cpu,
    /// Memory utilisation exceeded its threshold.
    Memory,
    /// Request rate exceeded its threshold.
    RequestRate,
    /// Error rate exceeded its threshold.
    ErrorRate,
    /// No threshold was crossed but usage is climbing rapidly.
    RisingTrend,
    /// Smoothed latency reached the latency threshold.
    Latency,
}

impl Breach {
    /// A short human-readable reason, used in logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Breach::Cpu => "cpu usage exceeded threshold",
            Breach::Memory => "memory usage exceeded threshold",
            Breach::RequestRate => "request rate exceeded threshold",
            Breach::ErrorRate => "error rate exceeded threshold",
            Breach::RisingTrend => "rapid increase in resource usage",
            Breach::Latency => "heavy backend latency saturated",
        }
    }
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// The first threshold `snapshot` breaches, checked in a fixed order:
/// CPU, memory, request rate, error rate.
///
/// Comparisons are strict: a reading equal to its threshold is not a breach.
pub fn first_breach(snapshot: &MetricsSnapshot, config: &RoutingConfig) -> Option<Breach> {
    if snapshot.cpu_utilization > config.cpu_threshold {
        Some(Breach::Cpu)
    } else if snapshot.memory_utilization > config.memory_threshold {
        Some(Breach::Memory)
    } else if snapshot.request_rate > config.request_threshold {
        Some(Breach::RequestRate)
    } else if snapshot.error_rate > config.error_rate_threshold {
        Some(Breach::ErrorRate)
    } else {
        None
    }
}
