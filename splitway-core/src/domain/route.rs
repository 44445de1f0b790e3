//! Route identity and per-route routing decisions.

use std::borrow::Borrow;
use std::fmt;
use std::time::SystemTime;

/// Identifies a logical API path that is split independently.
///
/// Keys are derived from the request path only; the query string never takes part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey(String);

impl RouteKey {
    /// Build a key from a request URI path. An empty path maps to `/`.
    pub fn from_path(path: &str) -> Self {
        if path.is_empty() {
            Self("/".to_string())
        } else {
            Self(path.to_string())
        }
    }

    /// The route as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RouteKey {
    fn from(path: &str) -> Self {
        Self::from_path(path)
    }
}

impl From<String> for RouteKey {
    fn from(path: String) -> Self {
        if path.is_empty() {
            Self("/".to_string())
        } else {
            Self(path)
        }
    }
}

impl Borrow<str> for RouteKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The routing state of one route as seen by the request path.
///
/// A decision is a plain value. The store replaces it wholesale on every commit, so
/// a reader either sees the previous decision or the next one, never a mix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutingDecision {
    /// Probability in `[0, 1]` that the next request goes to the heavy backend.
    pub ratio: f64,
    /// The smoothed latency (milliseconds) the ratio was computed from.
    pub latency_avg: f64,
    /// Observational request counter.
    pub request_count: u64,
    /// When this decision was produced.
    pub last_updated: SystemTime,
}

impl RoutingDecision {
    /// Create a decision stamped with the current time.
    ///
    /// The ratio is clamped into `[0, 1]` and a negative latency is floored to zero.
    pub fn new(ratio: f64, latency_avg: f64, request_count: u64) -> Self {
        Self {
            ratio: ratio.clamp(0.0, 1.0),
            latency_avg: latency_avg.max(0.0),
            request_count,
            last_updated: SystemTime::now(),
        }
    }

    /// The decision used for a route the first time it is seen.
    ///
    /// Favors the heavy backend fully so no traffic is dropped before the first
    /// reconciliation tick has produced a real decision.
    pub fn seed() -> Self {
        Self::new(1.0, 0.0, 1)
    }
}

impl Default for RoutingDecision {
    fn default() -> Self {
        Self::seed()
    }
}
