//! Decision primitives evaluated once per route per reconciliation tick.
//!
//! ```text
//! latency sample ─► LatencyAverager ─► heavy_ratio ──────────┐
//! MetricsSnapshot ─► SnapshotHistory ─► trend::analyze ─┐    ├─► DecisionPolicy ─► Verdict
//!                 └─► threshold::first_breach ──────────┴────┘
//! Verdict ─► ChangeLimiter ─► RoutingDecisionStore
//! ```

pub mod averager;
pub mod limiter;
pub mod policy;
pub mod ratio;
pub mod threshold;
pub mod trend;
