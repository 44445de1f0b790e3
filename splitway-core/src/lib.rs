//! Splitway Core functionality.
//!
//! This crate contains the domain models, configuration definitions and decision
//! primitives that power the Splitway traffic splitter: latency smoothing, the
//! latency-to-ratio mapping, hard-threshold overrides, change rate limiting and the
//! concurrent routing decision store shared with the proxy hot path.
//!
//! Nothing in here performs I/O. The control loop (`splitway-control`) feeds metric
//! readings in and commits decisions; the proxy (`splitway-proxy`) only reads them.

pub mod decision;
pub mod domain;
pub mod error;
pub mod load_balancer;

pub use decision::averager::LatencyAverager;
pub use decision::limiter::ChangeLimiter;
pub use decision::policy::{DecisionPolicy, PolicyInput, Verdict};
pub use decision::ratio::heavy_ratio;
pub use decision::threshold::Breach;
pub use decision::trend::Trend;
pub use domain::config::{PolicyKind, RouteBinding, RoutingConfig, SharedRoutingConfig};
pub use domain::metrics::{MetricsSnapshot, SnapshotHistory};
pub use domain::route::{RouteKey, RoutingDecision};
pub use domain::store::{RoutingDecisionStore, SharedDecisionStore};
pub use error::ConfigError;
pub use load_balancer::selector::{choose_backend, BackendPool};
