//! The routing configuration supplied by the control plane.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use http::Uri;
use serde::Deserialize;

use crate::error::ConfigError;

/// Which decision policy the reconciliation loop applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Continuous probabilistic split driven by smoothed latency.
    #[default]
    Gradual,
    /// Binary switch-over driven by hard resource thresholds and trends.
    Threshold,
}

/// Binds a route to the elastic target that can serve it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteBinding {
    /// The request path.
    pub route: String,
    /// Identifier of the elastic function or service serving this route.
    pub target: String,
}

/// Everything the control loop and the dispatcher read about routing.
///
/// Read-mostly: replaced as a whole when the control plane publishes a new version,
/// never mutated in place.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    /// Decision policy.
    pub policy: PolicyKind,
    /// Base URL of the capacity-heavy (serverful) pool.
    pub heavy_base: String,
    /// Base URL of the elastic (serverless) pool.
    pub elastic_base: String,
    /// Routes that have an elastic target.
    pub routes: Vec<RouteBinding>,
    /// Requests per second above which a route is forced to the elastic pool.
    pub request_threshold: f64,
    /// Latency (milliseconds) at which the heavy pool is considered saturated.
    pub latency_threshold: f64,
    /// CPU utilisation (percent) above which a route is forced to the elastic pool.
    pub cpu_threshold: f64,
    /// Memory utilisation (percent) above which a route is forced to the elastic pool.
    pub memory_threshold: f64,
    /// Error rate (percent) above which a route is forced to the elastic pool.
    pub error_rate_threshold: f64,
    /// Time between reconciliation ticks.
    #[serde(with = "serde_duration")]
    pub evaluation_interval: Duration,
    /// Minimum spacing between committed migrations of one route.
    #[serde(with = "serde_duration")]
    pub cooldown_period: Duration,
    /// Upper bound on collecting one route's readings, and on one selector update.
    #[serde(with = "serde_duration")]
    pub tick_timeout: Duration,
    /// How long a route without a binding may go without any metric reading before
    /// it is forgotten.
    #[serde(with = "serde_duration")]
    pub idle_route_ttl: Duration,
    /// Capacity of the slow latency window.
    pub slow_window_size: usize,
    /// Capacity of the fast latency window.
    pub fast_window_size: usize,
    /// Under the threshold policy, move a route back to the heavy pool once no
    /// threshold is breached instead of keeping its current assignment.
    pub restore_on_clear: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Gradual,
            heavy_base: String::new(),
            elastic_base: String::new(),
            routes: Vec::new(),
            request_threshold: 1000.0,
            latency_threshold: 200.0,
            cpu_threshold: 80.0,
            memory_threshold: 80.0,
            error_rate_threshold: 5.0,
            evaluation_interval: Duration::from_secs(10),
            cooldown_period: Duration::from_secs(10),
            tick_timeout: Duration::from_secs(5),
            idle_route_ttl: Duration::from_secs(300),
            slow_window_size: 10,
            fast_window_size: 3,
            restore_on_clear: false,
        }
    }
}

impl RoutingConfig {
    /// Check that this configuration can be put into service.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slow_window_size == 0 {
            return Err(ConfigError::InvalidWindowSize { window: "slow" });
        }
        if self.fast_window_size == 0 {
            return Err(ConfigError::InvalidWindowSize { window: "fast" });
        }

        for (name, value) in [
            ("request_threshold", self.request_threshold),
            ("latency_threshold", self.latency_threshold),
            ("cpu_threshold", self.cpu_threshold),
            ("memory_threshold", self.memory_threshold),
            ("error_rate_threshold", self.error_rate_threshold),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }

        if self.evaluation_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("evaluation_interval"));
        }
        if self.tick_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("tick_timeout"));
        }
        if self.idle_route_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration("idle_route_ttl"));
        }

        parse_base_url("heavy", &self.heavy_base)?;
        parse_base_url("elastic", &self.elastic_base)?;

        let mut seen = HashSet::new();
        for binding in &self.routes {
            if binding.route.is_empty() || binding.target.is_empty() {
                return Err(ConfigError::EmptyBinding(binding.route.clone()));
            }
            if !seen.insert(binding.route.as_str()) {
                return Err(ConfigError::DuplicateRoute(binding.route.clone()));
            }
        }

        Ok(())
    }

    /// The elastic target bound to `route`, if any.
    pub fn target_for(&self, route: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|b| b.route == route)
            .map(|b| b.target.as_str())
    }

    /// Parsed base URL of the heavy pool.
    pub fn heavy_uri(&self) -> Result<Uri, ConfigError> {
        parse_base_url("heavy", &self.heavy_base)
    }

    /// Parsed base URL of the elastic pool.
    pub fn elastic_uri(&self) -> Result<Uri, ConfigError> {
        parse_base_url("elastic", &self.elastic_base)
    }
}

/// Parse a backend base URL, accepting only plaintext `http` upstreams.
fn parse_base_url(pool: &'static str, raw: &str) -> Result<Uri, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBaseUrl {
        pool,
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let uri: Uri = raw.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
    match uri.scheme_str() {
        Some("http") => {}
        Some(_) => return Err(invalid("only http:// upstreams are supported")),
        None => return Err(invalid("missing scheme")),
    }
    if uri.authority().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(uri)
}

/// A routing configuration that can be swapped atomically while readers hold the
/// previous version.
pub type SharedRoutingConfig = Arc<ArcSwap<RoutingConfig>>;

/// Wrap a configuration for sharing between the control loop and the proxy.
pub fn shared(config: RoutingConfig) -> SharedRoutingConfig {
    Arc::new(ArcSwap::from_pointee(config))
}

/// Serde helper for durations written as human-readable strings (`"10s"`, `"5m"`).
pub mod serde_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    /// Deserialize a duration from a humantime string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
