//! Interchangeable decision policies over the same routing data model.

use crate::decision::ratio::heavy_ratio;
use crate::decision::threshold::{first_breach, Breach};
use crate::decision::trend::Trend;
use crate::domain::config::{PolicyKind, RoutingConfig};
use crate::domain::metrics::MetricsSnapshot;

/// What a policy wants to happen to one route this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Split traffic with this heavy share.
    Ratio(f64),
    /// Send everything to the elastic pool.
    ForceElastic(Breach),
    /// Send everything back to the heavy pool.
    ForceHeavy,
    /// Leave the current assignment alone.
    Keep,
}

impl Verdict {
    /// The heavy share this verdict resolves to, given the route's current share.
    pub fn target_ratio(&self, current: f64) -> f64 {
        match self {
            Verdict::Ratio(r) => *r,
            Verdict::ForceElastic(_) => 0.0,
            Verdict::ForceHeavy => 1.0,
            Verdict::Keep => current,
        }
    }
}

/// Everything a policy may look at for one route.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    /// Output of the route's latency averager.
    pub smoothed_latency: f64,
    /// The readings collected this tick, when the policy asked for a full snapshot.
    pub snapshot: Option<&'a MetricsSnapshot>,
    /// Trend over the route's snapshot history.
    pub trend: Trend,
}

/// A strategy that turns a route's readings into a [`Verdict`].
pub trait DecisionPolicy: Send + Sync {
    /// Whether this policy needs CPU, memory, request and error readings in addition
    /// to latency.
    fn needs_full_snapshot(&self) -> bool;

    /// Decide what should happen to the route.
    fn decide(&self, input: &PolicyInput<'_>, config: &RoutingConfig) -> Verdict;
}

/// Continuous split: the heavy share follows the smoothed latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradualPolicy;

impl DecisionPolicy for GradualPolicy {
    fn needs_full_snapshot(&self) -> bool {
        false
    }

    fn decide(&self, input: &PolicyInput<'_>, config: &RoutingConfig) -> Verdict {
        Verdict::Ratio(heavy_ratio(input.smoothed_latency, config.latency_threshold))
    }
}

/// Binary switch-over: any breached threshold, a rapid upward trend or a saturated
/// heavy backend moves the whole route to the elastic pool.
///
/// Checked in that order, so a resource breach is always the reported reason.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdPolicy;

impl DecisionPolicy for ThresholdPolicy {
    fn needs_full_snapshot(&self) -> bool {
        true
    }

    fn decide(&self, input: &PolicyInput<'_>, config: &RoutingConfig) -> Verdict {
        if let Some(breach) = input.snapshot.and_then(|s| first_breach(s, config)) {
            return Verdict::ForceElastic(breach);
        }
        if input.trend.is_rising_fast() {
            return Verdict::ForceElastic(Breach::RisingTrend);
        }
        if heavy_ratio(input.smoothed_latency, config.latency_threshold) == 0.0 {
            return Verdict::ForceElastic(Breach::Latency);
        }

        if input.snapshot.is_none() {
            Verdict::Keep
        } else if config.restore_on_clear {
            Verdict::ForceHeavy
        } else {
            Verdict::Keep
        }
    }
}

impl PolicyKind {
    /// The strategy implementing this kind.
    pub fn policy(self) -> &'static dyn DecisionPolicy {
        match self {
            PolicyKind::Gradual => &GradualPolicy,
            PolicyKind::Threshold => &ThresholdPolicy,
        }
    }
}
