//! Latency-to-ratio mapping.
//!
//! ```text
//! ratio
//!  1.0 ┤━━━━━━━━━━━━━━━━━━━━┓
//!      │                     ╲   slope -2
//!      │                      ╲
//!  0.2 ┤                       ┃
//!  0.0 ┤                       ┗━━━━━━━━━━
//!      └────────────────────┬──┬────────── p = latency / threshold
//!                          0.6 1.0
//! ```

/// Load factor at which the heavy share starts to fall.
pub const RATIO_BREAKPOINT: f64 = 0.6;

/// How fast the heavy share falls past the breakpoint.
pub const RATIO_SLOPE: f64 = 2.0;

/// Map a smoothed latency onto the share of traffic the heavy backend should receive.
///
/// With `p = avg_latency / latency_threshold`:
/// * `p >= 1.0` gives `0.0` (saturated, everything goes elastic),
/// * `0.6 <= p < 1.0` falls linearly from `1.0` towards `0.2`,
/// * `p < 0.6` gives `1.0`.
///
/// The curve is continuous at the lower breakpoint and drops from just above `0.2`
/// straight to `0.0` at saturation. `latency_threshold` must be positive, which
/// configuration validation guarantees.
pub fn heavy_ratio(avg_latency: f64, latency_threshold: f64) -> f64 {
    let p = avg_latency / latency_threshold;

    if p >= 1.0 {
        0.0
    } else if p >= RATIO_BREAKPOINT {
        1.0 - RATIO_SLOPE * (p - RATIO_BREAKPOINT)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn saturated_sends_nothing_heavy() {
        assert_eq!(heavy_ratio(200.0, 200.0), 0.0);
        assert_eq!(heavy_ratio(310.0, 200.0), 0.0);
    }

    #[test]
    fn comfortable_sends_everything_heavy() {
        assert_eq!(heavy_ratio(0.0, 200.0), 1.0);
        assert_eq!(heavy_ratio(119.0, 200.0), 1.0);
    }

    #[test]
    fn breakpoint_is_fully_heavy() {
        assert_eq!(heavy_ratio(120.0, 200.0), 1.0);
    }

    #[test]
    fn interpolates_between_breakpoints() {
        assert!((heavy_ratio(160.0, 200.0) - 0.6).abs() < EPS);
        assert!((heavy_ratio(140.0, 200.0) - 0.8).abs() < EPS);
        assert!((heavy_ratio(180.0, 200.0) - 0.4).abs() < EPS);
    }

    #[test]
    fn drops_to_zero_only_at_saturation() {
        let r = heavy_ratio(199.999, 200.0);
        assert!((r - 0.2).abs() < 1e-4);
        assert!(r > 0.2);
        assert_eq!(heavy_ratio(200.0, 200.0), 0.0);
    }

    proptest! {
        #[test]
        fn always_within_unit_interval(latency in 0.0f64..10_000.0, threshold in 1.0f64..5_000.0) {
            let r = heavy_ratio(latency, threshold);
            prop_assert!((0.0..=1.0).contains(&r));
        }

        #[test]
        fn never_increases_with_latency(a in 0.0f64..1_000.0, b in 0.0f64..1_000.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(heavy_ratio(hi, 200.0) <= heavy_ratio(lo, 200.0));
        }
    }
}
