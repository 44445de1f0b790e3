//! Weighted backend selection.

use std::fmt;

use rand::Rng;

/// One of the two backend pools traffic is split between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendPool {
    /// Capacity-provisioned (serverful) backend.
    Heavy,
    /// On-demand (serverless) backend.
    Elastic,
}

impl BackendPool {
    /// Lowercase name, as used in headers and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendPool::Heavy => "heavy",
            BackendPool::Elastic => "elastic",
        }
    }

    /// The pool a fully committed ratio points at. Split ratios have no single pool.
    pub fn for_ratio(ratio: f64) -> Option<Self> {
        if ratio >= 1.0 {
            Some(BackendPool::Heavy)
        } else if ratio <= 0.0 {
            Some(BackendPool::Elastic)
        } else {
            None
        }
    }
}

impl fmt::Display for BackendPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Draw a backend for one request: heavy with probability `ratio`, elastic otherwise.
///
/// The draw is uniform in `[0, 1)`, so a ratio of `1.0` always picks heavy and a ratio
/// of `0.0` always picks elastic.
pub fn choose_backend<R: Rng + ?Sized>(ratio: f64, rng: &mut R) -> BackendPool {
    if rng.gen::<f64>() < ratio {
        BackendPool::Heavy
    } else {
        BackendPool::Elastic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn heavy_share(ratio: f64, draws: usize, seed: u64) -> f64 {
        let mut rng = SmallRng::seed_from_u64(seed);
        let heavy = (0..draws)
            .filter(|_| choose_backend(ratio, &mut rng) == BackendPool::Heavy)
            .count();
        heavy as f64 / draws as f64
    }

    #[test]
    fn ratio_one_is_always_heavy() {
        assert_eq!(heavy_share(1.0, 10_000, 7), 1.0);
    }

    #[test]
    fn ratio_zero_is_always_elastic() {
        assert_eq!(heavy_share(0.0, 10_000, 7), 0.0);
    }

    #[test]
    fn half_ratio_converges_to_half() {
        for seed in [1, 2, 3] {
            let share = heavy_share(0.5, 20_000, seed);
            assert!((share - 0.5).abs() < 0.02, "seed {seed}: {share}");
        }
    }

    #[test]
    fn committed_ratios_map_to_a_pool() {
        assert_eq!(BackendPool::for_ratio(1.0), Some(BackendPool::Heavy));
        assert_eq!(BackendPool::for_ratio(0.0), Some(BackendPool::Elastic));
        assert_eq!(BackendPool::for_ratio(0.4), None);
    }
}
