//! Dual-Window Latency Averager
//!
//! Tracks two fixed-size moving averages of a route's latency: a fast window that
//! reacts to spikes within a few ticks, and a slow window that remembers them for
//! longer. The reported average is the larger of the two, so a spike is trusted
//! immediately while a recovery is only trusted once the slow window agrees.

use std::collections::VecDeque;

use crate::error::ConfigError;

/// One bounded FIFO window with an incrementally maintained average.
#[derive(Debug, Clone)]
struct Window {
    samples: VecDeque<f64>,
    size: usize,
    /// Running sum divided by `size`, not by the current occupancy. While the window
    /// is still filling the average under-reports on purpose.
    average: f64,
}

impl Window {
    fn new(size: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(size + 1),
            size,
            average: 0.0,
        }
    }

    fn push(&mut self, sample: f64) {
        let size = self.size as f64;
        self.average += sample / size;
        self.samples.push_back(sample);

        if self.samples.len() > self.size {
            if let Some(evicted) = self.samples.pop_front() {
                self.average -= evicted / size;
            }
        }
    }

    fn average(&self) -> f64 {
        // incremental updates can drift a hair below zero
        self.average.max(0.0)
    }
}

/// The smoothed latency of one route.
///
/// Owned by the reconciliation loop; the request path never reads it.
#[derive(Debug, Clone)]
pub struct LatencyAverager {
    slow: Window,
    fast: Window,
}

impl LatencyAverager {
    /// Create an averager with the given window capacities.
    ///
    /// A zero-sized window is a configuration error.
    pub fn new(slow_size: usize, fast_size: usize) -> Result<Self, ConfigError> {
        if slow_size == 0 {
            return Err(ConfigError::InvalidWindowSize { window: "slow" });
        }
        if fast_size == 0 {
            return Err(ConfigError::InvalidWindowSize { window: "fast" });
        }

        Ok(Self {
            slow: Window::new(slow_size),
            fast: Window::new(fast_size),
        })
    }

    /// Ingest one latency observation.
    pub fn update(&mut self, sample: f64) {
        self.slow.push(sample);
        self.fast.push(sample);
    }

    /// The conservative estimate: `max(slow, fast)`.
    pub fn average(&self) -> f64 {
        self.slow.average().max(self.fast.average())
    }

    /// Average over the slow window.
    pub fn slow_average(&self) -> f64 {
        self.slow.average()
    }

    /// Average over the fast window.
    pub fn fast_average(&self) -> f64 {
        self.fast.average()
    }

    /// Current occupancy of the `(slow, fast)` windows.
    pub fn occupancy(&self) -> (usize, usize) {
        (self.slow.samples.len(), self.fast.samples.len())
    }

    /// Configured capacities of the `(slow, fast)` windows.
    pub fn window_sizes(&self) -> (usize, usize) {
        (self.slow.size, self.fast.size)
    }
}
