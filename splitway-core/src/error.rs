//! Error types shared across the Splitway crates.

use thiserror::Error;

/// A routing configuration that cannot be put into service.
///
/// These are reported when a configuration is loaded or reloaded, never from the
/// steady-state update paths.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A latency averaging window was configured with zero capacity.
    #[error("{window} window size must be greater than zero")]
    InvalidWindowSize {
        /// Which window (`slow` or `fast`).
        window: &'static str,
    },

    /// A threshold is not a positive finite number.
    #[error("{name} must be a positive finite number, got {value}")]
    InvalidThreshold {
        /// The configuration key.
        name: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// A backend base URL cannot be used as a plaintext HTTP upstream.
    #[error("invalid {pool} base url {url:?}: {reason}")]
    InvalidBaseUrl {
        /// The backend pool the URL belongs to.
        pool: &'static str,
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A route is bound to more than one target.
    #[error("route {0} is bound more than once")]
    DuplicateRoute(String),

    /// A route binding has an empty route or target.
    #[error("route binding {0:?} must name both a route and a target")]
    EmptyBinding(String),

    /// An interval that drives a timer was zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}
