//! Error types for the Splitway control plane.

use std::path::PathBuf;
use std::time::Duration;

use splitway_core::{ConfigError, RouteKey};
use thiserror::Error;

/// A single metrics query that could not be answered.
///
/// Tolerated by the reconciliation loop until it repeats on consecutive ticks.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The metrics backend could not be reached.
    #[error("metrics request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The metrics backend answered with a non-success status.
    #[error("metrics backend returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The metrics backend refused to evaluate the query.
    #[error("metrics backend rejected the query: {0}")]
    Rejected(String),

    /// The response could not be interpreted.
    #[error("malformed metrics response: {0}")]
    Malformed(String),

    /// Collection did not finish within the tick timeout.
    #[error("metrics collection timed out after {0:?}")]
    Timeout(Duration),
}

/// A failed read or write of the external backend selector.
#[derive(Debug, Error)]
pub enum SelectorError {
    /// The selector resource could not be reached.
    #[error("selector request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The selector resource answered with a non-success status.
    #[error("selector resource {url} returned {status}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// The resource URL.
        url: String,
    },

    /// The selector resource does not have the expected shape.
    #[error("malformed selector resource: {0}")]
    Malformed(String),

    /// The update did not finish within the tick timeout.
    #[error("selector update timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures surfaced by the control plane.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Metrics collection failed on too many consecutive ticks. Fatal to the loop.
    #[error("metrics collection failed on {failures} consecutive ticks: {last}")]
    RepeatedMetricsFailure {
        /// Number of consecutive failed ticks.
        failures: u32,
        /// The most recent failure.
        #[source]
        last: MetricsError,
    },

    /// The external backend selector could not be updated. Fatal to the tick only.
    #[error("backend selector update for {route} failed after {attempts} attempts: {source}")]
    BackendUpdateFailure {
        /// The route being migrated.
        route: RouteKey,
        /// Update attempts made before giving up.
        attempts: u32,
        /// The last selector error.
        #[source]
        source: SelectorError,
    },

    /// The routing configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A non-routing setting is invalid.
    #[error("invalid setting {key}: {reason}")]
    InvalidSetting {
        /// The configuration key.
        key: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// The configuration file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        /// The configuration file.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: toml::de::Error,
    },

    /// Shutdown was requested while work was in flight.
    #[error("interrupted by shutdown")]
    ShuttingDown,
}
