//! Splitway Control Plane
//!
//! Loads the configuration file and keeps its routing section current, queries
//! metrics, and runs the reconciliation loop that commits routing decisions to the
//! store the proxy reads from.

pub mod config;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod selector;

pub use config::{ConfigWatcher, MetricsSettings, SelectorSettings, ServerSettings, SplitwayConfig};
pub use error::{ControlError, MetricsError, SelectorError};
pub use metrics::{MetricsSource, PrometheusSource, QueryTemplates};
pub use reconciler::{LoopState, Reconciler, TickReport};
pub use selector::{BackendSelector, HttpSelector};
