//! The configuration file and the watcher that hot-reloads its routing section.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:9000"
//!
//! [metrics]
//! endpoint = "http://prometheus:9090"
//!
//! [routing]
//! policy = "gradual"
//! heavy_base = "http://orders.internal:8080"
//! elastic_base = "http://gateway.openfaas:8080/function"
//!
//! [[routing.routes]]
//! route = "/orders"
//! target = "orders-fn"
//!
//! [selector]
//! endpoint = "http://selector.internal/services"
//! heavy = "orders-server"
//! elastic = "orders-fn"
//! ```
//!
//! Only `[routing]` is reloaded at runtime. The other tables are read once at startup.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use splitway_core::domain::config::serde_duration;
use splitway_core::{RoutingConfig, SharedRoutingConfig};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::metrics::QueryTemplates;

/// The whole configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SplitwayConfig {
    /// Listener and upstream timeouts of the proxy.
    #[serde(default)]
    pub server: ServerSettings,
    /// Where metrics come from.
    pub metrics: MetricsSettings,
    /// Routing thresholds, backends and bindings. Hot-reloadable.
    pub routing: RoutingConfig,
    /// External backend selector updated on binary migrations.
    #[serde(default)]
    pub selector: Option<SelectorSettings>,
}

/// Settings of the proxy listener.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    /// Address the proxy binds to.
    pub listen: SocketAddr,
    /// Upper bound on waiting for an upstream response.
    #[serde(with = "serde_duration")]
    pub upstream_timeout: Duration,
    /// Upper bound on opening an upstream connection.
    #[serde(with = "serde_duration")]
    pub connect_timeout: Duration,
    /// Routes the proxy seeds a decision for before it stops recording new ones.
    pub max_routes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9000)),
            upstream_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            max_routes: 10_000,
        }
    }
}

/// Settings of the metrics backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsSettings {
    /// Base URL of the Prometheus-compatible query API.
    pub endpoint: String,
    /// Per-request timeout.
    #[serde(default = "default_request_timeout", with = "serde_duration")]
    pub request_timeout: Duration,
    /// Query expressions, with `{route}` standing for the route path.
    #[serde(default)]
    pub queries: QueryTemplates,
}

/// Settings of the external backend selector.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectorSettings {
    /// Base URL under which selector resources live, one per binding target.
    pub endpoint: String,
    /// Selector label rewritten on migration.
    #[serde(default = "default_label")]
    pub label: String,
    /// Label value that selects the heavy pool.
    pub heavy: String,
    /// Label value that selects the elastic pool.
    pub elastic: String,
    /// Per-request timeout.
    #[serde(default = "default_request_timeout", with = "serde_duration")]
    pub request_timeout: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_label() -> String {
    "app".to_string()
}

impl SplitwayConfig {
    /// Read and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ControlError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ControlError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, path)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(raw: &str) -> Result<Self, ControlError> {
        Self::parse(raw, Path::new("<inline>"))
    }

    fn parse(raw: &str, origin: &Path) -> Result<Self, ControlError> {
        let config: SplitwayConfig =
            toml::from_str(raw).map_err(|source| ControlError::Parse {
                path: origin.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<(), ControlError> {
        self.routing.validate()?;
        check_endpoint("metrics.endpoint", &self.metrics.endpoint)?;

        if let Some(selector) = &self.selector {
            check_endpoint("selector.endpoint", &selector.endpoint)?;
            if selector.label.is_empty() {
                return Err(ControlError::InvalidSetting {
                    key: "selector.label",
                    reason: "must not be empty".to_string(),
                });
            }
            if selector.heavy == selector.elastic {
                return Err(ControlError::InvalidSetting {
                    key: "selector.elastic",
                    reason: "must differ from selector.heavy".to_string(),
                });
            }
        }

        if self.server.upstream_timeout.is_zero() {
            return Err(ControlError::InvalidSetting {
                key: "server.upstream_timeout",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.server.max_routes == 0 {
            return Err(ControlError::InvalidSetting {
                key: "server.max_routes",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

fn check_endpoint(key: &'static str, raw: &str) -> Result<(), ControlError> {
    let url = reqwest::Url::parse(raw).map_err(|e| ControlError::InvalidSetting {
        key,
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ControlError::InvalidSetting {
            key,
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl From<&std::fs::Metadata> for FileStamp {
    fn from(meta: &std::fs::Metadata) -> Self {
        Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        }
    }
}

/// Polls the configuration file and publishes a new [`RoutingConfig`] whenever its
/// `[routing]` table changes.
///
/// An invalid file is logged and ignored; the previous configuration stays in service.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    shared: SharedRoutingConfig,
    poll_interval: Duration,
    stamp: Option<FileStamp>,
}

impl ConfigWatcher {
    /// Watch `path`, publishing into `shared`.
    ///
    /// The file as it is now is taken to be what `shared` already holds.
    pub fn new(
        path: impl Into<PathBuf>,
        shared: SharedRoutingConfig,
        poll_interval: Duration,
    ) -> Self {
        let path = path.into();
        let stamp = std::fs::metadata(&path).ok().map(|m| FileStamp::from(&m));
        Self {
            path,
            shared,
            poll_interval,
            stamp,
        }
    }

    /// Check the file once. Returns whether a new routing configuration was published.
    pub async fn check(&mut self) -> Result<bool, ControlError> {
        let io_error = |source| ControlError::Io {
            path: self.path.clone(),
            source,
        };

        let meta = tokio::fs::metadata(&self.path).await.map_err(io_error)?;
        let stamp = FileStamp::from(&meta);
        if self.stamp == Some(stamp) {
            return Ok(false);
        }

        let raw = tokio::fs::read_to_string(&self.path).await.map_err(io_error)?;
        // remember the stamp even if the content is rejected so it is reported once
        self.stamp = Some(stamp);

        let config = SplitwayConfig::parse(&raw, &self.path)?;
        if **self.shared.load() == config.routing {
            debug!(path = %self.path.display(), "config file touched, routing unchanged");
            return Ok(false);
        }

        self.shared.store(Arc::new(config.routing));
        Ok(true)
    }

    /// Poll until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            path = %self.path.display(),
            interval = ?self.poll_interval,
            "watching config file"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => break,
            }

            match self.check().await {
                Ok(true) => {
                    let config = self.shared.load();
                    info!(
                        policy = ?config.policy,
                        routes = config.routes.len(),
                        "routing config reloaded"
                    );
                }
                Ok(false) => {}
                Err(e) => warn!(
                    error = %e,
                    "rejected config reload, keeping previous routing config"
                ),
            }
        }

        debug!("config watcher stopped");
    }
}
