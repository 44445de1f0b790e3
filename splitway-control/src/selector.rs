//! The external backend selector flipped on binary migrations.
//!
//! Under the threshold policy a route moves wholesale between pools. Besides the
//! in-process decision, the infrastructure that picks which pool a target's traffic
//! reaches (a Kubernetes Service selector, say) is rewritten to match.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use splitway_core::{BackendPool, RouteKey};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::SelectorSettings;
use crate::error::{ControlError, SelectorError};

/// Update attempts before a migration is abandoned.
pub const MAX_UPDATE_ATTEMPTS: u32 = 3;

/// Backoff unit; attempt `n` is followed by a pause of `n` units.
pub const BACKOFF_STEP: Duration = Duration::from_secs(1);

/// Reads and rewrites which pool serves a binding target.
pub trait BackendSelector: Send + Sync {
    /// The pool currently selected for `target`, if it is one of ours.
    fn current(
        &self,
        target: &str,
    ) -> impl Future<Output = Result<Option<BackendPool>, SelectorError>> + Send;

    /// Point `target` at `pool`.
    fn set(
        &self,
        target: &str,
        pool: BackendPool,
    ) -> impl Future<Output = Result<(), SelectorError>> + Send;
}

impl<T: BackendSelector> BackendSelector for Arc<T> {
    fn current(
        &self,
        target: &str,
    ) -> impl Future<Output = Result<Option<BackendPool>, SelectorError>> + Send {
        (**self).current(target)
    }

    fn set(
        &self,
        target: &str,
        pool: BackendPool,
    ) -> impl Future<Output = Result<(), SelectorError>> + Send {
        (**self).set(target, pool)
    }
}

/// What [`migrate`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Migration {
    /// The selector already pointed at the pool; nothing was written.
    AlreadyInPlace,
    /// The selector was rewritten.
    Applied {
        /// Attempts it took.
        attempts: u32,
    },
}

/// Point `target` at `pool`, retrying with linear backoff, within `budget`.
///
/// A selector that already points at `pool` is left untouched. Running out of
/// budget fails with [`SelectorError::Timeout`] and the attempts made so far.
/// Shutdown aborts the backoff wait with [`ControlError::ShuttingDown`].
pub async fn migrate<S: BackendSelector>(
    selector: &S,
    route: &RouteKey,
    target: &str,
    pool: BackendPool,
    budget: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Migration, ControlError> {
    let deadline = Instant::now() + budget;
    let failed = |attempts: u32, source: SelectorError| ControlError::BackendUpdateFailure {
        route: route.clone(),
        attempts,
        source,
    };

    let current = match timeout_at(deadline, selector.current(target)).await {
        Ok(read) => read.map_err(|source| failed(0, source))?,
        Err(_) => return Err(failed(0, SelectorError::Timeout(budget))),
    };
    if current == Some(pool) {
        debug!(%route, target, %pool, "selector already in place");
        return Ok(Migration::AlreadyInPlace);
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        let written = match timeout_at(deadline, selector.set(target, pool)).await {
            Ok(written) => written,
            Err(_) => return Err(failed(attempt, SelectorError::Timeout(budget))),
        };

        match written {
            Ok(()) => {
                info!(%route, target, %pool, attempts = attempt, "selector updated");
                return Ok(Migration::Applied { attempts: attempt });
            }
            Err(source) if attempt >= MAX_UPDATE_ATTEMPTS => {
                return Err(failed(attempt, source));
            }
            Err(e) => {
                let backoff = BACKOFF_STEP * attempt;
                if Instant::now() + backoff >= deadline {
                    warn!(%route, target, attempt, error = %e, "no time left to retry selector");
                    return Err(failed(attempt, SelectorError::Timeout(budget)));
                }
                warn!(
                    %route,
                    target,
                    attempt,
                    error = %e,
                    ?backoff,
                    "selector update failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return Err(ControlError::ShuttingDown),
                }
            }
        }
    }
}

/// [`BackendSelector`] over an HTTP resource shaped like a Kubernetes object:
/// `GET {endpoint}/{target}` returns JSON whose `spec.selector[label]` names the
/// pool, and `PUT` writes the edited document back.
#[derive(Debug, Clone)]
pub struct HttpSelector {
    client: reqwest::Client,
    endpoint: String,
    label: String,
    heavy: String,
    elastic: String,
}

impl HttpSelector {
    /// Build a selector client from its settings.
    pub fn new(settings: &SelectorSettings) -> Result<Self, SelectorError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            label: settings.label.clone(),
            heavy: settings.heavy.clone(),
            elastic: settings.elastic.clone(),
        })
    }

    fn resource_url(&self, target: &str) -> String {
        format!("{}/{}", self.endpoint, target)
    }

    fn value_for(&self, pool: BackendPool) -> &str {
        match pool {
            BackendPool::Heavy => &self.heavy,
            BackendPool::Elastic => &self.elastic,
        }
    }

    fn pool_for(&self, value: &str) -> Option<BackendPool> {
        if value == self.heavy {
            Some(BackendPool::Heavy)
        } else if value == self.elastic {
            Some(BackendPool::Elastic)
        } else {
            None
        }
    }

    async fn fetch(&self, url: &str) -> Result<Value, SelectorError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(SelectorError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

impl BackendSelector for HttpSelector {
    async fn current(&self, target: &str) -> Result<Option<BackendPool>, SelectorError> {
        let resource = self.fetch(&self.resource_url(target)).await?;
        Ok(selector_value(&resource, &self.label).and_then(|v| self.pool_for(v)))
    }

    async fn set(&self, target: &str, pool: BackendPool) -> Result<(), SelectorError> {
        let url = self.resource_url(target);
        let mut resource = self.fetch(&url).await?;
        set_selector_value(&mut resource, &self.label, self.value_for(pool))?;

        let response = self.client.put(&url).json(&resource).send().await?;
        if !response.status().is_success() {
            return Err(SelectorError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(())
    }
}

/// `spec.selector[label]` of a resource document.
pub fn selector_value<'a>(resource: &'a Value, label: &str) -> Option<&'a str> {
    resource.pointer("/spec/selector")?.get(label)?.as_str()
}

/// Set `spec.selector[label]`, leaving the rest of the document alone.
pub fn set_selector_value(
    resource: &mut Value,
    label: &str,
    value: &str,
) -> Result<(), SelectorError> {
    let selector = resource
        .pointer_mut("/spec/selector")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| {
            SelectorError::Malformed("resource has no spec.selector object".to_string())
        })?;
    selector.insert(label.to_string(), Value::String(value.to_string()));
    Ok(())
}
