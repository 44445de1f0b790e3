//! The request hot path: pick a backend by the route's ratio and forward.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use splitway_control::ServerSettings;
use splitway_core::{
    choose_backend, BackendPool, RouteKey, SharedDecisionStore, SharedRoutingConfig,
};
use tracing::{debug, warn};

use crate::connection_pool::ConnectionPool;
use crate::error::DispatchError;

/// Body type of every response the proxy produces.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Diagnostic header naming the chosen backend and the ratio it was drawn against.
pub const ROUTING_DECISION_HEADER: &str = "x-routing-decision";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Requests sent to each pool since startup.
#[derive(Debug, Default)]
pub struct DispatchStats {
    heavy: AtomicU64,
    elastic: AtomicU64,
}

impl DispatchStats {
    fn record(&self, pool: BackendPool) -> (u64, u64) {
        let counter = match pool {
            BackendPool::Heavy => &self.heavy,
            BackendPool::Elastic => &self.elastic,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        (self.heavy(), self.elastic())
    }

    /// Requests sent to the heavy pool.
    pub fn heavy(&self) -> u64 {
        self.heavy.load(Ordering::Relaxed)
    }

    /// Requests sent to the elastic pool.
    pub fn elastic(&self) -> u64 {
        self.elastic.load(Ordering::Relaxed)
    }
}

/// Forwards each request to the heavy or elastic pool.
///
/// Only reads routing state: decisions come from the shared store, base URLs and
/// bindings from the current routing configuration. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: SharedDecisionStore,
    config: SharedRoutingConfig,
    pool: ConnectionPool,
    stats: Arc<DispatchStats>,
    upstream_timeout: Duration,
    connect_timeout: Duration,
}

impl Dispatcher {
    /// A dispatcher reading from `store` and `config`.
    pub fn new(
        store: SharedDecisionStore,
        config: SharedRoutingConfig,
        settings: &ServerSettings,
    ) -> Self {
        Self {
            store,
            config,
            pool: ConnectionPool::new(),
            stats: Arc::new(DispatchStats::default()),
            upstream_timeout: settings.upstream_timeout,
            connect_timeout: settings.connect_timeout,
        }
    }

    /// Per-pool request counters.
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Forward `req`, turning any failure into a gateway error response.
    pub async fn dispatch(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.forward(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%method, %path, error = %e, "dispatch failed");
                error_response(&e)
            }
        }
    }

    async fn forward(
        &self,
        mut req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, DispatchError> {
        let route = RouteKey::from_path(req.uri().path());
        let decision = self.store.get_or_seed(route.as_str());
        let backend = choose_backend(decision.ratio, &mut rand::thread_rng());

        let base = {
            let config = self.config.load();
            match backend {
                BackendPool::Heavy => config.heavy_uri(),
                BackendPool::Elastic => {
                    if config.target_for(route.as_str()).is_none() {
                        return Err(DispatchError::Unroutable { route });
                    }
                    config.elastic_uri()
                }
            }
            .map_err(|e| DispatchError::InvalidTarget(e.to_string()))?
        };

        let authority = base
            .authority()
            .cloned()
            .ok_or_else(|| DispatchError::InvalidTarget(base.to_string()))?;
        let uri = upstream_uri(&base, req.uri())?;
        *req.uri_mut() = uri;
        rewrite_headers(req.headers_mut(), &authority)?;
        let summary = format!("backend={backend};ratio={:.3}", decision.ratio);
        let decision_header = HeaderValue::try_from(summary)
            .map_err(|e| DispatchError::InvalidTarget(e.to_string()))?;
        req.headers_mut()
            .insert(ROUTING_DECISION_HEADER, decision_header.clone());

        let (heavy_total, elastic_total) = self.stats.record(backend);
        debug!(
            %route,
            %backend,
            ratio = decision.ratio,
            upstream = %authority,
            heavy_total,
            elastic_total,
            "dispatching request"
        );

        let address = socket_address(&authority);
        let mut sender = self.pool.checkout(&address, self.connect_timeout).await?;
        let mut response = tokio::time::timeout(self.upstream_timeout, sender.send_request(req))
            .await
            .map_err(|_| DispatchError::Timeout(self.upstream_timeout))??;
        self.pool.push(&address, sender);

        strip_hop_by_hop(response.headers_mut());
        response
            .headers_mut()
            .insert(ROUTING_DECISION_HEADER, decision_header);
        Ok(response.map(|body| body.boxed()))
    }
}

/// Join the base URL's path with the request path, keeping the query, in origin form.
pub fn upstream_uri(base: &Uri, original: &Uri) -> Result<Uri, DispatchError> {
    let prefix = base.path().trim_end_matches('/');
    let mut target = format!("{prefix}{}", original.path());
    if let Some(query) = original.query() {
        target.push('?');
        target.push_str(query);
    }
    target
        .parse()
        .map_err(|e: http::uri::InvalidUri| DispatchError::InvalidTarget(e.to_string()))
}

fn rewrite_headers(headers: &mut HeaderMap, authority: &Authority) -> Result<(), DispatchError> {
    strip_hop_by_hop(headers);

    if let Some(original) = headers.get(header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, original);
    }
    let host = HeaderValue::from_str(authority.as_str())
        .map_err(|e| DispatchError::InvalidTarget(e.to_string()))?;
    headers.insert(header::HOST, host);
    Ok(())
}

/// Drops the fixed hop-by-hop set plus every header the `Connection` values name.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn socket_address(authority: &Authority) -> String {
    format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80))
}

fn error_response(error: &DispatchError) -> Response<ProxyBody> {
    let mut response = Response::new(full(error.to_string()));
    *response.status_mut() = error.status();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}
