//! The reconciliation loop.
//!
//! Every evaluation interval the loop collects readings for each known route, runs
//! them through the route's latency averager and the configured decision policy, and
//! commits the result to the shared decision store. A commit that changes a route's
//! ratio is a migration and must hold a token from the route's change limiter. The
//! token is only spent once the migration has been committed.
//!
//! ```text
//!  Idle ─tick─▶ Collecting ─ok─▶ Deciding ─ratio changed─▶ RateLimiting ─token─▶ Committing
//!   ▲               │               │                          │                    │
//!   │          error│         same ratio                   no token                 │
//!   └───────────────┴───────────────┴──────────────────────────┴────────────────────┘
//! ```

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

use futures::stream::{self, StreamExt};
use splitway_core::decision::trend;
use splitway_core::{
    BackendPool, ChangeLimiter, ConfigError, DecisionPolicy, LatencyAverager, PolicyInput,
    PolicyKind, RouteKey, RoutingConfig, RoutingDecision, SharedDecisionStore,
    SharedRoutingConfig, SnapshotHistory, Verdict,
};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{ControlError, MetricsError};
use crate::metrics::{self, MetricsSource, QueryTemplates, RouteReadings};
use crate::selector::{self, BackendSelector, HttpSelector};

/// Consecutive failed collections after which the loop gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Routes whose readings are collected at the same time.
pub const MAX_CONCURRENT_COLLECTIONS: usize = 16;

const RATIO_EPSILON: f64 = 1e-9;

/// Where the loop currently is within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    /// Waiting for the next tick.
    #[default]
    Idle,
    /// Querying metrics.
    Collecting,
    /// Running the policy for a route.
    Deciding,
    /// Asking the route's limiter for a migration token.
    RateLimiting,
    /// Updating the selector and the decision store.
    Committing,
}

/// Per-route state owned by the loop.
#[derive(Debug)]
pub struct RouteState {
    /// Smoothing over the route's latency readings.
    pub averager: LatencyAverager,
    /// Gate on how often the route may migrate.
    pub limiter: ChangeLimiter,
    /// Recent full snapshots, for trend analysis.
    pub history: SnapshotHistory,
    /// When the route last returned any reading.
    pub last_data: std::time::Instant,
}

impl RouteState {
    fn new(config: &RoutingConfig, now: std::time::Instant) -> Result<Self, ConfigError> {
        Ok(Self {
            averager: LatencyAverager::new(config.slow_window_size, config.fast_window_size)?,
            limiter: ChangeLimiter::new(config.cooldown_period, now),
            history: SnapshotHistory::new(),
            last_data: now,
        })
    }
}

/// Route states, kept in step with the routing configuration.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: HashMap<RouteKey, RouteState>,
    window_sizes: Option<(usize, usize)>,
}

impl RouteRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply configuration changes to existing routes.
    ///
    /// New window sizes restart every averager. A new cooldown applies to the next
    /// token each limiter hands out.
    pub fn sync(&mut self, config: &RoutingConfig) -> Result<(), ConfigError> {
        let sizes = (config.slow_window_size, config.fast_window_size);
        let resized = self.window_sizes.is_some_and(|previous| previous != sizes);
        self.window_sizes = Some(sizes);

        if resized {
            info!(
                slow = sizes.0,
                fast = sizes.1,
                "latency windows resized, restarting averagers"
            );
        }
        for state in self.routes.values_mut() {
            if resized {
                state.averager = LatencyAverager::new(sizes.0, sizes.1)?;
            }
            if state.limiter.period() != config.cooldown_period {
                state.limiter.set_period(config.cooldown_period);
            }
        }
        Ok(())
    }

    /// State of `route`, created on first use.
    pub fn state_mut(
        &mut self,
        route: &RouteKey,
        config: &RoutingConfig,
        now: std::time::Instant,
    ) -> Result<&mut RouteState, ConfigError> {
        match self.routes.entry(route.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(RouteState::new(config, now)?)),
        }
    }

    /// Drop the state of routes without a binding that have not returned a reading
    /// for `config.idle_route_ttl`. Returns the dropped routes.
    pub fn evict_idle(&mut self, config: &RoutingConfig, now: std::time::Instant) -> Vec<RouteKey> {
        let idle: Vec<RouteKey> = self
            .routes
            .iter()
            .filter(|(route, state)| {
                config.target_for(route.as_str()).is_none()
                    && now.saturating_duration_since(state.last_data) >= config.idle_route_ttl
            })
            .map(|(route, _)| route.clone())
            .collect();

        for route in &idle {
            self.routes.remove(route);
        }
        idle
    }

    /// State of `route`, if it has been evaluated.
    pub fn get(&self, route: &str) -> Option<&RouteState> {
        self.routes.get(route)
    }

    /// Number of tracked routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no route has been evaluated yet.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Metrics collection failed; nothing was evaluated.
    pub metrics_failed: bool,
    /// Routes evaluated.
    pub evaluated: usize,
    /// Decisions rewritten with an unchanged ratio.
    pub refreshed: usize,
    /// Decisions whose ratio changed.
    pub migrated: usize,
    /// Migrations held back by the change limiter.
    pub rate_limited: usize,
    /// Routes skipped for lack of metric data.
    pub skipped: usize,
    /// Idle routes forgotten.
    pub evicted: usize,
}

enum CommitOutcome {
    Refreshed,
    Migrated,
    RateLimited,
    NoData,
}

/// Drives routing decisions from metrics.
///
/// Owns all per-route mutable state. The decision store is the only thing it
/// shares with the proxy.
pub struct Reconciler<M, S = HttpSelector> {
    config: SharedRoutingConfig,
    store: SharedDecisionStore,
    metrics: M,
    queries: QueryTemplates,
    selector: Option<S>,
    registry: RouteRegistry,
    consecutive_failures: u32,
    state: LoopState,
}

impl<M: MetricsSource> Reconciler<M> {
    /// A reconciler without an external selector.
    pub fn new(
        config: SharedRoutingConfig,
        store: SharedDecisionStore,
        metrics: M,
        queries: QueryTemplates,
    ) -> Self {
        Self {
            config,
            store,
            metrics,
            queries,
            selector: None,
            registry: RouteRegistry::new(),
            consecutive_failures: 0,
            state: LoopState::Idle,
        }
    }
}

impl<M: MetricsSource, S: BackendSelector> Reconciler<M, S> {
    /// Also rewrite `selector` on binary migrations.
    pub fn with_selector<T: BackendSelector>(self, selector: T) -> Reconciler<M, T> {
        Reconciler {
            config: self.config,
            store: self.store,
            metrics: self.metrics,
            queries: self.queries,
            selector: Some(selector),
            registry: self.registry,
            consecutive_failures: self.consecutive_failures,
            state: self.state,
        }
    }

    /// Where the loop is within a tick.
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Failed collections since the last successful one.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Per-route state.
    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    /// Run until shutdown is signalled or metrics collection fails too often.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControlError> {
        {
            let config = self.config.load();
            info!(
                policy = ?config.policy,
                interval = ?config.evaluation_interval,
                cooldown = ?config.cooldown_period,
                "reconciliation loop started"
            );
        }

        loop {
            let interval = self.config.load().evaluation_interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }

            match self.tick(&mut shutdown).await {
                Ok(report) => debug!(
                    evaluated = report.evaluated,
                    migrated = report.migrated,
                    rate_limited = report.rate_limited,
                    skipped = report.skipped,
                    evicted = report.evicted,
                    "tick complete"
                ),
                Err(ControlError::ShuttingDown) => break,
                Err(e @ ControlError::RepeatedMetricsFailure { .. }) => {
                    error!(error = %e, "giving up on metrics");
                    return Err(e);
                }
                Err(e) => error!(error = %e, "tick failed"),
            }
        }

        info!("reconciliation loop stopped");
        Ok(())
    }

    /// Run one reconciliation pass over every known route.
    ///
    /// A failed collection commits nothing. It is reported in the returned
    /// [`TickReport`] until it has happened [`MAX_CONSECUTIVE_FAILURES`] times in a
    /// row, which is an error.
    ///
    /// A route that fails to commit does not stop the others; the first such failure
    /// is returned once every route has been evaluated.
    pub async fn tick(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<TickReport, ControlError> {
        let config = self.config.load_full();
        self.registry.sync(&config)?;
        let policy = config.policy.policy();
        let routes = self.routes_to_reconcile(&config);

        self.state = LoopState::Collecting;
        let readings = match self.collect(&routes, &config, policy.needs_full_snapshot()).await {
            Ok(readings) => readings,
            Err(e) => return self.collection_failed(e),
        };
        self.consecutive_failures = 0;

        let mut report = TickReport::default();
        let mut failure = None;
        for (route, route_readings) in readings {
            report.evaluated += 1;
            let outcome = self
                .reconcile_route(&route, route_readings, &config, policy, shutdown)
                .await;
            self.state = LoopState::Idle;
            match outcome {
                Ok(CommitOutcome::Refreshed) => report.refreshed += 1,
                Ok(CommitOutcome::Migrated) => report.migrated += 1,
                Ok(CommitOutcome::RateLimited) => report.rate_limited += 1,
                Ok(CommitOutcome::NoData) => report.skipped += 1,
                Err(ControlError::ShuttingDown) => return Err(ControlError::ShuttingDown),
                Err(e) if failure.is_none() => failure = Some(e),
                Err(e) => warn!(%route, error = %e, "route reconciliation failed"),
            }
        }

        let now = Instant::now().into_std();
        for route in self.registry.evict_idle(&config, now) {
            self.store.remove(route.as_str());
            debug!(%route, "forgot idle route");
            report.evicted += 1;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn routes_to_reconcile(&self, config: &RoutingConfig) -> Vec<RouteKey> {
        let mut routes: BTreeSet<RouteKey> = config
            .routes
            .iter()
            .map(|b| RouteKey::from(b.route.as_str()))
            .collect();
        routes.extend(self.store.routes());
        routes.into_iter().collect()
    }

    /// Collect every route's readings, [`MAX_CONCURRENT_COLLECTIONS`] at a time, each
    /// within `tick_timeout`.
    ///
    /// Any query error fails the whole collection, as does a bound route running out
    /// of time. A route without a binding that runs out of time has no data.
    async fn collect(
        &self,
        routes: &[RouteKey],
        config: &RoutingConfig,
        full: bool,
    ) -> Result<Vec<(RouteKey, RouteReadings)>, MetricsError> {
        let budget = config.tick_timeout;
        let mut pending = stream::iter(routes.iter().cloned())
            .map(|route| async move {
                let readings = timeout(
                    budget,
                    metrics::collect(&self.metrics, &self.queries, &route, full),
                )
                .await;
                (route, readings)
            })
            .buffer_unordered(MAX_CONCURRENT_COLLECTIONS);

        let mut collected = Vec::with_capacity(routes.len());
        while let Some((route, readings)) = pending.next().await {
            let readings = match readings {
                Ok(readings) => readings?,
                Err(_) if config.target_for(route.as_str()).is_none() => {
                    debug!(%route, ?budget, "metrics timed out for unbound route");
                    RouteReadings::default()
                }
                Err(_) => return Err(MetricsError::Timeout(budget)),
            };
            collected.push((route, readings));
        }

        collected.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(collected)
    }

    fn collection_failed(&mut self, error: MetricsError) -> Result<TickReport, ControlError> {
        self.state = LoopState::Idle;
        self.consecutive_failures += 1;
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            return Err(ControlError::RepeatedMetricsFailure {
                failures: self.consecutive_failures,
                last: error,
            });
        }

        warn!(
            failures = self.consecutive_failures,
            error = %error,
            "metrics collection failed, keeping current decisions"
        );
        Ok(TickReport {
            metrics_failed: true,
            ..TickReport::default()
        })
    }

    async fn reconcile_route(
        &mut self,
        route: &RouteKey,
        readings: RouteReadings,
        config: &RoutingConfig,
        policy: &dyn DecisionPolicy,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<CommitOutcome, ControlError> {
        self.state = LoopState::Deciding;
        let now = Instant::now().into_std();
        let state = self.registry.state_mut(route, config, now)?;

        if readings.is_empty() {
            debug!(%route, "no metric data, keeping current decision");
            return Ok(CommitOutcome::NoData);
        }
        state.last_data = now;

        // resource readings alone are enough for the threshold policy
        if let Some(latency) = readings.latency {
            state.averager.update(latency);
        }
        let smoothed = state.averager.average();

        let snapshot = policy
            .needs_full_snapshot()
            .then(|| readings.to_snapshot(state.history.latest()));
        if let Some(s) = snapshot {
            state.history.push(s);
        }
        let trend = trend::analyze(&state.history);

        let input = PolicyInput {
            smoothed_latency: smoothed,
            snapshot: snapshot.as_ref(),
            trend,
        };
        let verdict = policy.decide(&input, config);

        let current = self.store.get(route.as_str()).map_or(1.0, |d| d.ratio);
        let target = verdict.target_ratio(current);
        let request_count = readings
            .request_rate
            .map_or(0, |rps| rps.max(0.0).round() as u64);
        let decision = RoutingDecision::new(target, smoothed, request_count);

        if (target - current).abs() <= RATIO_EPSILON {
            self.store.put(route.clone(), decision);
            return Ok(CommitOutcome::Refreshed);
        }

        self.state = LoopState::RateLimiting;
        if !state.limiter.would_allow_at(now) {
            warn!(%route, current, target, "migration rate limited, keeping current decision");
            return Ok(CommitOutcome::RateLimited);
        }

        self.state = LoopState::Committing;
        if config.policy == PolicyKind::Threshold {
            if let (Some(selector), Some(pool), Some(binding)) = (
                self.selector.as_ref(),
                BackendPool::for_ratio(target),
                config.target_for(route.as_str()),
            ) {
                selector::migrate(selector, route, binding, pool, config.tick_timeout, shutdown)
                    .await?;
            }
        }

        let acquired = state.limiter.try_acquire_at(now);
        debug_assert!(acquired);
        self.store.put(route.clone(), decision);

        let reason = match verdict {
            Verdict::ForceElastic(breach) => breach.reason(),
            Verdict::ForceHeavy => "thresholds clear",
            Verdict::Ratio(_) | Verdict::Keep => "smoothed latency",
        };
        info!(
            %route,
            from = current,
            to = target,
            latency_ms = smoothed,
            reason,
            "routing decision migrated"
        );
        Ok(CommitOutcome::Migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use splitway_core::domain::config::shared;
    use splitway_core::{RouteBinding, RoutingDecisionStore};

    use crate::error::SelectorError;

    type Script = HashMap<String, VecDeque<Result<Option<f64>, MetricsError>>>;

    #[derive(Default)]
    struct ScriptedMetrics {
        script: Mutex<Script>,
        // unscripted queries never answer instead of matching nothing
        stall_unscripted: AtomicBool,
    }

    impl ScriptedMetrics {
        fn push(&self, expression: &str, value: Result<Option<f64>, MetricsError>) {
            self.script
                .lock()
                .unwrap()
                .entry(expression.to_string())
                .or_default()
                .push_back(value);
        }

        fn latencies(&self, route: &str, values: &[f64]) {
            for v in values {
                self.push(&format!("latency:{route}"), Ok(Some(*v)));
            }
        }
    }

    impl MetricsSource for Arc<ScriptedMetrics> {
        async fn query(&self, expression: &str) -> Result<Option<f64>, MetricsError> {
            let scripted = self
                .script
                .lock()
                .unwrap()
                .get_mut(expression)
                .and_then(VecDeque::pop_front);
            match scripted {
                Some(value) => value,
                None if self.stall_unscripted.load(Ordering::SeqCst) => {
                    std::future::pending().await
                }
                None => Ok(None),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSelector {
        current: Mutex<Option<BackendPool>>,
        failures: AtomicU32,
        writes: Mutex<Vec<(String, BackendPool)>>,
    }

    impl BackendSelector for RecordingSelector {
        async fn current(&self, _target: &str) -> Result<Option<BackendPool>, SelectorError> {
            Ok(*self.current.lock().unwrap())
        }

        async fn set(&self, target: &str, pool: BackendPool) -> Result<(), SelectorError> {
            self.writes.lock().unwrap().push((target.to_string(), pool));
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(SelectorError::Malformed("injected".to_string()));
            }
            *self.current.lock().unwrap() = Some(pool);
            Ok(())
        }
    }

    fn templates() -> QueryTemplates {
        QueryTemplates {
            latency: "latency:{route}".to_string(),
            request_rate: "rps:{route}".to_string(),
            error_rate: "errors:{route}".to_string(),
            cpu: "cpu:{route}".to_string(),
            memory: "mem:{route}".to_string(),
        }
    }

    fn routing(policy: PolicyKind) -> RoutingConfig {
        RoutingConfig {
            policy,
            heavy_base: "http://heavy:8080".to_string(),
            elastic_base: "http://elastic:8080".to_string(),
            routes: vec![RouteBinding {
                route: "/orders".to_string(),
                target: "orders".to_string(),
            }],
            slow_window_size: 2,
            fast_window_size: 2,
            cooldown_period: Duration::from_secs(10),
            ..RoutingConfig::default()
        }
    }

    struct Harness {
        metrics: Arc<ScriptedMetrics>,
        store: SharedDecisionStore,
        reconciler: Reconciler<Arc<ScriptedMetrics>>,
        shutdown_tx: watch::Sender<bool>,
        shutdown: watch::Receiver<bool>,
    }

    fn harness(config: RoutingConfig) -> Harness {
        let metrics = Arc::new(ScriptedMetrics::default());
        let store = Arc::new(RoutingDecisionStore::new());
        let reconciler =
            Reconciler::new(shared(config), store.clone(), metrics.clone(), templates());
        let (shutdown_tx, shutdown) = watch::channel(false);
        Harness {
            metrics,
            store,
            reconciler,
            shutdown_tx,
            shutdown,
        }
    }

    fn ratio(store: &SharedDecisionStore, route: &str) -> f64 {
        store.get(route).map(|d| d.ratio).unwrap_or(f64::NAN)
    }

    #[tokio::test(start_paused = true)]
    async fn orders_moves_to_elastic_once_latency_saturates() {
        let mut h = harness(routing(PolicyKind::Gradual));
        // smoothed averages 50, 60, 70, 310 against a 200ms threshold
        h.metrics.latencies("/orders", &[100.0, 20.0, 120.0, 500.0]);

        let mut ratios = Vec::new();
        let mut smoothed = Vec::new();
        for _ in 0..4 {
            h.reconciler.tick(&mut h.shutdown).await.unwrap();
            let d = h.store.get("/orders").unwrap();
            ratios.push(d.ratio);
            smoothed.push(d.latency_avg);
            tokio::time::advance(Duration::from_secs(10)).await;
        }

        assert_eq!(ratios, vec![1.0, 1.0, 1.0, 0.0]);
        assert_eq!(smoothed, vec![50.0, 60.0, 70.0, 310.0]);
        assert_eq!(h.reconciler.state(), LoopState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn third_consecutive_failure_is_fatal() {
        let mut h = harness(routing(PolicyKind::Gradual));
        for _ in 0..3 {
            h.metrics
                .push("latency:/orders", Err(MetricsError::Malformed("boom".to_string())));
        }

        for expected in 1..=2 {
            let report = h.reconciler.tick(&mut h.shutdown).await.unwrap();
            assert!(report.metrics_failed);
            assert_eq!(h.reconciler.consecutive_failures(), expected);
        }
        let err = h.reconciler.tick(&mut h.shutdown).await.unwrap_err();
        assert!(matches!(err, ControlError::RepeatedMetricsFailure { failures: 3, .. }));
        assert!(h.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_count() {
        let mut h = harness(routing(PolicyKind::Gradual));
        let fail = || Err(MetricsError::Malformed("boom".to_string()));
        h.metrics.push("latency:/orders", fail());
        h.metrics.push("latency:/orders", fail());
        h.metrics.push("latency:/orders", Ok(Some(40.0)));
        h.metrics.push("latency:/orders", fail());

        for _ in 0..4 {
            h.reconciler.tick(&mut h.shutdown).await.unwrap();
        }
        assert_eq!(h.reconciler.consecutive_failures(), 1);
        assert_eq!(ratio(&h.store, "/orders"), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn migrations_inside_one_cooldown_commit_once() {
        let mut config = routing(PolicyKind::Gradual);
        config.slow_window_size = 1;
        config.fast_window_size = 1;
        config.cooldown_period = Duration::from_secs(60);
        let mut h = harness(config);
        h.metrics.latencies("/orders", &[500.0, 50.0, 50.0]);

        let first = h.reconciler.tick(&mut h.shutdown).await.unwrap();
        assert_eq!(first.migrated, 1);
        assert_eq!(ratio(&h.store, "/orders"), 0.0);

        tokio::time::advance(Duration::from_secs(10)).await;
        let second = h.reconciler.tick(&mut h.shutdown).await.unwrap();
        assert_eq!(second.rate_limited, 1);
        assert_eq!(ratio(&h.store, "/orders"), 0.0);

        tokio::time::advance(Duration::from_secs(50)).await;
        let third = h.reconciler.tick(&mut h.shutdown).await.unwrap();
        assert_eq!(third.migrated, 1);
        assert_eq!(ratio(&h.store, "/orders"), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_latency_keeps_previous_decision() {
        let mut h = harness(routing(PolicyKind::Gradual));
        h.metrics.latencies("/orders", &[400.0]);
        h.metrics.push("latency:/orders", Ok(None));

        h.reconciler.tick(&mut h.shutdown).await.unwrap();
        let before = h.store.get("/orders").unwrap();

        let report = h.reconciler.tick(&mut h.shutdown).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(h.reconciler.consecutive_failures(), 0);
        assert_eq!(h.store.get("/orders").unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn routes_seen_by_the_proxy_are_reconciled() {
        let mut h = harness(routing(PolicyKind::Gradual));
        h.store.get_or_seed("/users");
        h.metrics.latencies("/users", &[40.0]);

        let report = h.reconciler.tick(&mut h.shutdown).await.unwrap();
        assert_eq!(report.evaluated, 2);
        assert_eq!(h.store.get("/users").unwrap().latency_avg, 20.0);
        assert!(h.reconciler.registry().get("/users").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn window_resize_restarts_averagers() {
        let config = shared(routing(PolicyKind::Gradual));
        let metrics = Arc::new(ScriptedMetrics::default());
        let store = Arc::new(RoutingDecisionStore::new());
        let mut reconciler =
            Reconciler::new(config.clone(), store.clone(), metrics.clone(), templates());
        let (_tx, mut rx) = watch::channel(false);

        metrics.latencies("/orders", &[100.0, 100.0]);
        reconciler.tick(&mut rx).await.unwrap();
        assert_eq!(reconciler.registry().get("/orders").unwrap().averager.occupancy(), (1, 1));

        let mut resized = routing(PolicyKind::Gradual);
        resized.slow_window_size = 4;
        config.store(Arc::new(resized));
        reconciler.tick(&mut rx).await.unwrap();

        let averager = &reconciler.registry().get("/orders").unwrap().averager;
        assert_eq!(averager.window_sizes(), (4, 2));
        assert_eq!(averager.occupancy(), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_breach_flips_selector_and_store() {
        let h = harness(routing(PolicyKind::Threshold));
        let selector = Arc::new(RecordingSelector {
            current: Mutex::new(Some(BackendPool::Heavy)),
            failures: AtomicU32::new(1),
            ..RecordingSelector::default()
        });
        let mut reconciler = h.reconciler.with_selector(selector.clone());
        let mut shutdown = h.shutdown;

        h.metrics.latencies("/orders", &[40.0]);
        h.metrics.push("cpu:/orders", Ok(Some(95.0)));

        let report = reconciler.tick(&mut shutdown).await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(ratio(&h.store, "/orders"), 0.0);
        assert_eq!(
            *selector.writes.lock().unwrap(),
            vec![
                ("orders".to_string(), BackendPool::Elastic),
                ("orders".to_string(), BackendPool::Elastic)
            ]
        );
        drop(h.shutdown_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_selector_update_leaves_decision_untouched() {
        let h = harness(routing(PolicyKind::Threshold));
        let selector = Arc::new(RecordingSelector {
            failures: AtomicU32::new(10),
            ..RecordingSelector::default()
        });
        let mut reconciler = h.reconciler.with_selector(selector.clone());
        let mut shutdown = h.shutdown;

        h.metrics.latencies("/orders", &[40.0]);
        h.metrics.push("mem:/orders", Ok(Some(99.0)));

        let err = reconciler.tick(&mut shutdown).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::BackendUpdateFailure { attempts: 3, .. }
        ));
        assert!(h.store.get("/orders").is_none());
        assert_eq!(selector.writes.lock().unwrap().len(), 3);
        drop(h.shutdown_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn selector_already_in_place_is_not_rewritten() {
        let h = harness(routing(PolicyKind::Threshold));
        let selector = Arc::new(RecordingSelector {
            current: Mutex::new(Some(BackendPool::Elastic)),
            ..RecordingSelector::default()
        });
        let mut reconciler = h.reconciler.with_selector(selector.clone());
        let mut shutdown = h.shutdown;

        h.metrics.latencies("/orders", &[40.0]);
        h.metrics.push("errors:/orders", Ok(Some(25.0)));

        reconciler.tick(&mut shutdown).await.unwrap();
        assert_eq!(ratio(&h.store, "/orders"), 0.0);
        assert!(selector.writes.lock().unwrap().is_empty());
        drop(h.shutdown_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_policy_moves_saturated_route() {
        let mut h = harness(routing(PolicyKind::Threshold));
        h.metrics.latencies("/orders", &[40.0, 900.0]);
        h.metrics.push("cpu:/orders", Ok(Some(20.0)));

        let clear = h.reconciler.tick(&mut h.shutdown).await.unwrap();
        assert_eq!(clear.refreshed, 1);
        assert_eq!(ratio(&h.store, "/orders"), 1.0);

        // smoothed latency of 470ms is past the 200ms threshold
        let saturated = h.reconciler.tick(&mut h.shutdown).await.unwrap();
        assert_eq!(saturated.migrated, 1);
        assert_eq!(ratio(&h.store, "/orders"), 0.0);
        assert_eq!(h.store.get("/orders").unwrap().latency_avg, 470.0);
        assert_eq!(h.reconciler.registry().get("/orders").unwrap().history.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_policy_acts_on_resources_without_latency() {
        let mut h = harness(routing(PolicyKind::Threshold));
        h.metrics.push("cpu:/orders", Ok(Some(99.0)));

        let report = h.reconciler.tick(&mut h.shutdown).await.unwrap();
        assert_eq!(report.skipped, 0);
        assert_eq!(report.migrated, 1);
        assert_eq!(ratio(&h.store, "/orders"), 0.0);

        let state = h.reconciler.registry().get("/orders").unwrap();
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.averager.occupancy(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn rising_cpu_moves_route_before_any_threshold() {
        let mut h = harness(routing(PolicyKind::Threshold));
        h.metrics.latencies("/orders", &[40.0, 40.0, 40.0]);
        for cpu in [10.0, 25.0, 75.0] {
            h.metrics.push("cpu:/orders", Ok(Some(cpu)));
        }

        let mut ratios = Vec::new();
        for _ in 0..3 {
            h.reconciler.tick(&mut h.shutdown).await.unwrap();
            ratios.push(ratio(&h.store, "/orders"));
            tokio::time::advance(Duration::from_secs(10)).await;
        }

        // cpu climbs 15 then 50 points, a trend score of 65 / 2 / 3 > 10
        assert_eq!(ratios, vec![1.0, 1.0, 0.0]);
        assert_eq!(h.reconciler.registry().get("/orders").unwrap().history.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_selector_update_does_not_spend_the_cooldown() {
        let h = harness(routing(PolicyKind::Threshold));
        let selector = Arc::new(RecordingSelector {
            failures: AtomicU32::new(3),
            ..RecordingSelector::default()
        });
        let mut reconciler = h.reconciler.with_selector(selector.clone());
        let mut shutdown = h.shutdown;

        h.store.get_or_seed("/users");
        h.metrics.latencies("/orders", &[40.0, 40.0]);
        h.metrics.push("mem:/orders", Ok(Some(99.0)));
        h.metrics.push("mem:/orders", Ok(Some(99.0)));
        h.metrics.latencies("/users", &[40.0]);

        let err = reconciler.tick(&mut shutdown).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::BackendUpdateFailure { attempts: 3, .. }
        ));
        assert!(h.store.get("/orders").is_none());
        // routes after the failed one are still evaluated
        assert_eq!(h.store.get("/users").unwrap().latency_avg, 20.0);

        // well inside the 10s cooldown
        let report = reconciler.tick(&mut shutdown).await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(ratio(&h.store, "/orders"), 0.0);
        assert_eq!(selector.writes.lock().unwrap().len(), 4);
        drop(h.shutdown_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_unbound_routes_do_not_fail_collection() {
        let mut config = routing(PolicyKind::Gradual);
        config.idle_route_ttl = Duration::from_secs(30);
        let mut h = harness(config);
        h.metrics.stall_unscripted.store(true, Ordering::SeqCst);
        h.metrics.latencies("/orders", &[40.0, 40.0, 40.0]);
        for i in 0..50 {
            h.store.get_or_seed(&format!("/spray/{i}"));
        }

        for _ in 0..2 {
            let report = h.reconciler.tick(&mut h.shutdown).await.unwrap();
            assert!(!report.metrics_failed);
            assert_eq!(report.evaluated, 51);
            assert_eq!(report.skipped, 50);
            assert_eq!(report.evicted, 0);
        }
        assert_eq!(h.reconciler.consecutive_failures(), 0);
        assert_eq!(h.store.get("/orders").unwrap().latency_avg, 40.0);

        tokio::time::advance(Duration::from_secs(60)).await;
        let report = h.reconciler.tick(&mut h.shutdown).await.unwrap();
        assert_eq!(report.evicted, 50);
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.reconciler.registry().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_bound_route_fails_collection() {
        let mut h = harness(routing(PolicyKind::Gradual));
        h.metrics.stall_unscripted.store(true, Ordering::SeqCst);

        let report = h.reconciler.tick(&mut h.shutdown).await.unwrap();
        assert!(report.metrics_failed);
        assert_eq!(h.reconciler.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let h = harness(routing(PolicyKind::Gradual));
        h.metrics.latencies("/orders", &[40.0, 40.0]);
        let handle = tokio::spawn(h.reconciler.run(h.shutdown));

        tokio::time::sleep(Duration::from_secs(25)).await;
        h.shutdown_tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
        // ticks ran and seeded the configured route
        assert_eq!(ratio(&h.store, "/orders"), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_gives_up_after_repeated_failures() {
        let h = harness(routing(PolicyKind::Gradual));
        for _ in 0..3 {
            h.metrics
                .push("latency:/orders", Err(MetricsError::Rejected("bad_data".to_string())));
        }

        let result = h.reconciler.run(h.shutdown).await;
        assert!(matches!(result, Err(ControlError::RepeatedMetricsFailure { .. })));
        drop(h.shutdown_tx);
    }
}
