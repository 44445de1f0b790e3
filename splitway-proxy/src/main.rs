//! Splitway daemon
//!
//! Loads the configuration file, starts the config watcher and the reconciliation
//! loop, and serves the proxy until Ctrl-C or until the loop gives up on metrics.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use splitway_control::{ConfigWatcher, HttpSelector, PrometheusSource, Reconciler, SplitwayConfig};
use splitway_core::domain::config::shared;
use splitway_core::RoutingDecisionStore;
use splitway_proxy::{serve, Dispatcher};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Adaptive traffic splitter between a heavy and an elastic backend pool.
#[derive(Debug, Parser)]
#[command(name = "splitway", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short)]
    config: PathBuf,

    /// Listen address, overriding `server.listen`.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// How often the configuration file is checked for changes.
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    config_poll: Duration,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,splitway=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = SplitwayConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    info!(
        path = %cli.config.display(),
        policy = ?config.routing.policy,
        routes = config.routing.routes.len(),
        "configuration loaded"
    );

    let store = Arc::new(RoutingDecisionStore::with_route_limit(config.server.max_routes));
    let routing = shared(config.routing.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Control plane ─────────────────────────────────────────

    let watcher = ConfigWatcher::new(&cli.config, routing.clone(), cli.config_poll);
    let watcher_task = tokio::spawn(watcher.run(shutdown_rx.clone()));

    let metrics = PrometheusSource::new(&config.metrics.endpoint, config.metrics.request_timeout)
        .context("building metrics client")?;
    let queries = config.metrics.queries.clone();
    let mut reconciler = Reconciler::new(routing.clone(), store.clone(), metrics, queries);
    if let Some(settings) = &config.selector {
        let selector = HttpSelector::new(settings).context("building selector client")?;
        reconciler = reconciler.with_selector(selector);
        info!(endpoint = %settings.endpoint, label = %settings.label, "backend selector enabled");
    }
    let mut reconciler_task = tokio::spawn(reconciler.run(shutdown_rx.clone()));

    // ── Proxy ─────────────────────────────────────────────────

    let listener = TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    let dispatcher = Dispatcher::new(store, routing, &config.server);
    let server_task = tokio::spawn(serve(listener, dispatcher, shutdown_rx));

    let loop_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            reconciler_task.await
        }
        finished = &mut reconciler_task => {
            let _ = shutdown_tx.send(true);
            finished
        }
    };

    let _ = server_task.await;
    let _ = watcher_task.await;

    match loop_result.context("reconciliation task panicked")? {
        Ok(()) => {
            info!("splitway stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "reconciliation loop failed");
            Err(e.into())
        }
    }
}
