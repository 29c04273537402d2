//! Edge gateway binary.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────────┐
//!                        │                     EDGE GATEWAY                      │
//!                        │                                                       │
//!  Client connection     │  ┌──────────┐   ┌──────────────────────────────────┐  │
//!  ──────────────────────┼─▶│ listener │──▶│ pipeline                         │  │
//!                        │  │   set    │   │ [proxy_protocol] → proxy_headers │  │
//!                        │  └──────────┘   │ → [tls] → lifecycle → http1|alpn │  │
//!                        │                 └────────────────┬─────────────────┘  │
//!                        │                                  ▼                    │
//!                        │                 ┌──────────────────────────────────┐  │
//!                        │                 │ filter chain engine              │  │
//!                        │                 │ inbound → routing → origin       │  │      Origin
//!  Client response       │                 │ → outbound  (error → always-run) │──┼───▶ backend
//!  ◀─────────────────────┼─────────────────┴──────────────────────────────────┘  │
//!                        │                                  ▲                    │
//!                        │  ┌──────────────┐   ┌────────────┴──┐                 │
//!                        │  │ filter source│──▶│ filter        │                 │
//!                        │  │ watcher      │   │ registry      │                 │
//!                        │  └──────────────┘   └───────────────┘                 │
//!                        └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use edge_gateway::config::watcher::DirectoryNudge;
use edge_gateway::config::{load_config, GatewayConfig};
use edge_gateway::engine::{
    ChannelNotifier, EngineConfig, FilterChainEngine, HttpOrigin, MetricsNotifier, UsageNotifier,
};
use edge_gateway::filters::StaticFilterFactory;
use edge_gateway::lifecycle::signals::shutdown_signal;
use edge_gateway::lifecycle::Shutdown;
use edge_gateway::net::connection::ConnectionTracker;
use edge_gateway::net::tls::PemFileProvider;
use edge_gateway::observability::{logging, metrics};
use edge_gateway::pipeline::ProtocolPipelineBuilder;
use edge_gateway::registry::{DirectorySource, FilterRegistry, FilterSourceWatcher};
use edge_gateway::server::{ConnectionServices, ListenerSet};

const USAGE_QUEUE_CAPACITY: usize = 10_000;

#[derive(Parser)]
#[command(name = "edge-gateway")]
#[command(about = "Edge gateway with a hot-swappable filter chain", long_about = None)]
struct Cli {
    /// Path to the gateway configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Validate the configuration and listener pipelines, then exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            logging::init(&GatewayConfig::default().observability);
            tracing::error!(path = ?cli.config, error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };
    logging::init(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listeners = config.listeners.len(),
        filter_dir = ?config.filters.directory,
        origin = %config.origin.address,
        "edge-gateway starting"
    );

    let builder = ProtocolPipelineBuilder::new(Arc::new(PemFileProvider));
    if cli.check {
        return check(&config, &builder);
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();

    // Filters: initial load, then keep watching.
    let registry = Arc::new(FilterRegistry::new());
    let source = DirectorySource::new(&config.filters.directory)
        .with_disabled(config.filters.disabled.iter().cloned());
    let mut watcher = FilterSourceWatcher::new(
        Arc::new(source),
        Arc::new(StaticFilterFactory::with_builtins()),
        Arc::clone(&registry),
        Duration::from_secs(config.filters.poll_interval_secs),
    );
    match watcher.poll().await {
        Ok(report) => tracing::info!(
            filters = report.added.len(),
            failed = report.failed.len(),
            version = registry.version(),
            "Initial filter set loaded"
        ),
        Err(e) => tracing::warn!(error = %e, "Filter source unavailable; starting with no filters"),
    }

    let (_fs_watcher, nudges) = if config.filters.watch_changes {
        let (nudge, rx) = DirectoryNudge::new(&config.filters.directory);
        match nudge.run() {
            Ok(handle) => (Some(handle), Some(rx)),
            Err(e) => {
                tracing::warn!(error = %e, "Filter directory watch unavailable; polling only");
                (None, None)
            }
        }
    } else {
        (None, None)
    };
    let watcher_task = tokio::spawn(watcher.run(shutdown.subscribe(), nudges));

    // Usage events are buffered so the request path never waits on them.
    let (notifier, usage_rx) = ChannelNotifier::new(USAGE_QUEUE_CAPACITY);
    let notifier: Arc<dyn UsageNotifier> = Arc::new(notifier);
    let _usage_task = ChannelNotifier::forward(usage_rx, Arc::new(MetricsNotifier));

    let origin = HttpOrigin::new(&config.origin)?;
    let engine = Arc::new(FilterChainEngine::new(
        Arc::clone(&registry),
        Arc::new(origin),
        Arc::clone(&notifier),
        EngineConfig::from(&config.engine),
    ));

    let listeners = ListenerSet::bind(&config.listeners, &builder).await;
    if listeners.is_empty() {
        tracing::error!(failed = listeners.failures().len(), "No listener could be started");
        return Err("no listener could be started".into());
    }

    let drain_deadline = config
        .listeners
        .values()
        .map(|l| l.timeouts.drain_secs)
        .max()
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(30));

    let tracker = ConnectionTracker::new();
    let services = ConnectionServices { engine, notifier };
    let serving = tokio::spawn(listeners.serve(services, shutdown.clone(), tracker.clone()));

    shutdown_signal().await;
    tracing::info!(active_connections = tracker.active_count(), "Shutting down");
    shutdown.trigger();

    if let Err(e) = serving.await {
        tracing::error!(error = %e, "Listener task failed");
    }
    let remaining = tracker.wait_for_shutdown(drain_deadline + Duration::from_secs(1)).await;
    if remaining > 0 {
        tracing::warn!(remaining, "Connections still open after drain deadline");
    }
    if let Err(e) = watcher_task.await {
        tracing::error!(error = %e, "Filter watcher task failed");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Build every listener pipeline without binding.
fn check(config: &GatewayConfig, builder: &ProtocolPipelineBuilder) -> Result<(), Box<dyn std::error::Error>> {
    let mut failed = 0;
    for (name, listener) in &config.listeners {
        match builder.build(name, listener) {
            Ok(pipeline) => tracing::info!(listener = %name, stages = ?pipeline.stage_names(), "Listener OK"),
            Err(e) => {
                failed += 1;
                tracing::error!(listener = %name, error = %e, "Listener invalid");
            }
        }
    }
    if failed > 0 {
        return Err(format!("{failed} listener(s) invalid").into());
    }
    tracing::info!("Configuration OK");
    Ok(())
}
