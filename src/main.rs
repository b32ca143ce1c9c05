use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use tracing::{info, warn, Level};

use hazard_route::api::{router, AppState};
use hazard_route::graph::NavigationGraph;
use hazard_route::{HazardRecord, InMemoryHazardStore, ServiceConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Hazard-aware route risk API.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON config file; built-in defaults apply when omitted.
    #[arg(long, env = "HAZARD_ROUTE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file.
    #[arg(long, env = "HAZARD_ROUTE_BIND")]
    bind: Option<String>,

    /// JSON array of hazard records to load at startup.
    #[arg(long, env = "HAZARD_ROUTE_HAZARDS")]
    hazards: Option<PathBuf>,

    /// Road network extract (.osm.pbf).
    #[arg(long, env = "HAZARD_ROUTE_NETWORK")]
    network: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,

    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format, args.log_level);

    // 1. Configuration
    let mut config = match &args.config {
        Some(path) => ServiceConfig::from_path(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if args.hazards.is_some() {
        config.hazards_path = args.hazards;
    }
    if args.network.is_some() {
        config.network_path = args.network;
    }
    config.validate()?;

    // 2. Hazard data
    let store = Arc::new(InMemoryHazardStore::new());
    if let Some(path) = &config.hazards_path {
        let loaded = load_hazards(&store, path)?;
        info!(loaded, path = %path.display(), "hazards loaded");
    }

    // 3. Road network
    let network = match &config.network_path {
        Some(path) => load_network(path)?.map(Arc::new),
        None => None,
    };

    if config.purge_interval_secs > 0 {
        spawn_purge(Arc::clone(&store), Duration::from_secs(config.purge_interval_secs));
    }

    // 4. Router
    let state = Arc::new(AppState::new(store, network, &config)?);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(addr = %config.bind, "API server running");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn init_tracing(format: LogFormat, level: Level) {
    let builder = tracing_subscriber::fmt().with_max_level(level);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_hazards(store: &InMemoryHazardStore, path: &Path) -> anyhow::Result<usize> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening hazards {}", path.display()))?;
    let records: Vec<HazardRecord> = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("parsing hazards {}", path.display()))?;
    let written = store.upsert_many(records)?;
    Ok(written)
}

#[cfg(feature = "osm")]
fn load_network(path: &Path) -> anyhow::Result<Option<NavigationGraph>> {
    NavigationGraph::from_pbf(path)
        .map(Some)
        .with_context(|| format!("loading road network {}", path.display()))
}

#[cfg(not(feature = "osm"))]
fn load_network(path: &Path) -> anyhow::Result<Option<NavigationGraph>> {
    warn!(
        path = %path.display(),
        "built without the `osm` feature; route planning is disabled"
    );
    Ok(None)
}

/// Periodically drop hazards whose validity window has closed.
fn spawn_purge(store: Arc<InMemoryHazardStore>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match store.purge_expired(Utc::now()) {
                Ok(0) => {}
                Ok(purged) => info!(purged, "expired hazards purged"),
                Err(e) => warn!(error = %e, "hazard purge failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}
