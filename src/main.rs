//! Candela service binary.
//!
//! Wires the composite aggregator to a SQLite store through a channel-backed
//! sink, starts the backfill service, the retention sweeper, and the HTTP/SSE
//! API.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use candela::aggregator::{AggregatorConfig, BarSink, CompositeAggregator};
use candela::api::{build_router, AppState};
use candela::backfill::{BackfillService, RestTradeFetcher};
use candela::clock::SystemClock;
use candela::models::{CompositeBar, Config, VenueBarRecord};
use candela::storage::{spawn_persistence_task, spawn_retention_task, BarStore};

/// Sink that forwards emissions into unbounded channels so the aggregator
/// tick never blocks on persistence.
struct ChannelSink {
    composite_tx: mpsc::UnboundedSender<CompositeBar>,
    venue_tx: mpsc::UnboundedSender<Vec<VenueBarRecord>>,
}

impl BarSink for ChannelSink {
    fn on_composite_bar(&self, bar: &CompositeBar) {
        let _ = self.composite_tx.send(bar.clone());
    }

    fn on_venue_bars(&self, bars: &[VenueBarRecord]) {
        let _ = self.venue_tx.send(bars.to_vec());
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);
    info!(
        assets = ?config.assets,
        spot_venues = ?config.spot_venues,
        perp_venues = ?config.perp_venues,
        port = config.port,
        "candela starting"
    );

    let store = Arc::new(BarStore::open(&config.database_path)?);

    let (composite_tx, composite_rx) = mpsc::unbounded_channel();
    let (venue_tx, venue_rx) = mpsc::unbounded_channel();
    spawn_persistence_task(store.clone(), composite_rx, venue_rx);
    spawn_retention_task(store.clone(), config.retention_days);

    let aggregator = Arc::new(CompositeAggregator::new(
        AggregatorConfig {
            assets: config.assets.clone(),
            spot_venues: config.spot_venues.clone(),
            perp_venues: config.perp_venues.clone(),
        },
        Arc::new(SystemClock),
        Arc::new(ChannelSink {
            composite_tx,
            venue_tx,
        }),
    ));
    aggregator.start();

    let backfill = Arc::new(BackfillService::new(
        store.clone(),
        Arc::new(RestTradeFetcher::new()?),
        config.spot_venues.clone(),
        config.perp_venues.clone(),
    ));

    let state = AppState {
        aggregator: aggregator.clone(),
        store,
        backfill,
        config: config.clone(),
        started_at: candela::models::now_ms() / 1000,
    };
    let router = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "api listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    aggregator.stop().await;
    info!("candela stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
