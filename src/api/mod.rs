//! HTTP and SSE surface.

pub mod routes;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::aggregator::CompositeAggregator;
use crate::backfill::BackfillService;
use crate::models::Config;
use crate::storage::BarStore;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<CompositeAggregator>,
    pub store: Arc<BarStore>,
    pub backfill: Arc<BackfillService>,
    pub config: Arc<Config>,
    pub started_at: i64,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/health/live", get(routes::liveness))
        .route("/health/ready", get(routes::readiness))
        .route("/v0/latest", get(routes::latest))
        .route("/v0/candles", get(routes::candles))
        .route("/v0/venue-candles", get(routes::venue_candles))
        .route("/v0/telemetry", get(routes::telemetry))
        .route("/v0/gaps", get(routes::gaps))
        .route("/v0/integrity", get(routes::integrity))
        .route("/v0/window", get(routes::window))
        .route("/v0/backfill", post(routes::backfill))
        .route("/v0/stream", get(routes::stream))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
