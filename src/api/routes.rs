//! API route handlers.
//!
//! Contract faults surface as 400/401/403; everything else is computed from
//! the aggregator's in-memory state or the store.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backfill::{BackfillError, BackfillResult};
use crate::models::{
    format_ts, now_ms, Asset, Bar, CompositeBar, MarketType, VenueId, VenueTelemetry,
};
use crate::storage::IntegrityStats;

use super::AppState;

/// Hard cap on candles returned per request (one day of minutes).
const MAX_CANDLES: usize = 1_440;

type ApiError = (StatusCode, String);

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, message.into())
}

fn internal_error(e: impl std::fmt::Display) -> ApiError {
    warn!("internal error: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}

fn parse_asset(raw: &str) -> Result<Asset, ApiError> {
    raw.parse().map_err(bad_request)
}

fn parse_market(raw: &str) -> Result<MarketType, ApiError> {
    raw.parse().map_err(bad_request)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    pub uptime_seconds: i64,
    pub connectors_connected: usize,
    pub connectors_total: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status_map = state.aggregator.connection_status();
    let connected = status_map.values().filter(|&&up| up).count();
    let total = status_map.len();

    let status = if total == 0 || connected * 2 >= total {
        "healthy"
    } else if connected > 0 {
        "degraded"
    } else {
        "unhealthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        service: "candela".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: format_ts(now_ms() / 1000),
        uptime_seconds: now_ms() / 1000 - state.started_at,
        connectors_connected: connected,
        connectors_total: total,
    })
}

pub async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

pub async fn readiness(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status_map = state.aggregator.connection_status();
    let connected = status_map.values().filter(|&&up| up).count();
    Json(serde_json::json!({
        "status": "ready",
        "connectors_connected": connected,
    }))
}

// ---------------------------------------------------------------------------
// Latest
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub asset: Option<String>,
    pub market_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LatestEntry {
    pub asset: Asset,
    pub market_type: MarketType,
    pub last_bar: Option<CompositeBar>,
}

#[derive(Debug, Serialize)]
pub struct LatestResponse {
    pub entries: Vec<LatestEntry>,
    pub current_prices: HashMap<String, f64>,
    pub timestamp: String,
}

pub async fn latest(
    Query(params): Query<LatestQuery>,
    State(state): State<AppState>,
) -> Result<Json<LatestResponse>, ApiError> {
    let asset_filter = params.asset.as_deref().map(parse_asset).transpose()?;
    let market_filter = params.market_type.as_deref().map(parse_market).transpose()?;

    let mut entries = Vec::new();
    for asset in Asset::ALL {
        if asset_filter.is_some_and(|a| a != asset) {
            continue;
        }
        for market in MarketType::ALL {
            if market_filter.is_some_and(|m| m != market) {
                continue;
            }
            let last_bar = match state.aggregator.latest_bar(asset, market) {
                Some(bar) => Some(bar),
                None => state
                    .store
                    .latest_composite(asset, market)
                    .map_err(internal_error)?,
            };
            entries.push(LatestEntry {
                asset,
                market_type: market,
                last_bar,
            });
        }
    }

    Ok(Json(LatestResponse {
        entries,
        current_prices: state.aggregator.current_prices(),
        timestamp: format_ts(now_ms() / 1000),
    }))
}

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CandlesQuery {
    pub asset: String,
    pub market_type: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CandlesResponse {
    pub asset: Asset,
    pub market_type: MarketType,
    pub candles: Vec<CompositeBar>,
    pub count: usize,
}

fn resolve_range(start: Option<i64>, end: Option<i64>) -> Result<(i64, i64), ApiError> {
    let end = end.unwrap_or_else(|| now_ms() / 1000);
    let start = start.unwrap_or(end - 3600);
    if start >= end {
        return Err(bad_request("start must be before end"));
    }
    Ok((start, end))
}

pub async fn candles(
    Query(params): Query<CandlesQuery>,
    State(state): State<AppState>,
) -> Result<Json<CandlesResponse>, ApiError> {
    let asset = parse_asset(&params.asset)?;
    let market = parse_market(&params.market_type)?;
    let (start, end) = resolve_range(params.start, params.end)?;
    let limit = params.limit.unwrap_or(MAX_CANDLES).min(MAX_CANDLES);

    let candles = state
        .store
        .composite_range(asset, market, start, end, limit)
        .map_err(internal_error)?;

    Ok(Json(CandlesResponse {
        asset,
        market_type: market,
        count: candles.len(),
        candles,
    }))
}

#[derive(Debug, Deserialize)]
pub struct VenueCandlesQuery {
    pub asset: String,
    pub market_type: String,
    pub venue: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct VenueCandlesResponse {
    pub asset: Asset,
    pub market_type: MarketType,
    pub venue: VenueId,
    pub candles: Vec<Bar>,
    pub count: usize,
}

pub async fn venue_candles(
    Query(params): Query<VenueCandlesQuery>,
    State(state): State<AppState>,
) -> Result<Json<VenueCandlesResponse>, ApiError> {
    let asset = parse_asset(&params.asset)?;
    let market = parse_market(&params.market_type)?;
    let venue: VenueId = params.venue.parse().map_err(bad_request)?;
    let (start, end) = resolve_range(params.start, params.end)?;
    let limit = params.limit.unwrap_or(MAX_CANDLES).min(MAX_CANDLES);

    let candles = state
        .store
        .venue_range(asset, market, venue, start, end, limit)
        .map_err(internal_error)?;

    Ok(Json(VenueCandlesResponse {
        asset,
        market_type: market,
        venue,
        count: candles.len(),
        candles,
    }))
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TelemetryResponse {
    pub venues: Vec<VenueTelemetry>,
    pub connections: HashMap<String, bool>,
    pub timestamp: String,
}

pub async fn telemetry(State(state): State<AppState>) -> Json<TelemetryResponse> {
    Json(TelemetryResponse {
        venues: state.aggregator.telemetry(),
        connections: state.aggregator.connection_status(),
        timestamp: format_ts(now_ms() / 1000),
    })
}

// ---------------------------------------------------------------------------
// Gaps & integrity
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub asset: String,
    pub market_type: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct GapsResponse {
    pub asset: Asset,
    pub market_type: MarketType,
    pub start: i64,
    pub end: i64,
    pub gaps: Vec<i64>,
    pub count: usize,
}

pub async fn gaps(
    Query(params): Query<RangeQuery>,
    State(state): State<AppState>,
) -> Result<Json<GapsResponse>, ApiError> {
    let asset = parse_asset(&params.asset)?;
    let market = parse_market(&params.market_type)?;
    let (start, end) = resolve_range(params.start, params.end)?;

    let gaps = state
        .store
        .gap_times(asset, market, start, end, MAX_CANDLES)
        .map_err(internal_error)?;

    Ok(Json(GapsResponse {
        asset,
        market_type: market,
        start,
        end,
        count: gaps.len(),
        gaps,
    }))
}

#[derive(Debug, Serialize)]
pub struct IntegrityResponse {
    pub asset: Asset,
    pub market_type: MarketType,
    pub start: i64,
    pub end: i64,
    #[serde(flatten)]
    pub stats: IntegrityStats,
}

pub async fn integrity(
    Query(params): Query<RangeQuery>,
    State(state): State<AppState>,
) -> Result<Json<IntegrityResponse>, ApiError> {
    let asset = parse_asset(&params.asset)?;
    let market = parse_market(&params.market_type)?;
    let (start, end) = resolve_range(params.start, params.end)?;

    let stats = state
        .store
        .integrity_stats(asset, market, start, end)
        .map_err(internal_error)?;

    Ok(Json(IntegrityResponse {
        asset,
        market_type: market,
        start,
        end,
        stats,
    }))
}

// ---------------------------------------------------------------------------
// Dataset window
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub asset: String,
    pub market_type: String,
    pub end: Option<i64>,
    pub minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WindowResponse {
    pub asset: Asset,
    pub market_type: MarketType,
    pub start: i64,
    pub end: i64,
    pub expected: i64,
    pub bars: Vec<CompositeBar>,
}

/// Fixed-length dataset window: one row per expected minute, with explicit
/// synthesized gap rows where the store has nothing.
pub async fn window(
    Query(params): Query<WindowQuery>,
    State(state): State<AppState>,
) -> Result<Json<WindowResponse>, ApiError> {
    let asset = parse_asset(&params.asset)?;
    let market = parse_market(&params.market_type)?;

    let minutes = params.minutes.unwrap_or(MAX_CANDLES as i64);
    if minutes <= 0 || minutes > MAX_CANDLES as i64 {
        return Err(bad_request(format!(
            "minutes must be in 1..={MAX_CANDLES}"
        )));
    }

    let end = params.end.unwrap_or_else(|| now_ms() / 1000 / 60 * 60);
    let start = end - minutes * 60;

    let stored = state
        .store
        .composite_range(asset, market, start, end, minutes as usize)
        .map_err(internal_error)?;
    let by_time: HashMap<i64, &CompositeBar> = stored.iter().map(|b| (b.time, b)).collect();

    let bars: Vec<CompositeBar> = (0..minutes)
        .map(|i| {
            let time = start + i * 60;
            match by_time.get(&time) {
                Some(&bar) => bar.clone(),
                None => synthesized_gap(time, asset, market),
            }
        })
        .collect();

    Ok(Json(WindowResponse {
        asset,
        market_type: market,
        start,
        end,
        expected: minutes,
        bars,
    }))
}

fn synthesized_gap(time: i64, asset: Asset, market: MarketType) -> CompositeBar {
    CompositeBar {
        time,
        open: None,
        high: None,
        low: None,
        close: None,
        volume: 0.0,
        buy_volume: 0.0,
        sell_volume: 0.0,
        buy_count: 0,
        sell_count: 0,
        degraded: true,
        is_gap: true,
        is_backfilled: false,
        included_venues: vec![],
        excluded_venues: vec![],
        asset,
        market_type: market,
    }
}

// ---------------------------------------------------------------------------
// Backfill (admin)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BackfillRequest {
    pub asset: String,
    pub market_type: String,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub venues: Option<Vec<String>>,
}

fn check_admin_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.admin_api_key.as_deref() else {
        // No key configured: development mode, mutations are open.
        return Ok(());
    };

    match headers.get("x-admin-key").and_then(|v| v.to_str().ok()) {
        None => Err((StatusCode::UNAUTHORIZED, "missing X-Admin-Key".to_string())),
        Some(key) if key != expected => {
            Err((StatusCode::FORBIDDEN, "invalid admin key".to_string()))
        }
        Some(_) => Ok(()),
    }
}

pub async fn backfill(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BackfillRequest>,
) -> Result<Json<BackfillResult>, ApiError> {
    check_admin_key(&state, &headers)?;

    let asset = parse_asset(&request.asset)?;
    let market = parse_market(&request.market_type)?;
    let venues = request
        .venues
        .map(|list| {
            list.iter()
                .map(|v| v.parse::<VenueId>())
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()
        .map_err(bad_request)?;

    info!(
        %asset,
        %market,
        start = request.start_time,
        end = request.end_time,
        "backfill requested"
    );

    let result = state
        .backfill
        .backfill_gaps(asset, market, request.start_time, request.end_time, venues)
        .await
        .map_err(|e| match e {
            BackfillError::InvalidRequest(msg) => bad_request(msg),
            other => internal_error(other),
        })?;

    Ok(Json(result))
}

// ---------------------------------------------------------------------------
// SSE stream
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PriceEvent {
    prices: HashMap<String, f64>,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct TelemetryEvent {
    venues: Vec<VenueTelemetry>,
    timestamp: i64,
}

/// SSE stream: `price` events on the price cadence, `telemetry` events on
/// the telemetry cadence.
pub async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let price_interval = tokio::time::interval(Duration::from_millis(
        state.config.sse_price_cadence_ms.max(100),
    ));
    let telemetry_interval = tokio::time::interval(Duration::from_millis(
        state.config.sse_telemetry_cadence_ms.max(1000),
    ));

    let stream = futures_util::stream::unfold(
        (state, price_interval, telemetry_interval),
        |(state, mut price_interval, mut telemetry_interval)| async move {
            let event = tokio::select! {
                _ = price_interval.tick() => {
                    let payload = PriceEvent {
                        prices: state.aggregator.current_prices(),
                        timestamp: now_ms(),
                    };
                    Event::default()
                        .event("price")
                        .json_data(&payload)
                        .unwrap_or_else(|_| Event::default().event("price").data("{}"))
                }
                _ = telemetry_interval.tick() => {
                    let payload = TelemetryEvent {
                        venues: state.aggregator.telemetry(),
                        timestamp: now_ms(),
                    };
                    Event::default()
                        .event("telemetry")
                        .json_data(&payload)
                        .unwrap_or_else(|_| Event::default().event("telemetry").data("{}"))
                }
            };
            Some((Ok(event), (state, price_interval, telemetry_interval)))
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{AggregatorConfig, CompositeAggregator, NullSink};
    use crate::backfill::{BackfillService, RestTradeFetcher};
    use crate::clock::SystemClock;
    use crate::models::Config;
    use crate::storage::BarStore;
    use std::sync::Arc;

    fn test_state(admin_key: Option<&str>) -> AppState {
        let store = Arc::new(BarStore::in_memory().unwrap());
        let aggregator = Arc::new(CompositeAggregator::new(
            AggregatorConfig::default(),
            Arc::new(SystemClock),
            Arc::new(NullSink),
        ));
        let backfill = Arc::new(BackfillService::new(
            store.clone(),
            Arc::new(RestTradeFetcher::new().unwrap()),
            vec![VenueId::Binance],
            vec![VenueId::Binance],
        ));
        AppState {
            aggregator,
            store,
            backfill,
            config: Arc::new(Config {
                database_path: String::new(),
                port: 0,
                assets: vec![Asset::Btc],
                spot_venues: vec![VenueId::Binance],
                perp_venues: vec![],
                retention_days: 0,
                admin_api_key: admin_key.map(String::from),
                sse_price_cadence_ms: 500,
                sse_telemetry_cadence_ms: 5000,
            }),
            started_at: now_ms() / 1000,
        }
    }

    #[test]
    fn test_admin_key_checks() {
        let open = test_state(None);
        assert!(check_admin_key(&open, &HeaderMap::new()).is_ok());

        let locked = test_state(Some("secret"));
        let err = check_admin_key(&locked, &HeaderMap::new()).unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);

        let mut wrong = HeaderMap::new();
        wrong.insert("x-admin-key", "nope".parse().unwrap());
        let err = check_admin_key(&locked, &wrong).unwrap_err();
        assert_eq!(err.0, StatusCode::FORBIDDEN);

        let mut right = HeaderMap::new();
        right.insert("x-admin-key", "secret".parse().unwrap());
        assert!(check_admin_key(&locked, &right).is_ok());
    }

    #[test]
    fn test_resolve_range_validation() {
        assert!(resolve_range(Some(100), Some(50)).is_err());
        assert_eq!(resolve_range(Some(100), Some(200)).unwrap(), (100, 200));
        let (start, end) = resolve_range(None, Some(7200)).unwrap();
        assert_eq!(end - start, 3600);
        assert_eq!(end, 7200);
    }

    #[tokio::test]
    async fn test_window_synthesizes_gap_rows() {
        let state = test_state(None);
        let end = 1_700_000_640;
        // Store only one of the ten minutes.
        let mut bar = synthesized_gap(end - 600, Asset::Btc, MarketType::Spot);
        bar.is_gap = false;
        bar.open = Some(1.0);
        bar.high = Some(1.0);
        bar.low = Some(1.0);
        bar.close = Some(1.0);
        bar.degraded = false;
        bar.included_venues = vec![VenueId::Binance, VenueId::Coinbase];
        state.store.upsert_composite(&bar).unwrap();

        let response = window(
            Query(WindowQuery {
                asset: "BTC".to_string(),
                market_type: "spot".to_string(),
                end: Some(end),
                minutes: Some(10),
            }),
            State(state),
        )
        .await
        .unwrap();

        assert_eq!(response.0.bars.len(), 10);
        assert_eq!(response.0.expected, 10);
        assert!(!response.0.bars[0].is_gap);
        assert!(response.0.bars[1..].iter().all(|b| b.is_gap));
        assert!(response
            .0
            .bars
            .windows(2)
            .all(|w| w[1].time - w[0].time == 60));
    }

    #[tokio::test]
    async fn test_candles_rejects_bad_params() {
        let state = test_state(None);
        let err = candles(
            Query(CandlesQuery {
                asset: "DOGE".to_string(),
                market_type: "spot".to_string(),
                start: None,
                end: None,
                limit: None,
            }),
            State(state.clone()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let err = candles(
            Query(CandlesQuery {
                asset: "BTC".to_string(),
                market_type: "margin".to_string(),
                start: None,
                end: None,
                limit: None,
            }),
            State(state),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_latest_respects_filters() {
        let state = test_state(None);
        let response = latest(
            Query(LatestQuery {
                asset: Some("BTC".to_string()),
                market_type: Some("spot".to_string()),
            }),
            State(state),
        )
        .await
        .unwrap();
        assert_eq!(response.0.entries.len(), 1);
        assert_eq!(response.0.entries[0].asset, Asset::Btc);
        assert_eq!(response.0.entries[0].market_type, MarketType::Spot);
    }
}
