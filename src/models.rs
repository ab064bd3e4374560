use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Assets covered by the indexer (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    Eth,
}

impl Asset {
    pub const ALL: [Asset; 2] = [Asset::Btc, Asset::Eth];

    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Asset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BTC" => Ok(Asset::Btc),
            "ETH" => Ok(Asset::Eth),
            other => Err(format!("unknown asset: {other}")),
        }
    }
}

/// Market type (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Perp,
}

impl MarketType {
    pub const ALL: [MarketType; 2] = [MarketType::Spot, MarketType::Perp];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Perp => "perp",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spot" => Ok(MarketType::Spot),
            "perp" => Ok(MarketType::Perp),
            other => Err(format!("unknown market type: {other}")),
        }
    }
}

/// Exchange venues (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueId {
    Binance,
    Coinbase,
    Kraken,
    Okx,
    Bybit,
}

impl VenueId {
    pub const ALL: [VenueId; 5] = [
        VenueId::Binance,
        VenueId::Coinbase,
        VenueId::Kraken,
        VenueId::Okx,
        VenueId::Bybit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueId::Binance => "binance",
            VenueId::Coinbase => "coinbase",
            VenueId::Kraken => "kraken",
            VenueId::Okx => "okx",
            VenueId::Bybit => "bybit",
        }
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VenueId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(VenueId::Binance),
            "coinbase" => Ok(VenueId::Coinbase),
            "kraken" => Ok(VenueId::Kraken),
            "okx" => Ok(VenueId::Okx),
            "bybit" => Ok(VenueId::Bybit),
            other => Err(format!("unknown venue: {other}")),
        }
    }
}

/// Normalized aggressor side: BUY lifted the ask, SELL hit the bid.
///
/// Every venue parser translates its own maker/taker field into this single
/// convention before a trade enters the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TakerSide {
    Buy,
    Sell,
}

/// A normalized trade from any venue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Exchange timestamp (ms).
    pub timestamp: i64,
    /// Local receipt timestamp (ms). Backfilled trades reuse the exchange time.
    pub local_timestamp: i64,
    pub price: f64,
    pub quantity: f64,
    pub taker_side: TakerSide,
    pub venue: VenueId,
    pub asset: Asset,
    pub market_type: MarketType,
}

/// A one-minute OHLCV bar for a single venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar start (unix seconds, floored to the minute).
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u32,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub buy_count: u32,
    pub sell_count: u32,
    pub venue: VenueId,
    pub asset: Asset,
    pub market_type: MarketType,
    pub is_partial: bool,
}

/// Why a venue was excluded from a composite component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExcludeReason {
    Disconnected,
    NoData,
    Stale,
    Outlier,
    BackfillUnavailable,
}

impl ExcludeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExcludeReason::Disconnected => "DISCONNECTED",
            ExcludeReason::NoData => "NO_DATA",
            ExcludeReason::Stale => "STALE",
            ExcludeReason::Outlier => "OUTLIER",
            ExcludeReason::BackfillUnavailable => "BACKFILL_UNAVAILABLE",
        }
    }
}

impl fmt::Display for ExcludeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExcludeReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISCONNECTED" => Ok(ExcludeReason::Disconnected),
            "NO_DATA" => Ok(ExcludeReason::NoData),
            "STALE" => Ok(ExcludeReason::Stale),
            "OUTLIER" => Ok(ExcludeReason::Outlier),
            "BACKFILL_UNAVAILABLE" => Ok(ExcludeReason::BackfillUnavailable),
            other => Err(format!("unknown exclude reason: {other}")),
        }
    }
}

/// Why a composite component is degraded, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradedReason {
    None,
    BelowPreferredQuorum,
    SingleSource,
    VenueOutlier,
    VenueStale,
    VenueDisconnected,
}

/// A venue excluded from a composite bar, with the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedVenue {
    pub venue: VenueId,
    pub reason: ExcludeReason,
}

/// A composite one-minute bar for an (asset, market) pair.
///
/// OHLC are absent exactly when `is_gap` is set; flow fields are zero on a
/// gap. `is_backfilled` is monotonic: once true it never reverts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeBar {
    pub time: i64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub buy_count: u32,
    pub sell_count: u32,
    pub degraded: bool,
    pub is_gap: bool,
    pub is_backfilled: bool,
    pub included_venues: Vec<VenueId>,
    pub excluded_venues: Vec<ExcludedVenue>,
    pub asset: Asset,
    pub market_type: MarketType,
}

/// Connector connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Read-only telemetry snapshot for a venue connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueTelemetry {
    pub venue: VenueId,
    pub asset: Asset,
    pub market_type: MarketType,
    pub connection_state: ConnectionState,
    pub last_message_time: Option<i64>,
    pub message_count: u64,
    pub trade_count: u64,
    pub reconnect_count: u64,
    pub session_start_time: Option<i64>,
    pub uptime_percent: f64,
    pub avg_message_rate: f64,
}

/// A venue bar together with its inclusion status in the minute's composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueBarRecord {
    pub bar: Bar,
    pub included: bool,
    pub exclude_reason: Option<ExcludeReason>,
}

/// Application configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub assets: Vec<Asset>,
    pub spot_venues: Vec<VenueId>,
    pub perp_venues: Vec<VenueId>,
    pub retention_days: i64,
    pub admin_api_key: Option<String>,
    pub sse_price_cadence_ms: u64,
    pub sse_telemetry_cadence_ms: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./candela.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let assets = parse_list::<Asset>(
            &std::env::var("ASSETS").unwrap_or_else(|_| "BTC,ETH".to_string()),
        );

        let spot_venues = parse_list::<VenueId>(
            &std::env::var("SPOT_VENUES")
                .unwrap_or_else(|_| "binance,coinbase,okx,kraken".to_string()),
        );

        let perp_venues = parse_list::<VenueId>(
            &std::env::var("PERP_VENUES").unwrap_or_else(|_| "binance,okx,bybit".to_string()),
        );

        let retention_days = std::env::var("RETENTION_DAYS")
            .unwrap_or_else(|_| "14".to_string())
            .parse()
            .unwrap_or(14);

        let admin_api_key = std::env::var("ADMIN_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let sse_price_cadence_ms = std::env::var("SSE_PRICE_CADENCE_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .unwrap_or(500);

        let sse_telemetry_cadence_ms = std::env::var("SSE_TELEMETRY_CADENCE_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .unwrap_or(5000);

        Ok(Self {
            database_path,
            port,
            assets,
            spot_venues,
            perp_venues,
            retention_days,
            admin_api_key,
            sse_price_cadence_ms,
            sse_telemetry_cadence_ms,
        })
    }
}

fn parse_list<T: FromStr>(raw: &str) -> Vec<T> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Current wall clock in unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Format a unix-second timestamp as RFC 3339 for API responses.
pub fn format_ts(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_round_trips() {
        for venue in VenueId::ALL {
            assert_eq!(venue.as_str().parse::<VenueId>().unwrap(), venue);
        }
        for asset in Asset::ALL {
            assert_eq!(asset.as_str().parse::<Asset>().unwrap(), asset);
        }
        for market in MarketType::ALL {
            assert_eq!(market.as_str().parse::<MarketType>().unwrap(), market);
        }
    }

    #[test]
    fn test_serde_casing_matches_wire_contract() {
        assert_eq!(serde_json::to_string(&Asset::Btc).unwrap(), "\"BTC\"");
        assert_eq!(serde_json::to_string(&VenueId::Okx).unwrap(), "\"okx\"");
        assert_eq!(serde_json::to_string(&MarketType::Perp).unwrap(), "\"perp\"");
        assert_eq!(
            serde_json::to_string(&ExcludeReason::BackfillUnavailable).unwrap(),
            "\"BACKFILL_UNAVAILABLE\""
        );
        assert_eq!(serde_json::to_string(&TakerSide::Sell).unwrap(), "\"SELL\"");
    }

    #[test]
    fn test_exclude_reason_round_trip() {
        for reason in [
            ExcludeReason::Disconnected,
            ExcludeReason::NoData,
            ExcludeReason::Stale,
            ExcludeReason::Outlier,
            ExcludeReason::BackfillUnavailable,
        ] {
            assert_eq!(reason.as_str().parse::<ExcludeReason>().unwrap(), reason);
        }
    }

    #[test]
    fn test_parse_list_skips_unknown_entries() {
        let venues = parse_list::<VenueId>("binance, coinbase,ftx,okx");
        assert_eq!(
            venues,
            vec![VenueId::Binance, VenueId::Coinbase, VenueId::Okx]
        );
    }
}
