//! Bybit trade stream driver (linear perpetual only).
//!
//! Subscription: `{"op":"subscribe","args":["publicTrade.BTCUSDT"]}`
//! Trade frame:
//! `{"topic":"publicTrade.BTCUSDT","type":"snapshot","ts":1672304486868,
//!   "data":[{"T":1672304486865,"s":"BTCUSDT","S":"Buy","v":"0.001",
//!            "p":"16578.50","L":"PlusTick","i":"20f43950-...","BT":false}]}`
//! `S` is the taker's direction.

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::models::{Asset, MarketType, TakerSide, Trade, VenueId};

use super::VenueDriver;

pub struct BybitDriver {
    asset: Asset,
    market_type: MarketType,
    symbol: String,
    url: String,
}

impl BybitDriver {
    pub fn new(asset: Asset, market_type: MarketType) -> Option<Self> {
        let symbol = catalog::symbol(VenueId::Bybit, asset, market_type)?.to_string();
        let url = catalog::ws_url(VenueId::Bybit, asset, market_type)?;
        Some(Self {
            asset,
            market_type,
            symbol,
            url,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TradeFrame {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    data: Vec<TradeRow>,
}

#[derive(Debug, Deserialize)]
struct TradeRow {
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(default, rename = "s")]
    symbol: String,
    #[serde(default, rename = "S")]
    side: String,
    #[serde(default, rename = "v")]
    volume: String,
    #[serde(default, rename = "p")]
    price: String,
}

impl VenueDriver for BybitDriver {
    fn venue(&self) -> VenueId {
        VenueId::Bybit
    }

    fn asset(&self) -> Asset {
        self.asset
    }

    fn market_type(&self) -> MarketType {
        self.market_type
    }

    fn ws_url(&self) -> String {
        self.url.clone()
    }

    fn subscribe_message(&self) -> Option<String> {
        catalog::subscription_message(VenueId::Bybit, self.asset, self.market_type)
    }

    fn parse_message(&self, text: &str, local_timestamp_ms: i64) -> Vec<Trade> {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("[bybit] invalid JSON: {e}");
                return Vec::new();
            }
        };

        // Operation responses: {"success":true,"op":"subscribe",...} and pongs.
        if let Some(op) = value.get("op").and_then(|o| o.as_str()) {
            match op {
                "subscribe" => {
                    if value.get("success").and_then(|s| s.as_bool()) == Some(true) {
                        info!("[bybit] subscription confirmed");
                    } else {
                        warn!("[bybit] subscription failed: {text}");
                    }
                }
                "ping" | "pong" => {}
                other => debug!("[bybit] ignoring op: {other}"),
            }
            return Vec::new();
        }

        let frame: TradeFrame = match serde_json::from_value(value) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let expected_topic = format!("publicTrade.{}", self.symbol);
        if frame.topic != expected_topic {
            debug!("[bybit] ignoring topic: {}", frame.topic);
            return Vec::new();
        }

        frame
            .data
            .iter()
            .filter_map(|row| {
                if !row.symbol.eq_ignore_ascii_case(&self.symbol) {
                    warn!(
                        "[bybit] symbol mismatch: got {}, expected {}",
                        row.symbol, self.symbol
                    );
                    return None;
                }
                let price: f64 = row.price.parse().ok()?;
                let quantity: f64 = row.volume.parse().ok()?;
                if price <= 0.0 || quantity <= 0.0 {
                    warn!("[bybit] invalid price/volume: {}/{}", row.price, row.volume);
                    return None;
                }
                let taker_side = match row.side.as_str() {
                    "Sell" => TakerSide::Sell,
                    "Buy" => TakerSide::Buy,
                    other => {
                        warn!("[bybit] unknown side: {other}");
                        return None;
                    }
                };
                Some(Trade {
                    timestamp: row.trade_time,
                    local_timestamp: local_timestamp_ms,
                    price,
                    quantity,
                    taker_side,
                    venue: VenueId::Bybit,
                    asset: self.asset,
                    market_type: self.market_type,
                })
            })
            .collect()
    }
}
