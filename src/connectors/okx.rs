//! OKX trade stream driver (spot and perpetual, same endpoint).
//!
//! Subscription: `{"op":"subscribe","args":[{"channel":"trades","instId":"BTC-USDT"}]}`
//! Trade frame:
//! `{"arg":{"channel":"trades","instId":"BTC-USDT"},
//!   "data":[{"instId":"BTC-USDT","tradeId":"130639474","px":"42219.9",
//!            "sz":"0.12060306","side":"buy","ts":"1629386781174"}]}`
//! `side` is the taker's direction.

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::models::{Asset, MarketType, TakerSide, Trade, VenueId};

use super::VenueDriver;

pub struct OkxDriver {
    asset: Asset,
    market_type: MarketType,
    symbol: String,
    url: String,
}

impl OkxDriver {
    pub fn new(asset: Asset, market_type: MarketType) -> Option<Self> {
        let symbol = catalog::symbol(VenueId::Okx, asset, market_type)?.to_string();
        let url = catalog::ws_url(VenueId::Okx, asset, market_type)?;
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
    arg: FrameArg,
    #[serde(default)]
    data: Vec<TradeRow>,
}

#[derive(Debug, Deserialize)]
struct FrameArg {
    #[serde(default)]
    channel: String,
    #[serde(default, rename = "instId")]
    inst_id: String,
}

#[derive(Debug, Deserialize)]
struct TradeRow {
    #[serde(default)]
    px: String,
    #[serde(default)]
    sz: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    ts: String,
}

impl VenueDriver for OkxDriver {
    fn venue(&self) -> VenueId {
        VenueId::Okx
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
        catalog::subscription_message(VenueId::Okx, self.asset, self.market_type)
    }

    fn parse_message(&self, text: &str, local_timestamp_ms: i64) -> Vec<Trade> {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("[okx] invalid JSON: {e}");
                return Vec::new();
            }
        };

        // Event frames: subscribe confirmations and errors.
        if let Some(event) = value.get("event").and_then(|e| e.as_str()) {
            match event {
                "subscribe" => info!("[okx] subscribed: {:?}", value.get("arg")),
                "error" => warn!("[okx] error frame: {text}"),
                other => debug!("[okx] ignoring event: {other}"),
            }
            return Vec::new();
        }

        let frame: TradeFrame = match serde_json::from_value(value) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        if frame.arg.channel != "trades" {
            debug!("[okx] ignoring channel: {}", frame.arg.channel);
            return Vec::new();
        }
        if !frame.arg.inst_id.eq_ignore_ascii_case(&self.symbol) {
            warn!(
                "[okx] instId mismatch: got {}, expected {}",
                frame.arg.inst_id, self.symbol
            );
            return Vec::new();
        }

        frame
            .data
            .iter()
            .filter_map(|row| {
                let price: f64 = row.px.parse().ok()?;
                let quantity: f64 = row.sz.parse().ok()?;
                let timestamp: i64 = row.ts.parse().ok()?;
                if price <= 0.0 || quantity <= 0.0 {
                    warn!("[okx] invalid px/sz: {}/{}", row.px, row.sz);
                    return None;
                }
                let taker_side = match row.side.as_str() {
                    "sell" => TakerSide::Sell,
                    "buy" => TakerSide::Buy,
                    other => {
                        warn!("[okx] unknown side: {other}");
                        return None;
                    }
                };
                Some(Trade {
                    timestamp,
                    local_timestamp: local_timestamp_ms,
                    price,
                    quantity,
                    taker_side,
                    venue: VenueId::Okx,
                    asset: self.asset,
                    market_type: self.market_type,
                })
            })
            .collect()
    }
}
