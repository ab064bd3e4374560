//! Coinbase trade stream driver (spot only).
//!
//! Subscribes to the `matches` channel. Trade frames:
//! `{"type":"match","trade_id":10,"sequence":50,"maker_order_id":"...",
//!   "taker_order_id":"...","time":"2014-11-07T08:19:27.028459Z",
//!   "product_id":"BTC-USD","size":"5.23512","price":"400.23","side":"sell"}`
//!
//! The `side` field maps directly onto the taker convention:
//! `side="sell"` ⇒ aggressor sold, `side="buy"` ⇒ aggressor bought.

use chrono::DateTime;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::catalog;
use crate::models::{Asset, MarketType, TakerSide, Trade, VenueId};

use super::VenueDriver;

pub struct CoinbaseDriver {
    asset: Asset,
    symbol: String,
    url: String,
}

impl CoinbaseDriver {
    pub fn new(asset: Asset) -> Option<Self> {
        let symbol = catalog::symbol(VenueId::Coinbase, asset, MarketType::Spot)?.to_string();
        let url = catalog::ws_url(VenueId::Coinbase, asset, MarketType::Spot)?;
        Some(Self { asset, symbol, url })
    }
}

#[derive(Debug, Deserialize)]
struct MatchFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    product_id: String,
    #[serde(default)]
    time: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    side: String,
}

impl VenueDriver for CoinbaseDriver {
    fn venue(&self) -> VenueId {
        VenueId::Coinbase
    }

    fn asset(&self) -> Asset {
        self.asset
    }

    fn market_type(&self) -> MarketType {
        MarketType::Spot
    }

    fn ws_url(&self) -> String {
        self.url.clone()
    }

    fn subscribe_message(&self) -> Option<String> {
        catalog::subscription_message(VenueId::Coinbase, self.asset, MarketType::Spot)
    }

    fn parse_message(&self, text: &str, local_timestamp_ms: i64) -> Vec<Trade> {
        let frame: MatchFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                warn!("[coinbase] invalid JSON: {e}");
                return Vec::new();
            }
        };

        match frame.kind.as_str() {
            // `last_match` arrives once on subscribe with the latest trade;
            // treat it like a regular match.
            "match" | "last_match" => {}
            "subscriptions" => {
                debug!("[coinbase] subscription confirmed");
                return Vec::new();
            }
            "error" => {
                warn!("[coinbase] error frame: {text}");
                return Vec::new();
            }
            other => {
                debug!("[coinbase] ignoring frame type: {other}");
                return Vec::new();
            }
        }

        if !frame.product_id.eq_ignore_ascii_case(&self.symbol) {
            warn!(
                "[coinbase] product mismatch: got {}, expected {}",
                frame.product_id, self.symbol
            );
            return Vec::new();
        }

        let timestamp = match DateTime::parse_from_rfc3339(&frame.time) {
            Ok(dt) => dt.timestamp_millis(),
            Err(e) => {
                warn!("[coinbase] unparseable time {:?}: {e}", frame.time);
                return Vec::new();
            }
        };

        let (price, quantity) = match (frame.price.parse::<f64>(), frame.size.parse::<f64>()) {
            (Ok(p), Ok(q)) => (p, q),
            _ => {
                warn!("[coinbase] unparseable price/size");
                return Vec::new();
            }
        };
        if price <= 0.0 || quantity <= 0.0 {
            warn!("[coinbase] invalid price/size: {price}/{quantity}");
            return Vec::new();
        }

        let taker_side = match frame.side.as_str() {
            "sell" => TakerSide::Sell,
            "buy" => TakerSide::Buy,
            other => {
                warn!("[coinbase] unknown side: {other}");
                return Vec::new();
            }
        };

        vec![Trade {
            timestamp,
            local_timestamp: local_timestamp_ms,
            price,
            quantity,
            taker_side,
            venue: VenueId::Coinbase,
            asset: self.asset,
            market_type: MarketType::Spot,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> CoinbaseDriver {
        CoinbaseDriver::new(Asset::Btc).unwrap()
    }

    const MATCH: &str = r#"{
        "type": "match",
        "trade_id": 865466224,
        "maker_order_id": "a04ff536-6624-4b78-b7b1-ba9aba2f2bb1",
        "taker_order_id": "ca5a3cf5-4e33-4f55-a251-dcfb4a3bdba2",
        "side": "sell",
        "size": "0.00052786",
        "price": "97114.49",
        "product_id": "BTC-USD",
        "sequence": 99312855403,
        "time": "2025-01-15T10:30:00.123456Z"
    }"#;

    #[test]
    fn test_parse_match() {
        let trades = driver().parse_message(MATCH, 42);
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.price, 97_114.49);
        assert_eq!(t.quantity, 0.00052786);
        assert_eq!(t.taker_side, TakerSide::Sell);
        assert_eq!(t.local_timestamp, 42);
        // 2025-01-15T10:30:00.123Z
        assert_eq!(t.timestamp, 1_736_937_000_123);
    }

    #[test]
    fn test_buy_side() {
        let frame = MATCH.replace("\"side\": \"sell\"", "\"side\": \"buy\"");
        assert_eq!(driver().parse_message(&frame, 0)[0].taker_side, TakerSide::Buy);
    }

    #[test]
    fn test_last_match_accepted() {
        let frame = MATCH.replace("\"type\": \"match\"", "\"type\": \"last_match\"");
        assert_eq!(driver().parse_message(&frame, 0).len(), 1);
    }

    #[test]
    fn test_admin_frames_ignored() {
        assert!(driver()
            .parse_message(r#"{"type":"subscriptions","channels":[]}"#, 0)
            .is_empty());
        assert!(driver()
            .parse_message(r#"{"type":"heartbeat","sequence":1}"#, 0)
            .is_empty());
    }

    #[test]
    fn test_product_mismatch_dropped() {
        let frame = MATCH.replace("BTC-USD", "ETH-USD");
        assert!(driver().parse_message(&frame, 0).is_empty());
    }

    #[test]
    fn test_bad_time_dropped() {
        let frame = MATCH.replace("2025-01-15T10:30:00.123456Z", "not-a-time");
        assert!(driver().parse_message(&frame, 0).is_empty());
    }

    #[test]
    fn test_subscribe_message_lists_matches_channel() {
        let sub = driver().subscribe_message().unwrap();
        assert!(sub.contains("\"matches\""));
        assert!(sub.contains("BTC-USD"));
    }
}
