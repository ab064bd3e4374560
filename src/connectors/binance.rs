//! Binance trade stream driver (spot and perpetual).
//!
//! Subscribes to the `aggTrade` stream. The stream name is embedded in the
//! connection URL, so no subscribe frame is needed.
//!
//! Frame format:
//! `{"e":"aggTrade","E":1672515782136,"s":"BTCUSDT","a":164227032,
//!   "p":"16825.43","q":"0.002","f":322222344,"l":322222344,
//!   "T":1672515782136,"m":true,"M":true}`
//! `m` is "is buyer maker": true means the aggressor sold.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::catalog;
use crate::models::{Asset, MarketType, TakerSide, Trade, VenueId};

use super::VenueDriver;

pub struct BinanceDriver {
    asset: Asset,
    market_type: MarketType,
    symbol: String,
    url: String,
}

impl BinanceDriver {
    pub fn new(asset: Asset, market_type: MarketType) -> Option<Self> {
        let symbol = catalog::symbol(VenueId::Binance, asset, market_type)?.to_string();
        let url = catalog::ws_url(VenueId::Binance, asset, market_type)?;
        Some(Self {
            asset,
            market_type,
            symbol,
            url,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AggTradeFrame {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m", default)]
    is_buyer_maker: bool,
}

impl VenueDriver for BinanceDriver {
    fn venue(&self) -> VenueId {
        VenueId::Binance
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
        catalog::subscription_message(VenueId::Binance, self.asset, self.market_type)
    }

    fn parse_message(&self, text: &str, local_timestamp_ms: i64) -> Vec<Trade> {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("[binance] invalid JSON: {e}");
                return Vec::new();
            }
        };

        // Subscription ack: {"result":null,"id":1}
        if value.get("id").is_some() && value.get("result").is_some() {
            debug!("[binance] subscription confirmed");
            return Vec::new();
        }
        if let Some(err) = value.get("error") {
            warn!("[binance] error frame: {err}");
            return Vec::new();
        }

        let frame: AggTradeFrame = match serde_json::from_value(value) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        if frame.event != "aggTrade" {
            debug!("[binance] ignoring event type: {}", frame.event);
            return Vec::new();
        }

        if !frame.symbol.eq_ignore_ascii_case(&self.symbol) {
            warn!(
                "[binance] symbol mismatch: got {}, expected {}",
                frame.symbol, self.symbol
            );
            return Vec::new();
        }

        let (price, quantity) = match (frame.price.parse::<f64>(), frame.quantity.parse::<f64>()) {
            (Ok(p), Ok(q)) => (p, q),
            _ => {
                warn!("[binance] unparseable price/quantity");
                return Vec::new();
            }
        };
        if price <= 0.0 || quantity <= 0.0 {
            warn!("[binance] invalid price/quantity: {price}/{quantity}");
            return Vec::new();
        }

        let taker_side = if frame.is_buyer_maker {
            TakerSide::Sell
        } else {
            TakerSide::Buy
        };

        vec![Trade {
            timestamp: frame.trade_time,
            local_timestamp: local_timestamp_ms,
            price,
            quantity,
            taker_side,
            venue: VenueId::Binance,
            asset: self.asset,
            market_type: self.market_type,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> BinanceDriver {
        BinanceDriver::new(Asset::Btc, MarketType::Spot).unwrap()
    }

    const AGG_TRADE: &str = r#"{
        "e": "aggTrade",
        "E": 1672515782136,
        "s": "BTCUSDT",
        "a": 164227032,
        "p": "16825.43",
        "q": "0.002",
        "f": 322222344,
        "l": 322222344,
        "T": 1672515782136,
        "m": true,
        "M": true
    }"#;

    #[test]
    fn test_parse_agg_trade() {
        let trades = driver().parse_message(AGG_TRADE, 1_672_515_782_200);
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.price, 16_825.43);
        assert_eq!(t.quantity, 0.002);
        assert_eq!(t.timestamp, 1_672_515_782_136);
        assert_eq!(t.local_timestamp, 1_672_515_782_200);
        // Buyer was maker, so the taker sold.
        assert_eq!(t.taker_side, TakerSide::Sell);
        assert_eq!(t.venue, VenueId::Binance);
    }

    #[test]
    fn test_taker_buy_when_buyer_not_maker() {
        let frame = AGG_TRADE.replace("\"m\": true", "\"m\": false");
        let trades = driver().parse_message(&frame, 0);
        assert_eq!(trades[0].taker_side, TakerSide::Buy);
    }

    #[test]
    fn test_subscription_ack_ignored() {
        assert!(driver().parse_message(r#"{"result":null,"id":1}"#, 0).is_empty());
    }

    #[test]
    fn test_symbol_mismatch_dropped() {
        let frame = AGG_TRADE.replace("BTCUSDT", "ETHUSDT");
        assert!(driver().parse_message(&frame, 0).is_empty());
    }

    #[test]
    fn test_nonpositive_price_dropped() {
        let frame = AGG_TRADE.replace("16825.43", "0");
        assert!(driver().parse_message(&frame, 0).is_empty());
        let frame = AGG_TRADE.replace("0.002", "-1");
        assert!(driver().parse_message(&frame, 0).is_empty());
    }

    #[test]
    fn test_other_event_types_ignored() {
        let frame = AGG_TRADE.replace("aggTrade", "kline");
        assert!(driver().parse_message(&frame, 0).is_empty());
        assert!(driver().parse_message("garbage", 0).is_empty());
    }

    #[test]
    fn test_perp_url() {
        let d = BinanceDriver::new(Asset::Eth, MarketType::Perp).unwrap();
        assert_eq!(d.ws_url(), "wss://fstream.binance.com/ws/ethusdt@aggTrade");
        assert!(d.subscribe_message().is_none());
    }
}
