//! Kraken trade stream driver (spot only).
//!
//! Kraken mixes two message shapes on one socket: JSON objects for system
//! events (subscriptionStatus, heartbeat, systemStatus) and arrays for data.
//! A trade message looks like:
//!
//! `[337, [["5541.20000","0.15850568","1534614057.321597","s","l",""]],
//!   "trade", "XBT/USD"]`
//!
//! Each inner row is `[price, volume, time, side, orderType, misc]` where
//! `time` is unix seconds with fractional microseconds and `side` is the
//! taker's direction (`"s"` sold, `"b"` bought). Kraken lists bitcoin as XBT.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::models::{Asset, MarketType, TakerSide, Trade, VenueId};

use super::VenueDriver;

pub struct KrakenDriver {
    asset: Asset,
    symbol: String,
    url: String,
}

impl KrakenDriver {
    pub fn new(asset: Asset) -> Option<Self> {
        let symbol = catalog::symbol(VenueId::Kraken, asset, MarketType::Spot)?.to_string();
        let url = catalog::ws_url(VenueId::Kraken, asset, MarketType::Spot)?;
        Some(Self { asset, symbol, url })
    }

    fn parse_system_message(&self, data: &Value) -> Vec<Trade> {
        match data.get("event").and_then(Value::as_str) {
            Some("subscriptionStatus") => {
                match data.get("status").and_then(Value::as_str) {
                    Some("subscribed") => {
                        info!(
                            "[kraken] subscribed to {:?} (channelID {:?})",
                            data.get("pair"),
                            data.get("channelID")
                        );
                    }
                    Some("error") => {
                        warn!(
                            "[kraken] subscription error: {:?}",
                            data.get("errorMessage")
                        );
                    }
                    _ => {}
                }
            }
            Some("heartbeat") | Some("systemStatus") | Some("pong") => {}
            other => debug!("[kraken] ignoring event: {other:?}"),
        }
        Vec::new()
    }

    fn parse_trade_array(&self, data: &[Value], local_timestamp_ms: i64) -> Vec<Trade> {
        if data.len() < 4 {
            debug!("[kraken] short array message: {} elements", data.len());
            return Vec::new();
        }

        let channel_name = data[data.len() - 2].as_str();
        let pair = data[data.len() - 1].as_str();

        if channel_name != Some("trade") {
            debug!("[kraken] ignoring channel: {channel_name:?}");
            return Vec::new();
        }

        if let Some(pair) = pair {
            if !pair.eq_ignore_ascii_case(&self.symbol) {
                warn!("[kraken] pair mismatch: got {pair}, expected {}", self.symbol);
                return Vec::new();
            }
        }

        let Some(rows) = data[1].as_array() else {
            warn!("[kraken] invalid trade array");
            return Vec::new();
        };

        rows.iter()
            .filter_map(|row| self.parse_single_trade(row, local_timestamp_ms))
            .collect()
    }

    fn parse_single_trade(&self, row: &Value, local_timestamp_ms: i64) -> Option<Trade> {
        let fields = row.as_array()?;
        if fields.len() < 4 {
            warn!("[kraken] invalid trade row: {row}");
            return None;
        }

        let price: f64 = fields[0].as_str()?.parse().ok()?;
        let volume: f64 = fields[1].as_str()?.parse().ok()?;
        let time_secs: f64 = fields[2].as_str()?.parse().ok()?;
        let side = fields[3].as_str()?;

        if price <= 0.0 || volume <= 0.0 {
            warn!("[kraken] invalid price/volume: {price}/{volume}");
            return None;
        }

        let taker_side = match side {
            "s" => TakerSide::Sell,
            "b" => TakerSide::Buy,
            other => {
                warn!("[kraken] unknown side: {other}");
                return None;
            }
        };

        Some(Trade {
            timestamp: (time_secs * 1000.0) as i64,
            local_timestamp: local_timestamp_ms,
            price,
            quantity: volume,
            taker_side,
            venue: VenueId::Kraken,
            asset: self.asset,
            market_type: MarketType::Spot,
        })
    }
}

impl VenueDriver for KrakenDriver {
    fn venue(&self) -> VenueId {
        VenueId::Kraken
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
        catalog::subscription_message(VenueId::Kraken, self.asset, MarketType::Spot)
    }

    fn parse_message(&self, text: &str, local_timestamp_ms: i64) -> Vec<Trade> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("[kraken] invalid JSON: {e}");
                return Vec::new();
            }
        };

        match value {
            Value::Object(_) => self.parse_system_message(&value),
            Value::Array(ref items) => self.parse_trade_array(items, local_timestamp_ms),
            _ => {
                warn!("[kraken] unexpected message shape");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> KrakenDriver {
        KrakenDriver::new(Asset::Btc).unwrap()
    }

    const TRADES: &str = r#"[
        337,
        [
            ["5541.20000", "0.15850568", "1534614057.321597", "s", "l", ""],
            ["5541.30000", "0.08000000", "1534614057.521597", "b", "m", ""]
        ],
        "trade",
        "XBT/USD"
    ]"#;

    #[test]
    fn test_parse_trade_batch() {
        let trades = driver().parse_message(TRADES, 7);
        assert_eq!(trades.len(), 2);

        assert_eq!(trades[0].price, 5_541.2);
        assert_eq!(trades[0].quantity, 0.15850568);
        assert_eq!(trades[0].timestamp, 1_534_614_057_321);
        assert_eq!(trades[0].taker_side, TakerSide::Sell);
        assert_eq!(trades[0].local_timestamp, 7);

        assert_eq!(trades[1].taker_side, TakerSide::Buy);
        assert_eq!(trades[1].timestamp, 1_534_614_057_521);
    }

    #[test]
    fn test_system_messages_ignored() {
        let d = driver();
        assert!(d.parse_message(r#"{"event":"heartbeat"}"#, 0).is_empty());
        assert!(d
            .parse_message(
                r#"{"event":"systemStatus","status":"online","version":"1.0.0"}"#,
                0
            )
            .is_empty());
        assert!(d
            .parse_message(
                r#"{"event":"subscriptionStatus","status":"subscribed","pair":"XBT/USD","channelID":337}"#,
                0
            )
            .is_empty());
    }

    #[test]
    fn test_pair_mismatch_dropped() {
        let frame = TRADES.replace("XBT/USD", "ETH/USD");
        assert!(driver().parse_message(&frame, 0).is_empty());
    }

    #[test]
    fn test_other_channels_ignored() {
        let frame = TRADES.replace("\"trade\"", "\"spread\"");
        assert!(driver().parse_message(&frame, 0).is_empty());
    }

    #[test]
    fn test_bad_rows_skipped_others_kept() {
        let frame = r#"[
            337,
            [
                ["0", "1.0", "1534614057.0", "s", "l", ""],
                ["5541.2", "1.0", "1534614057.0", "b", "l", ""]
            ],
            "trade",
            "XBT/USD"
        ]"#;
        let trades = driver().parse_message(frame, 0);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].taker_side, TakerSide::Buy);
    }

    #[test]
    fn test_subscribe_message_uses_xbt_pair() {
        let sub = driver().subscribe_message().unwrap();
        assert!(sub.contains("XBT/USD"));
        assert!(sub.contains("\"name\":\"trade\""));
    }
}
