//! Per-venue REST trade fetchers for gap repair.
//!
//! Each fetcher handles its venue's pagination scheme, spaces requests to
//! stay under rate limits, raises venue API errors as typed errors with a
//! `[venue/backfill]` prefix, and filters the returned trades to the exact
//! millisecond window. Malformed rows are dropped with a warning;
//! non-positive prices and quantities are dropped silently.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::catalog;
use crate::models::{Asset, MarketType, TakerSide, Trade, VenueId};

use super::BackfillError;

const BINANCE_SPOT_TRADES: &str = "https://api.binance.com/api/v3/aggTrades";
const BINANCE_PERP_TRADES: &str = "https://fapi.binance.com/fapi/v1/aggTrades";
const KRAKEN_TRADES: &str = "https://api.kraken.com/0/public/Trades";
const OKX_TRADES: &str = "https://www.okx.com/api/v5/market/history-trades";
const BYBIT_TRADES: &str = "https://api.bybit.com/v5/market/recent-trade";

// Inter-request delays, conservative to avoid 429s. Kraken is the most
// restrictive of the set.
const BINANCE_DELAY: Duration = Duration::from_millis(100);
const KRAKEN_DELAY: Duration = Duration::from_millis(500);
const OKX_DELAY: Duration = Duration::from_millis(200);
const BYBIT_DELAY: Duration = Duration::from_millis(200);

const MAX_PAGES: usize = 10;
const OKX_MAX_PAGES: usize = 50;

/// Source of historical trades for one venue-minute.
#[async_trait]
pub trait TradeFetcher: Send + Sync {
    async fn fetch_minute(
        &self,
        venue: VenueId,
        asset: Asset,
        market: MarketType,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Trade>, BackfillError>;
}

/// Production fetcher over the venues' public REST APIs.
pub struct RestTradeFetcher {
    client: Client,
}

impl RestTradeFetcher {
    pub fn new() -> Result<Self, BackfillError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackfillError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TradeFetcher for RestTradeFetcher {
    async fn fetch_minute(
        &self,
        venue: VenueId,
        asset: Asset,
        market: MarketType,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Trade>, BackfillError> {
        match venue {
            VenueId::Binance => fetch_binance(&self.client, asset, market, start_ms, end_ms).await,
            VenueId::Kraken => fetch_kraken(&self.client, asset, market, start_ms, end_ms).await,
            VenueId::Okx => fetch_okx(&self.client, asset, market, start_ms, end_ms).await,
            VenueId::Bybit => fetch_bybit(&self.client, asset, market, start_ms, end_ms).await,
            // Coinbase has no time-range trade API and is never a backfill
            // venue; reaching this arm is a caller bug.
            VenueId::Coinbase => Err(BackfillError::VenueApi {
                venue: VenueId::Coinbase,
                message: "coinbase has no historical trades endpoint".to_string(),
            }),
        }
    }
}

fn http_error(venue: VenueId, source: reqwest::Error) -> BackfillError {
    error!("[{venue}/backfill] http error: {source}");
    BackfillError::Http { venue, source }
}

fn api_error(venue: VenueId, message: String) -> BackfillError {
    error!("[{venue}/backfill] api error: {message}");
    BackfillError::VenueApi { venue, message }
}

async fn get_json(
    client: &Client,
    venue: VenueId,
    url: &str,
    query: &[(&str, String)],
) -> Result<Value, BackfillError> {
    let response = client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|e| http_error(venue, e))?;
    let response = response
        .error_for_status()
        .map_err(|e| http_error(venue, e))?;
    response.json().await.map_err(|e| http_error(venue, e))
}

// ---------------------------------------------------------------------------
// Binance: /aggTrades with fromId pagination
// ---------------------------------------------------------------------------

/// Fetch Binance aggregated trades for a window. Liquid minutes can exceed
/// the per-request limit of 1000 rows, so pagination walks `fromId` from the
/// last aggregate trade id until a short page or the window end.
async fn fetch_binance(
    client: &Client,
    asset: Asset,
    market: MarketType,
    start_ms: i64,
    end_ms: i64,
) -> Result<Vec<Trade>, BackfillError> {
    let symbol = format!("{}USDT", asset.as_str());
    let url = match market {
        MarketType::Spot => BINANCE_SPOT_TRADES,
        MarketType::Perp => BINANCE_PERP_TRADES,
    };

    let mut all_trades = Vec::new();
    let mut from_id: Option<i64> = None;

    for page in 0..MAX_PAGES {
        let mut query: Vec<(&str, String)> = vec![
            ("symbol", symbol.clone()),
            ("limit", "1000".to_string()),
        ];
        match from_id {
            // The window params only apply to the first request; afterwards
            // the cursor drives the scan.
            Some(id) => query.push(("fromId", (id + 1).to_string())),
            None => {
                query.push(("startTime", start_ms.to_string()));
                query.push(("endTime", end_ms.to_string()));
            }
        }

        tokio::time::sleep(BINANCE_DELAY).await;
        let data = get_json(client, VenueId::Binance, url, &query).await?;

        let rows = data
            .as_array()
            .ok_or_else(|| api_error(VenueId::Binance, format!("unexpected payload: {data}")))?;
        if rows.is_empty() {
            break;
        }

        let (trades, last_id) = parse_binance_page(rows, asset, market, start_ms, end_ms);
        all_trades.extend(trades);
        from_id = last_id;

        if rows.len() < 1000 {
            break;
        }
        // Cursor walked past the window: later pages are all out of range.
        if let Some(last_ts) = rows.last().and_then(|r| r.get("T")).and_then(Value::as_i64) {
            if last_ts > end_ms {
                break;
            }
        }
        debug!(
            "[binance/backfill] page {}: {} trades so far",
            page + 1,
            all_trades.len()
        );
    }

    Ok(all_trades)
}

/// Parse one page of Binance aggTrades rows. Returns the in-window trades
/// and the last aggregate trade id for cursor pagination.
pub fn parse_binance_page(
    rows: &[Value],
    asset: Asset,
    market: MarketType,
    start_ms: i64,
    end_ms: i64,
) -> (Vec<Trade>, Option<i64>) {
    let mut trades = Vec::new();
    let mut last_id = None;

    for row in rows {
        if let Some(id) = row.get("a").and_then(Value::as_i64) {
            last_id = Some(id);
        }

        let (Some(price), Some(quantity), Some(timestamp)) = (
            row.get("p").and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok()),
            row.get("q").and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok()),
            row.get("T").and_then(Value::as_i64),
        ) else {
            warn!("[binance/backfill] malformed row: {row}");
            continue;
        };

        if timestamp < start_ms || timestamp > end_ms {
            continue;
        }
        if price <= 0.0 || quantity <= 0.0 {
            continue;
        }

        let is_buyer_maker = row.get("m").and_then(Value::as_bool).unwrap_or(false);
        trades.push(Trade {
            timestamp,
            local_timestamp: timestamp,
            price,
            quantity,
            taker_side: if is_buyer_maker { TakerSide::Sell } else { TakerSide::Buy },
            venue: VenueId::Binance,
            asset,
            market_type: market,
        });
    }

    (trades, last_id)
}

// ---------------------------------------------------------------------------
// Kraken: /0/public/Trades with nanosecond `since` cursor
// ---------------------------------------------------------------------------

/// Fetch Kraken trades for a window. Spot only; the cursor is the `last`
/// nanosecond timestamp returned with each page.
async fn fetch_kraken(
    client: &Client,
    asset: Asset,
    market: MarketType,
    start_ms: i64,
    end_ms: i64,
) -> Result<Vec<Trade>, BackfillError> {
    if market != MarketType::Spot {
        debug!("[kraken/backfill] perps not supported, skipping {asset}");
        return Ok(Vec::new());
    }

    let pair = catalog::kraken_rest_pair(asset);
    let mut all_trades = Vec::new();
    let mut since_ns = start_ms * 1_000_000;
    let end_ns = end_ms * 1_000_000;

    for _page in 0..MAX_PAGES {
        let query: Vec<(&str, String)> = vec![
            ("pair", pair.to_string()),
            ("since", since_ns.to_string()),
        ];

        tokio::time::sleep(KRAKEN_DELAY).await;
        let data = get_json(client, VenueId::Kraken, KRAKEN_TRADES, &query).await?;

        if let Some(errors) = data.get("error").and_then(Value::as_array) {
            if !errors.is_empty() {
                return Err(api_error(VenueId::Kraken, format!("{errors:?}")));
            }
        }

        let Some(result) = data.get("result").and_then(Value::as_object) else {
            break;
        };

        let (trades, row_count) = parse_kraken_result(result, asset, start_ms, end_ms);
        all_trades.extend(trades);

        let last_ns = result
            .get("last")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i64>().ok());
        match last_ns {
            Some(last) if last <= end_ns && row_count >= 1000 => since_ns = last,
            _ => break,
        }
    }

    Ok(all_trades)
}

/// Parse a Kraken Trades result object: the trades live under the pair key,
/// `last` carries the pagination cursor. Returns in-window trades and the raw
/// row count of the page.
pub fn parse_kraken_result(
    result: &serde_json::Map<String, Value>,
    asset: Asset,
    start_ms: i64,
    end_ms: i64,
) -> (Vec<Trade>, usize) {
    let rows = result
        .iter()
        .find(|(key, _)| key.as_str() != "last")
        .and_then(|(_, v)| v.as_array());
    let Some(rows) = rows else {
        return (Vec::new(), 0);
    };

    let mut trades = Vec::new();
    for row in rows {
        let Some(fields) = row.as_array() else {
            warn!("[kraken/backfill] malformed row: {row}");
            continue;
        };
        let (Some(price), Some(volume), Some(time_secs), Some(side)) = (
            fields.first().and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok()),
            fields.get(1).and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok()),
            fields.get(2).and_then(Value::as_f64),
            fields.get(3).and_then(Value::as_str),
        ) else {
            warn!("[kraken/backfill] malformed row: {row}");
            continue;
        };

        let timestamp = (time_secs * 1000.0) as i64;
        if timestamp < start_ms || timestamp > end_ms {
            continue;
        }
        if price <= 0.0 || volume <= 0.0 {
            continue;
        }

        let taker_side = match side {
            "s" => TakerSide::Sell,
            "b" => TakerSide::Buy,
            other => {
                warn!("[kraken/backfill] unknown side: {other}");
                continue;
            }
        };

        trades.push(Trade {
            timestamp,
            local_timestamp: timestamp,
            price,
            quantity: volume,
            taker_side,
            venue: VenueId::Kraken,
            asset,
            market_type: MarketType::Spot,
        });
    }

    (trades, rows.len())
}

// ---------------------------------------------------------------------------
// OKX: /market/history-trades, newest-first, `after` tradeId cursor
// ---------------------------------------------------------------------------

async fn fetch_okx(
    client: &Client,
    asset: Asset,
    market: MarketType,
    start_ms: i64,
    end_ms: i64,
) -> Result<Vec<Trade>, BackfillError> {
    let Some(inst_id) = catalog::symbol(VenueId::Okx, asset, market) else {
        return Ok(Vec::new());
    };

    let mut all_trades = Vec::new();
    let mut after_id: Option<String> = None;

    for _page in 0..OKX_MAX_PAGES {
        let mut query: Vec<(&str, String)> = vec![
            ("instId", inst_id.to_string()),
            ("limit", "100".to_string()),
        ];
        if let Some(ref id) = after_id {
            query.push(("after", id.clone()));
        }

        tokio::time::sleep(OKX_DELAY).await;
        let data = get_json(client, VenueId::Okx, OKX_TRADES, &query).await?;

        if data.get("code").and_then(Value::as_str) != Some("0") {
            let msg = data
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(api_error(VenueId::Okx, msg.to_string()));
        }

        let Some(rows) = data.get("data").and_then(Value::as_array) else {
            break;
        };
        if rows.is_empty() {
            break;
        }

        let (trades, oldest_ts, last_id) = parse_okx_page(rows, asset, market, start_ms, end_ms);
        all_trades.extend(trades);
        after_id = last_id;

        if rows.len() < 100 {
            break;
        }
        // Pages run newest-first; once the oldest row predates the window the
        // scan is complete.
        if oldest_ts.map(|ts| ts < start_ms).unwrap_or(true) {
            break;
        }
    }

    Ok(all_trades)
}

/// Parse one page of OKX history-trades rows. Returns the in-window trades,
/// the oldest timestamp on the page, and the last tradeId for the cursor.
pub fn parse_okx_page(
    rows: &[Value],
    asset: Asset,
    market: MarketType,
    start_ms: i64,
    end_ms: i64,
) -> (Vec<Trade>, Option<i64>, Option<String>) {
    let mut trades = Vec::new();
    let mut oldest_ts: Option<i64> = None;
    let mut last_id: Option<String> = None;

    for row in rows {
        if let Some(id) = row.get("tradeId").and_then(Value::as_str) {
            last_id = Some(id.to_string());
        }

        let Some(timestamp) = row
            .get("ts")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
        else {
            warn!("[okx/backfill] malformed row: {row}");
            continue;
        };
        oldest_ts = Some(oldest_ts.map_or(timestamp, |t: i64| t.min(timestamp)));

        if timestamp < start_ms || timestamp > end_ms {
            continue;
        }

        let (Some(price), Some(quantity), Some(side)) = (
            row.get("px").and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok()),
            row.get("sz").and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok()),
            row.get("side").and_then(Value::as_str),
        ) else {
            warn!("[okx/backfill] malformed row: {row}");
            continue;
        };
        if price <= 0.0 || quantity <= 0.0 {
            continue;
        }

        let taker_side = match side {
            "sell" => TakerSide::Sell,
            "buy" => TakerSide::Buy,
            other => {
                warn!("[okx/backfill] unknown side: {other}");
                continue;
            }
        };

        trades.push(Trade {
            timestamp,
            local_timestamp: timestamp,
            price,
            quantity,
            taker_side,
            venue: VenueId::Okx,
            asset,
            market_type: market,
        });
    }

    (trades, oldest_ts, last_id)
}

// ---------------------------------------------------------------------------
// Bybit: /market/recent-trade, recent-only, single page
// ---------------------------------------------------------------------------

/// Fetch Bybit recent trades. The public endpoint has no time-range params
/// and no cursor: it returns up to 1000 of the newest trades, filtered
/// client-side. Windows older than a few minutes will typically come back
/// empty; that is a known venue limitation, not a failure.
async fn fetch_bybit(
    client: &Client,
    asset: Asset,
    market: MarketType,
    start_ms: i64,
    end_ms: i64,
) -> Result<Vec<Trade>, BackfillError> {
    if market != MarketType::Perp {
        warn!("[bybit/backfill] only perp supported, got {market}");
        return Ok(Vec::new());
    }
    let Some(symbol) = catalog::symbol(VenueId::Bybit, asset, market) else {
        return Ok(Vec::new());
    };

    let query: Vec<(&str, String)> = vec![
        ("category", "linear".to_string()),
        ("symbol", symbol.to_string()),
        ("limit", "1000".to_string()),
    ];

    tokio::time::sleep(BYBIT_DELAY).await;
    let data = get_json(client, VenueId::Bybit, BYBIT_TRADES, &query).await?;

    if data.get("retCode").and_then(Value::as_i64) != Some(0) {
        let msg = data
            .get("retMsg")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(api_error(VenueId::Bybit, msg.to_string()));
    }

    let rows = data
        .get("result")
        .and_then(|r| r.get("list"))
        .and_then(Value::as_array);
    let Some(rows) = rows else {
        return Ok(Vec::new());
    };

    Ok(parse_bybit_page(rows, asset, start_ms, end_ms))
}

/// Parse one page of Bybit recent-trade rows into in-window trades.
pub fn parse_bybit_page(
    rows: &[Value],
    asset: Asset,
    start_ms: i64,
    end_ms: i64,
) -> Vec<Trade> {
    let mut trades = Vec::new();
    for row in rows {
        let Some(timestamp) = row
            .get("time")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
        else {
            warn!("[bybit/backfill] malformed row: {row}");
            continue;
        };
        if timestamp < start_ms || timestamp > end_ms {
            continue;
        }

        let (Some(price), Some(quantity), Some(side)) = (
            row.get("price").and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok()),
            row.get("size").and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok()),
            row.get("side").and_then(Value::as_str),
        ) else {
            warn!("[bybit/backfill] malformed row: {row}");
            continue;
        };
        if price <= 0.0 || quantity <= 0.0 {
            continue;
        }

        let taker_side = match side {
            "Sell" => TakerSide::Sell,
            "Buy" => TakerSide::Buy,
            other => {
                warn!("[bybit/backfill] unknown side: {other}");
                continue;
            }
        };

        trades.push(Trade {
            timestamp,
            local_timestamp: timestamp,
            price,
            quantity,
            taker_side,
            venue: VenueId::Bybit,
            asset,
            market_type: MarketType::Perp,
        });
    }
    trades
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_binance_page_window_and_sides() {
        let rows = vec![
            json!({"a": 100, "p": "94000.5", "q": "0.5", "T": 1_700_000_010_000_i64, "m": true}),
            json!({"a": 101, "p": "94001.0", "q": "0.2", "T": 1_700_000_020_000_i64, "m": false}),
            // Outside the window.
            json!({"a": 102, "p": "94002.0", "q": "0.1", "T": 1_700_000_070_000_i64, "m": false}),
            // Bad price.
            json!({"a": 103, "p": "0", "q": "0.1", "T": 1_700_000_030_000_i64, "m": false}),
        ];

        let (trades, last_id) = parse_binance_page(
            &rows,
            Asset::Btc,
            MarketType::Spot,
            1_700_000_000_000,
            1_700_000_059_999,
        );

        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].taker_side, TakerSide::Sell);
        assert_eq!(trades[1].taker_side, TakerSide::Buy);
        assert_eq!(trades[0].local_timestamp, trades[0].timestamp);
        assert_eq!(last_id, Some(103));
    }

    #[test]
    fn test_parse_kraken_result() {
        let result = json!({
            "XXBTZUSD": [
                ["94000.1", "0.1", 1_700_000_010.5, "s", "l", ""],
                ["94000.2", "0.2", 1_700_000_020.5, "b", "m", ""],
                ["94000.3", "0.3", 1_700_000_070.0, "b", "l", ""]
            ],
            "last": "1700000070000000000"
        });
        let map = result.as_object().unwrap();

        let (trades, count) =
            parse_kraken_result(map, Asset::Btc, 1_700_000_000_000, 1_700_000_059_999);
        assert_eq!(count, 3);
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].taker_side, TakerSide::Sell);
        assert_eq!(trades[0].timestamp, 1_700_000_010_500);
        assert_eq!(trades[1].taker_side, TakerSide::Buy);
    }

    #[test]
    fn test_parse_okx_page_newest_first() {
        let rows = vec![
            json!({"instId": "BTC-USDT", "tradeId": "3", "px": "94010", "sz": "0.3",
                   "side": "sell", "ts": "1700000050000"}),
            json!({"instId": "BTC-USDT", "tradeId": "2", "px": "94005", "sz": "0.2",
                   "side": "buy", "ts": "1700000030000"}),
            json!({"instId": "BTC-USDT", "tradeId": "1", "px": "94000", "sz": "0.1",
                   "side": "buy", "ts": "1699999990000"}),
        ];

        let (trades, oldest, last_id) = parse_okx_page(
            &rows,
            Asset::Btc,
            MarketType::Spot,
            1_700_000_000_000,
            1_700_000_059_999,
        );

        assert_eq!(trades.len(), 2);
        assert_eq!(oldest, Some(1_699_999_990_000));
        assert_eq!(last_id, Some("1".to_string()));
    }

    #[test]
    fn test_parse_bybit_page() {
        let rows = vec![
            json!({"symbol": "BTCUSDT", "side": "Sell", "size": "0.01",
                   "price": "94000.0", "time": "1700000010000", "isBlockTrade": false}),
            json!({"symbol": "BTCUSDT", "side": "Buy", "size": "0.02",
                   "price": "94001.0", "time": "1700000070000", "isBlockTrade": false}),
            json!({"symbol": "BTCUSDT", "side": "Buy", "size": "bogus",
                   "price": "94001.0", "time": "1700000020000", "isBlockTrade": false}),
        ];

        let trades = parse_bybit_page(&rows, Asset::Btc, 1_700_000_000_000, 1_700_000_059_999);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].taker_side, TakerSide::Sell);
        assert_eq!(trades[0].market_type, MarketType::Perp);
    }
}
