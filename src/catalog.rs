//! Venue catalog: frozen per-venue configuration.
//!
//! Maps (venue, asset, market) to native symbols, stream names, WebSocket
//! endpoints, subscription payloads and stale thresholds. Also declares which
//! venues participate in realtime aggregation and which have historical REST
//! APIs usable for backfill. No runtime mutation.

use serde_json::json;

use crate::models::{Asset, MarketType, VenueId};

/// Venues eligible for realtime aggregation.
pub const REALTIME_VENUES: &[VenueId] = &[
    VenueId::Binance,
    VenueId::Coinbase,
    VenueId::Kraken,
    VenueId::Okx,
    VenueId::Bybit,
];

/// Venues with historical trade REST APIs. Coinbase's public trades endpoint
/// has no time-range query, so it is realtime-only.
pub const BACKFILL_VENUES: &[VenueId] = &[
    VenueId::Binance,
    VenueId::Kraken,
    VenueId::Okx,
    VenueId::Bybit,
];

pub fn supports_backfill(venue: VenueId) -> bool {
    BACKFILL_VENUES.contains(&venue)
}

/// Static capabilities for one venue.
#[derive(Debug, Clone, Copy)]
pub struct VenueCaps {
    pub supports_spot: bool,
    pub supports_perp: bool,
    pub ws_endpoint_spot: Option<&'static str>,
    pub ws_endpoint_perp: Option<&'static str>,
    pub stale_threshold_spot_ms: i64,
    pub stale_threshold_perp_ms: i64,
}

pub fn venue_caps(venue: VenueId) -> VenueCaps {
    match venue {
        VenueId::Binance => VenueCaps {
            supports_spot: true,
            supports_perp: true,
            ws_endpoint_spot: Some("wss://stream.binance.com:9443/ws"),
            ws_endpoint_perp: Some("wss://fstream.binance.com/ws"),
            stale_threshold_spot_ms: 10_000,
            stale_threshold_perp_ms: 10_000,
        },
        VenueId::Coinbase => VenueCaps {
            supports_spot: true,
            supports_perp: false,
            ws_endpoint_spot: Some("wss://ws-feed.exchange.coinbase.com"),
            ws_endpoint_perp: None,
            stale_threshold_spot_ms: 30_000,
            stale_threshold_perp_ms: 30_000,
        },
        VenueId::Kraken => VenueCaps {
            supports_spot: true,
            supports_perp: false,
            ws_endpoint_spot: Some("wss://ws.kraken.com"),
            ws_endpoint_perp: None,
            stale_threshold_spot_ms: 30_000,
            stale_threshold_perp_ms: 30_000,
        },
        VenueId::Okx => VenueCaps {
            supports_spot: true,
            supports_perp: true,
            ws_endpoint_spot: Some("wss://ws.okx.com:8443/ws/v5/public"),
            ws_endpoint_perp: Some("wss://ws.okx.com:8443/ws/v5/public"),
            stale_threshold_spot_ms: 15_000,
            stale_threshold_perp_ms: 15_000,
        },
        VenueId::Bybit => VenueCaps {
            supports_spot: false,
            supports_perp: true,
            ws_endpoint_spot: None,
            ws_endpoint_perp: Some("wss://stream.bybit.com/v5/public/linear"),
            stale_threshold_spot_ms: 10_000,
            stale_threshold_perp_ms: 10_000,
        },
    }
}

pub fn supports_market(venue: VenueId, market: MarketType) -> bool {
    let caps = venue_caps(venue);
    match market {
        MarketType::Spot => caps.supports_spot,
        MarketType::Perp => caps.supports_perp,
    }
}

/// Stale threshold in milliseconds for a venue on a market.
pub fn stale_threshold_ms(venue: VenueId, market: MarketType) -> i64 {
    let caps = venue_caps(venue);
    match market {
        MarketType::Spot => caps.stale_threshold_spot_ms,
        MarketType::Perp => caps.stale_threshold_perp_ms,
    }
}

pub fn ws_endpoint(venue: VenueId, market: MarketType) -> Option<&'static str> {
    let caps = venue_caps(venue);
    match market {
        MarketType::Spot => caps.ws_endpoint_spot,
        MarketType::Perp => caps.ws_endpoint_perp,
    }
}

/// Venue-native trading symbol for an (asset, market) pair, if supported.
pub fn symbol(venue: VenueId, asset: Asset, market: MarketType) -> Option<&'static str> {
    if !supports_market(venue, market) {
        return None;
    }
    let sym = match (venue, asset) {
        (VenueId::Binance, Asset::Btc) => "BTCUSDT",
        (VenueId::Binance, Asset::Eth) => "ETHUSDT",
        (VenueId::Coinbase, Asset::Btc) => "BTC-USD",
        (VenueId::Coinbase, Asset::Eth) => "ETH-USD",
        // Kraken trades bitcoin as XBT over its websocket API.
        (VenueId::Kraken, Asset::Btc) => "XBT/USD",
        (VenueId::Kraken, Asset::Eth) => "ETH/USD",
        (VenueId::Okx, Asset::Btc) => match market {
            MarketType::Spot => "BTC-USDT",
            MarketType::Perp => "BTC-USDT-SWAP",
        },
        (VenueId::Okx, Asset::Eth) => match market {
            MarketType::Spot => "ETH-USDT",
            MarketType::Perp => "ETH-USDT-SWAP",
        },
        (VenueId::Bybit, Asset::Btc) => "BTCUSDT",
        (VenueId::Bybit, Asset::Eth) => "ETHUSDT",
    };
    Some(sym)
}

/// Stream name used in subscription payloads (Binance wants it lower-cased).
pub fn stream_name(venue: VenueId, asset: Asset, market: MarketType) -> Option<String> {
    let sym = symbol(venue, asset, market)?;
    Some(match venue {
        VenueId::Binance => sym.to_ascii_lowercase(),
        _ => sym.to_string(),
    })
}

/// Full WebSocket URL to dial for a subscription.
///
/// Binance embeds the stream in the URL path; the remaining venues use a
/// shared endpoint plus an explicit subscribe message.
pub fn ws_url(venue: VenueId, asset: Asset, market: MarketType) -> Option<String> {
    let base = ws_endpoint(venue, market)?;
    match venue {
        VenueId::Binance => {
            let stream = stream_name(venue, asset, market)?;
            Some(format!("{base}/{stream}@aggTrade"))
        }
        _ => Some(base.to_string()),
    }
}

/// Subscription message body, if the venue requires one after connect.
pub fn subscription_message(
    venue: VenueId,
    asset: Asset,
    market: MarketType,
) -> Option<String> {
    let sym = symbol(venue, asset, market)?;
    let msg = match venue {
        // Stream is implicit in the URL; no subscribe frame needed.
        VenueId::Binance => return None,
        VenueId::Coinbase => json!({
            "type": "subscribe",
            "product_ids": [sym],
            "channels": ["matches"],
        }),
        VenueId::Kraken => json!({
            "event": "subscribe",
            "pair": [sym],
            "subscription": {"name": "trade"},
        }),
        VenueId::Okx => json!({
            "op": "subscribe",
            "args": [{"channel": "trades", "instId": sym}],
        }),
        VenueId::Bybit => json!({
            "op": "subscribe",
            "args": [format!("publicTrade.{sym}")],
        }),
    };
    Some(msg.to_string())
}

/// Kraken REST pair names differ from its websocket pairs.
pub fn kraken_rest_pair(asset: Asset) -> &'static str {
    match asset {
        Asset::Btc => "XXBTZUSD",
        Asset::Eth => "XETHZUSD",
    }
}

/// Venues to use for a backfill run on a market: enabled for that market,
/// in the backfill set, and with an implemented REST fetcher.
pub fn default_backfill_venues(market: MarketType) -> Vec<VenueId> {
    BACKFILL_VENUES
        .iter()
        .copied()
        .filter(|v| supports_market(*v, market))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_matrix() {
        assert!(supports_market(VenueId::Binance, MarketType::Spot));
        assert!(supports_market(VenueId::Binance, MarketType::Perp));
        assert!(!supports_market(VenueId::Coinbase, MarketType::Perp));
        assert!(!supports_market(VenueId::Kraken, MarketType::Perp));
        assert!(!supports_market(VenueId::Bybit, MarketType::Spot));
        assert!(supports_market(VenueId::Okx, MarketType::Perp));
    }

    #[test]
    fn test_symbols() {
        assert_eq!(
            symbol(VenueId::Kraken, Asset::Btc, MarketType::Spot),
            Some("XBT/USD")
        );
        assert_eq!(
            symbol(VenueId::Okx, Asset::Eth, MarketType::Perp),
            Some("ETH-USDT-SWAP")
        );
        assert_eq!(symbol(VenueId::Bybit, Asset::Btc, MarketType::Spot), None);
    }

    #[test]
    fn test_binance_ws_url_embeds_stream() {
        let url = ws_url(VenueId::Binance, Asset::Btc, MarketType::Spot).unwrap();
        assert_eq!(url, "wss://stream.binance.com:9443/ws/btcusdt@aggTrade");
        assert!(subscription_message(VenueId::Binance, Asset::Btc, MarketType::Spot).is_none());
    }

    #[test]
    fn test_subscription_payloads() {
        let okx = subscription_message(VenueId::Okx, Asset::Btc, MarketType::Perp).unwrap();
        assert!(okx.contains("\"instId\":\"BTC-USDT-SWAP\""));
        assert!(okx.contains("\"channel\":\"trades\""));

        let bybit = subscription_message(VenueId::Bybit, Asset::Eth, MarketType::Perp).unwrap();
        assert!(bybit.contains("publicTrade.ETHUSDT"));

        let kraken = subscription_message(VenueId::Kraken, Asset::Btc, MarketType::Spot).unwrap();
        assert!(kraken.contains("XBT/USD"));
    }

    #[test]
    fn test_backfill_sets() {
        assert!(!supports_backfill(VenueId::Coinbase));
        assert_eq!(
            default_backfill_venues(MarketType::Spot),
            vec![VenueId::Binance, VenueId::Kraken, VenueId::Okx]
        );
        assert_eq!(
            default_backfill_venues(MarketType::Perp),
            vec![VenueId::Binance, VenueId::Okx, VenueId::Bybit]
        );
    }

    #[test]
    fn test_stale_thresholds() {
        assert_eq!(stale_threshold_ms(VenueId::Binance, MarketType::Spot), 10_000);
        assert_eq!(stale_threshold_ms(VenueId::Coinbase, MarketType::Spot), 30_000);
        assert_eq!(stale_threshold_ms(VenueId::Okx, MarketType::Perp), 15_000);
    }
}
