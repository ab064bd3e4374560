//! Minute bar construction from trade streams.
//!
//! A `BarBuilder` accumulates trades into the current minute's bar and emits
//! the completed bar when a trade crosses the minute boundary. Missing minutes
//! are never synthesized here; gaps are a composite-level concept.

use std::collections::VecDeque;

use tracing::debug;

use crate::models::{Asset, Bar, MarketType, TakerSide, Trade, VenueId};

/// Bar interval in seconds.
pub const BAR_INTERVAL_SECONDS: i64 = 60;

/// Completed bars retained per venue (about two hours).
pub const MAX_BARS_PER_VENUE: usize = 120;

/// Per-minute trade cap. Trades beyond this within one minute are dropped;
/// the rollover check still runs so bar closure is never blocked.
pub const MAX_TRADES_PER_MINUTE: u32 = 5_000;

/// Floor an exchange timestamp (ms) to its minute start (unix seconds).
pub fn floor_to_minute(timestamp_ms: i64) -> i64 {
    timestamp_ms / 1000 / BAR_INTERVAL_SECONDS * BAR_INTERVAL_SECONDS
}

/// Mutable accumulator for the currently forming minute.
#[derive(Debug, Clone)]
struct BarAccumulator {
    bar_time: i64,
    open: Option<f64>,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    trade_count: u32,
    buy_volume: f64,
    sell_volume: f64,
    buy_count: u32,
    sell_count: u32,
}

impl BarAccumulator {
    fn new(bar_time: i64) -> Self {
        Self {
            bar_time,
            open: None,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0.0,
            trade_count: 0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            buy_count: 0,
            sell_count: 0,
        }
    }

    fn add_trade(&mut self, trade: &Trade) {
        match self.open {
            None => {
                self.open = Some(trade.price);
                self.high = trade.price;
                self.low = trade.price;
                self.close = trade.price;
            }
            Some(_) => {
                if trade.price > self.high {
                    self.high = trade.price;
                }
                if trade.price < self.low {
                    self.low = trade.price;
                }
                self.close = trade.price;
            }
        }

        self.volume += trade.quantity;
        self.trade_count += 1;

        match trade.taker_side {
            TakerSide::Buy => {
                self.buy_volume += trade.quantity;
                self.buy_count += 1;
            }
            TakerSide::Sell => {
                self.sell_volume += trade.quantity;
                self.sell_count += 1;
            }
        }
    }

    fn to_bar(
        &self,
        venue: VenueId,
        asset: Asset,
        market_type: MarketType,
        is_partial: bool,
    ) -> Option<Bar> {
        let open = self.open?;
        Some(Bar {
            time: self.bar_time,
            open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            trade_count: self.trade_count,
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            buy_count: self.buy_count,
            sell_count: self.sell_count,
            venue,
            asset,
            market_type,
            is_partial,
        })
    }

    fn reset(&mut self, new_bar_time: i64) {
        *self = BarAccumulator::new(new_bar_time);
    }
}

/// Builds one-minute OHLCV bars from a stream of trades for one
/// (venue, asset, market) key.
pub struct BarBuilder {
    venue: VenueId,
    asset: Asset,
    market_type: MarketType,
    accumulator: Option<BarAccumulator>,
    completed: VecDeque<Bar>,
    minute_trade_count: u32,
    last_trade_time: Option<i64>,
    on_bar_complete: Option<Box<dyn Fn(&Bar) + Send + Sync>>,
}

impl BarBuilder {
    pub fn new(venue: VenueId, asset: Asset, market_type: MarketType) -> Self {
        Self {
            venue,
            asset,
            market_type,
            accumulator: None,
            completed: VecDeque::with_capacity(MAX_BARS_PER_VENUE),
            minute_trade_count: 0,
            last_trade_time: None,
            on_bar_complete: None,
        }
    }

    pub fn set_on_bar_complete<F>(&mut self, hook: F)
    where
        F: Fn(&Bar) + Send + Sync + 'static,
    {
        self.on_bar_complete = Some(Box::new(hook));
    }

    /// Add a trade. Returns the completed bar when the trade crossed into a
    /// new minute.
    ///
    /// Trades older than the current bar are dropped: bar closure is one-way
    /// and an already-emitted bar is never mutated.
    pub fn add_trade(&mut self, trade: &Trade) -> Option<Bar> {
        let trade_bar_time = floor_to_minute(trade.timestamp);

        let acc = self
            .accumulator
            .get_or_insert_with(|| BarAccumulator::new(trade_bar_time));

        if trade_bar_time < acc.bar_time {
            debug!(
                venue = %self.venue,
                trade_time = trade.timestamp,
                bar_time = acc.bar_time,
                "dropping out-of-order trade from a prior minute"
            );
            return None;
        }

        let mut completed: Option<Bar> = None;

        // The rollover check runs before the per-minute cap so the counter is
        // always reset even when the previous minute hit the cap.
        if trade_bar_time > acc.bar_time {
            completed = acc.to_bar(self.venue, self.asset, self.market_type, false);
            acc.reset(trade_bar_time);
            self.minute_trade_count = 0;

            if let Some(ref bar) = completed {
                self.completed.push_back(bar.clone());
                while self.completed.len() > MAX_BARS_PER_VENUE {
                    self.completed.pop_front();
                }
                if let Some(hook) = &self.on_bar_complete {
                    hook(bar);
                }
            }
        }

        if self.minute_trade_count >= MAX_TRADES_PER_MINUTE {
            return completed;
        }

        if let Some(acc) = self.accumulator.as_mut() {
            acc.add_trade(trade);
            self.minute_trade_count += 1;
            self.last_trade_time = Some(trade.timestamp);
        }

        completed
    }

    /// The currently forming bar, flagged partial. None before any trade.
    pub fn partial_bar(&self) -> Option<Bar> {
        self.accumulator
            .as_ref()
            .and_then(|acc| acc.to_bar(self.venue, self.asset, self.market_type, true))
    }

    /// Most recently completed bar.
    pub fn latest_bar(&self) -> Option<&Bar> {
        self.completed.back()
    }

    /// Completed bars, oldest first.
    pub fn bars(&self, limit: Option<usize>) -> Vec<Bar> {
        let bars: Vec<Bar> = self.completed.iter().cloned().collect();
        match limit {
            Some(n) if n < bars.len() => bars[bars.len() - n..].to_vec(),
            _ => bars,
        }
    }

    /// Close of the forming bar.
    pub fn current_price(&self) -> Option<f64> {
        self.accumulator
            .as_ref()
            .filter(|acc| acc.open.is_some())
            .map(|acc| acc.close)
    }

    pub fn last_trade_time(&self) -> Option<i64> {
        self.last_trade_time
    }
}

/// Rebuild a single completed bar from an out-of-band trade list, keeping
/// only trades that fall inside the bar's minute. Used by backfill.
pub fn bar_from_trades(
    trades: &[Trade],
    bar_time: i64,
    venue: VenueId,
    asset: Asset,
    market_type: MarketType,
) -> Option<Bar> {
    let mut acc = BarAccumulator::new(bar_time);
    for trade in trades {
        if floor_to_minute(trade.timestamp) == bar_time {
            acc.add_trade(trade);
        }
    }
    acc.to_bar(venue, asset, market_type, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn trade(ts_ms: i64, price: f64, qty: f64, side: TakerSide) -> Trade {
        Trade {
            timestamp: ts_ms,
            local_timestamp: ts_ms,
            price,
            quantity: qty,
            taker_side: side,
            venue: VenueId::Binance,
            asset: Asset::Btc,
            market_type: MarketType::Spot,
        }
    }

    fn builder() -> BarBuilder {
        BarBuilder::new(VenueId::Binance, Asset::Btc, MarketType::Spot)
    }

    #[test]
    fn test_single_trade_opens_bar() {
        let mut b = builder();
        assert!(b.add_trade(&trade(1_700_000_030_000, 100.0, 0.5, TakerSide::Buy)).is_none());

        let partial = b.partial_bar().unwrap();
        assert_eq!(partial.time, 1_700_000_000 - 1_700_000_000 % 60);
        assert_eq!(partial.open, 100.0);
        assert_eq!(partial.close, 100.0);
        assert_eq!(partial.buy_volume, 0.5);
        assert_eq!(partial.sell_volume, 0.0);
        assert!(partial.is_partial);
        assert_eq!(b.current_price(), Some(100.0));
    }

    // A minute-aligned base for boundary tests (divisible by 60).
    const T0: i64 = 1_700_000_040;

    #[test]
    fn test_rollover_emits_completed_bar() {
        // Trade at :59.9 of one minute (price 100), then :00.1 of the next
        // (price 110): the first minute closes as a one-trade bar and the new
        // minute opens at 110.
        let mut b = builder();
        b.add_trade(&trade(T0 * 1000 + 59_900, 100.0, 0.25, TakerSide::Buy));
        let done = b
            .add_trade(&trade(T0 * 1000 + 60_100, 110.0, 1.0, TakerSide::Buy))
            .unwrap();

        assert_eq!(done.time, T0);
        assert_eq!(done.open, 100.0);
        assert_eq!(done.close, 100.0);
        assert_eq!(done.high, 100.0);
        assert_eq!(done.low, 100.0);
        assert_eq!(done.volume, 0.25);
        assert_eq!(done.buy_volume, 0.25);
        assert!(!done.is_partial);

        let partial = b.partial_bar().unwrap();
        assert_eq!(partial.time, T0 + 60);
        assert_eq!(partial.open, 110.0);
    }

    #[test]
    fn test_minute_boundary_trade_starts_new_bar() {
        // A trade exactly at t = 60k seconds belongs to the new bar, not the
        // prior one.
        let mut b = builder();
        b.add_trade(&trade(T0 * 1000 - 1, 100.0, 1.0, TakerSide::Sell));
        let done = b.add_trade(&trade(T0 * 1000, 101.0, 1.0, TakerSide::Buy)).unwrap();
        assert_eq!(done.time, T0 - 60);
        assert_eq!(done.trade_count, 1);
        assert_eq!(b.partial_bar().unwrap().time, T0);
        assert_eq!(b.partial_bar().unwrap().open, 101.0);
    }

    #[test]
    fn test_out_of_order_trade_dropped() {
        let mut b = builder();
        b.add_trade(&trade(T0 * 1000 + 100, 110.0, 1.0, TakerSide::Buy));
        // Late trade from the previous minute never mutates state.
        assert!(b.add_trade(&trade(T0 * 1000 - 1_000, 90.0, 5.0, TakerSide::Sell)).is_none());
        let partial = b.partial_bar().unwrap();
        assert_eq!(partial.low, 110.0);
        assert_eq!(partial.volume, 1.0);
    }

    #[test]
    fn test_ohlc_and_flow_invariants() {
        let mut b = builder();
        let base = 1_700_000_000_000;
        b.add_trade(&trade(base, 100.0, 1.0, TakerSide::Buy));
        b.add_trade(&trade(base + 1_000, 105.0, 2.0, TakerSide::Sell));
        b.add_trade(&trade(base + 2_000, 95.0, 0.5, TakerSide::Buy));
        b.add_trade(&trade(base + 3_000, 99.0, 1.5, TakerSide::Sell));

        let bar = b.partial_bar().unwrap();
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 105.0);
        assert_eq!(bar.low, 95.0);
        assert_eq!(bar.close, 99.0);
        assert!(bar.low <= bar.open.min(bar.close));
        assert!(bar.high >= bar.open.max(bar.close));
        assert!((bar.buy_volume + bar.sell_volume - bar.volume).abs() < 1e-9);
        assert_eq!(bar.buy_count + bar.sell_count, bar.trade_count);
        assert_eq!(bar.time % 60, 0);
    }

    #[test]
    fn test_completion_hook_fires_in_bar_time_order() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let mut b = builder();
        b.set_on_bar_complete(move |bar| {
            assert!(!bar.is_partial);
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        let base = 1_700_000_000_000;
        b.add_trade(&trade(base, 100.0, 1.0, TakerSide::Buy));
        b.add_trade(&trade(base + 60_000, 101.0, 1.0, TakerSide::Buy));
        b.add_trade(&trade(base + 120_000, 102.0, 1.0, TakerSide::Buy));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(b.latest_bar().unwrap().time, floor_to_minute(base + 60_000));
    }

    #[test]
    fn test_trade_cap_never_blocks_rollover() {
        let mut b = builder();
        let base = 1_700_000_000_000;
        for i in 0..MAX_TRADES_PER_MINUTE + 100 {
            b.add_trade(&trade(base + i as i64, 100.0, 1.0, TakerSide::Buy));
        }
        let partial = b.partial_bar().unwrap();
        assert_eq!(partial.trade_count, MAX_TRADES_PER_MINUTE);

        // Rollover still closes the capped bar and the new minute accepts trades.
        let done = b.add_trade(&trade(base + 60_000, 200.0, 1.0, TakerSide::Sell)).unwrap();
        assert_eq!(done.trade_count, MAX_TRADES_PER_MINUTE);
        assert_eq!(b.partial_bar().unwrap().open, 200.0);
        assert_eq!(b.partial_bar().unwrap().trade_count, 1);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let base = 1_700_000_000_000;
        let trades = vec![
            trade(base + 100, 100.0, 1.0, TakerSide::Buy),
            trade(base + 5_000, 101.5, 0.2, TakerSide::Sell),
            trade(base + 30_000, 99.5, 2.5, TakerSide::Sell),
            trade(base + 59_999, 100.5, 0.7, TakerSide::Buy),
            trade(base + 60_000, 101.0, 1.0, TakerSide::Buy),
        ];

        let run = |trades: &[Trade]| {
            let mut b = builder();
            let mut completed = None;
            for t in trades {
                if let Some(bar) = b.add_trade(t) {
                    completed = Some(bar);
                }
            }
            completed.unwrap()
        };

        assert_eq!(run(&trades), run(&trades));
    }

    #[test]
    fn test_bar_from_trades_filters_window() {
        let bar_time = 1_700_000_040; // minute floor of the window below
        let bar_time = bar_time - bar_time % 60;
        let trades = vec![
            trade(bar_time * 1000 + 500, 100.0, 1.0, TakerSide::Buy),
            trade(bar_time * 1000 + 59_000, 102.0, 1.0, TakerSide::Sell),
            // Next minute; must be ignored.
            trade((bar_time + 60) * 1000, 150.0, 1.0, TakerSide::Buy),
        ];
        let bar = bar_from_trades(&trades, bar_time, VenueId::Kraken, Asset::Btc, MarketType::Spot)
            .unwrap();
        assert_eq!(bar.time, bar_time);
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.close, 102.0);
        assert_eq!(bar.trade_count, 2);
        assert_eq!(bar.venue, VenueId::Kraken);
    }

    #[test]
    fn test_history_ring_buffer_bounded() {
        let mut b = builder();
        let base = 1_700_000_000_000;
        for i in 0..(MAX_BARS_PER_VENUE as i64 + 10) {
            b.add_trade(&trade(base + i * 60_000, 100.0 + i as f64, 1.0, TakerSide::Buy));
        }
        assert_eq!(b.bars(None).len(), MAX_BARS_PER_VENUE);
        assert_eq!(b.bars(Some(5)).len(), 5);
    }
}
