//! Candela: a composite OHLCV candle indexer.
//!
//! Fans in live trade streams from exchange venues, builds per-venue minute
//! bars, filters outliers, and publishes canonical composite candles with
//! explicit quality semantics. A backfill path repairs historical gaps from
//! venue REST APIs.

pub mod aggregator;
pub mod api;
pub mod backfill;
pub mod bars;
pub mod catalog;
pub mod clock;
pub mod composite;
pub mod connectors;
pub mod models;
pub mod storage;

pub use aggregator::{AggregatorConfig, BarSink, CompositeAggregator};
pub use backfill::{BackfillResult, BackfillService};
pub use models::{Asset, Bar, CompositeBar, Config, MarketType, Trade, VenueId};
pub use storage::BarStore;
