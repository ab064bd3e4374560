//! SQLite persistence for composite and venue bars.
//!
//! Composite bars are keyed `(time, asset, market_type)`, venue bars
//! `(time, asset, market_type, venue)`. Upserts keep `is_backfilled`
//! monotonic: once true it stays true, and repairing a gap row flips it true.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::models::{
    Asset, Bar, CompositeBar, ExcludedVenue, MarketType, VenueBarRecord, VenueId,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS composite_bars (
    time          INTEGER NOT NULL,
    asset         TEXT NOT NULL,
    market_type   TEXT NOT NULL,
    open          REAL,
    high          REAL,
    low           REAL,
    close         REAL,
    volume        REAL NOT NULL DEFAULT 0,
    buy_volume    REAL NOT NULL DEFAULT 0,
    sell_volume   REAL NOT NULL DEFAULT 0,
    buy_count     INTEGER NOT NULL DEFAULT 0,
    sell_count    INTEGER NOT NULL DEFAULT 0,
    degraded      INTEGER NOT NULL DEFAULT 0,
    is_gap        INTEGER NOT NULL DEFAULT 0,
    is_backfilled INTEGER NOT NULL DEFAULT 0,
    included_venues TEXT NOT NULL DEFAULT '[]',
    excluded_venues TEXT NOT NULL DEFAULT '[]',
    created_at    INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (time, asset, market_type)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_composite_bars_key_time
    ON composite_bars(asset, market_type, time DESC);

CREATE TABLE IF NOT EXISTS venue_bars (
    time          INTEGER NOT NULL,
    asset         TEXT NOT NULL,
    market_type   TEXT NOT NULL,
    venue         TEXT NOT NULL,
    open          REAL NOT NULL,
    high          REAL NOT NULL,
    low           REAL NOT NULL,
    close         REAL NOT NULL,
    volume        REAL NOT NULL DEFAULT 0,
    trade_count   INTEGER NOT NULL DEFAULT 0,
    buy_volume    REAL NOT NULL DEFAULT 0,
    sell_volume   REAL NOT NULL DEFAULT 0,
    buy_count     INTEGER NOT NULL DEFAULT 0,
    sell_count    INTEGER NOT NULL DEFAULT 0,
    included      INTEGER NOT NULL DEFAULT 1,
    exclude_reason TEXT,
    created_at    INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (time, asset, market_type, venue)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_venue_bars_key_time
    ON venue_bars(asset, market_type, venue, time DESC);
"#;

/// Data-quality tier over a window, with the gating recommendation derived
/// from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Proceed,
    ProceedWithCaution,
    BackfillRequired,
}

/// Integrity statistics over a window.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityStats {
    pub expected_bars: i64,
    pub actual_bars: i64,
    pub missing_bars: i64,
    pub gaps: i64,
    pub total_gaps: i64,
    pub gap_rate: f64,
    pub degraded: i64,
    pub degraded_rate: f64,
    pub quality_degraded: i64,
    pub quality_degraded_rate: f64,
    pub backfilled: i64,
    pub tier: u8,
    pub recommendation: Recommendation,
}

/// SQLite-backed store for composite and venue bars.
pub struct BarStore {
    conn: Mutex<Connection>,
}

impl BarStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize schema")?;
        info!(path, "bar store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert one composite bar, keeping `is_backfilled` monotonic.
    pub fn upsert_composite(&self, bar: &CompositeBar) -> Result<()> {
        let conn = self.conn.lock();
        Self::upsert_composite_inner(&conn, bar)
    }

    /// Upsert a batch of composite bars inside one transaction.
    pub fn upsert_composites(&self, bars: &[CompositeBar]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for bar in bars {
            Self::upsert_composite_inner(&tx, bar)?;
        }
        tx.commit()?;
        Ok(bars.len())
    }

    fn upsert_composite_inner(conn: &Connection, bar: &CompositeBar) -> Result<()> {
        let included = serde_json::to_string(&bar.included_venues)?;
        let excluded = serde_json::to_string(&bar.excluded_venues)?;

        conn.execute(
            r#"
            INSERT INTO composite_bars (
                time, asset, market_type,
                open, high, low, close,
                volume, buy_volume, sell_volume, buy_count, sell_count,
                degraded, is_gap, is_backfilled,
                included_venues, excluded_venues
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(time, asset, market_type) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume,
                buy_volume = excluded.buy_volume,
                sell_volume = excluded.sell_volume,
                buy_count = excluded.buy_count,
                sell_count = excluded.sell_count,
                degraded = excluded.degraded,
                is_gap = excluded.is_gap,
                is_backfilled = CASE
                    WHEN composite_bars.is_backfilled = 1 THEN 1
                    WHEN composite_bars.is_gap = 1 AND excluded.is_gap = 0 THEN 1
                    ELSE excluded.is_backfilled
                END,
                included_venues = excluded.included_venues,
                excluded_venues = excluded.excluded_venues
            "#,
            params![
                bar.time,
                bar.asset.as_str(),
                bar.market_type.as_str(),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume,
                bar.buy_volume,
                bar.sell_volume,
                bar.buy_count,
                bar.sell_count,
                bar.degraded,
                bar.is_gap,
                bar.is_backfilled,
                included,
                excluded,
            ],
        )
        .context("failed to upsert composite bar")?;
        Ok(())
    }

    /// Upsert venue bars with their inclusion status, one transaction.
    pub fn upsert_venue_bars(&self, records: &[VenueBarRecord]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for record in records {
            let bar = &record.bar;
            tx.execute(
                r#"
                INSERT INTO venue_bars (
                    time, asset, market_type, venue,
                    open, high, low, close,
                    volume, trade_count, buy_volume, sell_volume, buy_count, sell_count,
                    included, exclude_reason
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                ON CONFLICT(time, asset, market_type, venue) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    trade_count = excluded.trade_count,
                    buy_volume = excluded.buy_volume,
                    sell_volume = excluded.sell_volume,
                    buy_count = excluded.buy_count,
                    sell_count = excluded.sell_count,
                    included = excluded.included,
                    exclude_reason = excluded.exclude_reason
                "#,
                params![
                    bar.time,
                    bar.asset.as_str(),
                    bar.market_type.as_str(),
                    bar.venue.as_str(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                    bar.trade_count,
                    bar.buy_volume,
                    bar.sell_volume,
                    bar.buy_count,
                    bar.sell_count,
                    record.included,
                    record.exclude_reason.map(|r| r.as_str()),
                ],
            )
            .context("failed to upsert venue bar")?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Composite bars with `start <= time < end`, ascending, capped at `limit`.
    pub fn composite_range(
        &self,
        asset: Asset,
        market: MarketType,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<CompositeBar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT time, open, high, low, close,
                   volume, buy_volume, sell_volume, buy_count, sell_count,
                   degraded, is_gap, is_backfilled, included_venues, excluded_venues
            FROM composite_bars
            WHERE asset = ?1 AND market_type = ?2 AND time >= ?3 AND time < ?4
            ORDER BY time ASC
            LIMIT ?5
            "#,
        )?;

        let rows = stmt.query_map(
            params![asset.as_str(), market.as_str(), start, end, limit as i64],
            |row| Self::row_to_composite(row, asset, market),
        )?;

        let mut bars = Vec::new();
        for row in rows {
            bars.push(row?);
        }
        Ok(bars)
    }

    /// Most recent composite bar for a key.
    pub fn latest_composite(&self, asset: Asset, market: MarketType) -> Result<Option<CompositeBar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT time, open, high, low, close,
                   volume, buy_volume, sell_volume, buy_count, sell_count,
                   degraded, is_gap, is_backfilled, included_venues, excluded_venues
            FROM composite_bars
            WHERE asset = ?1 AND market_type = ?2
            ORDER BY time DESC
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query_map(params![asset.as_str(), market.as_str()], |row| {
            Self::row_to_composite(row, asset, market)
        })?;

        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn row_to_composite(
        row: &rusqlite::Row<'_>,
        asset: Asset,
        market: MarketType,
    ) -> rusqlite::Result<CompositeBar> {
        let included_json: String = row.get(13)?;
        let excluded_json: String = row.get(14)?;
        let included_venues: Vec<VenueId> =
            serde_json::from_str(&included_json).unwrap_or_default();
        let excluded_venues: Vec<ExcludedVenue> =
            serde_json::from_str(&excluded_json).unwrap_or_default();

        Ok(CompositeBar {
            time: row.get(0)?,
            open: row.get(1)?,
            high: row.get(2)?,
            low: row.get(3)?,
            close: row.get(4)?,
            volume: row.get(5)?,
            buy_volume: row.get(6)?,
            sell_volume: row.get(7)?,
            buy_count: row.get(8)?,
            sell_count: row.get(9)?,
            degraded: row.get(10)?,
            is_gap: row.get(11)?,
            is_backfilled: row.get(12)?,
            included_venues,
            excluded_venues,
            asset,
            market_type: market,
        })
    }

    /// Venue bars for one venue, ascending.
    pub fn venue_range(
        &self,
        asset: Asset,
        market: MarketType,
        venue: VenueId,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT time, open, high, low, close,
                   volume, trade_count, buy_volume, sell_volume, buy_count, sell_count
            FROM venue_bars
            WHERE asset = ?1 AND market_type = ?2 AND venue = ?3
              AND time >= ?4 AND time < ?5
            ORDER BY time ASC
            LIMIT ?6
            "#,
        )?;

        let rows = stmt.query_map(
            params![
                asset.as_str(),
                market.as_str(),
                venue.as_str(),
                start,
                end,
                limit as i64
            ],
            |row| {
                Ok(Bar {
                    time: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                    trade_count: row.get(6)?,
                    buy_volume: row.get(7)?,
                    sell_volume: row.get(8)?,
                    buy_count: row.get(9)?,
                    sell_count: row.get(10)?,
                    venue,
                    asset,
                    market_type: market,
                    is_partial: false,
                })
            },
        )?;

        let mut bars = Vec::new();
        for row in rows {
            bars.push(row?);
        }
        Ok(bars)
    }

    /// Timestamps of gap bars in `[start, end)`, ascending.
    pub fn gap_times(
        &self,
        asset: Asset,
        market: MarketType,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT time FROM composite_bars
            WHERE asset = ?1 AND market_type = ?2 AND time >= ?3 AND time < ?4
              AND is_gap = 1
            ORDER BY time ASC
            LIMIT ?5
            "#,
        )?;

        let rows = stmt.query_map(
            params![asset.as_str(), market.as_str(), start, end, limit as i64],
            |row| row.get::<_, i64>(0),
        )?;

        let mut times = Vec::new();
        for row in rows {
            times.push(row?);
        }
        Ok(times)
    }

    /// Integrity statistics over `[start, end)`.
    ///
    /// Missing rows count as gaps (`total_gaps`); `quality_degraded` counts
    /// bars with any excluded venue. Tier thresholds are calibrated to a
    /// 24 h window of 1 440 bars.
    pub fn integrity_stats(
        &self,
        asset: Asset,
        market: MarketType,
        start: i64,
        end: i64,
    ) -> Result<IntegrityStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(is_gap), 0),
                COALESCE(SUM(degraded), 0),
                COALESCE(SUM(is_backfilled), 0),
                COALESCE(SUM(CASE WHEN excluded_venues != '[]' THEN 1 ELSE 0 END), 0)
            FROM composite_bars
            WHERE asset = ?1 AND market_type = ?2 AND time >= ?3 AND time < ?4
            "#,
        )?;

        let (actual_bars, gaps, degraded, backfilled, quality_degraded): (i64, i64, i64, i64, i64) =
            stmt.query_row(params![asset.as_str(), market.as_str(), start, end], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?;

        let expected_bars = (end - start) / 60;
        let missing_bars = (expected_bars - actual_bars).max(0);
        let total_gaps = gaps + missing_bars;

        let rate = |n: i64| {
            if expected_bars > 0 {
                n as f64 / expected_bars as f64
            } else {
                0.0
            }
        };

        // Quality-degraded bars (excluded venues), not quorum-degraded ones,
        // gate the tier so two clean venues can still reach tier 1.
        let tier = if total_gaps <= 5 && quality_degraded <= 60 {
            1
        } else if total_gaps <= 30 && quality_degraded <= 180 {
            2
        } else {
            3
        };

        let recommendation = match tier {
            1 => Recommendation::Proceed,
            2 => Recommendation::ProceedWithCaution,
            _ => Recommendation::BackfillRequired,
        };

        Ok(IntegrityStats {
            expected_bars,
            actual_bars,
            missing_bars,
            gaps,
            total_gaps,
            gap_rate: rate(total_gaps),
            degraded,
            degraded_rate: rate(degraded),
            quality_degraded,
            quality_degraded_rate: rate(quality_degraded),
            backfilled,
            tier,
            recommendation,
        })
    }

    /// Delete bars older than `retention_days`. Returns rows removed.
    pub fn enforce_retention(&self, retention_days: i64, now_secs: i64) -> Result<usize> {
        if retention_days <= 0 {
            return Ok(0);
        }
        let cutoff = now_secs - retention_days * 86_400;
        let conn = self.conn.lock();
        let composite = conn.execute("DELETE FROM composite_bars WHERE time < ?1", params![cutoff])?;
        let venue = conn.execute("DELETE FROM venue_bars WHERE time < ?1", params![cutoff])?;
        if composite + venue > 0 {
            info!(composite, venue, cutoff, "retention sweep removed rows");
        }
        Ok(composite + venue)
    }
}

/// Hourly retention sweep supervisor.
pub fn spawn_retention_task(store: Arc<BarStore>, retention_days: i64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if retention_days <= 0 {
            info!("retention enforcement disabled");
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick is immediate
        loop {
            ticker.tick().await;
            let now = crate::models::now_ms() / 1000;
            match store.enforce_retention(retention_days, now) {
                Ok(deleted) if deleted > 0 => {
                    info!(deleted, "retention sweep complete");
                }
                Ok(_) => {}
                Err(e) => error!("retention sweep failed: {e:#}"),
            }
        }
    })
}

/// Drain aggregator emissions into the store without blocking the tick.
pub fn spawn_persistence_task(
    store: Arc<BarStore>,
    mut composite_rx: tokio::sync::mpsc::UnboundedReceiver<CompositeBar>,
    mut venue_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<VenueBarRecord>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                bar = composite_rx.recv() => {
                    match bar {
                        Some(bar) => {
                            if let Err(e) = store.upsert_composite(&bar) {
                                error!("failed to persist composite bar: {e:#}");
                            }
                        }
                        None => break,
                    }
                }
                records = venue_rx.recv() => {
                    match records {
                        Some(records) => {
                            if let Err(e) = store.upsert_venue_bars(&records) {
                                error!("failed to persist venue bars: {e:#}");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        warn!("persistence task stopped");
    })
}
