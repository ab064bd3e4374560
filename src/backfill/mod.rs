//! Gap repair from venue REST APIs.
//!
//! For an explicit time range the service lists gap minutes from the store,
//! pulls historical trades per backfill venue, rebuilds venue bars with the
//! same accumulator the live path uses, recomputes the composite under the
//! same outlier rules, and upserts the results with `is_backfilled=true`.

pub mod fetchers;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bars::{bar_from_trades, BAR_INTERVAL_SECONDS};
use crate::catalog;
use crate::composite::{
    build_composite_bar, filter_outliers, FlowTotals, VenuePriceInput, MIN_QUORUM,
};
use crate::models::{
    Asset, Bar, CompositeBar, ExcludeReason, ExcludedVenue, MarketType, VenueBarRecord, VenueId,
};
use crate::storage::BarStore;

pub use fetchers::{RestTradeFetcher, TradeFetcher};

/// Backfill calls are bounded to one day per request.
pub const MAX_BACKFILL_RANGE_SECS: i64 = 24 * 3600;

const MAX_GAPS_PER_RUN: usize = 10_000;

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("invalid backfill request: {0}")]
    InvalidRequest(String),
    #[error("[{venue}/backfill] api error: {message}")]
    VenueApi { venue: VenueId, message: String },
    #[error("[{venue}/backfill] http error: {source}")]
    Http {
        venue: VenueId,
        #[source]
        source: reqwest::Error,
    },
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
    #[error("{0}")]
    Internal(String),
}

/// Outcome of one backfill run.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillResult {
    pub asset: Asset,
    pub market_type: MarketType,
    pub start_time: i64,
    pub end_time: i64,
    pub gaps_found: usize,
    pub bars_repaired: usize,
    pub bars_failed: usize,
    pub venue_bars_inserted: usize,
    pub errors: Vec<String>,
    pub duration_seconds: f64,
}

pub struct BackfillService {
    store: Arc<BarStore>,
    fetcher: Arc<dyn TradeFetcher>,
    spot_venues: Vec<VenueId>,
    perp_venues: Vec<VenueId>,
}

impl BackfillService {
    pub fn new(
        store: Arc<BarStore>,
        fetcher: Arc<dyn TradeFetcher>,
        spot_venues: Vec<VenueId>,
        perp_venues: Vec<VenueId>,
    ) -> Self {
        Self {
            store,
            fetcher,
            spot_venues,
            perp_venues,
        }
    }

    fn enabled_venues(&self, market: MarketType) -> &[VenueId] {
        match market {
            MarketType::Spot => &self.spot_venues,
            MarketType::Perp => &self.perp_venues,
        }
    }

    /// Repair gaps in `[start, end)`.
    ///
    /// `venues` defaults to the enabled venues for the market that have a
    /// historical REST API; an explicit list is filtered down to the same
    /// set. Per-minute failures are collected, not raised.
    pub async fn backfill_gaps(
        &self,
        asset: Asset,
        market: MarketType,
        start: i64,
        end: i64,
        venues: Option<Vec<VenueId>>,
    ) -> Result<BackfillResult, BackfillError> {
        if start >= end {
            return Err(BackfillError::InvalidRequest(format!(
                "start {start} must be before end {end}"
            )));
        }
        if end - start > MAX_BACKFILL_RANGE_SECS {
            return Err(BackfillError::InvalidRequest(format!(
                "range {}s exceeds the 24h limit",
                end - start
            )));
        }

        let started = Instant::now();
        let mut result = BackfillResult {
            asset,
            market_type: market,
            start_time: start,
            end_time: end,
            gaps_found: 0,
            bars_repaired: 0,
            bars_failed: 0,
            venue_bars_inserted: 0,
            errors: Vec::new(),
            duration_seconds: 0.0,
        };

        let fetch_venues: Vec<VenueId> = venues
            .unwrap_or_else(|| self.enabled_venues(market).to_vec())
            .into_iter()
            .filter(|v| catalog::supports_backfill(*v) && catalog::supports_market(*v, market))
            .collect();

        let gaps = self
            .store
            .gap_times(asset, market, start, end, MAX_GAPS_PER_RUN)?;
        result.gaps_found = gaps.len();

        if gaps.is_empty() {
            info!(%asset, %market, "no gaps found in range");
            result.duration_seconds = started.elapsed().as_secs_f64();
            return Ok(result);
        }

        info!(
            %asset,
            %market,
            gaps = gaps.len(),
            venues = ?fetch_venues,
            "backfilling gaps"
        );

        for gap_time in gaps {
            match self
                .backfill_single_gap(asset, market, gap_time, &fetch_venues, &mut result.errors)
                .await
            {
                Ok(inserted) if inserted > 0 => {
                    result.bars_repaired += 1;
                    result.venue_bars_inserted += inserted;
                }
                Ok(_) => result.bars_failed += 1,
                Err(e) => {
                    warn!("failed to backfill gap at {gap_time}: {e}");
                    result.bars_failed += 1;
                    result.errors.push(format!("gap {gap_time}: {e}"));
                }
            }
        }

        result.duration_seconds = started.elapsed().as_secs_f64();
        info!(
            repaired = result.bars_repaired,
            failed = result.bars_failed,
            duration = result.duration_seconds,
            "backfill complete"
        );
        Ok(result)
    }

    /// Repair one gap minute. Returns the number of venue bars inserted, or
    /// zero when the minute stays unrepaired.
    async fn backfill_single_gap(
        &self,
        asset: Asset,
        market: MarketType,
        gap_time: i64,
        venues: &[VenueId],
        errors: &mut Vec<String>,
    ) -> Result<usize, BackfillError> {
        let start_ms = gap_time * 1000;
        let end_ms = (gap_time + BAR_INTERVAL_SECONDS) * 1000 - 1;

        let mut venue_bars: BTreeMap<VenueId, Bar> = BTreeMap::new();
        for &venue in venues {
            let trades = match self
                .fetcher
                .fetch_minute(venue, asset, market, start_ms, end_ms)
                .await
            {
                Ok(trades) => trades,
                Err(e) => {
                    // One venue's API fault aborts that venue for this
                    // minute, not the others.
                    warn!("{e}");
                    errors.push(e.to_string());
                    continue;
                }
            };

            if trades.is_empty() {
                debug!("[{venue}/backfill] no trades for minute {gap_time}");
                continue;
            }

            if let Some(bar) = bar_from_trades(&trades, gap_time, venue, asset, market) {
                venue_bars.insert(venue, bar);
            }
        }

        if venue_bars.len() < MIN_QUORUM {
            debug!(
                "insufficient venues ({}) to repair gap at {gap_time}",
                venue_bars.len()
            );
            return Ok(0);
        }

        let enabled = self.enabled_venues(market).to_vec();
        let Some((composite, records)) =
            compose_backfill_bar(&venue_bars, gap_time, asset, market, &enabled)
        else {
            return Ok(0);
        };

        let inserted = self.store.upsert_venue_bars(&records)?;
        self.store.upsert_composite(&composite)?;

        info!(
            time = gap_time,
            venues = venue_bars.len(),
            "repaired gap"
        );
        Ok(inserted)
    }
}

/// Build a backfilled composite from rebuilt venue bars.
///
/// All inputs carry exchange timestamps from inside the minute, so staleness
/// cannot apply; disconnection is modeled by absence. Enabled venues that
/// produced no bar are recorded as excluded: realtime-only venues with
/// `BACKFILL_UNAVAILABLE`, backfill venues with `NO_DATA`. Returns `None`
/// when the outlier filter leaves the close below quorum.
pub fn compose_backfill_bar(
    venue_bars: &BTreeMap<VenueId, Bar>,
    bar_time: i64,
    asset: Asset,
    market: MarketType,
    enabled_venues: &[VenueId],
) -> Option<(CompositeBar, Vec<VenueBarRecord>)> {
    let fresh_ms = (bar_time + BAR_INTERVAL_SECONDS) * 1000;

    let build_inputs = |component: fn(&Bar) -> f64| -> Vec<VenuePriceInput> {
        venue_bars
            .iter()
            .map(|(&venue, bar)| VenuePriceInput {
                venue,
                price: Some(component(bar)),
                last_update_ms: Some(fresh_ms),
                is_connected: true,
            })
            .collect()
    };

    let open_result = filter_outliers(&build_inputs(|b| b.open), fresh_ms, market);
    let high_result = filter_outliers(&build_inputs(|b| b.high), fresh_ms, market);
    let low_result = filter_outliers(&build_inputs(|b| b.low), fresh_ms, market);
    let close_result = filter_outliers(&build_inputs(|b| b.close), fresh_ms, market);

    if close_result.is_gap {
        return None;
    }

    let bar_refs: Vec<(VenueId, &Bar)> = venue_bars.iter().map(|(&v, b)| (v, b)).collect();
    let flow = FlowTotals::from_included(&bar_refs, &close_result);

    let mut composite = build_composite_bar(
        bar_time,
        &open_result,
        &high_result,
        &low_result,
        &close_result,
        flow,
        asset,
        market,
    );

    // Enabled venues absent from the fetched set are excluded explicitly so
    // quality accounting sees them.
    for &venue in enabled_venues {
        if !venue_bars.contains_key(&venue) {
            let reason = if catalog::supports_backfill(venue) {
                ExcludeReason::NoData
            } else {
                ExcludeReason::BackfillUnavailable
            };
            composite.excluded_venues.push(ExcludedVenue { venue, reason });
        }
    }

    composite.is_gap = false;
    composite.is_backfilled = true;

    let records: Vec<VenueBarRecord> = venue_bars
        .values()
        .map(|bar| {
            let contribution = close_result.venues.iter().find(|c| c.venue == bar.venue);
            VenueBarRecord {
                bar: bar.clone(),
                included: contribution.map(|c| c.included).unwrap_or(false),
                exclude_reason: contribution.and_then(|c| c.exclude_reason),
            }
        })
        .collect();

    Some((composite, records))
}
