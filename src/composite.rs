//! Median-based outlier filtering for composite price calculation.
//!
//! Exclusion order is fixed: DISCONNECTED, then NO_DATA, then STALE, and only
//! then the outlier test against the median of the survivors. A stale venue
//! must never pull the median, however far its last price drifted.

use crate::catalog::stale_threshold_ms;
use crate::models::{
    Asset, Bar, CompositeBar, DegradedReason, ExcludeReason, ExcludedVenue, MarketType, VenueId,
};

/// Maximum deviation from the median before a venue is excluded as outlier.
pub const OUTLIER_THRESHOLD_BPS: f64 = 100.0;

/// Below this many included venues the composite is a gap.
pub const MIN_QUORUM: usize = 2;

/// Below this many included venues the composite is degraded.
pub const PREFERRED_QUORUM: usize = 3;

/// A venue's price state for one OHLC component at one minute.
#[derive(Debug, Clone, Copy)]
pub struct VenuePriceInput {
    pub venue: VenueId,
    pub price: Option<f64>,
    pub last_update_ms: Option<i64>,
    pub is_connected: bool,
}

/// Per-venue outcome of a composite calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VenueContribution {
    pub venue: VenueId,
    pub price: Option<f64>,
    pub included: bool,
    pub deviation_bps: Option<f64>,
    pub exclude_reason: Option<ExcludeReason>,
}

/// Result of one composite component calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeResult {
    /// Median of the included venues; absent when the component is a gap.
    pub price: Option<f64>,
    pub venues: Vec<VenueContribution>,
    pub included_count: usize,
    pub total_count: usize,
    pub degraded: bool,
    pub degraded_reason: DegradedReason,
    pub is_gap: bool,
}

impl CompositeResult {
    pub fn included_venues(&self) -> Vec<VenueId> {
        self.venues
            .iter()
            .filter(|c| c.included)
            .map(|c| c.venue)
            .collect()
    }

    pub fn excluded_venues(&self) -> Vec<ExcludedVenue> {
        self.venues
            .iter()
            .filter_map(|c| {
                c.exclude_reason.map(|reason| ExcludedVenue {
                    venue: c.venue,
                    reason,
                })
            })
            .collect()
    }
}

/// Median with the standard odd/even definition.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Absolute deviation from the median in basis points.
pub fn deviation_bps(price: f64, median: f64) -> f64 {
    if median == 0.0 {
        return 0.0;
    }
    ((price - median) / median).abs() * 10_000.0
}

/// Filter venue prices for one OHLC component and compute the composite.
pub fn filter_outliers(
    inputs: &[VenuePriceInput],
    current_time_ms: i64,
    market_type: MarketType,
) -> CompositeResult {
    let total_count = inputs.len();
    let mut contributions: Vec<VenueContribution> = Vec::with_capacity(total_count);
    let mut candidates: Vec<(usize, f64)> = Vec::with_capacity(total_count);

    for input in inputs {
        let mut contribution = VenueContribution {
            venue: input.venue,
            price: input.price,
            included: false,
            deviation_bps: None,
            exclude_reason: None,
        };

        if !input.is_connected {
            contribution.exclude_reason = Some(ExcludeReason::Disconnected);
            contributions.push(contribution);
            continue;
        }

        let (price, last_update_ms) = match (input.price, input.last_update_ms) {
            (Some(p), Some(t)) => (p, t),
            _ => {
                contribution.exclude_reason = Some(ExcludeReason::NoData);
                contributions.push(contribution);
                continue;
            }
        };

        let age_ms = current_time_ms - last_update_ms;
        if age_ms > stale_threshold_ms(input.venue, market_type) {
            contribution.exclude_reason = Some(ExcludeReason::Stale);
            contributions.push(contribution);
            continue;
        }

        candidates.push((contributions.len(), price));
        contributions.push(contribution);
    }

    // The median is computed over connected, fresh venues only, so an
    // excluded price can never pollute the outlier test.
    let candidate_prices: Vec<f64> = candidates.iter().map(|(_, p)| *p).collect();
    let clean_median = median(&candidate_prices);

    let mut included_prices: Vec<f64> = Vec::with_capacity(candidates.len());
    for (idx, price) in &candidates {
        let contribution = &mut contributions[*idx];
        match clean_median {
            None => {
                contribution.included = true;
                contribution.deviation_bps = Some(0.0);
                included_prices.push(*price);
            }
            Some(m) => {
                let dev = deviation_bps(*price, m);
                contribution.deviation_bps = Some(dev);
                if dev > OUTLIER_THRESHOLD_BPS {
                    contribution.exclude_reason = Some(ExcludeReason::Outlier);
                } else {
                    contribution.included = true;
                    included_prices.push(*price);
                }
            }
        }
    }

    let included_count = included_prices.len();
    let is_gap = included_count < MIN_QUORUM;
    let degraded = included_count < PREFERRED_QUORUM || is_gap;
    let degraded_reason = derive_degraded_reason(&contributions, included_count, is_gap, degraded);

    CompositeResult {
        price: if is_gap { None } else { median(&included_prices) },
        venues: contributions,
        included_count,
        total_count,
        degraded,
        degraded_reason,
        is_gap,
    }
}

fn derive_degraded_reason(
    contributions: &[VenueContribution],
    included_count: usize,
    is_gap: bool,
    degraded: bool,
) -> DegradedReason {
    if !degraded {
        return DegradedReason::None;
    }

    let has = |reason: ExcludeReason| {
        contributions
            .iter()
            .any(|c| c.exclude_reason == Some(reason))
    };

    if is_gap {
        if has(ExcludeReason::Disconnected) {
            DegradedReason::VenueDisconnected
        } else if has(ExcludeReason::NoData) || has(ExcludeReason::Stale) {
            DegradedReason::VenueStale
        } else if has(ExcludeReason::Outlier) {
            DegradedReason::VenueOutlier
        } else if included_count == 1 {
            DegradedReason::SingleSource
        } else {
            DegradedReason::BelowPreferredQuorum
        }
    } else if has(ExcludeReason::Disconnected) {
        DegradedReason::VenueDisconnected
    } else if has(ExcludeReason::Stale) {
        DegradedReason::VenueStale
    } else if has(ExcludeReason::Outlier) {
        DegradedReason::VenueOutlier
    } else {
        DegradedReason::BelowPreferredQuorum
    }
}

/// Pre-summed order flow across the venues included by the close result.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowTotals {
    pub volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub buy_count: u32,
    pub sell_count: u32,
}

impl FlowTotals {
    /// Sum flow over the bars of venues included by the close composite.
    pub fn from_included(bars: &[(VenueId, &Bar)], close: &CompositeResult) -> Self {
        let included = close.included_venues();
        let mut totals = FlowTotals::default();
        for (venue, bar) in bars {
            if included.contains(venue) {
                totals.volume += bar.volume;
                totals.buy_volume += bar.buy_volume;
                totals.sell_volume += bar.sell_volume;
                totals.buy_count += bar.buy_count;
                totals.sell_count += bar.sell_count;
            }
        }
        totals
    }
}

/// Assemble a composite bar from the four component results.
///
/// The close result is the single source of truth for the included and
/// excluded venue lists (and therefore for the flow sums passed in); venue
/// sets could differ across O/H/L/C when connectivity changes intra-minute,
/// and a single deterministic set keeps the contract simple.
pub fn build_composite_bar(
    time: i64,
    open: &CompositeResult,
    high: &CompositeResult,
    low: &CompositeResult,
    close: &CompositeResult,
    flow: FlowTotals,
    asset: Asset,
    market_type: MarketType,
) -> CompositeBar {
    let is_gap = close.is_gap;
    let degraded = open.degraded || high.degraded || low.degraded || close.degraded;

    CompositeBar {
        time,
        open: if is_gap { None } else { open.price },
        high: if is_gap { None } else { high.price },
        low: if is_gap { None } else { low.price },
        close: if is_gap { None } else { close.price },
        volume: if is_gap { 0.0 } else { flow.volume },
        buy_volume: if is_gap { 0.0 } else { flow.buy_volume },
        sell_volume: if is_gap { 0.0 } else { flow.sell_volume },
        buy_count: if is_gap { 0 } else { flow.buy_count },
        sell_count: if is_gap { 0 } else { flow.sell_count },
        degraded,
        is_gap,
        is_backfilled: false,
        included_venues: close.included_venues(),
        excluded_venues: close.excluded_venues(),
        asset,
        market_type,
    }
}
