// ─────────────────────────────────────────────────────────────────────────────
// reconcile.rs — Pure grid planning and reconciliation helpers
//
// Everything in here is I/O-free: the control loop feeds observed state in
// and gets cancel/create plans out, which keeps the tricky split logic unit
// testable without a venue.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::{Decimal, RoundingStrategy};

use crate::config::OrderSizeMode;
use crate::ids::{Side, MAX_LEVEL_PER_SIDE};
use crate::quant::{quantize_price, quantize_size};
use crate::trader::{MarketMeta, OpenOrder};

/// Snaps the mid onto the grid-step lattice: round_half_up(mid/step)·step.
pub fn snap_center(mid: Decimal, step: Decimal, price_decimals: u32) -> Decimal {
    let steps = (mid / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    quantize_price(steps * step, price_decimals)
}

/// Stable dedup of a price list.
pub fn unique_prices(prices: &[Decimal]) -> Vec<Decimal> {
    let mut seen = BTreeSet::new();
    prices
        .iter()
        .filter(|p| seen.insert(**p))
        .copied()
        .collect()
}

/// Desired ask/bid prices around `center`, non-positive prices dropped.
pub fn dynamic_grid_prices(
    center: Decimal,
    step: Decimal,
    levels_up: u64,
    levels_down: u64,
    price_decimals: u32,
) -> (Vec<Decimal>, Vec<Decimal>) {
    let mut asks = Vec::with_capacity(levels_up as usize);
    for i in 1..=levels_up {
        let price = quantize_price(center + step * Decimal::from(i), price_decimals);
        if price > Decimal::ZERO {
            asks.push(price);
        }
    }
    let mut bids = Vec::with_capacity(levels_down as usize);
    for i in 1..=levels_down {
        let price = quantize_price(center - step * Decimal::from(i), price_decimals);
        if price > Decimal::ZERO {
            bids.push(price);
        }
    }
    (unique_prices(&asks), unique_prices(&bids))
}

/// Groups one side's open orders by quantized price.
pub fn group_orders_by_price(
    orders: &[OpenOrder],
    is_ask: bool,
    price_decimals: u32,
) -> BTreeMap<Decimal, Vec<OpenOrder>> {
    let mut grouped: BTreeMap<Decimal, Vec<OpenOrder>> = BTreeMap::new();
    for order in orders.iter().filter(|o| o.is_ask == is_ask) {
        let price = crate::quant::from_scaled_int(order.price_int, price_decimals);
        grouped.entry(price).or_default().push(order.clone());
    }
    grouped
}

/// Strict target matching: for each priced bucket, keep the first order when
/// the price is a target (cancel duplicates), cancel everything else. Used
/// directly in AS mode and as the building block of the dynamic split.
pub fn split_cancel_keep_by_target(
    orders_by_price: &BTreeMap<Decimal, Vec<OpenOrder>>,
    targets: &BTreeSet<Decimal>,
) -> (Vec<(OpenOrder, Decimal)>, BTreeSet<Decimal>) {
    let mut cancels = Vec::new();
    let mut kept = BTreeSet::new();
    for (price, orders) in orders_by_price {
        if orders.is_empty() {
            continue;
        }
        if targets.contains(price) {
            kept.insert(*price);
            for order in &orders[1..] {
                cancels.push((order.clone(), *price));
            }
        } else {
            for order in orders {
                cancels.push((order.clone(), *price));
            }
        }
    }
    (cancels, kept)
}

/// Dynamic-mode split: targets keep exactly one order, prices beyond the
/// band's far edge are cancelled, inside-band strays are left alone so the
/// grid does not churn as the center wobbles. An empty target set clears the
/// whole side.
pub fn split_cancel_keep_banded(
    orders_by_price: &BTreeMap<Decimal, Vec<OpenOrder>>,
    targets: &BTreeSet<Decimal>,
    side: Side,
) -> (Vec<(OpenOrder, Decimal)>, BTreeSet<Decimal>) {
    let Some(edge) = (match side {
        Side::Ask => targets.iter().next_back(),
        Side::Bid => targets.iter().next(),
    }) else {
        return split_cancel_keep_by_target(orders_by_price, targets);
    };

    let mut cancels = Vec::new();
    let mut kept = BTreeSet::new();
    for (price, orders) in orders_by_price {
        if orders.is_empty() {
            continue;
        }
        if targets.contains(price) {
            kept.insert(*price);
            for order in &orders[1..] {
                cancels.push((order.clone(), *price));
            }
            continue;
        }
        let out_of_band = match side {
            Side::Ask => price > edge,
            Side::Bid => price < edge,
        };
        if out_of_band {
            for order in orders {
                cancels.push((order.clone(), *price));
            }
        }
        // Inside the band but not a target: leave resting.
    }
    (cancels, kept)
}

/// Missing prices on one side: desired minus kept.
pub fn missing_prices(desired: &[Decimal], kept: &BTreeSet<Decimal>) -> Vec<Decimal> {
    desired
        .iter()
        .filter(|p| !kept.contains(p))
        .copied()
        .collect()
}

/// Orders the placement candidates closest-to-center first; ties go to the
/// ask side.
pub fn interleave_by_distance(
    center: Decimal,
    missing_asks: &[Decimal],
    missing_bids: &[Decimal],
) -> Vec<(Side, Decimal)> {
    let mut plan: Vec<(Side, Decimal)> = missing_asks
        .iter()
        .map(|p| (Side::Ask, *p))
        .chain(missing_bids.iter().map(|p| (Side::Bid, *p)))
        .collect();
    plan.sort_by(|a, b| {
        let da = (a.1 - center).abs();
        let db = (b.1 - center).abs();
        da.cmp(&db)
            .then_with(|| a.0.is_ask().cmp(&b.0.is_ask()).reverse())
            .then_with(|| a.1.cmp(&b.1))
    });
    plan
}

/// Smallest free level in [1, MAX_LEVEL_PER_SIDE].
pub fn pick_level(used: &BTreeSet<u64>) -> Option<u64> {
    (1..=MAX_LEVEL_PER_SIDE).find(|level| !used.contains(level))
}

/// Smallest free level at or after `cursor`, wrapping to the smallest free
/// level when the tail is exhausted. Returns (level, next_cursor).
pub fn pick_level_with_cursor(used: &BTreeSet<u64>, cursor: u64) -> Option<(u64, u64)> {
    let cursor = cursor.clamp(1, MAX_LEVEL_PER_SIDE);
    let level = (cursor..=MAX_LEVEL_PER_SIDE)
        .find(|level| !used.contains(level))
        .or_else(|| (1..cursor).find(|level| !used.contains(level)))?;
    let next = if level >= MAX_LEVEL_PER_SIDE { 1 } else { level + 1 };
    Some((level, next))
}

/// Base quantity for one order, floored onto the lot grid and checked against
/// the venue minimums. `None` means the order cannot be placed at this price.
pub fn derive_base_qty(
    size_mode: OrderSizeMode,
    size_value: Decimal,
    price: Decimal,
    multiplier: Decimal,
    meta: &MarketMeta,
) -> Option<Decimal> {
    if price <= Decimal::ZERO {
        return None;
    }
    let raw = match size_mode {
        OrderSizeMode::Base => size_value,
        OrderSizeMode::Notional => size_value / price,
    };
    let base = quantize_size(raw * multiplier, meta.size_decimals);
    if base <= Decimal::ZERO || base < meta.min_base_amount {
        return None;
    }
    if base * price < meta.min_quote_amount {
        return None;
    }
    Some(base)
}
