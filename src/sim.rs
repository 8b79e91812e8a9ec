// ─────────────────────────────────────────────────────────────────────────────
// sim.rs — Simulated fill engine
//
// In dry-run the engine keeps the grid's resting orders in memory; with
// simulate_fill it also matches them against each observed BBO and tracks
// position and P&L in exact decimal arithmetic. The loop reads the same
// observational surface it would get from the venue: open orders, position,
// trades, P&L.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::quant::to_scaled_int;
use crate::trader::OpenOrder;

#[derive(Debug, Clone)]
pub struct SimOrder {
    pub price: Decimal,
    pub base_qty: Decimal,
    pub is_ask: bool,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct SimTrade {
    pub ts_ms: i64,
    pub price: Decimal,
    pub size: Decimal,
    pub is_ask: bool,
}

/// Per-symbol simulated venue state. Reset on every manual start.
#[derive(Debug, Clone, Default)]
pub struct SimState {
    pub orders: BTreeMap<u64, SimOrder>,
    pub trades: Vec<SimTrade>,
    pub position_base: Decimal,
    pub position_cost: Decimal,
    pub realized_pnl: Decimal,
    pub last_mid: Decimal,
}

impl SimState {
    pub fn add_order(&mut self, cid: u64, price: Decimal, base_qty: Decimal, is_ask: bool, ts_ms: i64) {
        self.orders.insert(
            cid,
            SimOrder {
                price,
                base_qty,
                is_ask,
                created_at_ms: ts_ms,
            },
        );
    }

    pub fn cancel_order(&mut self, cid: u64) -> bool {
        self.orders.remove(&cid).is_some()
    }

    pub fn clear_orders(&mut self) {
        self.orders.clear();
    }

    /// The resting book in the loop's normalized shape. The CID doubles as
    /// the venue order id, mirroring venues that key orders by client index.
    pub fn open_orders(&self, price_decimals: u32, size_decimals: u32) -> Vec<OpenOrder> {
        self.orders
            .iter()
            .map(|(cid, o)| OpenOrder {
                client_order_id: *cid,
                order_id: *cid as i64,
                is_ask: o.is_ask,
                price_int: to_scaled_int(o.price, price_decimals).unwrap_or(0),
                size_int: to_scaled_int(o.base_qty, size_decimals).unwrap_or(0),
                status: "open".to_string(),
                created_at_ms: o.created_at_ms,
            })
            .collect()
    }

    /// Crosses the resting book against an observed BBO: an ask fills when
    /// the bid reaches its price, a bid when the ask falls to its price.
    /// Whole orders fill at their own limit price. Returns the fill count.
    pub fn match_bbo(&mut self, bid: Decimal, ask: Decimal, ts_ms: i64) -> usize {
        let crossed: Vec<u64> = self
            .orders
            .iter()
            .filter(|(_, o)| {
                if o.is_ask {
                    bid >= o.price
                } else {
                    ask <= o.price
                }
            })
            .map(|(cid, _)| *cid)
            .collect();

        for cid in &crossed {
            if let Some(order) = self.orders.remove(cid) {
                self.apply_fill(order.is_ask, order.price, order.base_qty, ts_ms);
            }
        }
        crossed.len()
    }

    /// Books one fill. Fills in the direction of the current position (or on
    /// a flat book) extend it at cost; fills against it realize P&L versus
    /// the average entry and any excess flips the position with the fill
    /// price as the new basis.
    pub fn apply_fill(&mut self, is_ask: bool, price: Decimal, size: Decimal, ts_ms: i64) {
        self.trades.push(SimTrade {
            ts_ms,
            price,
            size,
            is_ask,
        });
        apply_fill_to_position(
            &mut self.position_base,
            &mut self.position_cost,
            &mut self.realized_pnl,
            is_ask,
            price,
            size,
        );
    }

    /// Realized plus mark-to-mid unrealized P&L.
    pub fn pnl(&self, mid: Decimal) -> Decimal {
        self.realized_pnl + mid * self.position_base - self.position_cost
    }

    /// (Σ |price·size|, count) over trades in [t0_ms, t1_ms].
    pub fn trade_stats(&self, t0_ms: i64, t1_ms: i64) -> (Decimal, u64) {
        let mut volume = Decimal::ZERO;
        let mut count = 0u64;
        for trade in &self.trades {
            if trade.ts_ms < t0_ms || trade.ts_ms > t1_ms {
                continue;
            }
            volume += (trade.price * trade.size).abs();
            count += 1;
        }
        (volume, count)
    }
}

/// Shared fill bookkeeping: the simulated book and the live own-trade cursor
/// run the same arithmetic so dry and live P&L cannot drift apart.
pub fn apply_fill_to_position(
    position_base: &mut Decimal,
    position_cost: &mut Decimal,
    realized_pnl: &mut Decimal,
    is_ask: bool,
    price: Decimal,
    size: Decimal,
) {
    let signed = if is_ask { -size } else { size };
    let flat = position_base.is_zero();
    let extends = flat || (*position_base > Decimal::ZERO) == (signed > Decimal::ZERO);

    if extends {
        *position_base += signed;
        *position_cost += signed * price;
        return;
    }

    let avg_entry = (*position_cost / *position_base).abs();
    let held = position_base.abs();
    let cover = size.min(held);
    let direction = if *position_base > Decimal::ZERO {
        Decimal::ONE
    } else {
        Decimal::NEGATIVE_ONE
    };
    // Long closed by a sell earns price − entry; short closed by a buy earns
    // entry − price.
    *realized_pnl += (price - avg_entry) * cover * direction;
    *position_base -= cover * direction;
    *position_cost -= avg_entry * cover * direction;

    let residual = size - cover;
    if residual > Decimal::ZERO {
        let flipped = -direction * residual;
        *position_base = flipped;
        *position_cost = flipped * price;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ask_fills_when_bid_reaches_price() {
        let mut sim = SimState::default();
        sim.add_order(11001, dec!(101.50), dec!(0.1), true, 0);
        sim.add_order(11002, dec!(102.50), dec!(0.1), true, 0);

        assert_eq!(sim.match_bbo(dec!(101.50), dec!(101.70), 1_000), 1);
        assert!(!sim.orders.contains_key(&11001));
        assert!(sim.orders.contains_key(&11002));
        assert_eq!(sim.position_base, dec!(-0.1));
    }

    #[test]
    fn test_bid_fills_when_ask_drops_to_price() {
        let mut sim = SimState::default();
        sim.add_order(16001, dec!(99.50), dec!(0.2), false, 0);

        assert_eq!(sim.match_bbo(dec!(99.30), dec!(99.50), 1_000), 1);
        assert_eq!(sim.position_base, dec!(0.2));
        assert_eq!(sim.position_cost, dec!(19.900));
    }

    #[test]
    fn test_no_fill_inside_touch() {
        let mut sim = SimState::default();
        sim.add_order(11001, dec!(101.50), dec!(0.1), true, 0);
        sim.add_order(16001, dec!(99.50), dec!(0.1), false, 0);
        assert_eq!(sim.match_bbo(dec!(100.40), dec!(100.60), 1_000), 0);
        assert_eq!(sim.orders.len(), 2);
    }

    #[test]
    fn test_round_trip_same_price_realizes_zero() {
        let mut sim = SimState::default();
        sim.apply_fill(false, dec!(100.10), dec!(0.3), 0);
        sim.apply_fill(true, dec!(100.10), dec!(0.3), 1);
        assert_eq!(sim.realized_pnl, Decimal::ZERO);
        assert_eq!(sim.position_base, Decimal::ZERO);
        assert_eq!(sim.position_cost, Decimal::ZERO);
    }

    #[test]
    fn test_long_round_trip_with_profit() {
        let mut sim = SimState::default();
        sim.apply_fill(false, dec!(100), dec!(1), 0);
        sim.apply_fill(false, dec!(102), dec!(1), 1); // avg entry 101
        sim.apply_fill(true, dec!(103), dec!(2), 2);
        assert_eq!(sim.realized_pnl, dec!(4));
        assert_eq!(sim.position_base, Decimal::ZERO);
        assert_eq!(sim.position_cost, Decimal::ZERO);
    }

    #[test]
    fn test_short_reduce_and_flip() {
        let mut sim = SimState::default();
        sim.apply_fill(true, dec!(100), dec!(1), 0); // short 1 @ 100
        sim.apply_fill(false, dec!(98), dec!(1.5), 1); // cover 1, flip long 0.5 @ 98

        assert_eq!(sim.realized_pnl, dec!(2)); // (100 − 98) × 1
        assert_eq!(sim.position_base, dec!(0.5));
        assert_eq!(sim.position_cost, dec!(49.0));
    }

    #[test]
    fn test_pnl_marks_open_position_to_mid() {
        let mut sim = SimState::default();
        sim.apply_fill(false, dec!(100), dec!(2), 0);
        assert_eq!(sim.pnl(dec!(101)), dec!(2));
        assert_eq!(sim.pnl(dec!(99)), dec!(-2));
    }

    #[test]
    fn test_trade_stats_window() {
        let mut sim = SimState::default();
        sim.apply_fill(false, dec!(100), dec!(1), 1_000);
        sim.apply_fill(true, dec!(101), dec!(1), 2_000);
        sim.apply_fill(false, dec!(99), dec!(1), 9_000);

        let (volume, count) = sim.trade_stats(0, 5_000);
        assert_eq!(count, 2);
        assert_eq!(volume, dec!(201));
    }

    #[test]
    fn test_open_orders_normalized_view() {
        let mut sim = SimState::default();
        sim.add_order(11001, dec!(101.50), dec!(0.0985), true, 5);
        let orders = sim.open_orders(2, 4);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].client_order_id, 11001);
        assert_eq!(orders[0].price_int, 10150);
        assert_eq!(orders[0].size_int, 985);
        assert!(orders[0].is_ask);
    }
}
