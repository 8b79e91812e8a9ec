// ─────────────────────────────────────────────────────────────────────────────
// ids.rs — Deterministic client-order-ID namespace
//
// Every grid order carries a client order ID of the form
//   prefix * 10_000 + side_offset + level
// where `prefix` is derived from (account, market, symbol). The block layout
// makes ownership an O(1) integer test, so after a restart the engine only
// ever touches orders it placed itself.
// ─────────────────────────────────────────────────────────────────────────────

pub const CLIENT_ORDER_PREFIX_MOD: u64 = 10_000;
pub const CLIENT_ORDER_BLOCK: u64 = 10_000;
pub const CLIENT_ORDER_OFFSET_ASK: u64 = 1_000;
pub const CLIENT_ORDER_OFFSET_BID: u64 = 6_000;
pub const MAX_LEVEL_PER_SIDE: u64 = 3_999;
/// Largest client order ID the venue accepts (48 bits).
pub const CLIENT_ORDER_MAX: u64 = 281_474_976_710_655;

/// Order side as encoded into the CID block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Ask,
    Bid,
}

impl Side {
    pub fn is_ask(self) -> bool {
        matches!(self, Side::Ask)
    }

    pub fn from_is_ask(is_ask: bool) -> Self {
        if is_ask {
            Side::Ask
        } else {
            Side::Bid
        }
    }

    fn offset(self) -> u64 {
        match self {
            Side::Ask => CLIENT_ORDER_OFFSET_ASK,
            Side::Bid => CLIENT_ORDER_OFFSET_BID,
        }
    }
}

/// CRC32 of "account:market:symbol", folded into the prefix space.
pub fn grid_prefix(account_key: &str, market_id: &str, symbol: &str) -> u64 {
    let raw = format!("{account_key}:{market_id}:{symbol}");
    u64::from(crc32fast::hash(raw.as_bytes())) % CLIENT_ORDER_PREFIX_MOD
}

/// Builds the CID for (prefix, side, level). Returns `None` when the level is
/// out of range or the result would not fit the venue's 48-bit ID space.
pub fn grid_client_order_id(prefix: u64, side: Side, level: u64) -> Option<u64> {
    if level < 1 || level > MAX_LEVEL_PER_SIDE {
        return None;
    }
    let cid = prefix
        .checked_mul(CLIENT_ORDER_BLOCK)?
        .checked_add(side.offset() + level)?;
    if cid > CLIENT_ORDER_MAX {
        return None;
    }
    Some(cid)
}

/// True when `cid` belongs to this engine instance's block.
pub fn is_grid_client_order(prefix: u64, cid: u64) -> bool {
    cid / CLIENT_ORDER_BLOCK == prefix
}

/// Recovers (side, level) from a CID, independent of the prefix.
pub fn grid_side_level(cid: u64) -> Option<(Side, u64)> {
    let within = cid % CLIENT_ORDER_BLOCK;
    if within >= CLIENT_ORDER_OFFSET_BID {
        let level = within - CLIENT_ORDER_OFFSET_BID;
        if (1..=MAX_LEVEL_PER_SIDE).contains(&level) {
            return Some((Side::Bid, level));
        }
        return None;
    }
    if within >= CLIENT_ORDER_OFFSET_ASK {
        let level = within - CLIENT_ORDER_OFFSET_ASK;
        if (1..=MAX_LEVEL_PER_SIDE).contains(&level) {
            return Some((Side::Ask, level));
        }
        return None;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_is_stable_and_bounded() {
        let p1 = grid_prefix("7", "1", "ETH");
        let p2 = grid_prefix("7", "1", "ETH");
        assert_eq!(p1, p2);
        assert!(p1 < CLIENT_ORDER_PREFIX_MOD);
        // Different symbol must not collide into the same triple.
        assert_ne!(grid_prefix("7", "1", "ETH"), grid_prefix("7", "1", "BTC"));
    }

    #[test]
    fn test_cid_round_trip_all_levels() {
        let prefix = grid_prefix("42", "3", "SOL");
        for level in [1, 2, 500, MAX_LEVEL_PER_SIDE] {
            for side in [Side::Ask, Side::Bid] {
                let cid = grid_client_order_id(prefix, side, level).unwrap();
                assert!(is_grid_client_order(prefix, cid));
                assert!(cid <= CLIENT_ORDER_MAX);
                assert_eq!(grid_side_level(cid), Some((side, level)));
            }
        }
    }

    #[test]
    fn test_cid_rejects_bad_levels() {
        let prefix = 1234;
        assert_eq!(grid_client_order_id(prefix, Side::Ask, 0), None);
        assert_eq!(
            grid_client_order_id(prefix, Side::Bid, MAX_LEVEL_PER_SIDE + 1),
            None
        );
    }

    #[test]
    fn test_cid_rejects_overflow_past_venue_max() {
        // A prefix far outside the CRC32-mod space would run past 48 bits.
        let huge_prefix = CLIENT_ORDER_MAX / CLIENT_ORDER_BLOCK + 1;
        assert_eq!(grid_client_order_id(huge_prefix, Side::Ask, 1), None);
    }

    #[test]
    fn test_sides_cannot_collide_within_prefix() {
        let prefix = 999;
        let ask = grid_client_order_id(prefix, Side::Ask, 7).unwrap();
        let bid = grid_client_order_id(prefix, Side::Bid, 7).unwrap();
        assert_ne!(ask, bid);
        assert_eq!(bid - ask, CLIENT_ORDER_OFFSET_BID - CLIENT_ORDER_OFFSET_ASK);
    }

    #[test]
    fn test_foreign_cid_is_not_ours() {
        let prefix = grid_prefix("7", "1", "ETH");
        let other = (prefix + 1) % CLIENT_ORDER_PREFIX_MOD;
        let cid = grid_client_order_id(other, Side::Bid, 3).unwrap();
        assert!(!is_grid_client_order(prefix, cid));
    }

    #[test]
    fn test_decode_rejects_gap_regions() {
        // Residues below the ask offset or in the dead zone between the ask
        // band and the bid offset decode to nothing.
        assert_eq!(grid_side_level(10_000 * 5 + 999), None);
        assert_eq!(grid_side_level(10_000 * 5 + 5_500), None);
        assert_eq!(grid_side_level(10_000 * 5 + 1_000), None); // level 0
        assert_eq!(grid_side_level(10_000 * 5 + 6_000), None);
    }
}
