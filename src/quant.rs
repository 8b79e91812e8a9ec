// ─────────────────────────────────────────────────────────────────────────────
// quant.rs — Price/size quantization on the venue's tick and lot grids
//
// Prices round half-up, sizes round down. Anything that leaves this module
// for the wire is an integer scaled by 10^decimals; no binary floats touch
// order values anywhere in the engine.
// ─────────────────────────────────────────────────────────────────────────────
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// 10^decimals as a Decimal. Clamped to the mantissa's reach.
pub fn pow10(decimals: u32) -> Decimal {
    Decimal::from_i128_with_scale(10i128.pow(decimals.min(28)), 0)
}

/// One tick / lot on a grid with the given number of decimals.
pub fn unit(decimals: u32) -> Decimal {
    Decimal::new(1, decimals.min(28))
}

/// Rounds a price half-up onto the tick grid.
pub fn quantize_price(value: Decimal, price_decimals: u32) -> Decimal {
    value.round_dp_with_strategy(price_decimals, RoundingStrategy::MidpointAwayFromZero)
}

/// Rounds a size down onto the lot grid.
pub fn quantize_size(value: Decimal, size_decimals: u32) -> Decimal {
    value.round_dp_with_strategy(size_decimals, RoundingStrategy::ToZero)
}

/// Scales an already-quantized value into integer wire units.
pub fn to_scaled_int(value: Decimal, decimals: u32) -> Option<i64> {
    let scaled = value.checked_mul(pow10(decimals))?;
    scaled
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Inverse of `to_scaled_int`.
pub fn from_scaled_int(value: i64, decimals: u32) -> Decimal {
    Decimal::from(value) / pow10(decimals)
}

/// Number of decimal places implied by a tick-size string such as "0.01".
/// Returns 0 for non-positive or unparsable steps.
pub fn decimals_from_step(step: &str) -> u32 {
    match step.trim().parse::<Decimal>() {
        Ok(d) if d > Decimal::ZERO => d.normalize().scale(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_rounds_half_up() {
        assert_eq!(quantize_price(dec!(100.505), 2), dec!(100.51));
        assert_eq!(quantize_price(dec!(100.504), 2), dec!(100.50));
        assert_eq!(quantize_price(dec!(100.5), 0), dec!(101));
    }

    #[test]
    fn test_size_rounds_down() {
        assert_eq!(quantize_size(dec!(0.09949), 4), dec!(0.0994));
        assert_eq!(quantize_size(dec!(0.10059), 4), dec!(0.1005));
        assert_eq!(quantize_size(dec!(1.9999), 0), dec!(1));
    }

    #[test]
    fn test_scaled_int_round_trip() {
        let q = quantize_price(dec!(101.5), 2);
        let i = to_scaled_int(q, 2).unwrap();
        assert_eq!(i, 10150);
        assert_eq!(from_scaled_int(i, 2), dec!(101.50));
    }

    #[test]
    fn test_scaled_int_size_example() {
        // 10 notional at 100.50 → 0.0995024..., floored to 4 decimals.
        let base = quantize_size(dec!(10) / dec!(100.50), 4);
        assert_eq!(base, dec!(0.0995));
        assert_eq!(to_scaled_int(base, 4).unwrap(), 995);
    }

    #[test]
    fn test_decimals_from_step() {
        assert_eq!(decimals_from_step("0.01"), 2);
        assert_eq!(decimals_from_step("0.000100"), 4);
        assert_eq!(decimals_from_step("1"), 0);
        assert_eq!(decimals_from_step("0"), 0);
        assert_eq!(decimals_from_step("abc"), 0);
    }
}
