// ─────────────────────────────────────────────────────────────────────────────
// indicator.rs — Mid-price window and Avellaneda–Stoikov quoting
//
// σ is estimated from dt-normalized mid increments so an irregular tick
// cadence does not bias the estimate: x_i = (p_i − p_{i−1}) / √dt_i, and σ is
// the sample standard deviation of the x_i.
// ─────────────────────────────────────────────────────────────────────────────
use rust_decimal::{Decimal, MathematicalOps};

use crate::quant::{quantize_price, unit};

/// Bounded sliding window of (ts_ms, mid) samples.
#[derive(Debug, Clone, Default)]
pub struct MidWindow {
    samples: Vec<(i64, Decimal)>,
    capacity: usize,
}

impl MidWindow {
    pub fn new(vol_points: usize) -> Self {
        Self {
            samples: Vec::new(),
            capacity: vol_points.max(2) + 1,
        }
    }

    /// Re-bounds the window when the configured point count changes.
    pub fn ensure_capacity(&mut self, vol_points: usize) {
        let capacity = vol_points.max(2) + 1;
        if self.capacity != capacity {
            self.capacity = capacity;
            if self.samples.len() > capacity {
                let drop = self.samples.len() - capacity;
                self.samples.drain(..drop);
            }
        }
    }

    pub fn push(&mut self, ts_ms: i64, mid: Decimal) {
        self.samples.push((ts_ms, mid));
        if self.samples.len() > self.capacity {
            let drop = self.samples.len() - self.capacity;
            self.samples.drain(..drop);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample standard deviation of dt-normalized increments; zero until at
    /// least three samples (two increments) are available.
    pub fn sigma(&self) -> Decimal {
        let mut xs: Vec<Decimal> = Vec::with_capacity(self.samples.len());
        for w in self.samples.windows(2) {
            let ((t0, p0), (t1, p1)) = (w[0], w[1]);
            let dt_ms = t1 - t0;
            if dt_ms <= 0 {
                continue;
            }
            let dt = Decimal::from(dt_ms) / Decimal::from(1000);
            let Some(sqrt_dt) = dt.sqrt() else { continue };
            if sqrt_dt <= Decimal::ZERO {
                continue;
            }
            xs.push((p1 - p0) / sqrt_dt);
        }
        if xs.len() < 2 {
            return Decimal::ZERO;
        }
        let n = Decimal::from(xs.len() as u64);
        let mean = xs.iter().copied().sum::<Decimal>() / n;
        let var = xs
            .iter()
            .map(|x| {
                let d = *x - mean;
                d * d
            })
            .sum::<Decimal>()
            / (n - Decimal::ONE);
        var.sqrt().unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AsParams {
    pub gamma: Decimal,
    pub k: Decimal,
    pub tau: Decimal,
    pub step_multiplier: Decimal,
}

/// One AS quote: the grid centers on `center` and places a single ask at
/// `center + step` and a single bid at `center − step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsQuote {
    pub center: Decimal,
    pub step: Decimal,
}

/// Reservation price and half-spread per Avellaneda–Stoikov:
///   spread = γσ²τ + (2/γ)·ln(1 + γ/k)
///   r      = S − qγσ²τ
/// The half-step is floored at one tick and both outputs are quantized onto
/// the market's price grid.
pub fn as_quote(
    mid: Decimal,
    position_base: Decimal,
    sigma: Decimal,
    params: &AsParams,
    price_decimals: u32,
) -> Option<AsQuote> {
    if params.gamma <= Decimal::ZERO || params.k <= Decimal::ZERO || params.tau <= Decimal::ZERO {
        return None;
    }
    let gamma_sigma2_tau = params.gamma * sigma * sigma * params.tau;
    let log_arg = Decimal::ONE + params.gamma / params.k;
    let log_term = (Decimal::TWO / params.gamma) * log_arg.checked_ln()?;
    let spread = gamma_sigma2_tau + log_term;

    let tick = unit(price_decimals);
    let half = spread / Decimal::TWO * params.step_multiplier;
    let step = quantize_price(half.max(tick), price_decimals).max(tick);

    let reservation = mid - position_base * gamma_sigma2_tau;
    let center = quantize_price(reservation, price_decimals);
    if center <= Decimal::ZERO {
        return None;
    }
    Some(AsQuote { center, step })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn params() -> AsParams {
        AsParams {
            gamma: dec!(0.1),
            k: dec!(1.5),
            tau: dec!(30),
            step_multiplier: dec!(1),
        }
    }

    #[test]
    fn test_window_is_bounded() {
        let mut w = MidWindow::new(3);
        for i in 0..10 {
            w.push(i * 1_000, dec!(100) + Decimal::from(i));
        }
        assert_eq!(w.len(), 4); // vol_points + 1
    }

    #[test]
    fn test_sigma_zero_for_constant_mid() {
        let mut w = MidWindow::new(10);
        for i in 0..8 {
            w.push(i * 1_000, dec!(100));
        }
        assert_eq!(w.sigma(), Decimal::ZERO);
    }

    #[test]
    fn test_sigma_dt_normalization() {
        // Same price path sampled at 1 s and at 4 s spacing: the 4 s samples
        // move 4× further per step, but √dt halves the normalized increment
        // twice as much, so per-√s increments match and σ stays comparable.
        let mut fast = MidWindow::new(20);
        let mut slow = MidWindow::new(20);
        for i in 0..10i64 {
            let drift = if i % 2 == 0 { dec!(0.5) } else { dec!(-0.5) };
            fast.push(i * 1_000, dec!(100) + drift);
            slow.push(i * 4_000, dec!(100) + drift * dec!(2));
        }
        let sf = fast.sigma();
        let ss = slow.sigma();
        assert!(sf > Decimal::ZERO);
        assert!(ss > Decimal::ZERO);
        assert!((sf - ss).abs() < dec!(0.000001));
    }

    #[test]
    fn test_sigma_ignores_non_advancing_timestamps() {
        let mut w = MidWindow::new(10);
        w.push(1_000, dec!(100));
        w.push(1_000, dec!(105)); // dt = 0, skipped
        w.push(2_000, dec!(101));
        w.push(3_000, dec!(100));
        assert!(w.sigma() > Decimal::ZERO);
    }

    #[test]
    fn test_as_quote_worked_example() {
        // σ = 0.5, γ = 0.1, k = 1.5, τ = 30:
        //   spread = 0.1·0.25·30 + 20·ln(1 + 0.1/1.5) ≈ 0.75 + 1.291 = 2.041
        //   half-step ≈ 1.02 on a 2-decimal grid.
        let q = as_quote(dec!(100.50), Decimal::ZERO, dec!(0.5), &params(), 2).unwrap();
        assert_eq!(q.center, dec!(100.50)); // q = 0 → reservation = mid
        assert_eq!(q.step, dec!(1.02));
    }

    #[test]
    fn test_as_quote_inventory_skews_reservation_down_when_long() {
        let q = as_quote(dec!(100.00), dec!(2), dec!(0.5), &params(), 2).unwrap();
        // r = 100 − 2·0.75 = 98.50
        assert_eq!(q.center, dec!(98.50));
    }

    #[test]
    fn test_as_quote_step_floors_at_tick() {
        // Tiny σ and a huge k make the spread nearly zero; step must still be
        // at least one tick.
        let p = AsParams {
            gamma: dec!(0.0001),
            k: dec!(1000000),
            tau: dec!(1),
            step_multiplier: dec!(1),
        };
        let q = as_quote(dec!(100), Decimal::ZERO, Decimal::ZERO, &p, 2).unwrap();
        assert_eq!(q.step, dec!(0.01));
    }

    #[test]
    fn test_as_quote_rejects_bad_params() {
        let p = AsParams {
            gamma: Decimal::ZERO,
            ..params()
        };
        assert!(as_quote(dec!(100), Decimal::ZERO, dec!(0.5), &p, 2).is_none());
    }
}
