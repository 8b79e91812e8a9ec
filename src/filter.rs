// ─────────────────────────────────────────────────────────────────────────────
// filter.rs — ATR/ADX market regime filter
//
// Grid quoting bleeds in trending or dead-flat markets. The filter aggregates
// observed mids into 1-minute OHLC bars and blocks quoting when volatility is
// outside [atr_pct_min, atr_pct_max] or trend strength (ADX) is above adx_max.
// Recovery from a block requires `recover_pass_count` consecutive passing
// evaluations; a block outliving `block_timeout_minutes` asks the loop to stop.
// ─────────────────────────────────────────────────────────────────────────────
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const BAR_INTERVAL_MS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OhlcBar {
    pub ts_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketFilterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_period")]
    pub atr_period: usize,
    #[serde(default = "default_period")]
    pub adx_period: usize,
    #[serde(default = "default_atr_pct_min")]
    pub atr_pct_min: Decimal,
    #[serde(default = "default_atr_pct_max")]
    pub atr_pct_max: Decimal,
    #[serde(default = "default_adx_max")]
    pub adx_max: Decimal,
    #[serde(default = "default_recover_pass_count")]
    pub recover_pass_count: u32,
    #[serde(default = "default_block_timeout_minutes")]
    pub block_timeout_minutes: Decimal,
}

fn default_period() -> usize {
    14
}
fn default_atr_pct_min() -> Decimal {
    Decimal::new(2, 3) // 0.002
}
fn default_atr_pct_max() -> Decimal {
    Decimal::new(2, 2) // 0.02
}
fn default_adx_max() -> Decimal {
    Decimal::from(28)
}
fn default_recover_pass_count() -> u32 {
    3
}
fn default_block_timeout_minutes() -> Decimal {
    Decimal::from(30)
}

impl Default for MarketFilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            atr_period: default_period(),
            adx_period: default_period(),
            atr_pct_min: default_atr_pct_min(),
            atr_pct_max: default_atr_pct_max(),
            adx_max: default_adx_max(),
            recover_pass_count: default_recover_pass_count(),
            block_timeout_minutes: default_block_timeout_minutes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Off,
    Warmup,
    Block,
    Pass,
}

impl FilterState {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterState::Off => "off",
            FilterState::Warmup => "warmup",
            FilterState::Block => "block",
            FilterState::Pass => "pass",
        }
    }
}

/// Mutable filter state carried between evaluations.
#[derive(Debug, Clone)]
pub struct MarketFilterRuntime {
    pub state: FilterState,
    pub reason: String,
    pub pass_streak: u32,
    pub block_started_ms: i64,
    pub block_seconds: i64,
    pub atr_pct: Option<Decimal>,
    pub adx: Option<Decimal>,
}

impl Default for MarketFilterRuntime {
    fn default() -> Self {
        Self {
            state: FilterState::Off,
            reason: "disabled".to_string(),
            pass_streak: 0,
            block_started_ms: 0,
            block_seconds: 0,
            atr_pct: None,
            adx: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketFilterDecision {
    pub state: FilterState,
    pub reason: String,
    pub atr_pct: Option<Decimal>,
    pub adx: Option<Decimal>,
    pub pass_streak: u32,
    pub block_seconds: i64,
    /// Keep cancels running but place no new grid orders.
    pub close_only: bool,
    /// The block has lasted past the configured timeout.
    pub timeout_stop: bool,
}

/// Folds one observed mid into the per-minute bar sequence.
pub fn update_ohlc_bars(bars: &mut Vec<OhlcBar>, ts_ms: i64, price: Decimal, max_bars: usize) {
    let bucket = ts_ms - ts_ms.rem_euclid(BAR_INTERVAL_MS);
    match bars.last_mut() {
        Some(bar) if bar.ts_ms == bucket => {
            if price > bar.high {
                bar.high = price;
            }
            if price < bar.low {
                bar.low = price;
            }
            bar.close = price;
        }
        _ => bars.push(OhlcBar {
            ts_ms: bucket,
            open: price,
            high: price,
            low: price,
            close: price,
        }),
    }
    if max_bars > 0 && bars.len() > max_bars {
        let drop = bars.len() - max_bars;
        bars.drain(..drop);
    }
}

/// Bars whose minute has closed; the still-forming bar is excluded.
pub fn completed_bars(bars: &[OhlcBar], now_ms: i64) -> &[OhlcBar] {
    if bars.is_empty() {
        return bars;
    }
    let current_bucket = now_ms - now_ms.rem_euclid(BAR_INTERVAL_MS);
    if bars[bars.len() - 1].ts_ms == current_bucket {
        &bars[..bars.len() - 1]
    } else {
        bars
    }
}

// ATR needs period+1 bars, ADX needs 2*period.
pub fn required_bar_count(atr_period: usize, adx_period: usize) -> usize {
    (atr_period + 1).max(adx_period * 2)
}

fn true_range(prev_close: Decimal, curr: &OhlcBar) -> Decimal {
    let hl = curr.high - curr.low;
    let hc = (curr.high - prev_close).abs();
    let lc = (curr.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Wilder-smoothed ATR as a fraction of the last close.
pub fn calc_atr_pct(bars: &[OhlcBar], period: usize) -> Option<Decimal> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let trs: Vec<Decimal> = bars
        .windows(2)
        .map(|w| true_range(w[0].close, &w[1]))
        .collect();
    if trs.len() < period {
        return None;
    }

    let period_d = Decimal::from(period as u64);
    let mut atr = trs[..period].iter().copied().sum::<Decimal>() / period_d;
    for tr in &trs[period..] {
        atr = (atr * (period_d - Decimal::ONE) + *tr) / period_d;
    }

    let last_close = bars[bars.len() - 1].close;
    if last_close <= Decimal::ZERO {
        return None;
    }
    Some(atr / last_close)
}

/// Wilder ADX over the bar sequence.
pub fn calc_adx(bars: &[OhlcBar], period: usize) -> Option<Decimal> {
    if period == 0 || bars.len() < period * 2 {
        return None;
    }

    let mut trs = Vec::with_capacity(bars.len() - 1);
    let mut plus_dm = Vec::with_capacity(bars.len() - 1);
    let mut minus_dm = Vec::with_capacity(bars.len() - 1);

    for w in bars.windows(2) {
        let (prev, curr) = (&w[0], &w[1]);
        let up_move = curr.high - prev.high;
        let down_move = prev.low - curr.low;
        let pdm = if up_move > Decimal::ZERO && up_move > down_move {
            up_move
        } else {
            Decimal::ZERO
        };
        let mdm = if down_move > Decimal::ZERO && down_move > up_move {
            down_move
        } else {
            Decimal::ZERO
        };
        trs.push(true_range(prev.close, curr));
        plus_dm.push(pdm);
        minus_dm.push(mdm);
    }

    if trs.len() < period * 2 - 1 {
        return None;
    }

    let period_d = Decimal::from(period as u64);
    let hundred = Decimal::ONE_HUNDRED;

    let dx = |tr_sum: Decimal, pdm_sum: Decimal, mdm_sum: Decimal| -> Decimal {
        if tr_sum <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let plus_di = hundred * pdm_sum / tr_sum;
        let minus_di = hundred * mdm_sum / tr_sum;
        let denom = plus_di + minus_di;
        if denom <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        hundred * (plus_di - minus_di).abs() / denom
    };

    let mut tr_s = trs[..period].iter().copied().sum::<Decimal>();
    let mut pdm_s = plus_dm[..period].iter().copied().sum::<Decimal>();
    let mut mdm_s = minus_dm[..period].iter().copied().sum::<Decimal>();

    let mut dx_values = vec![dx(tr_s, pdm_s, mdm_s)];
    for i in period..trs.len() {
        tr_s = tr_s - tr_s / period_d + trs[i];
        pdm_s = pdm_s - pdm_s / period_d + plus_dm[i];
        mdm_s = mdm_s - mdm_s / period_d + minus_dm[i];
        dx_values.push(dx(tr_s, pdm_s, mdm_s));
    }

    if dx_values.len() < period {
        return None;
    }

    let mut adx = dx_values[..period].iter().copied().sum::<Decimal>() / period_d;
    for v in &dx_values[period..] {
        adx = (adx * (period_d - Decimal::ONE) + *v) / period_d;
    }
    Some(adx)
}

pub fn evaluate_market_filter(
    cfg: &MarketFilterConfig,
    runtime: &mut MarketFilterRuntime,
    bars: &[OhlcBar],
    now_ms: i64,
) -> MarketFilterDecision {
    let decision = |runtime: &MarketFilterRuntime, close_only: bool, timeout_stop: bool| {
        MarketFilterDecision {
            state: runtime.state,
            reason: runtime.reason.clone(),
            atr_pct: runtime.atr_pct,
            adx: runtime.adx,
            pass_streak: runtime.pass_streak,
            block_seconds: runtime.block_seconds,
            close_only,
            timeout_stop,
        }
    };

    if !cfg.enabled {
        *runtime = MarketFilterRuntime::default();
        return decision(runtime, false, false);
    }

    let need = required_bar_count(cfg.atr_period, cfg.adx_period);
    if bars.len() < need {
        runtime.state = FilterState::Warmup;
        runtime.reason = format!("warmup:{}/{}", bars.len(), need);
        runtime.pass_streak = 0;
        runtime.block_started_ms = 0;
        runtime.block_seconds = 0;
        runtime.atr_pct = None;
        runtime.adx = None;
        return decision(runtime, true, false);
    }

    let atr_pct = calc_atr_pct(bars, cfg.atr_period);
    let adx = calc_adx(bars, cfg.adx_period);
    runtime.atr_pct = atr_pct;
    runtime.adx = adx;

    let (Some(atr_pct), Some(adx)) = (atr_pct, adx) else {
        runtime.state = FilterState::Warmup;
        runtime.reason = "indicator_not_ready".to_string();
        runtime.pass_streak = 0;
        runtime.block_started_ms = 0;
        runtime.block_seconds = 0;
        return decision(runtime, true, false);
    };

    let mut block_reasons: Vec<&str> = Vec::new();
    if atr_pct < cfg.atr_pct_min {
        block_reasons.push("atr_low");
    }
    if atr_pct > cfg.atr_pct_max {
        block_reasons.push("atr_high");
    }
    if adx > cfg.adx_max {
        block_reasons.push("adx_high");
    }

    if !block_reasons.is_empty() {
        runtime.state = FilterState::Block;
        runtime.reason = block_reasons.join(",");
        runtime.pass_streak = 0;
        if runtime.block_started_ms <= 0 {
            runtime.block_started_ms = now_ms;
        }
        runtime.block_seconds = ((now_ms - runtime.block_started_ms) / 1000).max(0);
        let timeout_stop = cfg.block_timeout_minutes > Decimal::ZERO
            && Decimal::from(runtime.block_seconds) >= cfg.block_timeout_minutes * Decimal::from(60);
        return decision(runtime, true, timeout_stop);
    }

    let recovering = matches!(runtime.state, FilterState::Block | FilterState::Warmup);
    if recovering {
        runtime.pass_streak += 1;
        if runtime.pass_streak < cfg.recover_pass_count.max(1) {
            runtime.state = FilterState::Warmup;
            runtime.reason = format!(
                "recovering:{}/{}",
                runtime.pass_streak,
                cfg.recover_pass_count.max(1)
            );
            runtime.block_started_ms = 0;
            runtime.block_seconds = 0;
            return decision(runtime, true, false);
        }
    }

    runtime.state = FilterState::Pass;
    runtime.reason = "ok".to_string();
    runtime.pass_streak = 0;
    runtime.block_started_ms = 0;
    runtime.block_seconds = 0;
    decision(runtime, false, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trend_bars(count: usize) -> Vec<OhlcBar> {
        let mut bars = Vec::new();
        let mut price = dec!(100);
        for i in 0..count {
            let open = price;
            let close = price + dec!(0.8);
            bars.push(OhlcBar {
                ts_ms: i as i64 * BAR_INTERVAL_MS,
                open,
                high: close + dec!(0.3),
                low: open - dec!(0.2),
                close,
            });
            price = close;
        }
        bars
    }

    fn sideways_bars(count: usize) -> Vec<OhlcBar> {
        let mut bars = Vec::new();
        let mut price = dec!(100);
        for i in 0..count {
            let delta = if i % 2 == 0 { dec!(0.3) } else { dec!(-0.3) };
            let open = price;
            let close = price + delta;
            bars.push(OhlcBar {
                ts_ms: i as i64 * BAR_INTERVAL_MS,
                open,
                high: open.max(close) + dec!(0.2),
                low: open.min(close) - dec!(0.2),
                close,
            });
            price = close;
        }
        bars
    }

    fn flat_bars(count: usize) -> Vec<OhlcBar> {
        (0..count)
            .map(|i| OhlcBar {
                ts_ms: i as i64 * BAR_INTERVAL_MS,
                open: dec!(100),
                high: dec!(100),
                low: dec!(100),
                close: dec!(100),
            })
            .collect()
    }

    #[test]
    fn test_update_and_complete_bars() {
        let mut bars = Vec::new();
        update_ohlc_bars(&mut bars, 1_000, dec!(100), 600);
        update_ohlc_bars(&mut bars, 20_000, dec!(102), 600);
        update_ohlc_bars(&mut bars, 35_000, dec!(99), 600);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open, dec!(100));
        assert_eq!(bars[0].high, dec!(102));
        assert_eq!(bars[0].low, dec!(99));
        assert_eq!(bars[0].close, dec!(99));

        update_ohlc_bars(&mut bars, BAR_INTERVAL_MS + 5_000, dec!(101), 600);
        assert_eq!(bars.len(), 2);
        let done = completed_bars(&bars, BAR_INTERVAL_MS + 10_000);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].close, dec!(99));
    }

    #[test]
    fn test_atr_pct_positive_on_trend() {
        let atr = calc_atr_pct(&trend_bars(40), 14).unwrap();
        assert!(atr > Decimal::ZERO);
        assert!(atr < dec!(0.2));
    }

    #[test]
    fn test_adx_trend_beats_sideways() {
        let trend = calc_adx(&trend_bars(80), 14).unwrap();
        let sideways = calc_adx(&sideways_bars(80), 14).unwrap();
        assert!(trend > sideways);
    }

    #[test]
    fn test_disabled_filter_is_off() {
        let cfg = MarketFilterConfig::default();
        let mut rt = MarketFilterRuntime::default();
        let d = evaluate_market_filter(&cfg, &mut rt, &trend_bars(50), 5_000_000);
        assert_eq!(d.state, FilterState::Off);
        assert!(!d.close_only);
        assert!(!d.timeout_stop);
    }

    #[test]
    fn test_warmup_when_not_enough_bars() {
        let cfg = MarketFilterConfig {
            enabled: true,
            ..Default::default()
        };
        let mut rt = MarketFilterRuntime::default();
        let d = evaluate_market_filter(&cfg, &mut rt, &trend_bars(10), 5_000_000);
        assert_eq!(d.state, FilterState::Warmup);
        assert!(d.close_only);
    }

    #[test]
    fn test_block_on_dead_market() {
        let cfg = MarketFilterConfig {
            enabled: true,
            atr_pct_max: dec!(0.05),
            adx_max: dec!(80),
            ..Default::default()
        };
        let mut rt = MarketFilterRuntime::default();
        let d = evaluate_market_filter(&cfg, &mut rt, &flat_bars(60), 5_000_000);
        assert_eq!(d.state, FilterState::Block);
        assert!(d.reason.contains("atr_low"));
        assert!(d.close_only);
        assert!(!d.timeout_stop);
    }

    #[test]
    fn test_recovery_requires_pass_streak() {
        let mut rt = MarketFilterRuntime::default();
        let block_cfg = MarketFilterConfig {
            enabled: true,
            atr_pct_max: dec!(0.05),
            adx_max: dec!(80),
            recover_pass_count: 2,
            ..Default::default()
        };
        evaluate_market_filter(&block_cfg, &mut rt, &flat_bars(60), 6_000_000);
        assert_eq!(rt.state, FilterState::Block);

        let pass_cfg = MarketFilterConfig {
            enabled: true,
            atr_pct_min: dec!(0.001),
            atr_pct_max: dec!(0.05),
            adx_max: dec!(100),
            recover_pass_count: 2,
            ..Default::default()
        };
        let d1 = evaluate_market_filter(&pass_cfg, &mut rt, &trend_bars(80), 6_060_000);
        assert_eq!(d1.state, FilterState::Warmup);
        assert!(d1.close_only);
        assert_eq!(d1.pass_streak, 1);

        let d2 = evaluate_market_filter(&pass_cfg, &mut rt, &trend_bars(80), 6_120_000);
        assert_eq!(d2.state, FilterState::Pass);
        assert!(!d2.close_only);
        assert_eq!(d2.pass_streak, 0);
    }

    #[test]
    fn test_block_timeout_requests_stop() {
        let cfg = MarketFilterConfig {
            enabled: true,
            atr_pct_max: dec!(0.05),
            adx_max: dec!(80),
            block_timeout_minutes: dec!(1),
            ..Default::default()
        };
        let mut rt = MarketFilterRuntime {
            state: FilterState::Block,
            block_started_ms: 1,
            ..Default::default()
        };
        let d = evaluate_market_filter(&cfg, &mut rt, &flat_bars(80), 120_000);
        assert_eq!(d.state, FilterState::Block);
        assert!(d.block_seconds >= 60);
        assert!(d.timeout_stop);
    }
}
