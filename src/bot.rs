// ─────────────────────────────────────────────────────────────────────────────
// bot.rs — Bot supervisor and per-symbol control loop
//
// The supervisor owns one long-lived task per running symbol plus every
// per-symbol cache (sim state, P&L cursor, rate-limit marks, reduce-mode,
// restart budget). Each task runs the reconciliation loop: read config, pull
// market state, diff the desired grid against resting orders, cancel then
// create, publish status. Two ticks of one symbol never overlap.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, ConfigStore, GridMode, RuntimeConfig, StrategyConfig};
use crate::filter::{
    completed_bars, evaluate_market_filter, update_ohlc_bars, FilterState, MarketFilterRuntime,
    OhlcBar,
};
use crate::history::{HistoryRecord, HistoryStore, HistoryTotals, SymbolSnapshot};
use crate::ids::{
    grid_client_order_id, grid_prefix, grid_side_level, is_grid_client_order, Side,
};
use crate::indicator::{as_quote, AsParams, MidWindow};
use crate::logbus::LogBus;
use crate::quant::{quantize_price, to_scaled_int, unit};
use crate::reconcile::{
    derive_base_qty, dynamic_grid_prices, group_orders_by_price, interleave_by_distance,
    missing_prices, pick_level, pick_level_with_cursor, snap_center, split_cancel_keep_banded,
    split_cancel_keep_by_target,
};
use crate::sim::{apply_fill_to_position, SimState};
use crate::trader::{OpenOrder, OwnTrade, Trader, TraderError};

const MAX_ACTIONS_PER_TICK: usize = 10;
const MARKET_RESOLVE_COOLDOWN_MS: i64 = 20_000;
const ERROR_LOG_INTERVAL_MS: i64 = 5_000;
const EMERGENCY_CANCEL_LIMIT: usize = 200;
const RATE_LIMIT_BASE_MS: i64 = 500;
const RATE_LIMIT_CAP_MS: i64 = 8_000;
const MAX_OHLC_BARS: usize = 600;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn now_iso() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

// ─── Public status ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub symbol: String,
    pub running: bool,
    pub started_at: Option<String>,
    pub last_tick_at: Option<String>,
    pub message: String,
    pub market_id: Option<i64>,
    pub mid: Option<String>,
    pub center: Option<String>,
    pub desired: usize,
    pub existing: usize,
    pub delay_count: u64,
    pub reduce_mode: bool,
    pub stop_signal: bool,
    pub stop_reason: String,
}

impl BotStatus {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            running: false,
            started_at: None,
            last_tick_at: None,
            message: String::new(),
            market_id: None,
            mid: None,
            center: None,
            desired: 0,
            existing: 0,
            delay_count: 0,
            reduce_mode: false,
            stop_signal: false,
            stop_reason: String::new(),
        }
    }
}

// ─── Per-symbol state ────────────────────────────────────────────────────────

/// Forward-only cursor over our own venue trades; mirrors the sim's P&L
/// arithmetic for live sessions.
#[derive(Debug, Clone, Default)]
pub struct TradeCursor {
    pub last_ts_ms: i64,
    pub position_base: Decimal,
    pub position_cost: Decimal,
    pub realized_pnl: Decimal,
    pub volume_notional: Decimal,
    pub trade_count: u64,
}

impl TradeCursor {
    pub fn advance(&mut self, trades: &[OwnTrade]) {
        for trade in trades {
            if trade.ts_ms <= self.last_ts_ms {
                continue;
            }
            apply_fill_to_position(
                &mut self.position_base,
                &mut self.position_cost,
                &mut self.realized_pnl,
                trade.is_ask,
                trade.price,
                trade.size,
            );
            self.volume_notional += (trade.price * trade.size).abs();
            self.trade_count += 1;
            self.last_ts_ms = trade.ts_ms;
        }
    }

    pub fn pnl(&self, mid: Decimal) -> Decimal {
        self.realized_pnl + mid * self.position_base - self.position_cost
    }
}

#[derive(Debug)]
struct SymbolState {
    sim: SimState,
    mid_window: MidWindow,
    bars: Vec<OhlcBar>,
    filter_rt: MarketFilterRuntime,
    cursor: TradeCursor,
    peak_profit: Option<Decimal>,
    reduce_mode: bool,
    delay_count: u64,
    delay_seen: BTreeSet<(bool, Decimal)>,
    ask_cursor: u64,
    bid_cursor: u64,
    start_ms: i64,
    last_stop_check_ms: i64,
    stop_signal: bool,
    stop_reason: String,
    resolved_market_id: Option<i64>,
    market_resolve_attempt_ms: i64,
    error_log_ms: HashMap<String, i64>,
    last_mid: Decimal,
}

impl SymbolState {
    fn new(start_ms: i64) -> Self {
        Self {
            sim: SimState::default(),
            mid_window: MidWindow::new(60),
            bars: Vec::new(),
            filter_rt: MarketFilterRuntime::default(),
            cursor: TradeCursor::default(),
            peak_profit: None,
            reduce_mode: false,
            delay_count: 0,
            delay_seen: BTreeSet::new(),
            ask_cursor: 1,
            bid_cursor: 1,
            start_ms,
            last_stop_check_ms: 0,
            stop_signal: false,
            stop_reason: String::new(),
            resolved_market_id: None,
            market_resolve_attempt_ms: 0,
            error_log_ms: HashMap::new(),
            last_mid: Decimal::ZERO,
        }
    }

    /// At most one line per ~5 s per reason so a hot loop cannot flood the
    /// log sink.
    fn should_log_error(&mut self, key: &str, now: i64) -> bool {
        let last = self.error_log_ms.get(key).copied().unwrap_or(0);
        if now - last < ERROR_LOG_INTERVAL_MS {
            return false;
        }
        self.error_log_ms.insert(key.to_string(), now);
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RateLimitMark {
    until_ms: i64,
    streak: u32,
}

// ─── Pure loop helpers (unit-tested below) ───────────────────────────────────

/// Reduce-mode hysteresis: enter at or above `max`, leave at or below `exit`.
fn update_reduce_mode(current: bool, pos_notional: Decimal, max: Decimal, exit: Decimal) -> bool {
    if max <= Decimal::ZERO {
        return false;
    }
    if !current {
        pos_notional >= max
    } else {
        pos_notional > exit
    }
}

/// Bumps the delay counter once per distinct wrong-side missing price and
/// lets recovered prices re-trigger later.
fn update_delay_counter(
    seen: &mut BTreeSet<(bool, Decimal)>,
    delay_count: &mut u64,
    wrong_side_missing: &BTreeSet<(bool, Decimal)>,
) {
    for key in wrong_side_missing {
        if seen.insert(*key) {
            *delay_count += 1;
        }
    }
    seen.retain(|key| wrong_side_missing.contains(key));
}

/// True when the restart budget still allows another auto-restart after
/// recording one at `now`.
fn restart_allowed(times: &mut Vec<i64>, now: i64, window_ms: i64, max: u32) -> bool {
    times.push(now);
    times.retain(|t| now - *t <= window_ms);
    times.len() <= max as usize
}

enum TickOutcome {
    Continue,
    Terminated,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

pub struct BotSupervisor {
    logbus: Arc<LogBus>,
    config: Arc<ConfigStore>,
    history: Arc<HistoryStore>,
    lifecycle: TokioMutex<()>,
    tasks: StdMutex<HashMap<String, JoinHandle<()>>>,
    status: StdMutex<HashMap<String, BotStatus>>,
    states: StdMutex<HashMap<String, Arc<TokioMutex<SymbolState>>>>,
    manual_stop: StdMutex<HashSet<String>>,
    restart_times: StdMutex<HashMap<String, Vec<i64>>>,
    rate_limits: StdMutex<HashMap<String, RateLimitMark>>,
}

impl BotSupervisor {
    pub fn new(logbus: Arc<LogBus>, config: Arc<ConfigStore>, history: Arc<HistoryStore>) -> Self {
        Self {
            logbus,
            config,
            history,
            lifecycle: TokioMutex::new(()),
            tasks: StdMutex::new(HashMap::new()),
            status: StdMutex::new(HashMap::new()),
            states: StdMutex::new(HashMap::new()),
            manual_stop: StdMutex::new(HashSet::new()),
            restart_times: StdMutex::new(HashMap::new()),
            rate_limits: StdMutex::new(HashMap::new()),
        }
    }

    pub async fn start(self: &Arc<Self>, symbol: &str, trader: Arc<dyn Trader>, manual: bool) {
        let symbol = symbol.to_uppercase();
        let _guard = self.lifecycle.lock().await;

        {
            let tasks = self.tasks.lock().expect("tasks poisoned");
            if let Some(task) = tasks.get(&symbol) {
                if !task.is_finished() {
                    return;
                }
            }
        }

        if manual {
            self.states
                .lock()
                .expect("states poisoned")
                .insert(symbol.clone(), Arc::new(TokioMutex::new(SymbolState::new(now_ms()))));
            self.manual_stop
                .lock()
                .expect("manual_stop poisoned")
                .remove(&symbol);
            self.restart_times
                .lock()
                .expect("restart_times poisoned")
                .remove(&symbol);
            self.rate_limits
                .lock()
                .expect("rate_limits poisoned")
                .remove(&symbol);
        } else {
            self.states
                .lock()
                .expect("states poisoned")
                .entry(symbol.clone())
                .or_insert_with(|| Arc::new(TokioMutex::new(SymbolState::new(now_ms()))));
        }

        {
            let mut status = self.status.lock().expect("status poisoned");
            let entry = BotStatus {
                running: true,
                started_at: Some(now_iso()),
                message: "starting".to_string(),
                ..BotStatus::new(&symbol)
            };
            status.insert(symbol.clone(), entry);
        }

        let supervisor = Arc::clone(self);
        let task_symbol = symbol.clone();
        let handle = tokio::spawn(async move {
            run_bot_task(supervisor, task_symbol, trader).await;
        });
        self.tasks
            .lock()
            .expect("tasks poisoned")
            .insert(symbol.clone(), handle);
        self.logbus.publish(&format!("bot.start symbol={symbol}"));
    }

    /// Manual stop: sticky, clears the restart budget and forbids respawns.
    pub async fn stop(&self, symbol: &str) {
        let symbol = symbol.to_uppercase();
        let _guard = self.lifecycle.lock().await;

        self.manual_stop
            .lock()
            .expect("manual_stop poisoned")
            .insert(symbol.clone());

        let task = self.tasks.lock().expect("tasks poisoned").remove(&symbol);
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        self.restart_times
            .lock()
            .expect("restart_times poisoned")
            .remove(&symbol);
        self.rate_limits
            .lock()
            .expect("rate_limits poisoned")
            .remove(&symbol);

        {
            let mut status = self.status.lock().expect("status poisoned");
            let prev = status.remove(&symbol);
            status.insert(
                symbol.clone(),
                BotStatus {
                    running: false,
                    message: "stopped".to_string(),
                    started_at: prev.and_then(|p| p.started_at),
                    ..BotStatus::new(&symbol)
                },
            );
        }
        self.logbus.publish(&format!("bot.stop symbol={symbol}"));
    }

    pub async fn stop_all(&self) {
        let symbols: Vec<String> = {
            let tasks = self.tasks.lock().expect("tasks poisoned");
            tasks.keys().cloned().collect()
        };
        for symbol in symbols {
            self.stop(&symbol).await;
        }
    }

    pub fn snapshot(&self) -> HashMap<String, BotStatus> {
        self.status.lock().expect("status poisoned").clone()
    }

    fn patch_status(&self, symbol: &str, patch: impl FnOnce(&mut BotStatus)) {
        let mut status = self.status.lock().expect("status poisoned");
        let entry = status
            .entry(symbol.to_string())
            .or_insert_with(|| BotStatus::new(symbol));
        patch(entry);
    }

    fn state(&self, symbol: &str) -> Arc<TokioMutex<SymbolState>> {
        let mut states = self.states.lock().expect("states poisoned");
        Arc::clone(
            states
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(SymbolState::new(now_ms())))),
        )
    }

    fn is_manual_stopped(&self, symbol: &str) -> bool {
        self.manual_stop
            .lock()
            .expect("manual_stop poisoned")
            .contains(symbol)
    }

    // ── Rate-limit marks ─────────────────────────────────────────────────────

    /// Marks the symbol rate-limited and returns (delay_ms, streak). The
    /// delay doubles per consecutive mark and caps at 8 s.
    pub fn mark_rate_limited(&self, symbol: &str, now: i64) -> (i64, u32) {
        let mut marks = self.rate_limits.lock().expect("rate_limits poisoned");
        let mark = marks.entry(symbol.to_string()).or_default();
        mark.streak = mark.streak.saturating_add(1);
        let delay = (RATE_LIMIT_BASE_MS << (mark.streak - 1).min(16)).min(RATE_LIMIT_CAP_MS);
        mark.until_ms = now + delay;
        (delay, mark.streak)
    }

    /// Remaining milliseconds this symbol must stay quiet; zero when clear.
    pub fn rate_limit_wait_ms(&self, symbol: &str, now: i64) -> i64 {
        let marks = self.rate_limits.lock().expect("rate_limits poisoned");
        marks
            .get(symbol)
            .map(|mark| (mark.until_ms - now).max(0))
            .unwrap_or(0)
    }

    pub fn clear_rate_limited(&self, symbol: &str) {
        self.rate_limits
            .lock()
            .expect("rate_limits poisoned")
            .remove(symbol);
    }

    // ── History capture ──────────────────────────────────────────────────────

    /// Appends one run-history record covering every known symbol. Never
    /// raises: capture failures are logged and swallowed.
    pub async fn capture_history(&self, trader: &Arc<dyn Trader>, reason: &str) {
        let config = match self.config.read() {
            Ok(config) => config,
            Err(e) => {
                self.logbus
                    .publish(&format!("history.write.error err=config:{e}"));
                return;
            }
        };
        let dry_run = config.runtime.dry_run;

        let state_arcs: Vec<(String, Arc<TokioMutex<SymbolState>>)> = {
            let states = self.states.lock().expect("states poisoned");
            states
                .iter()
                .map(|(symbol, state)| (symbol.clone(), Arc::clone(state)))
                .collect()
        };

        let mut symbols = std::collections::BTreeMap::new();
        for (symbol, state_arc) in state_arcs {
            // A still-running loop holds its state for the whole tick; skip
            // rather than block the control surface on it.
            let Ok(state) = state_arc.try_lock() else {
                continue;
            };
            let running = self
                .status
                .lock()
                .expect("status poisoned")
                .get(&symbol)
                .map(|s| s.running)
                .unwrap_or(false);
            let mut snapshot =
                build_symbol_snapshot(&state, running, state.last_mid, dry_run, state.start_ms);
            if !dry_run {
                snapshot.open_orders =
                    live_open_order_count(trader, &config, &symbol).await.unwrap_or(0);
            }
            symbols.insert(symbol, snapshot);
        }

        let record = HistoryRecord {
            created_at: now_iso(),
            exchange: config.exchange.name.clone(),
            reason: reason.to_string(),
            stop_reason: String::new(),
            totals: build_totals(&symbols),
            symbols,
        };
        if let Err(e) = self.history.append(&record) {
            self.logbus.publish(&format!("history.write.error err={e}"));
        }
    }

    /// Stops everything and clears every own resting order the venue still
    /// shows on any configured market.
    pub async fn emergency_stop(&self, trader: &Arc<dyn Trader>) -> HashMap<String, u64> {
        self.stop_all().await;

        let mut canceled = HashMap::new();
        let Ok(config) = self.config.read() else {
            return canceled;
        };

        for (symbol, strat) in &config.strategies {
            let Some(market_id) = strat.market_id else {
                continue;
            };
            let orders = match trader.active_orders(market_id).await {
                Ok(orders) => orders,
                Err(e) => {
                    self.logbus
                        .publish(&format!("emergency.list.error symbol={symbol} err={e}"));
                    continue;
                }
            };

            let prefix = grid_prefix(&trader.account_key(), &market_id.to_string(), symbol);
            let mut count = 0u64;
            for order in orders
                .iter()
                .filter(|o| o.client_order_id > 0 && is_grid_client_order(prefix, o.client_order_id))
                .take(EMERGENCY_CANCEL_LIMIT)
            {
                match trader.cancel(market_id, order.order_id).await {
                    Ok(()) => count += 1,
                    Err(e) => self.logbus.publish(&format!(
                        "emergency.cancel.error symbol={symbol} id={} err={e}",
                        order.client_order_id
                    )),
                }
            }
            if count > 0 {
                canceled.insert(symbol.clone(), count);
            }
        }

        if !canceled.is_empty() {
            self.capture_history(trader, "emergency_stop").await;
        }
        self.logbus.publish("bots.emergency_stop");
        canceled
    }
}

/// Our resting-order count on the venue for one symbol's market.
async fn live_open_order_count(
    trader: &Arc<dyn Trader>,
    config: &AppConfig,
    symbol: &str,
) -> Option<u64> {
    let market_id = config.strategy(symbol)?.market_id?;
    let orders = trader.active_orders(market_id).await.ok()?;
    let prefix = grid_prefix(&trader.account_key(), &market_id.to_string(), symbol);
    Some(
        orders
            .iter()
            .filter(|o| o.client_order_id > 0 && is_grid_client_order(prefix, o.client_order_id))
            .count() as u64,
    )
}

fn build_symbol_snapshot(
    state: &SymbolState,
    running: bool,
    mid: Decimal,
    dry_run: bool,
    start_ms: i64,
) -> SymbolSnapshot {
    if dry_run {
        let (volume, trade_count) = state.sim.trade_stats(start_ms, now_ms());
        SymbolSnapshot {
            running,
            profit: state.sim.pnl(mid),
            volume,
            trade_count,
            position_notional: (state.sim.position_base * mid).abs(),
            open_orders: state.sim.orders.len() as u64,
            reduce_mode: state.reduce_mode,
        }
    } else {
        SymbolSnapshot {
            running,
            profit: state.cursor.pnl(mid),
            volume: state.cursor.volume_notional,
            trade_count: state.cursor.trade_count,
            position_notional: (state.cursor.position_base * mid).abs(),
            open_orders: 0,
            reduce_mode: state.reduce_mode,
        }
    }
}

fn build_totals(symbols: &std::collections::BTreeMap<String, SymbolSnapshot>) -> HistoryTotals {
    let mut totals = HistoryTotals::default();
    for (symbol, snap) in symbols {
        totals.profit += snap.profit;
        totals.volume += snap.volume;
        totals.trade_count += snap.trade_count;
        totals.position_notional += snap.position_notional;
        totals.open_orders += snap.open_orders;
        if snap.reduce_mode {
            totals.reduce_symbols.push(symbol.clone());
        }
        if snap.running {
            totals.running += 1;
        }
    }
    totals
}

// ─── Task wrapper: exception edge and auto-restart ───────────────────────────

async fn run_bot_task(supervisor: Arc<BotSupervisor>, symbol: String, trader: Arc<dyn Trader>) {
    loop {
        match run_symbol_loop(&supervisor, &symbol, &trader).await {
            Ok(()) => break,
            Err(err) => {
                supervisor
                    .logbus
                    .publish(&format!("bot.error symbol={symbol} err={err}"));
                let runtime = supervisor
                    .config
                    .read()
                    .map(|c| c.runtime)
                    .unwrap_or_default();

                if !runtime.auto_restart || supervisor.is_manual_stopped(&symbol) {
                    supervisor.patch_status(&symbol, |s| {
                        s.running = false;
                        s.message = format!("error: {err}");
                    });
                    break;
                }

                let allowed = {
                    let mut restarts = supervisor
                        .restart_times
                        .lock()
                        .expect("restart_times poisoned");
                    let times = restarts.entry(symbol.clone()).or_default();
                    restart_allowed(times, now_ms(), runtime.restart_window_ms, runtime.restart_max)
                };
                if !allowed {
                    supervisor.patch_status(&symbol, |s| {
                        s.running = false;
                        s.message = "auto-restart exhausted".to_string();
                    });
                    supervisor
                        .logbus
                        .publish(&format!("bot.restart.exhausted symbol={symbol}"));
                    break;
                }

                supervisor.patch_status(&symbol, |s| s.message = "restarting".to_string());
                supervisor
                    .logbus
                    .publish(&format!("bot.restart symbol={symbol}"));
                tokio::time::sleep(std::time::Duration::from_millis(runtime.restart_delay_ms))
                    .await;
            }
        }
    }
}

// ─── The control loop ────────────────────────────────────────────────────────

async fn run_symbol_loop(
    supervisor: &Arc<BotSupervisor>,
    symbol: &str,
    trader: &Arc<dyn Trader>,
) -> Result<(), String> {
    let state_arc = supervisor.state(symbol);

    loop {
        let interval = {
            let config = supervisor.config.read().map_err(|e| e.to_string())?;
            config.runtime.loop_interval_ms.max(10)
        };
        tokio::time::sleep(std::time::Duration::from_millis(interval)).await;

        let config = supervisor.config.read().map_err(|e| e.to_string())?;
        let mut state = state_arc.lock().await;
        match run_tick(supervisor, symbol, trader, &config, &mut state).await {
            Ok(TickOutcome::Continue) => {}
            Ok(TickOutcome::Terminated) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

async fn run_tick(
    supervisor: &Arc<BotSupervisor>,
    symbol: &str,
    trader: &Arc<dyn Trader>,
    config: &AppConfig,
    st: &mut SymbolState,
) -> Result<TickOutcome, String> {
    let runtime = &config.runtime;
    let now = now_ms();

    let Some(strat) = config.strategy(symbol) else {
        supervisor.patch_status(symbol, |s| {
            s.message = "no strategy configured".to_string();
            s.last_tick_at = Some(now_iso());
        });
        return Ok(TickOutcome::Continue);
    };

    if !strat.enabled {
        supervisor.patch_status(symbol, |s| {
            s.message = "disabled".to_string();
            s.last_tick_at = Some(now_iso());
        });
        return Ok(TickOutcome::Continue);
    }

    if let Err(msg) = strat.validate() {
        supervisor.patch_status(symbol, |s| {
            s.message = format!("config: {msg}");
            s.last_tick_at = Some(now_iso());
        });
        return Ok(TickOutcome::Continue);
    }

    // ── Market resolution (cooldown-gated when unconfigured) ────────────────
    let market_id = match strat.market_id.or(st.resolved_market_id) {
        Some(id) => id,
        None => {
            if now - st.market_resolve_attempt_ms < MARKET_RESOLVE_COOLDOWN_MS {
                supervisor.patch_status(symbol, |s| {
                    s.message = "market_id not configured".to_string();
                    s.last_tick_at = Some(now_iso());
                });
                return Ok(TickOutcome::Continue);
            }
            st.market_resolve_attempt_ms = now;
            match trader.resolve_market(symbol).await {
                Ok(Some(id)) => {
                    st.resolved_market_id = Some(id);
                    supervisor
                        .logbus
                        .publish(&format!("market.resolve symbol={symbol} market_id={id}"));
                    id
                }
                Ok(None) => {
                    supervisor.patch_status(symbol, |s| {
                        s.message = "unknown market for symbol".to_string();
                        s.last_tick_at = Some(now_iso());
                    });
                    return Ok(TickOutcome::Continue);
                }
                Err(e) => {
                    note_trader_error(supervisor, st, symbol, "market.resolve", &e, now);
                    return Ok(TickOutcome::Continue);
                }
            }
        }
    };

    // ── Rate-limit short-circuit ────────────────────────────────────────────
    let wait = supervisor.rate_limit_wait_ms(symbol, now);
    if wait > 0 {
        supervisor.patch_status(symbol, |s| {
            s.message = format!("rate limited ({wait} ms)");
            s.market_id = Some(market_id);
            s.last_tick_at = Some(now_iso());
        });
        return Ok(TickOutcome::Continue);
    }

    // ── Market data ─────────────────────────────────────────────────────────
    let meta = match trader.market_meta(market_id).await {
        Ok(meta) => meta,
        Err(e) => {
            note_trader_error(supervisor, st, symbol, "market.meta", &e, now);
            return Ok(TickOutcome::Continue);
        }
    };

    let (bid, ask) = match trader.best_bid_ask(market_id).await {
        Ok(bbo) => bbo,
        Err(e) => {
            note_trader_error(supervisor, st, symbol, "book", &e, now);
            return Ok(TickOutcome::Continue);
        }
    };
    let (Some(bid), Some(ask)) = (bid, ask) else {
        supervisor.patch_status(symbol, |s| {
            s.message = "no book".to_string();
            s.market_id = Some(market_id);
            s.last_tick_at = Some(now_iso());
        });
        return Ok(TickOutcome::Continue);
    };
    let mid = (bid + ask) / Decimal::TWO;
    st.last_mid = mid;

    if runtime.dry_run && runtime.simulate_fill {
        st.sim.last_mid = mid;
        let fills = st.sim.match_bbo(bid, ask, now);
        if fills > 0 {
            supervisor
                .logbus
                .publish(&format!("sim.fill symbol={symbol} count={fills}"));
        }
    }

    // ── Position ────────────────────────────────────────────────────────────
    let position = if runtime.dry_run {
        st.sim.position_base
    } else {
        match trader.position_base(market_id).await {
            Ok(position) => position,
            Err(e) => {
                note_trader_error(supervisor, st, symbol, "position", &e, now);
                return Ok(TickOutcome::Continue);
            }
        }
    };

    // ── Market filter ───────────────────────────────────────────────────────
    let filter_decision = {
        if strat.market_filter.enabled {
            update_ohlc_bars(&mut st.bars, now, mid, MAX_OHLC_BARS);
        }
        let completed = completed_bars(&st.bars, now).to_vec();
        evaluate_market_filter(&strat.market_filter, &mut st.filter_rt, &completed, now)
    };
    if filter_decision.timeout_stop && !st.stop_signal {
        st.stop_signal = true;
        st.stop_reason = format!("market filter blocked ({})", filter_decision.reason);
        supervisor.logbus.publish(&format!(
            "stop.signal symbol={symbol} reason={}",
            st.stop_reason
        ));
    }

    // ── Stop-condition evaluation (throttled) ───────────────────────────────
    if !st.stop_signal && now - st.last_stop_check_ms >= runtime.stop_check_interval_ms() {
        st.last_stop_check_ms = now;
        if let Some(reason) =
            evaluate_stop_conditions(supervisor, symbol, trader, runtime, strat, st, market_id, mid, now)
                .await
        {
            st.stop_signal = true;
            st.stop_reason = reason;
            supervisor.logbus.publish(&format!(
                "stop.signal symbol={symbol} reason={}",
                st.stop_reason
            ));
        }
    }

    // ── Stop flow ───────────────────────────────────────────────────────────
    if st.stop_signal {
        return run_stop_flow(supervisor, symbol, trader, runtime, st, market_id, &meta, mid, now)
            .await;
    }

    // ── Reduce-mode hysteresis (dynamic only) ───────────────────────────────
    let pos_notional = (position * mid).abs();
    if strat.grid_mode == GridMode::Dynamic {
        let next = update_reduce_mode(
            st.reduce_mode,
            pos_notional,
            strat.max_position_notional,
            strat.reduce_exit_notional(),
        );
        if next != st.reduce_mode {
            st.reduce_mode = next;
            supervisor.logbus.publish(&format!(
                "reduce.{} symbol={symbol} notional={pos_notional}",
                if next { "enter" } else { "exit" }
            ));
        }
    } else {
        st.reduce_mode = false;
    }

    // ── Target grid ─────────────────────────────────────────────────────────
    let (center, desired_asks, desired_bids) = match strat.grid_mode {
        GridMode::Dynamic => {
            let center = snap_center(mid, strat.grid_step, meta.price_decimals);
            let (asks, bids) = dynamic_grid_prices(
                center,
                strat.grid_step,
                strat.levels_up,
                strat.levels_down,
                meta.price_decimals,
            );
            (center, asks, bids)
        }
        GridMode::As => {
            st.mid_window.ensure_capacity(strat.as_vol_points);
            st.mid_window.push(now, mid);
            let params = AsParams {
                gamma: strat.as_gamma,
                k: strat.as_k,
                tau: strat.as_tau,
                step_multiplier: strat.as_step_multiplier,
            };
            let Some(quote) = as_quote(
                mid,
                position,
                st.mid_window.sigma(),
                &params,
                meta.price_decimals,
            ) else {
                supervisor.patch_status(symbol, |s| {
                    s.message = "config: as quote degenerate".to_string();
                    s.last_tick_at = Some(now_iso());
                });
                return Ok(TickOutcome::Continue);
            };
            let ask_price = quantize_price(quote.center + quote.step, meta.price_decimals);
            let bid_price = quantize_price(quote.center - quote.step, meta.price_decimals);
            let bids = if bid_price > Decimal::ZERO {
                vec![bid_price]
            } else {
                Vec::new()
            };
            (quote.center, vec![ask_price], bids)
        }
    };

    // ── Existing-order classification ───────────────────────────────────────
    let prefix = grid_prefix(&trader.account_key(), &market_id.to_string(), symbol);
    let all_orders = if runtime.dry_run {
        st.sim.open_orders(meta.price_decimals, meta.size_decimals)
    } else {
        match trader.active_orders(market_id).await {
            Ok(orders) => orders,
            Err(e) => {
                note_trader_error(supervisor, st, symbol, "orders", &e, now);
                return Ok(TickOutcome::Continue);
            }
        }
    };
    let own: Vec<OpenOrder> = all_orders
        .into_iter()
        .filter(|o| o.client_order_id > 0 && is_grid_client_order(prefix, o.client_order_id))
        .collect();
    let total_existing = own.len();

    let mut used_ask_levels: BTreeSet<u64> = BTreeSet::new();
    let mut used_bid_levels: BTreeSet<u64> = BTreeSet::new();
    for order in &own {
        if let Some((side, level)) = grid_side_level(order.client_order_id) {
            match side {
                Side::Ask => used_ask_levels.insert(level),
                Side::Bid => used_bid_levels.insert(level),
            };
        }
    }

    let grouped_asks = group_orders_by_price(&own, true, meta.price_decimals);
    let grouped_bids = group_orders_by_price(&own, false, meta.price_decimals);
    let ask_targets: BTreeSet<Decimal> = desired_asks.iter().copied().collect();
    let bid_targets: BTreeSet<Decimal> = desired_bids.iter().copied().collect();

    // ── Cancel/keep split ───────────────────────────────────────────────────
    let ((ask_cancels, ask_kept), (bid_cancels, bid_kept)) = match strat.grid_mode {
        GridMode::Dynamic => (
            split_cancel_keep_banded(&grouped_asks, &ask_targets, Side::Ask),
            split_cancel_keep_banded(&grouped_bids, &bid_targets, Side::Bid),
        ),
        GridMode::As => (
            split_cancel_keep_by_target(&grouped_asks, &ask_targets),
            split_cancel_keep_by_target(&grouped_bids, &bid_targets),
        ),
    };
    let cancels: Vec<(OpenOrder, Decimal)> =
        ask_cancels.into_iter().chain(bid_cancels).collect();
    let planned_cancels = cancels.len();

    // ── Apply cancels (cancellations precede creations) ─────────────────────
    let mut actions = 0usize;
    let mut rate_limited = false;
    for (order, price) in &cancels {
        if actions >= MAX_ACTIONS_PER_TICK {
            break;
        }
        if runtime.dry_run {
            st.sim.cancel_order(order.client_order_id);
            supervisor.logbus.publish(&format!(
                "dry_run cancel symbol={symbol} market_id={market_id} id={} price={price}",
                order.client_order_id
            ));
        } else {
            match trader.cancel(market_id, order.order_id).await {
                Ok(()) => {
                    supervisor.clear_rate_limited(symbol);
                    supervisor.logbus.publish(&format!(
                        "order.cancel symbol={symbol} market_id={market_id} id={}",
                        order.client_order_id
                    ));
                }
                Err(e) => {
                    if e.is_rate_limited() {
                        let (delay, streak) = supervisor.mark_rate_limited(symbol, now);
                        supervisor.logbus.publish(&format!(
                            "rate.limit symbol={symbol} op=cancel delay_ms={delay} streak={streak}"
                        ));
                        rate_limited = true;
                        break;
                    }
                    if st.should_log_error("cancel", now) {
                        supervisor.logbus.publish(&format!(
                            "order.cancel.error symbol={symbol} id={} err={e}",
                            order.client_order_id
                        ));
                    }
                }
            }
        }
        actions += 1;
    }

    // ── Placement plan ──────────────────────────────────────────────────────
    let missing_asks = missing_prices(&desired_asks, &ask_kept);
    let missing_bids = missing_prices(&desired_bids, &bid_kept);
    let mut placed: BTreeSet<(bool, Decimal)> = BTreeSet::new();

    let close_only = filter_decision.close_only;
    if close_only && filter_decision.state != FilterState::Off {
        supervisor.logbus.publish(&format!(
            "grid.blocked symbol={symbol} state={} reason={}",
            filter_decision.state.as_str(),
            filter_decision.reason
        ));
    }

    if !close_only && !rate_limited {
        let slots = if strat.grid_mode == GridMode::Dynamic && strat.max_open_orders > 0 {
            (strat.max_open_orders as usize)
                .saturating_sub(total_existing.saturating_sub(planned_cancels))
        } else {
            usize::MAX
        };

        let mut plan = interleave_by_distance(center, &missing_asks, &missing_bids);
        plan.truncate(slots);

        for (side, price) in plan {
            if actions >= MAX_ACTIONS_PER_TICK {
                break;
            }
            let cursor_now = match side {
                Side::Ask => st.ask_cursor,
                Side::Bid => st.bid_cursor,
            };
            let used_levels = match side {
                Side::Ask => &mut used_ask_levels,
                Side::Bid => &mut used_bid_levels,
            };
            let picked = if config.exchange.rotate_client_ids {
                pick_level_with_cursor(used_levels, cursor_now)
            } else {
                pick_level(used_levels).map(|level| (level, cursor_now))
            };
            let Some((level, next_cursor)) = picked else {
                if st.should_log_error("levels", now) {
                    supervisor
                        .logbus
                        .publish(&format!("grid.levels.exhausted symbol={symbol}"));
                }
                continue;
            };
            let Some(cid) = grid_client_order_id(prefix, side, level) else {
                continue;
            };

            let reduce_side = st.reduce_mode
                && ((position > Decimal::ZERO && side == Side::Ask)
                    || (position < Decimal::ZERO && side == Side::Bid));
            let multiplier = if reduce_side {
                strat.reduce_order_size_multiplier
            } else {
                Decimal::ONE
            };
            let Some(base_qty) = derive_base_qty(
                strat.order_size_mode,
                strat.order_size_value,
                price,
                multiplier,
                &meta,
            ) else {
                if st.should_log_error("size", now) {
                    supervisor.logbus.publish(&format!(
                        "order.size.skip symbol={symbol} price={price}"
                    ));
                }
                continue;
            };

            let (Some(price_int), Some(base_int)) = (
                to_scaled_int(price, meta.price_decimals),
                to_scaled_int(base_qty, meta.size_decimals),
            ) else {
                continue;
            };

            if runtime.dry_run {
                st.sim.add_order(cid, price, base_qty, side.is_ask(), now);
                supervisor.logbus.publish(&format!(
                    "dry_run create symbol={symbol} market_id={market_id} id={cid} ask={} price={price_int} size={base_int}",
                    side.is_ask()
                ));
                used_levels.insert(level);
                match side {
                    Side::Ask => st.ask_cursor = next_cursor,
                    Side::Bid => st.bid_cursor = next_cursor,
                }
                placed.insert((side.is_ask(), price));
            } else {
                match trader
                    .create_limit(
                        market_id,
                        cid,
                        base_int,
                        price_int,
                        side.is_ask(),
                        strat.post_only,
                        false,
                    )
                    .await
                {
                    Ok(()) => {
                        supervisor.clear_rate_limited(symbol);
                        supervisor.logbus.publish(&format!(
                            "order.create symbol={symbol} market_id={market_id} id={cid} ask={} price={price_int} size={base_int}",
                            side.is_ask()
                        ));
                        used_levels.insert(level);
                        match side {
                            Side::Ask => st.ask_cursor = next_cursor,
                            Side::Bid => st.bid_cursor = next_cursor,
                        }
                        placed.insert((side.is_ask(), price));
                    }
                    Err(e) => {
                        if e.is_rate_limited() {
                            let (delay, streak) = supervisor.mark_rate_limited(symbol, now);
                            supervisor.logbus.publish(&format!(
                                "rate.limit symbol={symbol} op=create delay_ms={delay} streak={streak}"
                            ));
                            break;
                        }
                        if st.should_log_error("create", now) {
                            supervisor.logbus.publish(&format!(
                                "order.create.error symbol={symbol} id={cid} price={price_int} err={e}"
                            ));
                        }
                    }
                }
            }
            actions += 1;
        }
    }

    // ── Delay counter (dynamic only) ────────────────────────────────────────
    if strat.grid_mode == GridMode::Dynamic {
        let wrong_side: BTreeSet<(bool, Decimal)> = missing_asks
            .iter()
            .filter(|p| **p < mid)
            .map(|p| (true, *p))
            .chain(missing_bids.iter().filter(|p| **p > mid).map(|p| (false, *p)))
            .filter(|key| !placed.contains(key))
            .collect();
        update_delay_counter(&mut st.delay_seen, &mut st.delay_count, &wrong_side);
    }

    if planned_cancels > 0 || !placed.is_empty() {
        supervisor.logbus.publish(&format!(
            "grid.reconcile symbol={symbol} desired={} existing={total_existing} cancels={planned_cancels} creates={}",
            desired_asks.len() + desired_bids.len(),
            placed.len()
        ));
    }

    // ── Status ──────────────────────────────────────────────────────────────
    let message = if close_only && filter_decision.state != FilterState::Off {
        format!("blocked: {}", filter_decision.reason)
    } else if st.reduce_mode {
        "reduce mode".to_string()
    } else if runtime.dry_run {
        "sim".to_string()
    } else {
        "live".to_string()
    };
    let desired_total = desired_asks.len() + desired_bids.len();
    let delay_count = st.delay_count;
    let reduce_mode = st.reduce_mode;
    let stop_signal = st.stop_signal;
    let stop_reason = st.stop_reason.clone();
    supervisor.patch_status(symbol, |s| {
        s.running = true;
        s.message = message;
        s.last_tick_at = Some(now_iso());
        s.market_id = Some(market_id);
        s.mid = Some(mid.to_string());
        s.center = Some(center.to_string());
        s.desired = desired_total;
        s.existing = total_existing;
        s.delay_count = delay_count;
        s.reduce_mode = reduce_mode;
        s.stop_signal = stop_signal;
        s.stop_reason = stop_reason;
    });

    Ok(TickOutcome::Continue)
}

/// Time / volume / AS-drawdown stop triggers. Returns the reason on trigger.
#[allow(clippy::too_many_arguments)]
async fn evaluate_stop_conditions(
    supervisor: &Arc<BotSupervisor>,
    symbol: &str,
    trader: &Arc<dyn Trader>,
    runtime: &RuntimeConfig,
    strat: &StrategyConfig,
    st: &mut SymbolState,
    market_id: i64,
    mid: Decimal,
    now: i64,
) -> Option<String> {
    if runtime.stop_after_minutes > Decimal::ZERO {
        let elapsed = Decimal::from(now - st.start_ms);
        if elapsed >= runtime.stop_after_minutes * Decimal::from(60_000) {
            return Some(format!("time limit {} min", runtime.stop_after_minutes));
        }
    }

    let needs_session_stats =
        runtime.stop_after_volume > Decimal::ZERO || strat.as_max_drawdown > Decimal::ZERO;
    if !needs_session_stats {
        return None;
    }

    let (profit, volume) = match session_stats(trader, runtime, st, market_id, mid, now).await {
        Ok(stats) => stats,
        Err(e) => {
            if st.should_log_error("stats", now) {
                supervisor
                    .logbus
                    .publish(&format!("stop.stats.error symbol={symbol} err={e}"));
            }
            return None;
        }
    };

    if runtime.stop_after_volume > Decimal::ZERO && volume >= runtime.stop_after_volume {
        return Some(format!("volume limit {}", runtime.stop_after_volume));
    }

    if strat.grid_mode == GridMode::As && strat.as_max_drawdown > Decimal::ZERO {
        let peak = st.peak_profit.map_or(profit, |p| p.max(profit));
        st.peak_profit = Some(peak);
        if peak - profit >= strat.as_max_drawdown {
            return Some(format!("drawdown {} from peak", peak - profit));
        }
    }

    None
}

/// Session-scoped (profit, volume): sim state when dry, the own-trade cursor
/// when live.
async fn session_stats(
    trader: &Arc<dyn Trader>,
    runtime: &RuntimeConfig,
    st: &mut SymbolState,
    market_id: i64,
    mid: Decimal,
    now: i64,
) -> Result<(Decimal, Decimal), TraderError> {
    if runtime.dry_run {
        let (volume, _) = st.sim.trade_stats(st.start_ms, now);
        return Ok((st.sim.pnl(mid), volume));
    }
    let from = if st.cursor.last_ts_ms > 0 {
        st.cursor.last_ts_ms + 1
    } else {
        st.start_ms
    };
    let trades = trader.trades_since(market_id, from).await?;
    st.cursor.advance(&trades);
    Ok((st.cursor.pnl(mid), st.cursor.volume_notional))
}

/// Terminal drain: cancel the grid, then close or wait out the position.
#[allow(clippy::too_many_arguments)]
async fn run_stop_flow(
    supervisor: &Arc<BotSupervisor>,
    symbol: &str,
    trader: &Arc<dyn Trader>,
    runtime: &RuntimeConfig,
    st: &mut SymbolState,
    market_id: i64,
    meta: &crate::trader::MarketMeta,
    mid: Decimal,
    now: i64,
) -> Result<TickOutcome, String> {
    let prefix = grid_prefix(&trader.account_key(), &market_id.to_string(), symbol);

    // 1. Drain our resting orders.
    if runtime.dry_run {
        st.sim.clear_orders();
    } else {
        match trader.active_orders(market_id).await {
            Ok(orders) => {
                for order in orders
                    .iter()
                    .filter(|o| o.client_order_id > 0 && is_grid_client_order(prefix, o.client_order_id))
                {
                    if let Err(e) = trader.cancel(market_id, order.order_id).await {
                        if e.is_rate_limited() {
                            supervisor.mark_rate_limited(symbol, now);
                            return Ok(TickOutcome::Continue);
                        }
                        if st.should_log_error("stop.cancel", now) {
                            supervisor.logbus.publish(&format!(
                                "order.cancel.error symbol={symbol} id={} err={e}",
                                order.client_order_id
                            ));
                        }
                    }
                }
            }
            Err(e) => {
                note_trader_error(supervisor, st, symbol, "stop.orders", &e, now);
                return Ok(TickOutcome::Continue);
            }
        }
    }
    supervisor
        .logbus
        .publish(&format!("stop.cancel.done symbol={symbol}"));

    // 2. Position small enough to abandon?
    let position = if runtime.dry_run {
        st.sim.position_base
    } else {
        match trader.position_base(market_id).await {
            Ok(position) => position,
            Err(e) => {
                note_trader_error(supervisor, st, symbol, "stop.position", &e, now);
                return Ok(TickOutcome::Continue);
            }
        }
    };
    let dust = meta.min_base_amount.max(unit(meta.size_decimals));
    if position.abs() <= dust {
        finish_stopped(supervisor, symbol, st, runtime.dry_run, mid);
        return Ok(TickOutcome::Terminated);
    }

    // 3. Close at market only once the session P&L is non-negative.
    let (profit, _) = match session_stats(trader, runtime, st, market_id, mid, now).await {
        Ok(stats) => stats,
        Err(e) => {
            note_trader_error(supervisor, st, symbol, "stop.stats", &e, now);
            return Ok(TickOutcome::Continue);
        }
    };
    if profit < Decimal::ZERO {
        let stop_reason = st.stop_reason.clone();
        supervisor.patch_status(symbol, |s| {
            s.running = true;
            s.message = format!("stop pending: pnl {profit} < 0");
            s.last_tick_at = Some(now_iso());
            s.stop_signal = true;
            s.stop_reason = stop_reason;
        });
        return Ok(TickOutcome::Continue);
    }

    let close_is_ask = position > Decimal::ZERO;
    if runtime.dry_run {
        st.sim.apply_fill(close_is_ask, mid, position.abs(), now);
        supervisor.logbus.publish(&format!(
            "dry_run close symbol={symbol} size={} price={mid}",
            position.abs()
        ));
    } else {
        let Some(base_int) = to_scaled_int(position.abs(), meta.size_decimals) else {
            return Ok(TickOutcome::Continue);
        };
        match trader
            .create_market(market_id, base_int, close_is_ask, true)
            .await
        {
            Ok(()) => supervisor.logbus.publish(&format!(
                "stop.close symbol={symbol} size={}",
                position.abs()
            )),
            Err(e) => {
                if e.is_rate_limited() {
                    supervisor.mark_rate_limited(symbol, now);
                } else if st.should_log_error("stop.close", now) {
                    supervisor
                        .logbus
                        .publish(&format!("stop.close.error symbol={symbol} err={e}"));
                }
                return Ok(TickOutcome::Continue);
            }
        }
    }

    finish_stopped(supervisor, symbol, st, runtime.dry_run, mid);
    Ok(TickOutcome::Terminated)
}

/// Writes the terminal history record and flips the status to stopped.
fn finish_stopped(
    supervisor: &Arc<BotSupervisor>,
    symbol: &str,
    st: &mut SymbolState,
    dry_run: bool,
    mid: Decimal,
) {
    let snapshot = build_symbol_snapshot(st, false, mid, dry_run, st.start_ms);
    let mut symbols = std::collections::BTreeMap::new();
    symbols.insert(symbol.to_string(), snapshot);
    let exchange = supervisor
        .config
        .read()
        .map(|c| c.exchange.name)
        .unwrap_or_default();
    let record = HistoryRecord {
        created_at: now_iso(),
        exchange,
        reason: "stop".to_string(),
        stop_reason: st.stop_reason.clone(),
        totals: build_totals(&symbols),
        symbols,
    };
    if let Err(e) = supervisor.history.append(&record) {
        supervisor
            .logbus
            .publish(&format!("history.write.error symbol={symbol} err={e}"));
    }

    let stop_reason = st.stop_reason.clone();
    supervisor.patch_status(symbol, |s| {
        s.running = false;
        s.message = format!("stopped: {stop_reason}");
        s.last_tick_at = Some(now_iso());
        s.stop_signal = true;
        s.stop_reason = stop_reason.clone();
    });
    supervisor
        .logbus
        .publish(&format!("bot.stopped symbol={symbol} reason={stop_reason}"));
}

fn note_trader_error(
    supervisor: &Arc<BotSupervisor>,
    st: &mut SymbolState,
    symbol: &str,
    context: &str,
    err: &TraderError,
    now: i64,
) {
    if err.is_rate_limited() {
        let (delay, streak) = supervisor.mark_rate_limited(symbol, now);
        supervisor.logbus.publish(&format!(
            "rate.limit symbol={symbol} op={context} delay_ms={delay} streak={streak}"
        ));
    } else if st.should_log_error(context, now) {
        supervisor
            .logbus
            .publish(&format!("bot.{context}.error symbol={symbol} err={err}"));
    }
    supervisor.patch_status(symbol, |s| {
        s.message = format!("{context}: {err}");
        s.last_tick_at = Some(now_iso());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn supervisor() -> (tempfile::TempDir, Arc<BotSupervisor>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::new(dir.path().join("config.json")));
        let history = Arc::new(HistoryStore::new(dir.path().join("history.jsonl")));
        let logbus = Arc::new(LogBus::new());
        (dir, Arc::new(BotSupervisor::new(logbus, config, history)))
    }

    #[test]
    fn test_rate_limit_backoff_and_clear() {
        let (_dir, sup) = supervisor();

        let (delay1, streak1) = sup.mark_rate_limited("ETH", 1_000);
        assert_eq!(delay1, 500);
        assert_eq!(streak1, 1);
        assert_eq!(sup.rate_limit_wait_ms("ETH", 1_200), 300);

        let (delay2, streak2) = sup.mark_rate_limited("ETH", 1_200);
        assert_eq!(delay2, 1_000);
        assert_eq!(streak2, 2);
        assert_eq!(sup.rate_limit_wait_ms("ETH", 1_700), 500);

        sup.clear_rate_limited("ETH");
        assert_eq!(sup.rate_limit_wait_ms("ETH", 1_700), 0);
    }

    #[test]
    fn test_rate_limit_delay_caps_at_8s() {
        let (_dir, sup) = supervisor();
        let mut delay = 0;
        for _ in 0..10 {
            delay = sup.mark_rate_limited("BTC", 0).0;
        }
        assert_eq!(delay, 8_000);
    }

    #[test]
    fn test_reduce_mode_hysteresis() {
        let max = dec!(100);
        let exit = dec!(80);

        assert!(!update_reduce_mode(false, dec!(99), max, exit));
        assert!(update_reduce_mode(false, dec!(101), max, exit));
        assert!(update_reduce_mode(false, dec!(100), max, exit));
        // Stays on between exit and max.
        assert!(update_reduce_mode(true, dec!(90), max, exit));
        // Clears at or below the exit threshold.
        assert!(!update_reduce_mode(true, dec!(80), max, exit));
        assert!(!update_reduce_mode(true, dec!(79), max, exit));
        // No cap → never engages.
        assert!(!update_reduce_mode(true, dec!(1000), Decimal::ZERO, exit));
    }

    #[test]
    fn test_delay_counter_counts_each_price_once() {
        let mut seen = BTreeSet::new();
        let mut count = 0u64;

        let wrong: BTreeSet<(bool, Decimal)> =
            [(true, dec!(99.5)), (false, dec!(101.5))].into_iter().collect();
        update_delay_counter(&mut seen, &mut count, &wrong);
        assert_eq!(count, 2);

        // Same set again: no double counting.
        update_delay_counter(&mut seen, &mut count, &wrong);
        assert_eq!(count, 2);

        // One price recovers, then regresses: counts again.
        let only_ask: BTreeSet<(bool, Decimal)> = [(true, dec!(99.5))].into_iter().collect();
        update_delay_counter(&mut seen, &mut count, &only_ask);
        assert_eq!(count, 2);
        update_delay_counter(&mut seen, &mut count, &wrong);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_restart_budget_window() {
        let mut times = Vec::new();
        let window = 60_000;
        // restart_max = 2: third restart inside the window is refused.
        assert!(restart_allowed(&mut times, 1_000, window, 2));
        assert!(restart_allowed(&mut times, 2_000, window, 2));
        assert!(!restart_allowed(&mut times, 3_000, window, 2));
        // Outside the window the budget resets.
        assert!(restart_allowed(&mut times, 70_000, window, 2));
    }

    #[test]
    fn test_trade_cursor_forward_only() {
        let mut cursor = TradeCursor::default();
        let trades = vec![
            OwnTrade {
                ts_ms: 1_000,
                price: dec!(100),
                size: dec!(1),
                is_ask: false,
            },
            OwnTrade {
                ts_ms: 2_000,
                price: dec!(101),
                size: dec!(1),
                is_ask: true,
            },
        ];
        cursor.advance(&trades);
        assert_eq!(cursor.realized_pnl, dec!(1));
        assert_eq!(cursor.position_base, Decimal::ZERO);
        assert_eq!(cursor.trade_count, 2);
        assert_eq!(cursor.volume_notional, dec!(201));
        assert_eq!(cursor.last_ts_ms, 2_000);

        // Replaying the same page is a no-op.
        cursor.advance(&trades);
        assert_eq!(cursor.trade_count, 2);
        assert_eq!(cursor.realized_pnl, dec!(1));
    }

    #[test]
    fn test_trade_cursor_pnl_marks_open_position() {
        let mut cursor = TradeCursor::default();
        cursor.advance(&[OwnTrade {
            ts_ms: 1,
            price: dec!(100),
            size: dec!(0.1),
            is_ask: false,
        }]);
        assert_eq!(cursor.pnl(dec!(110)), dec!(1.0));
    }

    #[tokio::test]
    async fn test_snapshot_empty_and_status_patch() {
        let (_dir, sup) = supervisor();
        assert!(sup.snapshot().is_empty());
        sup.patch_status("ETH", |s| {
            s.running = true;
            s.message = "sim".to_string();
        });
        let snap = sup.snapshot();
        assert!(snap["ETH"].running);
        assert_eq!(snap["ETH"].message, "sim");
    }

    #[tokio::test]
    async fn test_manual_stop_is_sticky() {
        let (_dir, sup) = supervisor();
        sup.stop("ETH").await;
        assert!(sup.is_manual_stopped("ETH"));
        let snap = sup.snapshot();
        assert!(!snap["ETH"].running);
        assert_eq!(snap["ETH"].message, "stopped");
    }
}
