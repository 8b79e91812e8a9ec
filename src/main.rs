// ─────────────────────────────────────────────────────────────────────────────
// grid-engine-rs: multi-symbol grid market-making engine for perp venues
//
// One supervisor, one reconciliation loop per enabled symbol. The venue is
// the source of truth for resting orders; deterministic client order IDs let
// the engine pick its own grid back up after a restart.
// ─────────────────────────────────────────────────────────────────────────────
mod bot;
mod config;
mod filter;
mod history;
mod ids;
mod indicator;
mod lighter;
mod logbus;
mod market_ws;
mod quant;
mod reconcile;
mod sim;
mod trader;

use std::path::Path;
use std::sync::Arc;

use bot::BotSupervisor;
use config::ConfigStore;
use history::HistoryStore;
use lighter::LighterTrader;
use logbus::LogBus;
use trader::Trader;

#[tokio::main]
async fn main() {
    // Load .env if present (silently ignored when missing).
    dotenvy::dotenv().ok();
    env_logger::init();
    log::info!("grid-engine-rs starting…");

    let data_dir = std::env::var("GRID_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let config = Arc::new(ConfigStore::new(Path::new(&data_dir).join("config.json")));
    if let Err(e) = config.ensure() {
        log::error!("config init failed: {e}");
        return;
    }
    let history = Arc::new(HistoryStore::new(Path::new(&data_dir).join("history.jsonl")));
    let logbus = Arc::new(LogBus::new());
    logbus.publish("server.start");

    let cfg = match config.read() {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("config read failed: {e}");
            return;
        }
    };

    log::info!(
        "  mode: {}{}",
        if cfg.runtime.dry_run { "dry-run" } else { "LIVE" },
        if cfg.runtime.dry_run && cfg.runtime.simulate_fill {
            " + simulated fills"
        } else {
            ""
        }
    );
    log::info!("  exchange: {} ({})", cfg.exchange.name, cfg.exchange.env);

    // Secrets come from the environment; the config store only knows the
    // account wiring.
    let api_private_key = std::env::var("GRID_API_PRIVATE_KEY").ok();
    let trader: Arc<dyn Trader> = match LighterTrader::new(
        &cfg.exchange.env,
        cfg.exchange.account_index.unwrap_or(-1),
        cfg.exchange.api_key_index.unwrap_or(0),
        api_private_key.as_deref(),
    ) {
        Ok(trader) => Arc::new(trader),
        Err(e) => {
            log::error!("trader init failed: {e}");
            return;
        }
    };

    if !cfg.runtime.dry_run {
        if let Some(err) = trader.check_client() {
            log::error!("trader self-test failed: {err}");
            return;
        }
    }

    let supervisor = Arc::new(BotSupervisor::new(
        logbus.clone(),
        config.clone(),
        history.clone(),
    ));

    let symbols: Vec<String> = cfg
        .strategies
        .iter()
        .filter(|(_, strat)| strat.enabled)
        .map(|(symbol, _)| symbol.clone())
        .collect();
    if symbols.is_empty() {
        log::warn!("no enabled strategies in config; idling");
    }
    for symbol in &symbols {
        supervisor.start(symbol, Arc::clone(&trader), true).await;
    }
    log::info!("{} bot(s) started. ctrl-c to stop.", symbols.len());

    let _ = tokio::signal::ctrl_c().await;
    log::info!("shutting down…");

    if cfg.runtime.dry_run {
        supervisor.stop_all().await;
        supervisor.capture_history(&trader, "shutdown").await;
    } else {
        // Live shutdown also clears anything still resting on the venue.
        supervisor.emergency_stop(&trader).await;
    }
    trader.close().await;
    logbus.publish("server.stop");
}
