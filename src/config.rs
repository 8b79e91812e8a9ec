// ─────────────────────────────────────────────────────────────────────────────
// config.rs — Persisted configuration and its read-side accessors
//
// One JSON document on disk: runtime flags, exchange account wiring, and one
// strategy block per symbol. Writes go through a temp file + rename so a
// crash mid-write never leaves a torn config behind.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::filter::MarketFilterConfig;
use crate::ids::MAX_LEVEL_PER_SIDE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridMode {
    Dynamic,
    As,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSizeMode {
    Notional,
    Base,
}

/// Global runtime flags, re-read every loop tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default)]
    pub simulate_fill: bool,
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_restart_max")]
    pub restart_max: u32,
    #[serde(default = "default_restart_window_ms")]
    pub restart_window_ms: i64,
    #[serde(default)]
    pub stop_after_minutes: Decimal,
    #[serde(default)]
    pub stop_after_volume: Decimal,
    #[serde(default = "default_stop_check_interval_ms")]
    pub stop_check_interval_ms: i64,
}

fn default_true() -> bool {
    true
}
fn default_loop_interval_ms() -> u64 {
    100
}
fn default_restart_delay_ms() -> u64 {
    1_000
}
fn default_restart_max() -> u32 {
    5
}
fn default_restart_window_ms() -> i64 {
    60_000
}
fn default_stop_check_interval_ms() -> i64 {
    1_000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("runtime defaults")
    }
}

impl RuntimeConfig {
    /// Stop checks are never allowed to spin faster than 200 ms.
    pub fn stop_check_interval_ms(&self) -> i64 {
        self.stop_check_interval_ms.max(200)
    }
}

/// Venue account wiring. Secrets themselves come from the environment; the
/// store only knows which account to bind to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default)]
    pub l1_address: String,
    #[serde(default)]
    pub account_index: Option<i64>,
    #[serde(default)]
    pub api_key_index: Option<i64>,
    /// Rotate client-ID levels instead of always reusing the smallest free
    /// one; some venues dislike a just-cancelled ID coming straight back.
    #[serde(default)]
    pub rotate_client_ids: bool,
}

fn default_exchange_name() -> String {
    "lighter".to_string()
}
fn default_env() -> String {
    "mainnet".to_string()
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("exchange defaults")
    }
}

/// Per-symbol strategy block.
///
/// AS mode always quotes exactly one ask and one bid; `levels_up`,
/// `levels_down` and `max_open_orders` only apply to dynamic mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub market_id: Option<i64>,
    #[serde(default = "default_grid_mode")]
    pub grid_mode: GridMode,
    #[serde(default)]
    pub grid_step: Decimal,
    #[serde(default = "default_levels")]
    pub levels_up: u64,
    #[serde(default = "default_levels")]
    pub levels_down: u64,
    #[serde(default = "default_order_size_mode")]
    pub order_size_mode: OrderSizeMode,
    #[serde(default = "default_order_size_value")]
    pub order_size_value: Decimal,
    #[serde(default = "default_true")]
    pub post_only: bool,
    /// 0 = unlimited.
    #[serde(default = "default_max_open_orders")]
    pub max_open_orders: u64,
    /// 0 = no position cap.
    #[serde(default = "default_max_position_notional")]
    pub max_position_notional: Decimal,
    /// Exit threshold of reduce-mode; 0 falls back to 0.8 × max at runtime.
    #[serde(default)]
    pub reduce_position_notional: Decimal,
    #[serde(default = "default_reduce_multiplier")]
    pub reduce_order_size_multiplier: Decimal,
    #[serde(default = "default_as_gamma")]
    pub as_gamma: Decimal,
    #[serde(default = "default_as_k")]
    pub as_k: Decimal,
    #[serde(default = "default_as_tau")]
    pub as_tau: Decimal,
    #[serde(default = "default_as_vol_points")]
    pub as_vol_points: usize,
    #[serde(default = "default_as_step_multiplier")]
    pub as_step_multiplier: Decimal,
    /// 0 disables the AS drawdown stop.
    #[serde(default)]
    pub as_max_drawdown: Decimal,
    #[serde(default)]
    pub market_filter: MarketFilterConfig,
}

fn default_grid_mode() -> GridMode {
    GridMode::Dynamic
}
fn default_levels() -> u64 {
    10
}
fn default_order_size_mode() -> OrderSizeMode {
    OrderSizeMode::Notional
}
fn default_order_size_value() -> Decimal {
    Decimal::from(5)
}
fn default_max_open_orders() -> u64 {
    50
}
fn default_max_position_notional() -> Decimal {
    Decimal::from(20)
}
fn default_reduce_multiplier() -> Decimal {
    Decimal::ONE
}
fn default_as_gamma() -> Decimal {
    Decimal::new(1, 1) // 0.1
}
fn default_as_k() -> Decimal {
    Decimal::new(15, 1) // 1.5
}
fn default_as_tau() -> Decimal {
    Decimal::from(30)
}
fn default_as_vol_points() -> usize {
    60
}
fn default_as_step_multiplier() -> Decimal {
    Decimal::ONE
}

impl Default for StrategyConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("strategy defaults")
    }
}

impl StrategyConfig {
    /// Rejects configurations the loop must not trade on. The loop surfaces
    /// the message in the bot status and retries only after a config change.
    pub fn validate(&self) -> Result<(), String> {
        if self.grid_mode == GridMode::Dynamic && self.grid_step <= Decimal::ZERO {
            return Err("grid_step must be > 0".to_string());
        }
        if self.order_size_value <= Decimal::ZERO {
            return Err("order_size_value must be > 0".to_string());
        }
        if self.levels_up > MAX_LEVEL_PER_SIDE || self.levels_down > MAX_LEVEL_PER_SIDE {
            return Err(format!("levels must be <= {MAX_LEVEL_PER_SIDE}"));
        }
        if self.reduce_order_size_multiplier < Decimal::ONE {
            return Err("reduce_order_size_multiplier must be >= 1".to_string());
        }
        if self.max_position_notional > Decimal::ZERO
            && self.reduce_position_notional > Decimal::ZERO
            && self.reduce_position_notional >= self.max_position_notional
        {
            return Err(
                "reduce_position_notional must be below max_position_notional".to_string(),
            );
        }
        if self.grid_mode == GridMode::As {
            if self.as_gamma <= Decimal::ZERO
                || self.as_k <= Decimal::ZERO
                || self.as_tau <= Decimal::ZERO
            {
                return Err("as parameters gamma/k/tau must be > 0".to_string());
            }
            if self.as_vol_points < 2 {
                return Err("as_vol_points must be >= 2".to_string());
            }
        }
        Ok(())
    }

    /// Reduce-mode exit threshold with the 0.8 × max fallback.
    pub fn reduce_exit_notional(&self) -> Decimal {
        if self.reduce_position_notional > Decimal::ZERO
            && self.reduce_position_notional < self.max_position_notional
        {
            self.reduce_position_notional
        } else {
            self.max_position_notional * Decimal::new(8, 1)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub strategies: BTreeMap<String, StrategyConfig>,
}

impl AppConfig {
    pub fn seed() -> Self {
        let mut strategies = BTreeMap::new();
        for symbol in ["BTC", "ETH", "SOL"] {
            strategies.insert(symbol.to_string(), StrategyConfig::default());
        }
        Self {
            runtime: RuntimeConfig::default(),
            exchange: ExchangeConfig::default(),
            strategies,
        }
    }

    pub fn strategy(&self, symbol: &str) -> Option<&StrategyConfig> {
        self.strategies.get(symbol)
    }
}

/// File-backed store. All access goes through one mutex; writes are atomic.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Creates the file with seeded defaults when missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !self.path.exists() {
            let _guard = self.lock.lock().expect("config lock poisoned");
            self.write_unlocked(&AppConfig::seed())?;
        }
        Ok(())
    }

    pub fn read(&self) -> std::io::Result<AppConfig> {
        self.ensure()?;
        let _guard = self.lock.lock().expect("config lock poisoned");
        let raw = fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn write(&self, config: &AppConfig) -> std::io::Result<()> {
        self.ensure()?;
        let _guard = self.lock.lock().expect("config lock poisoned");
        self.write_unlocked(config)
    }

    /// Deep-merges a JSON patch into the stored document and returns the
    /// merged config.
    pub fn update(&self, patch: &serde_json::Value) -> std::io::Result<AppConfig> {
        let current = self.read()?;
        let mut value = serde_json::to_value(&current)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        deep_merge(&mut value, patch);
        let merged: AppConfig = serde_json::from_value(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.write(&merged)?;
        Ok(merged)
    }

    fn write_unlocked(&self, config: &AppConfig) -> std::io::Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(config)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)
    }
}

fn deep_merge(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(slot) if slot.is_object() && value.is_object() => {
                        deep_merge(slot, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        (dir, store)
    }

    #[test]
    fn test_seed_and_read_back() {
        let (_dir, store) = store();
        let cfg = store.read().unwrap();
        assert!(cfg.runtime.dry_run);
        assert_eq!(cfg.runtime.loop_interval_ms, 100);
        assert!(cfg.strategies.contains_key("ETH"));
        assert_eq!(cfg.strategies["ETH"].levels_up, 10);
    }

    #[test]
    fn test_update_deep_merges() {
        let (_dir, store) = store();
        let merged = store
            .update(&serde_json::json!({
                "runtime": {"dry_run": false},
                "strategies": {"ETH": {"grid_step": "1.0", "market_id": 1}}
            }))
            .unwrap();
        assert!(!merged.runtime.dry_run);
        assert_eq!(merged.runtime.loop_interval_ms, 100);
        assert_eq!(merged.strategies["ETH"].grid_step, dec!(1.0));
        assert_eq!(merged.strategies["ETH"].market_id, Some(1));
        // Untouched symbols survive.
        assert!(merged.strategies.contains_key("BTC"));
    }

    #[test]
    fn test_validate_rejects_bad_strategy() {
        let mut strat = StrategyConfig::default();
        assert!(strat.validate().is_err()); // grid_step defaults to 0

        strat.grid_step = dec!(1);
        assert!(strat.validate().is_ok());

        strat.order_size_value = Decimal::ZERO;
        assert!(strat.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_reduce_at_or_above_max() {
        let strat = StrategyConfig {
            grid_step: dec!(1),
            max_position_notional: dec!(100),
            reduce_position_notional: dec!(100),
            ..Default::default()
        };
        assert!(strat.validate().is_err());

        let ok = StrategyConfig {
            reduce_position_notional: dec!(80),
            ..strat
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_reduce_exit_defaults_to_80_pct() {
        let strat = StrategyConfig {
            grid_step: dec!(1),
            max_position_notional: dec!(100),
            ..Default::default()
        };
        assert_eq!(strat.reduce_exit_notional(), dec!(80.0));

        let explicit = StrategyConfig {
            reduce_position_notional: dec!(60),
            ..strat
        };
        assert_eq!(explicit.reduce_exit_notional(), dec!(60));
    }

    #[test]
    fn test_as_mode_validation() {
        let strat = StrategyConfig {
            grid_mode: GridMode::As,
            order_size_value: dec!(10),
            as_gamma: Decimal::ZERO,
            ..Default::default()
        };
        assert!(strat.validate().is_err());

        let ok = StrategyConfig {
            as_gamma: dec!(0.1),
            ..strat
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_stop_check_interval_floor() {
        let rt = RuntimeConfig {
            stop_check_interval_ms: 50,
            ..Default::default()
        };
        assert_eq!(rt.stop_check_interval_ms(), 200);
    }
}
