// ─────────────────────────────────────────────────────────────────────────────
// history.rs — Append-only run-history journal (JSONL)
//
// One record per bot stop (or explicit capture). Readers get the last N
// lines; a corrupt line is skipped rather than failing the whole read.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Aggregate figures across all captured symbols.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryTotals {
    pub profit: Decimal,
    pub volume: Decimal,
    pub trade_count: u64,
    pub position_notional: Decimal,
    pub open_orders: u64,
    pub reduce_symbols: Vec<String>,
    pub running: u64,
}

/// Per-symbol snapshot at capture time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SymbolSnapshot {
    pub running: bool,
    pub profit: Decimal,
    pub volume: Decimal,
    pub trade_count: u64,
    pub position_notional: Decimal,
    pub open_orders: u64,
    pub reduce_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub created_at: String,
    pub exchange: String,
    pub reason: String,
    #[serde(default)]
    pub stop_reason: String,
    pub totals: HistoryTotals,
    pub symbols: BTreeMap<String, SymbolSnapshot>,
}

#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn append(&self, record: &HistoryRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let _guard = self.lock.lock().expect("history lock poisoned");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }

    /// Last `limit` records, oldest first. `limit == 0` returns everything.
    pub fn read(&self, limit: usize) -> Vec<HistoryRecord> {
        let raw = {
            let _guard = self.lock.lock().expect("history lock poisoned");
            match fs::read_to_string(&self.path) {
                Ok(raw) => raw,
                Err(_) => return Vec::new(),
            }
        };
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = if limit > 0 {
            lines.len().saturating_sub(limit)
        } else {
            0
        };
        lines[start..]
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(reason: &str) -> HistoryRecord {
        HistoryRecord {
            created_at: "2025-01-01T00:00:00+00:00".to_string(),
            exchange: "lighter".to_string(),
            reason: reason.to_string(),
            stop_reason: String::new(),
            totals: HistoryTotals {
                profit: dec!(1.5),
                volume: dec!(520),
                trade_count: 12,
                position_notional: dec!(10),
                open_orders: 4,
                reduce_symbols: vec![],
                running: 1,
            },
            symbols: BTreeMap::new(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        store.append(&record("stop")).unwrap();
        store.append(&record("emergency")).unwrap();

        let all = store.read(0);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].reason, "stop");
        assert_eq!(all[1].reason, "emergency");

        let last = store.read(1);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].reason, "emergency");
    }

    #[test]
    fn test_read_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = HistoryStore::new(&path);
        store.append(&record("stop")).unwrap();
        {
            let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{{ not json").unwrap();
        }
        store.append(&record("stop2")).unwrap();

        let all = store.read(0);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].reason, "stop2");
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("nope.jsonl"));
        assert!(store.read(10).is_empty());
    }
}
