// ─────────────────────────────────────────────────────────────────────────────
// logbus.rs — Operational log sink
//
// Short component-token lines ("bot.start symbol=ETH") land here. The bus
// keeps a bounded ring for late readers and fans live lines out over a
// broadcast channel; it also mirrors everything to the process logger.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::broadcast;

const MAX_ITEMS: usize = 2_000;

#[derive(Debug)]
pub struct LogBus {
    items: Mutex<VecDeque<String>>,
    sender: broadcast::Sender<String>,
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            items: Mutex::new(VecDeque::with_capacity(MAX_ITEMS)),
            sender,
        }
    }

    pub fn publish(&self, message: &str) {
        let line = format!(
            "[{}] {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%z"),
            message
        );
        log::info!("{message}");
        {
            let mut items = self.items.lock().expect("logbus poisoned");
            if items.len() >= MAX_ITEMS {
                items.pop_front();
            }
            items.push_back(line.clone());
        }
        // Nobody listening is fine.
        let _ = self.sender.send(line);
    }

    /// Most recent `limit` lines, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }
        let items = self.items.lock().expect("logbus poisoned");
        items
            .iter()
            .skip(items.len().saturating_sub(limit))
            .cloned()
            .collect()
    }

    /// Live subscription for streaming consumers.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_returns_tail_in_order() {
        let bus = LogBus::new();
        bus.publish("a");
        bus.publish("b");
        bus.publish("c");
        let lines = bus.recent(2);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" b"));
        assert!(lines[1].ends_with(" c"));
        assert!(bus.recent(0).is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_sees_new_lines() {
        let bus = LogBus::new();
        let mut rx = bus.subscribe();
        bus.publish("order.create symbol=ETH id=1");
        let line = rx.recv().await.unwrap();
        assert!(line.contains("order.create symbol=ETH id=1"));
    }
}
