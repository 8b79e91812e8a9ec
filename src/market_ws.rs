// ─────────────────────────────────────────────────────────────────────────────
// market_ws.rs — WebSocket top-of-book cache
//
// One background stream per subscribed market keeps the latest best bid/ask.
// Readers wait at most one second for a first value; when the stream has
// nothing yet the trader falls back to REST. Streams reconnect on their own
// with capped exponential backoff.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

pub type Bbo = (Option<Decimal>, Option<Decimal>);

const FIRST_VALUE_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY_SECS: u64 = 32;

struct BookStream {
    task: JoinHandle<()>,
    rx: watch::Receiver<Option<Bbo>>,
}

/// Per-venue order-book subscription manager.
pub struct MarketDataWs {
    ws_url: String,
    streams: Mutex<HashMap<i64, BookStream>>,
}

impl MarketDataWs {
    pub fn new(ws_url: String) -> Self {
        Self {
            ws_url,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Latest cached BBO for the market, subscribing on first use. Returns
    /// `(None, None)` when nothing has arrived within the wait budget.
    pub async fn best_bid_ask(&self, market_id: i64) -> Bbo {
        let mut rx = self.ensure_stream(market_id).await;
        if let Some(bbo) = *rx.borrow() {
            return bbo;
        }
        // No book yet: wait briefly for the stream's first update.
        let _ = tokio::time::timeout(FIRST_VALUE_TIMEOUT, rx.changed()).await;
        let result = (*rx.borrow()).unwrap_or((None, None));
        result
    }

    async fn ensure_stream(&self, market_id: i64) -> watch::Receiver<Option<Bbo>> {
        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get(&market_id) {
            if !stream.task.is_finished() {
                return stream.rx.clone();
            }
        }

        let (tx, rx) = watch::channel(None);
        let url = self.ws_url.clone();
        let task = tokio::spawn(async move {
            run_book_stream(url, market_id, tx).await;
        });
        streams.insert(market_id, BookStream { task, rx: rx.clone() });
        rx
    }

    pub async fn close(&self) {
        let mut streams = self.streams.lock().await;
        for (_, stream) in streams.drain() {
            stream.task.abort();
        }
    }
}

async fn run_book_stream(ws_url: String, market_id: i64, tx: watch::Sender<Option<Bbo>>) {
    let mut retry_delay_secs: u64 = 1;

    loop {
        let url = match Url::parse(&ws_url) {
            Ok(url) => url,
            Err(e) => {
                log::error!("market_ws: bad url {ws_url}: {e}");
                return;
            }
        };

        match connect_async(url).await {
            Ok((ws_stream, _)) => {
                log::debug!("market_ws: connected market_id={market_id}");
                retry_delay_secs = 1;
                let (mut write, mut read) = ws_stream.split();

                let sub = serde_json::json!({
                    "type": "subscribe",
                    "channel": format!("order_book/{market_id}"),
                });
                if let Err(e) = write.send(Message::Text(sub.to_string())).await {
                    log::warn!("market_ws: subscribe failed market_id={market_id}: {e}");
                }

                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            if let Some(bbo) = parse_book_message(&text, market_id) {
                                let _ = tx.send(Some(bbo));
                            }
                        }
                        Ok(Message::Ping(data)) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Ok(Message::Close(_)) => {
                            log::warn!("market_ws: closed by server market_id={market_id}");
                            break;
                        }
                        Err(e) => {
                            log::warn!("market_ws: error market_id={market_id}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => {
                log::warn!(
                    "market_ws: connect failed market_id={market_id}: {e}. retry in {retry_delay_secs}s"
                );
            }
        }

        // A stale cache is worse than an empty one while we reconnect.
        let _ = tx.send(None);
        tokio::time::sleep(Duration::from_secs(retry_delay_secs)).await;
        retry_delay_secs = (retry_delay_secs * 2).min(MAX_RECONNECT_DELAY_SECS);
    }
}

/// Extracts best bid/ask from an order-book payload for our market. The feed
/// labels channels as "order_book/<id>" (subscription echo) or
/// "order_book:<id>" (updates); both carry the book under "order_book".
fn parse_book_message(text: &str, market_id: i64) -> Option<Bbo> {
    let parsed: serde_json::Value = serde_json::from_str(text).ok()?;
    let channel = parsed["channel"].as_str().unwrap_or("");
    if !channel_matches(channel, market_id) {
        return None;
    }
    let book = if parsed["order_book"].is_object() {
        &parsed["order_book"]
    } else {
        &parsed["data"]
    };
    let bid = best_price(book["bids"].as_array(), true);
    let ask = best_price(book["asks"].as_array(), false);
    if bid.is_none() && ask.is_none() {
        return None;
    }
    Some((bid, ask))
}

fn channel_matches(channel: &str, market_id: i64) -> bool {
    let id = market_id.to_string();
    channel == format!("order_book/{id}") || channel == format!("order_book:{id}")
}

fn best_price(levels: Option<&Vec<serde_json::Value>>, highest: bool) -> Option<Decimal> {
    let mut best: Option<Decimal> = None;
    for level in levels? {
        let Some(raw) = level["price"]
            .as_str()
            .map(str::to_string)
            .or_else(|| level["price"].as_f64().map(|v| v.to_string()))
        else {
            continue;
        };
        let Ok(price) = raw.parse::<Decimal>() else {
            continue;
        };
        best = match best {
            None => Some(price),
            Some(current) if highest && price > current => Some(price),
            Some(current) if !highest && price < current => Some(price),
            Some(current) => Some(current),
        };
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_book_message_best_of_each_side() {
        let text = serde_json::json!({
            "channel": "order_book:1",
            "order_book": {
                "bids": [{"price": "100.3", "size": "1"}, {"price": "100.4", "size": "2"}],
                "asks": [{"price": "100.7", "size": "1"}, {"price": "100.6", "size": "2"}],
            }
        })
        .to_string();
        let (bid, ask) = parse_book_message(&text, 1).unwrap();
        assert_eq!(bid, Some(dec!(100.4)));
        assert_eq!(ask, Some(dec!(100.6)));
    }

    #[test]
    fn test_parse_book_message_ignores_other_markets() {
        let text = serde_json::json!({
            "channel": "order_book:2",
            "order_book": {"bids": [{"price": "1"}], "asks": []},
        })
        .to_string();
        assert!(parse_book_message(&text, 1).is_none());
    }

    #[test]
    fn test_parse_book_message_one_sided_book() {
        let text = serde_json::json!({
            "channel": "order_book/3",
            "order_book": {"bids": [], "asks": [{"price": "5.5", "size": "9"}]},
        })
        .to_string();
        let (bid, ask) = parse_book_message(&text, 3).unwrap();
        assert_eq!(bid, None);
        assert_eq!(ask, Some(dec!(5.5)));
    }

    #[test]
    fn test_parse_book_message_rejects_garbage() {
        assert!(parse_book_message("not json", 1).is_none());
        let empty = serde_json::json!({
            "channel": "order_book:1",
            "order_book": {"bids": [], "asks": []},
        })
        .to_string();
        assert!(parse_book_message(&empty, 1).is_none());
    }
}
