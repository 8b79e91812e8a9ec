// ─────────────────────────────────────────────────────────────────────────────
// trader.rs — Venue-agnostic trader abstraction
//
// A Trader is one authenticated connection to one venue for one account. The
// control loop only ever sees this trait plus the normalized records below;
// venue payload quirks stay inside the concrete implementations.
// ─────────────────────────────────────────────────────────────────────────────
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Per-market immutable metadata, cached inside the trader after first fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMeta {
    pub market_id: i64,
    pub symbol: String,
    pub size_decimals: u32,
    pub price_decimals: u32,
    pub min_base_amount: Decimal,
    pub min_quote_amount: Decimal,
}

/// A resting order as the control loop sees it, decoded from whatever shape
/// the venue returns.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    /// Client order ID (0 when the venue lost or never had it).
    pub client_order_id: u64,
    /// Venue-native order ID used for cancels.
    pub order_id: i64,
    pub is_ask: bool,
    /// Price in integer wire units on the market's tick grid.
    pub price_int: i64,
    /// Size in integer wire units on the market's lot grid.
    pub size_int: i64,
    pub status: String,
    pub created_at_ms: i64,
}

/// One of our own fills, normalized from the venue's trade history.
#[derive(Debug, Clone)]
pub struct OwnTrade {
    pub ts_ms: i64,
    pub price: Decimal,
    pub size: Decimal,
    pub is_ask: bool,
}

/// Error taxonomy for venue calls. The loop keys its behavior off the kind,
/// never off venue-specific payloads.
#[derive(Debug, thiserror::Error)]
pub enum TraderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl TraderError {
    pub fn is_rate_limited(&self) -> bool {
        match self {
            TraderError::RateLimited(_) => true,
            TraderError::Rejected(text) | TraderError::Transport(text) => {
                is_rate_limited_text(text)
            }
        }
    }
}

/// Venues signal throttling inconsistently: HTTP 429, embedded error codes,
/// or free text. Substring match is the common denominator.
pub fn is_rate_limited_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("429")
        || lowered.contains("rate limit")
        || lowered.contains("too many request")
}

#[async_trait]
pub trait Trader: Send + Sync {
    /// Stable key naming the venue account (part of the CID prefix).
    fn account_key(&self) -> String;

    /// Synchronous self-test of the local signer/credentials.
    fn check_client(&self) -> Option<String>;

    async fn close(&self);

    async fn market_meta(&self, market_id: i64) -> Result<MarketMeta, TraderError>;

    /// Resolves a symbol to its perp market id from venue metadata.
    async fn resolve_market(&self, symbol: &str) -> Result<Option<i64>, TraderError>;

    /// Top of book. Prefers the WS cache, falls back to REST; either side may
    /// be absent on a one-sided or empty book.
    async fn best_bid_ask(
        &self,
        market_id: i64,
    ) -> Result<(Option<Decimal>, Option<Decimal>), TraderError>;

    async fn active_orders(&self, market_id: i64) -> Result<Vec<OpenOrder>, TraderError>;

    /// Signed base position: long > 0, short < 0. May be served from a short
    /// TTL cache.
    async fn position_base(&self, market_id: i64) -> Result<Decimal, TraderError>;

    /// Places a limit order. `base_amount` and `price` are integer wire units
    /// already on the market's grids; idempotent per (account, cid).
    #[allow(clippy::too_many_arguments)]
    async fn create_limit(
        &self,
        market_id: i64,
        client_order_id: u64,
        base_amount: i64,
        price: i64,
        is_ask: bool,
        post_only: bool,
        reduce_only: bool,
    ) -> Result<(), TraderError>;

    /// Immediate-or-cancel market order in integer base units.
    async fn create_market(
        &self,
        market_id: i64,
        base_amount: i64,
        is_ask: bool,
        reduce_only: bool,
    ) -> Result<(), TraderError>;

    /// Cancels by venue-native order id; idempotent.
    async fn cancel(&self, market_id: i64, order_id: i64) -> Result<(), TraderError>;

    /// Aggregate notional volume and fill count in [start_ms, end_ms],
    /// bounded page count.
    async fn fills_since(
        &self,
        market_id: i64,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<(Decimal, u64), TraderError>;

    /// Raw own trades at or after `start_ms`, oldest first. Used to advance
    /// the per-symbol P&L cursor on venues without a direct P&L read.
    async fn trades_since(
        &self,
        market_id: i64,
        start_ms: i64,
    ) -> Result<Vec<OwnTrade>, TraderError>;

    /// Bearer token valid for at least 60 s more.
    async fn auth_token(&self) -> Result<String, TraderError>;
}

// ─── Request pacing ──────────────────────────────────────────────────────────

/// Minimum spacing between venue requests plus the retry delays used when the
/// venue answers with a rate limit.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    retry_limit: u32,
    retry_base_ms: u64,
    retry_cap_ms: u64,
}

impl Default for Throttle {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(350),
            last_request: Mutex::new(None),
            retry_limit: 4,
            retry_base_ms: 800,
            retry_cap_ms: 8_000,
        }
    }
}

impl Throttle {
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Capped exponential backoff for retry `attempt` (0-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let ms = self
            .retry_base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.retry_cap_ms);
        Duration::from_millis(ms)
    }

    /// Sleeps just long enough to honor the minimum inter-request spacing.
    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_text_matches() {
        assert!(is_rate_limited_text(
            "ApiException: (429) Too Many Requests! code=23000"
        ));
        assert!(is_rate_limited_text("Rate Limit exceeded"));
        assert!(is_rate_limited_text("too many requests, slow down"));
    }

    #[test]
    fn test_rate_limited_text_rejects_plain_errors() {
        assert!(!is_rate_limited_text("network timeout"));
        assert!(!is_rate_limited_text("post only would cross"));
    }

    #[test]
    fn test_error_kind_rate_limit_detection() {
        assert!(TraderError::RateLimited("".into()).is_rate_limited());
        assert!(TraderError::Transport("HTTP 429".into()).is_rate_limited());
        assert!(!TraderError::Rejected("bad price".into()).is_rate_limited());
    }

    #[test]
    fn test_retry_delay_caps() {
        let t = Throttle::default();
        assert_eq!(t.retry_delay(0), Duration::from_millis(800));
        assert_eq!(t.retry_delay(1), Duration::from_millis(1_600));
        assert_eq!(t.retry_delay(10), Duration::from_millis(8_000));
    }
}
