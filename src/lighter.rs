// ─────────────────────────────────────────────────────────────────────────────
// lighter.rs — Lighter perps trader
//
// REST client plus a native transaction signer. Prices and sizes cross this
// boundary as integers already scaled onto the market's grids; this module
// never rounds. Order and cancel transactions are msgpack-hashed and signed
// with the account's ETH key, with a nonce lock held across sign + send.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use ethers_core::types::H256;
use ethers_core::utils::keccak256;
use ethers_signers::{LocalWallet, Signer};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::market_ws::MarketDataWs;
use crate::quant::{quantize_price, to_scaled_int};
use crate::trader::{
    is_rate_limited_text, MarketMeta, OpenOrder, OwnTrade, Throttle, Trader, TraderError,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const POSITIONS_TTL: Duration = Duration::from_secs(2);
const AUTH_DEADLINE_SECS: i64 = 60 * 60;
const AUTH_REFRESH_MARGIN_SECS: i64 = 60;
const MAX_TRADE_PAGES: usize = 5;

const TX_TYPE_CREATE_ORDER: u8 = 14;
const TX_TYPE_CANCEL_ORDER: u8 = 16;

const ORDER_TYPE_LIMIT: u8 = 0;
const ORDER_TYPE_MARKET: u8 = 1;
const TIF_GOOD_TILL_TIME: u8 = 1;
const TIF_IMMEDIATE_OR_CANCEL: u8 = 2;
const TIF_POST_ONLY: u8 = 3;

pub fn base_url(env: &str) -> &'static str {
    if env == "testnet" {
        "https://testnet.zklighter.elliot.ai"
    } else {
        "https://mainnet.zklighter.elliot.ai"
    }
}

pub fn ws_url(env: &str) -> String {
    let host = base_url(env).trim_start_matches("https://");
    format!("wss://{host}/stream")
}

// ─── Transaction wire shapes (msgpack-hashed before signing) ─────────────────

#[derive(Serialize)]
struct OrderTxWire {
    market_index: i64,
    client_order_index: u64,
    base_amount: i64,
    price: i64,
    is_ask: u8,
    order_type: u8,
    time_in_force: u8,
    reduce_only: u8,
    account_index: i64,
    api_key_index: i64,
}

#[derive(Serialize)]
struct CancelTxWire {
    market_index: i64,
    order_index: i64,
    account_index: i64,
    api_key_index: i64,
}

/// keccak(msgpack(payload) || nonce_be). The nonce rides outside the msgpack
/// body, mirroring the venue's signer.
fn tx_digest<T: Serialize>(payload: &T, nonce: i64) -> Result<[u8; 32], TraderError> {
    let mut buf = Vec::new();
    let mut serializer = rmp_serde::Serializer::new(&mut buf).with_struct_map();
    payload
        .serialize(&mut serializer)
        .map_err(|e| TraderError::Rejected(format!("tx encode: {e}")))?;
    buf.extend_from_slice(&nonce.to_be_bytes());
    Ok(keccak256(&buf))
}

fn sign_digest(wallet: &LocalWallet, digest: [u8; 32]) -> Result<String, TraderError> {
    let sig = wallet
        .sign_hash(H256::from(digest))
        .map_err(|e| TraderError::Rejected(format!("sign: {e}")))?;
    Ok(format!("0x{:0>64x}{:0>64x}{:02x}", sig.r, sig.s, sig.v))
}

/// Auth tokens are "expiry:api_key_index:signature"; the leading field is the
/// unix expiry.
pub fn parse_auth_expiry(token: &str) -> Option<i64> {
    token.split(':').next()?.parse().ok()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Venue timestamps arrive in seconds, milliseconds, or nanoseconds.
fn trade_ts_ms(value: &serde_json::Value) -> Option<i64> {
    let ts = value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))?;
    if ts > 10_000_000_000_000 {
        Some(ts / 1_000_000)
    } else if ts > 10_000_000_000 {
        Some(ts)
    } else {
        Some(ts * 1000)
    }
}

fn int_field(value: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        let v = &value[*key];
        if let Some(n) = v.as_i64() {
            return Some(n);
        }
        if let Some(s) = v.as_str() {
            if let Ok(n) = s.parse() {
                return Some(n);
            }
        }
    }
    None
}

fn decimal_field(value: &serde_json::Value, keys: &[&str]) -> Option<Decimal> {
    for key in keys {
        let v = &value[*key];
        if let Some(s) = v.as_str() {
            if let Ok(d) = s.parse() {
                return Some(d);
            }
        }
        if let Some(n) = v.as_f64() {
            if let Ok(d) = Decimal::from_str(&n.to_string()) {
                return Some(d);
            }
        }
    }
    None
}

/// Decodes one venue order payload into the normalized record the loop
/// consumes. Integer `base_price`/`base_size` are preferred; decimal string
/// fields are scaled with the market decimals when the integers are absent.
pub fn normalize_open_order(
    raw: &serde_json::Value,
    price_decimals: u32,
    size_decimals: u32,
) -> Option<OpenOrder> {
    let client_order_id =
        int_field(raw, &["client_order_index", "client_order_id"]).unwrap_or(0);
    let order_id = int_field(raw, &["order_index", "order_id"])?;

    let is_ask = match raw["is_ask"].as_bool() {
        Some(flag) => flag,
        None => match raw["side"].as_str() {
            Some(side) => side.eq_ignore_ascii_case("sell") || side.eq_ignore_ascii_case("ask"),
            None => return None,
        },
    };

    let price_int = int_field(raw, &["base_price"]).or_else(|| {
        decimal_field(raw, &["price"]).and_then(|p| to_scaled_int(p, price_decimals))
    })?;
    let size_int = int_field(raw, &["base_size"]).or_else(|| {
        decimal_field(raw, &["remaining_base_amount", "size"])
            .and_then(|s| to_scaled_int(s, size_decimals))
    })?;

    Some(OpenOrder {
        client_order_id: client_order_id.max(0) as u64,
        order_id,
        is_ask,
        price_int,
        size_int,
        status: raw["status"].as_str().unwrap_or("open").to_string(),
        created_at_ms: int_field(raw, &["created_at", "timestamp"])
            .and_then(|ts| trade_ts_ms(&serde_json::Value::from(ts)))
            .unwrap_or(0),
    })
}

// ─── The trader ──────────────────────────────────────────────────────────────

pub struct LighterTrader {
    pub env: String,
    url: String,
    account_index: i64,
    api_key_index: i64,
    wallet: Option<LocalWallet>,
    client: reqwest::Client,
    throttle: Throttle,
    nonce: Mutex<i64>,
    auth: Mutex<Option<(String, i64)>>,
    market_cache: Mutex<HashMap<i64, MarketMeta>>,
    symbol_cache: Mutex<HashMap<String, i64>>,
    positions: Mutex<Option<(HashMap<i64, Decimal>, i64)>>,
    ws: MarketDataWs,
}

impl LighterTrader {
    pub fn new(
        env: &str,
        account_index: i64,
        api_key_index: i64,
        api_private_key: Option<&str>,
    ) -> Result<Self, TraderError> {
        let wallet = match api_private_key {
            Some(key) if !key.trim().is_empty() => Some(
                LocalWallet::from_str(key.trim())
                    .map_err(|e| TraderError::Rejected(format!("bad api key: {e}")))?,
            ),
            _ => None,
        };
        Ok(Self {
            env: env.to_string(),
            url: base_url(env).to_string(),
            account_index,
            api_key_index,
            wallet,
            client: reqwest::Client::new(),
            throttle: Throttle::default(),
            nonce: Mutex::new(0),
            auth: Mutex::new(None),
            market_cache: Mutex::new(HashMap::new()),
            symbol_cache: Mutex::new(HashMap::new()),
            positions: Mutex::new(None),
            ws: MarketDataWs::new(ws_url(env)),
        })
    }

    fn wallet(&self) -> Result<&LocalWallet, TraderError> {
        self.wallet
            .as_ref()
            .ok_or_else(|| TraderError::Rejected("signer not configured".to_string()))
    }

    /// One GET with throttling and rate-limit retries.
    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, TraderError> {
        let url = format!("{}{}", self.url, path);
        let mut attempt = 0;
        loop {
            self.throttle.wait().await;
            let result = self
                .client
                .get(&url)
                .query(query)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await;
            match self.decode_response(result).await {
                Err(e) if e.is_rate_limited() && attempt + 1 < self.throttle.retry_limit() => {
                    tokio::time::sleep(self.throttle.retry_delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn post_json_once(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, TraderError> {
        let url = format!("{}{}", self.url, path);
        self.throttle.wait().await;
        let result = self
            .client
            .post(&url)
            .json(body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;
        self.decode_response(result).await
    }

    async fn decode_response(
        &self,
        result: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<serde_json::Value, TraderError> {
        let resp = result.map_err(|e| TraderError::Transport(e.to_string()))?;
        if resp.status().as_u16() == 429 {
            return Err(TraderError::RateLimited("HTTP 429".to_string()));
        }
        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TraderError::Transport(e.to_string()))?;
        if let Some(code) = data["code"].as_i64() {
            if code != 0 && code != 200 {
                let message = data["message"].as_str().unwrap_or("").to_string();
                let text = format!("code={code} message={message}");
                if code == 429 || is_rate_limited_text(&text) {
                    return Err(TraderError::RateLimited(text));
                }
                return Err(TraderError::Rejected(text));
            }
        }
        Ok(data)
    }

    /// Signs and submits one transaction, retrying on venue rate limits. The
    /// nonce lock is held across sign + send so concurrent orders cannot
    /// reorder their nonces on the wire.
    async fn send_tx<T: Serialize>(&self, tx_type: u8, payload: T) -> Result<(), TraderError> {
        let wallet = self.wallet()?;
        let mut attempt = 0;
        loop {
            let result = {
                let mut nonce_guard = self.nonce.lock().await;
                *nonce_guard = (*nonce_guard + 1).max(now_ms());
                let nonce = *nonce_guard;

                let digest = tx_digest(&payload, nonce)?;
                let signature = sign_digest(wallet, digest)?;
                let mut tx_info = serde_json::to_value(&payload)
                    .map_err(|e| TraderError::Rejected(format!("tx encode: {e}")))?;
                tx_info["nonce"] = serde_json::Value::from(nonce);
                tx_info["signature"] = serde_json::Value::from(signature);

                let body = serde_json::json!({
                    "tx_type": tx_type,
                    "tx_info": tx_info,
                });
                self.post_json_once("/api/v1/sendTx", &body).await
            };
            match result {
                Ok(_) => return Ok(()),
                Err(e) if e.is_rate_limited() && attempt + 1 < self.throttle.retry_limit() => {
                    tokio::time::sleep(self.throttle.retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_order_books(&self) -> Result<(), TraderError> {
        let data = self.get_json("/api/v1/orderBooks", &[]).await?;
        let mut markets = self.market_cache.lock().await;
        let mut symbols = self.symbol_cache.lock().await;
        for ob in data["order_books"].as_array().unwrap_or(&Vec::new()) {
            if ob["market_type"].as_str().unwrap_or("perp") != "perp" {
                continue;
            }
            let Some(market_id) = int_field(ob, &["market_id"]) else {
                continue;
            };
            let symbol = ob["symbol"].as_str().unwrap_or("").to_string();
            let meta = MarketMeta {
                market_id,
                symbol: symbol.clone(),
                size_decimals: int_field(ob, &["supported_size_decimals"]).unwrap_or(0).max(0)
                    as u32,
                price_decimals: int_field(ob, &["supported_price_decimals"]).unwrap_or(0).max(0)
                    as u32,
                min_base_amount: decimal_field(ob, &["min_base_amount"]).unwrap_or(Decimal::ZERO),
                min_quote_amount: decimal_field(ob, &["min_quote_amount"])
                    .unwrap_or(Decimal::ZERO),
            };
            if !symbol.is_empty() {
                symbols.insert(symbol.to_uppercase(), market_id);
            }
            markets.insert(market_id, meta);
        }
        Ok(())
    }

    async fn fetch_trades_page(
        &self,
        market_id: i64,
        cursor: Option<&str>,
    ) -> Result<serde_json::Value, TraderError> {
        let auth = self.auth_token().await?;
        let mut query: Vec<(&str, String)> = vec![
            ("account_index", self.account_index.to_string()),
            ("market_id", market_id.to_string()),
            ("sort_by", "timestamp".to_string()),
            ("sort_dir", "asc".to_string()),
            ("limit", "200".to_string()),
            ("auth", auth),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        self.get_json("/api/v1/trades", &query).await
    }

    fn own_trade_from(&self, item: &serde_json::Value) -> Option<OwnTrade> {
        let ts_ms = trade_ts_ms(&item["timestamp"])
            .or_else(|| trade_ts_ms(&item["time"]))
            .unwrap_or(0);
        let price = decimal_field(item, &["price", "fill_price"])?;
        let size = decimal_field(item, &["size", "amount"])?;
        let is_ask = if int_field(item, &["ask_account_id"]) == Some(self.account_index) {
            true
        } else if int_field(item, &["bid_account_id"]) == Some(self.account_index) {
            false
        } else {
            item["is_ask"].as_bool()?
        };
        Some(OwnTrade {
            ts_ms,
            price,
            size,
            is_ask,
        })
    }
}

#[async_trait]
impl Trader for LighterTrader {
    fn account_key(&self) -> String {
        self.account_index.to_string()
    }

    fn check_client(&self) -> Option<String> {
        if self.wallet.is_none() {
            return Some("signer not configured".to_string());
        }
        if self.account_index < 0 || self.api_key_index < 0 {
            return Some("account_index / api_key_index not configured".to_string());
        }
        None
    }

    async fn close(&self) {
        self.ws.close().await;
    }

    async fn market_meta(&self, market_id: i64) -> Result<MarketMeta, TraderError> {
        if let Some(meta) = self.market_cache.lock().await.get(&market_id) {
            return Ok(meta.clone());
        }
        self.load_order_books().await?;
        self.market_cache
            .lock()
            .await
            .get(&market_id)
            .cloned()
            .ok_or_else(|| TraderError::Rejected(format!("unknown market_id {market_id}")))
    }

    async fn resolve_market(&self, symbol: &str) -> Result<Option<i64>, TraderError> {
        let symbol = symbol.to_uppercase();
        if let Some(id) = self.symbol_cache.lock().await.get(&symbol) {
            return Ok(Some(*id));
        }
        self.load_order_books().await?;
        Ok(self.symbol_cache.lock().await.get(&symbol).copied())
    }

    async fn best_bid_ask(
        &self,
        market_id: i64,
    ) -> Result<(Option<Decimal>, Option<Decimal>), TraderError> {
        let (bid, ask) = self.ws.best_bid_ask(market_id).await;
        if bid.is_some() || ask.is_some() {
            return Ok((bid, ask));
        }
        let data = self
            .get_json(
                "/api/v1/orderBookOrders",
                &[
                    ("market_id", market_id.to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        let bid = data["bids"]
            .as_array()
            .and_then(|levels| levels.first())
            .and_then(|level| decimal_field(level, &["price"]));
        let ask = data["asks"]
            .as_array()
            .and_then(|levels| levels.first())
            .and_then(|level| decimal_field(level, &["price"]));
        Ok((bid, ask))
    }

    async fn active_orders(&self, market_id: i64) -> Result<Vec<OpenOrder>, TraderError> {
        let meta = self.market_meta(market_id).await?;
        let auth = self.auth_token().await?;
        let data = self
            .get_json(
                "/api/v1/accountActiveOrders",
                &[
                    ("account_index", self.account_index.to_string()),
                    ("market_id", market_id.to_string()),
                    ("auth", auth),
                ],
            )
            .await?;
        let orders = data["orders"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|raw| {
                        normalize_open_order(raw, meta.price_decimals, meta.size_decimals)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(orders)
    }

    async fn position_base(&self, market_id: i64) -> Result<Decimal, TraderError> {
        {
            let cached = self.positions.lock().await;
            if let Some((positions, cached_at)) = cached.as_ref() {
                if now_ms() - cached_at < POSITIONS_TTL.as_millis() as i64 {
                    return Ok(positions.get(&market_id).copied().unwrap_or(Decimal::ZERO));
                }
            }
        }

        let data = self
            .get_json(
                "/api/v1/account",
                &[
                    ("by", "index".to_string()),
                    ("value", self.account_index.to_string()),
                ],
            )
            .await?;

        // The account payload nests positions either per sub-account or at
        // the top level depending on the endpoint version.
        let mut positions_raw: Option<&Vec<serde_json::Value>> = None;
        if let Some(accounts) = data["accounts"].as_array() {
            let picked = accounts
                .iter()
                .find(|item| int_field(item, &["account_index", "index"]) == Some(self.account_index))
                .or_else(|| accounts.first());
            if let Some(item) = picked {
                positions_raw = item["positions"].as_array();
            }
        }
        if positions_raw.is_none() {
            positions_raw = data["positions"].as_array();
        }

        let mut positions = HashMap::new();
        for pos in positions_raw.unwrap_or(&Vec::new()) {
            let Some(mid) = int_field(pos, &["market_id"]) else {
                continue;
            };
            let sign = match int_field(pos, &["sign"]) {
                Some(0) | None => Decimal::ONE,
                Some(s) if s < 0 => Decimal::NEGATIVE_ONE,
                Some(_) => Decimal::ONE,
            };
            let qty = decimal_field(pos, &["position"]).unwrap_or(Decimal::ZERO);
            positions.insert(mid, qty * sign);
        }

        let result = positions.get(&market_id).copied().unwrap_or(Decimal::ZERO);
        *self.positions.lock().await = Some((positions, now_ms()));
        Ok(result)
    }

    async fn create_limit(
        &self,
        market_id: i64,
        client_order_id: u64,
        base_amount: i64,
        price: i64,
        is_ask: bool,
        post_only: bool,
        reduce_only: bool,
    ) -> Result<(), TraderError> {
        let tx = OrderTxWire {
            market_index: market_id,
            client_order_index: client_order_id,
            base_amount,
            price,
            is_ask: is_ask as u8,
            order_type: ORDER_TYPE_LIMIT,
            time_in_force: if post_only {
                TIF_POST_ONLY
            } else {
                TIF_GOOD_TILL_TIME
            },
            reduce_only: reduce_only as u8,
            account_index: self.account_index,
            api_key_index: self.api_key_index,
        };
        self.send_tx(TX_TYPE_CREATE_ORDER, tx).await
    }

    async fn create_market(
        &self,
        market_id: i64,
        base_amount: i64,
        is_ask: bool,
        reduce_only: bool,
    ) -> Result<(), TraderError> {
        // The venue wants an average execution price bound even for market
        // orders; the current mid, on-grid, serves as that bound.
        let meta = self.market_meta(market_id).await?;
        let (bid, ask) = self.best_bid_ask(market_id).await?;
        let avg = match (bid, ask) {
            (Some(bid), Some(ask)) => (bid + ask) / Decimal::TWO,
            (Some(bid), None) => bid,
            (None, Some(ask)) => ask,
            (None, None) => {
                return Err(TraderError::Transport("no book for market order".to_string()))
            }
        };
        let price_q = quantize_price(avg, meta.price_decimals);
        let price_int = to_scaled_int(price_q, meta.price_decimals)
            .ok_or_else(|| TraderError::Rejected("price out of range".to_string()))?;

        let tx = OrderTxWire {
            market_index: market_id,
            client_order_index: 0,
            base_amount,
            price: price_int,
            is_ask: is_ask as u8,
            order_type: ORDER_TYPE_MARKET,
            time_in_force: TIF_IMMEDIATE_OR_CANCEL,
            reduce_only: reduce_only as u8,
            account_index: self.account_index,
            api_key_index: self.api_key_index,
        };
        self.send_tx(TX_TYPE_CREATE_ORDER, tx).await
    }

    async fn cancel(&self, market_id: i64, order_id: i64) -> Result<(), TraderError> {
        let tx = CancelTxWire {
            market_index: market_id,
            order_index: order_id,
            account_index: self.account_index,
            api_key_index: self.api_key_index,
        };
        self.send_tx(TX_TYPE_CANCEL_ORDER, tx).await
    }

    async fn fills_since(
        &self,
        market_id: i64,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<(Decimal, u64), TraderError> {
        let mut total = Decimal::ZERO;
        let mut count = 0u64;
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TRADE_PAGES {
            let data = self.fetch_trades_page(market_id, cursor.as_deref()).await?;
            for item in data["trades"].as_array().unwrap_or(&Vec::new()) {
                let Some(trade) = self.own_trade_from(item) else {
                    continue;
                };
                if trade.ts_ms < start_ms || trade.ts_ms > end_ms {
                    continue;
                }
                total += (trade.price * trade.size).abs();
                count += 1;
            }
            cursor = data["next_cursor"]
                .as_str()
                .map(str::to_string)
                .or_else(|| data["next"].as_str().map(str::to_string));
            if cursor.is_none() {
                break;
            }
        }
        Ok((total, count))
    }

    async fn trades_since(
        &self,
        market_id: i64,
        start_ms: i64,
    ) -> Result<Vec<OwnTrade>, TraderError> {
        let mut trades = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TRADE_PAGES {
            let data = self.fetch_trades_page(market_id, cursor.as_deref()).await?;
            for item in data["trades"].as_array().unwrap_or(&Vec::new()) {
                if let Some(trade) = self.own_trade_from(item) {
                    if trade.ts_ms >= start_ms {
                        trades.push(trade);
                    }
                }
            }
            cursor = data["next_cursor"]
                .as_str()
                .map(str::to_string)
                .or_else(|| data["next"].as_str().map(str::to_string));
            if cursor.is_none() {
                break;
            }
        }
        trades.sort_by_key(|t| t.ts_ms);
        Ok(trades)
    }

    async fn auth_token(&self) -> Result<String, TraderError> {
        let now = chrono::Utc::now().timestamp();
        {
            let auth = self.auth.lock().await;
            if let Some((token, expiry)) = auth.as_ref() {
                if expiry - now > AUTH_REFRESH_MARGIN_SECS {
                    return Ok(token.clone());
                }
            }
        }

        let wallet = self.wallet()?;
        let deadline = now + AUTH_DEADLINE_SECS;
        let message = format!(
            "{}:{}:{}",
            self.account_index, self.api_key_index, deadline
        );
        let signature = sign_digest(wallet, keccak256(message.as_bytes()))?;
        let token = format!("{deadline}:{}:{signature}", self.api_key_index);

        *self.auth.lock().await = Some((token.clone(), deadline));
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::from_scaled_int;
    use rust_decimal_macros::dec;

    #[test]
    fn test_normalize_open_order_prefers_integer_fields() {
        let raw = serde_json::json!({
            "client_order_index": 12341001,
            "order_index": 777,
            "is_ask": true,
            "base_price": 10150,
            "base_size": 985,
            "status": "open",
            "created_at": 1_700_000_000,
        });
        let order = normalize_open_order(&raw, 2, 4).unwrap();
        assert_eq!(order.client_order_id, 12341001);
        assert_eq!(order.order_id, 777);
        assert!(order.is_ask);
        assert_eq!(order.price_int, 10150);
        assert_eq!(order.size_int, 985);
        assert_eq!(order.created_at_ms, 1_700_000_000_000);
    }

    #[test]
    fn test_normalize_open_order_scales_decimal_fallbacks() {
        let raw = serde_json::json!({
            "client_order_id": "12346002",
            "order_id": 42,
            "side": "buy",
            "price": "99.50",
            "remaining_base_amount": "0.1005",
        });
        let order = normalize_open_order(&raw, 2, 4).unwrap();
        assert_eq!(order.client_order_id, 12346002);
        assert!(!order.is_ask);
        assert_eq!(order.price_int, 9950);
        assert_eq!(order.size_int, 1005);
        assert_eq!(from_scaled_int(order.price_int, 2), dec!(99.50));
    }

    #[test]
    fn test_normalize_open_order_rejects_sideless_payload() {
        let raw = serde_json::json!({"order_index": 1, "base_price": 1, "base_size": 1});
        assert!(normalize_open_order(&raw, 2, 4).is_none());
    }

    #[test]
    fn test_trade_ts_ms_units() {
        assert_eq!(
            trade_ts_ms(&serde_json::Value::from(1_700_000_000)),
            Some(1_700_000_000_000)
        );
        assert_eq!(
            trade_ts_ms(&serde_json::Value::from(1_700_000_000_000i64)),
            Some(1_700_000_000_000)
        );
        assert_eq!(
            trade_ts_ms(&serde_json::Value::from(1_700_000_000_000_000_000i64)),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn test_parse_auth_expiry() {
        assert_eq!(parse_auth_expiry("1700000000:2:0xabc"), Some(1_700_000_000));
        assert_eq!(parse_auth_expiry("garbage"), None);
    }

    #[test]
    fn test_tx_digest_is_deterministic_and_nonce_sensitive() {
        let tx = OrderTxWire {
            market_index: 1,
            client_order_index: 12341001,
            base_amount: 985,
            price: 10150,
            is_ask: 1,
            order_type: ORDER_TYPE_LIMIT,
            time_in_force: TIF_POST_ONLY,
            reduce_only: 0,
            account_index: 7,
            api_key_index: 2,
        };
        let d1 = tx_digest(&tx, 1000).unwrap();
        let d2 = tx_digest(&tx, 1000).unwrap();
        let d3 = tx_digest(&tx, 1001).unwrap();
        assert_eq!(d1, d2);
        assert_ne!(d1, d3);
    }

    #[test]
    fn test_ws_url_shape() {
        assert_eq!(ws_url("mainnet"), "wss://mainnet.zklighter.elliot.ai/stream");
        assert_eq!(ws_url("testnet"), "wss://testnet.zklighter.elliot.ai/stream");
    }
}
