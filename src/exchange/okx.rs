// =============================================================================
// OKX adapter — REST client with the OK-ACCESS header signature scheme
// =============================================================================
//
// OKX signs `timestamp + method + path + body` with HMAC-SHA256 and base64,
// carried in OK-ACCESS-* headers together with the API passphrase. Responses
// are wrapped in `{code, msg, data}`; `code != "0"` is an API error even on
// HTTP 200. The "funding account" here is OKX's funding wallet, reached via
// internal transfers between account 18 (trading) and 6 (funding).
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::Method;
use sha2::Sha256;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::precision::SavingsPrecisions;
use crate::types::{
    Candle, FillRecord, FundingBalance, MarketSpec, OrderBookTop, OrderRecord, OrderStatus, Side,
    SpotBalance, Ticker,
};

use super::cache::TtlCache;
use super::error::{ExchangeError, ExchangeResult};
use super::{log_funding_update, ExchangeAdapter, Feature};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://www.okx.com";
const CACHE_TTL: Duration = Duration::from_secs(30);
const MARKET_DATA_ATTEMPTS: u32 = 3;
const MIN_VALUE_THRESHOLD: f64 = 1.0;

/// OKX internal account ids for asset transfers.
const ACCOUNT_TRADING: &str = "18";
const ACCOUNT_FUNDING: &str = "6";

#[derive(Debug, Clone)]
struct OkxMarket {
    /// Venue-native id, e.g. "BNB-USDT".
    inst_id: String,
    spec: MarketSpec,
}

pub struct OkxAdapter {
    api_key: String,
    secret: String,
    passphrase: String,
    simulated: bool,
    client: reqwest::Client,
    time_offset_ms: AtomicI64,
    markets: RwLock<HashMap<String, OkxMarket>>,
    spot_cache: TtlCache<SpotBalance>,
    funding_cache: TtlCache<FundingBalance>,
    total_value_cache: TtlCache<f64>,
    savings_enabled: bool,
    savings_precisions: SavingsPrecisions,
}

impl OkxAdapter {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(60));
        if let Some(proxy) = &config.http_proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let client = builder.build()?;

        if config.testnet_mode {
            warn!("testnet mode enabled, using OKX simulated trading (demo API keys required)");
        }

        Ok(Self {
            api_key: config.okx_api_key.clone(),
            secret: config.okx_api_secret.clone(),
            passphrase: config.okx_passphrase.clone(),
            simulated: config.testnet_mode,
            client,
            time_offset_ms: AtomicI64::new(0),
            markets: RwLock::new(HashMap::new()),
            spot_cache: TtlCache::new(CACHE_TTL),
            funding_cache: TtlCache::new(CACHE_TTL),
            total_value_cache: TtlCache::new(CACHE_TTL),
            savings_enabled: config.enable_savings,
            savings_precisions: config.savings_precisions.clone(),
        })
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// ISO-8601 timestamp with millisecond precision, adjusted by the server
    /// offset (OKX rejects requests stamped more than 30 s off).
    fn adjusted_timestamp_iso(&self) -> String {
        let local = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let adjusted = local + self.time_offset_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(adjusted)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string()
    }

    fn sign(&self, prehash: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(prehash.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    fn market_inst_id(&self, symbol: &str) -> ExchangeResult<String> {
        self.markets
            .read()
            .get(symbol)
            .map(|m| m.inst_id.clone())
            .ok_or_else(|| ExchangeError::Parse(format!("unknown market {symbol}")))
    }

    // -------------------------------------------------------------------------
    // HTTP layer
    // -------------------------------------------------------------------------

    /// Send one request with bounded retry on transient failures; `data` array
    /// of the unwrapped response is returned.
    async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<serde_json::Value>,
        signed: bool,
        attempts: u32,
    ) -> ExchangeResult<serde_json::Value> {
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();

        let attempts = attempts.max(1);
        let mut attempt: u32 = 1;
        let mut resynced = false;

        loop {
            let url = format!("{BASE_URL}{path_and_query}");
            let mut req = self.client.request(method.clone(), &url);

            if signed {
                let ts = self.adjusted_timestamp_iso();
                let prehash = format!("{ts}{}{}{}", method.as_str(), path_and_query, body_str);
                req = req
                    .header("OK-ACCESS-KEY", &self.api_key)
                    .header("OK-ACCESS-SIGN", self.sign(&prehash))
                    .header("OK-ACCESS-TIMESTAMP", ts)
                    .header("OK-ACCESS-PASSPHRASE", &self.passphrase);
                if self.simulated {
                    req = req.header("x-simulated-trading", "1");
                }
            }
            if body.is_some() {
                req = req
                    .header("Content-Type", "application/json")
                    .body(body_str.clone());
            }

            let outcome = async {
                let resp = req.send().await?;
                let status = resp.status();
                let retry_after = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok());
                let payload: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| ExchangeError::Parse(e.to_string()))?;

                if status.as_u16() == 429 || status.as_u16() == 418 {
                    return Err(ExchangeError::RateLimited {
                        retry_after_secs: retry_after,
                    });
                }
                if status.is_server_error() {
                    return Err(ExchangeError::Network(format!("HTTP {status}: {payload}")));
                }
                classify_okx_response(&payload)
            }
            .await;

            match outcome {
                Ok(data) => return Ok(data),
                Err(ExchangeError::ClockSkew(_)) if !resynced => {
                    // The skew retry does not consume an attempt.
                    warn!(path = path_and_query, "venue rejected timestamp, forcing time resync");
                    resynced = true;
                    if let Ok(offset) = self.fetch_server_offset().await {
                        self.time_offset_ms.store(offset, Ordering::Relaxed);
                    }
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let backoff = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                    debug!(path = path_and_query, attempt, error = %e, "transient error, backing off");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_public(&self, path_and_query: &str) -> ExchangeResult<serde_json::Value> {
        self.request(Method::GET, path_and_query, None, false, MARKET_DATA_ATTEMPTS)
            .await
    }

    async fn get_private(&self, path_and_query: &str) -> ExchangeResult<serde_json::Value> {
        self.request(Method::GET, path_and_query, None, true, MARKET_DATA_ATTEMPTS)
            .await
    }

    async fn post_private(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> ExchangeResult<serde_json::Value> {
        self.request(Method::POST, path, Some(body), true, 1).await
    }

    /// Measure the server-minus-local offset with a single unretried GET.
    ///
    /// Kept out of the `request` machinery so the clock-skew recovery path
    /// inside `request` cannot recurse into it.
    async fn fetch_server_offset(&self) -> ExchangeResult<i64> {
        let url = format!("{BASE_URL}/api/v5/public/time");
        let resp = self.client.get(&url).send().await?;
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;
        let data = classify_okx_response(&payload)?;
        let server_time = data
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| row["ts"].as_str())
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| ExchangeError::Parse("time response missing ts".into()))?;
        let local = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok(server_time - local)
    }

    async fn transfer(&self, asset: &str, amount: f64, from: &str, to: &str) -> ExchangeResult<()> {
        if !self.savings_enabled {
            return Err(ExchangeError::Unsupported("savings disabled"));
        }
        let formatted = self.savings_precisions.format_amount(asset, amount);
        let client_id: String = Uuid::new_v4().simple().to_string().chars().take(32).collect();
        let body = serde_json::json!({
            "ccy": asset,
            "amt": formatted,
            "from": from,
            "to": to,
            "type": "0",
            "clientId": client_id,
        });
        self.post_private("/api/v5/asset/transfer", body).await?;

        debug!(asset, amount = %formatted, from, to, "internal transfer completed");
        self.spot_cache.invalidate();
        self.funding_cache.invalidate();
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn name(&self) -> &'static str {
        "okx"
    }

    fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::SpotTrading => true,
            Feature::FundingAccount => self.savings_enabled,
        }
    }

    async fn load_markets(&self) -> ExchangeResult<()> {
        let data = self
            .get_public("/api/v5/public/instruments?instType=SPOT")
            .await?;
        let rows = data
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("instruments data is not an array".into()))?;

        let mut markets = HashMap::new();
        for row in rows {
            if let Some((symbol, market)) = parse_instrument(row) {
                markets.insert(symbol, market);
            }
        }
        let count = markets.len();
        *self.markets.write() = markets;
        debug!(count, "markets loaded");
        Ok(())
    }

    fn market_spec(&self, symbol: &str) -> Option<MarketSpec> {
        self.markets.read().get(symbol).map(|m| m.spec)
    }

    async fn sync_time(&self) -> ExchangeResult<()> {
        let offset = self.fetch_server_offset().await?;
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        debug!(offset_ms = offset, "server time synced");
        Ok(())
    }

    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        let inst_id = self.market_inst_id(symbol)?;
        let data = self
            .get_public(&format!("/api/v5/market/ticker?instId={inst_id}"))
            .await?;
        let row = data
            .as_array()
            .and_then(|rows| rows.first())
            .ok_or_else(|| ExchangeError::Parse("ticker data empty".into()))?;
        Ok(Ticker {
            last_price: parse_str_f64(&row["last"])?,
            bid: parse_str_f64(&row["bidPx"])?,
            ask: parse_str_f64(&row["askPx"])?,
            high_24h: parse_str_f64(&row["high24h"])?,
            low_24h: parse_str_f64(&row["low24h"])?,
            quote_volume_24h: parse_str_f64(&row["volCcy24h"]).unwrap_or(0.0),
        })
    }

    async fn fetch_order_book(&self, symbol: &str, depth: u32) -> ExchangeResult<OrderBookTop> {
        let inst_id = self.market_inst_id(symbol)?;
        let data = self
            .get_public(&format!("/api/v5/market/books?instId={inst_id}&sz={depth}"))
            .await?;
        let row = data
            .as_array()
            .and_then(|rows| rows.first())
            .ok_or_else(|| ExchangeError::Parse("order book data empty".into()))?;

        let best = |side: &str| -> Option<f64> {
            row[side]
                .as_array()
                .and_then(|levels| levels.first())
                .and_then(|level| level.as_array())
                .and_then(|parts| parts.first())
                .and_then(|p| parse_str_f64(p).ok())
        };

        match (best("bids"), best("asks")) {
            (Some(best_bid), Some(best_ask)) if best_bid > 0.0 && best_ask > 0.0 => {
                Ok(OrderBookTop { best_bid, best_ask })
            }
            _ => Err(ExchangeError::Parse(format!("empty order book for {symbol}"))),
        }
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> ExchangeResult<Vec<Candle>> {
        let inst_id = self.market_inst_id(symbol)?;
        let bar = okx_bar(timeframe);
        let data = self
            .get_public(&format!(
                "/api/v5/market/candles?instId={inst_id}&bar={bar}&limit={limit}"
            ))
            .await?;
        let rows = data
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("candles data is not an array".into()))?;

        // OKX returns newest-first; callers expect oldest-first.
        let mut candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| {
                let parts = row.as_array()?;
                if parts.len() < 6 {
                    return None;
                }
                Some(Candle {
                    open_time: parse_str_f64(&parts[0]).ok()? as i64,
                    open: parse_str_f64(&parts[1]).ok()?,
                    high: parse_str_f64(&parts[2]).ok()?,
                    low: parse_str_f64(&parts[3]).ok()?,
                    close: parse_str_f64(&parts[4]).ok()?,
                    volume: parse_str_f64(&parts[5]).ok()?,
                })
            })
            .collect();
        candles.reverse();
        Ok(candles)
    }

    async fn fetch_spot_balance(&self) -> SpotBalance {
        if let Some(cached) = self.spot_cache.get() {
            return cached;
        }

        match self.get_private("/api/v5/account/balance").await {
            Ok(data) => {
                let balance = parse_okx_balance(&data);
                self.spot_cache.put(balance.clone());
                balance
            }
            Err(e) => {
                error!(error = %e, "failed to fetch spot balance");
                self.spot_cache.get_stale().unwrap_or_default()
            }
        }
    }

    async fn fetch_funding_balance(&self) -> FundingBalance {
        if !self.savings_enabled {
            return FundingBalance::new();
        }
        if let Some(cached) = self.funding_cache.get() {
            return cached;
        }

        let previous = self.funding_cache.get_stale().unwrap_or_default();
        match self.get_private("/api/v5/asset/balances").await {
            Ok(data) => {
                let mut balances = FundingBalance::new();
                if let Some(rows) = data.as_array() {
                    for row in rows {
                        let Some(asset) = row["ccy"].as_str() else {
                            continue;
                        };
                        let amount = parse_str_f64(&row["bal"]).unwrap_or(0.0);
                        if amount > 0.0 {
                            balances.insert(asset.to_string(), amount);
                        }
                    }
                }
                log_funding_update(self.name(), &previous, &balances);
                self.funding_cache.put(balances.clone());
                balances
            }
            Err(e) => {
                error!(error = %e, "failed to fetch funding balance");
                previous
            }
        }
    }

    async fn create_limit_order(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
        price: f64,
    ) -> ExchangeResult<OrderRecord> {
        let inst_id = self.market_inst_id(symbol)?;
        let spec = self.market_spec(symbol).unwrap_or_default();
        let body = serde_json::json!({
            "instId": inst_id,
            "tdMode": "cash",
            "side": side.as_str(),
            "ordType": "limit",
            "px": format!("{price:.prec$}", prec = spec.price_precision as usize),
            "sz": format!("{amount:.prec$}", prec = spec.amount_precision as usize),
        });
        let data = self.post_private("/api/v5/trade/order", body).await?;
        self.spot_cache.invalidate();

        let ord_id = order_ack_id(&data)?;
        // The submit ack carries no fill state; report the order as open at
        // the requested size.
        Ok(OrderRecord {
            id: ord_id,
            status: OrderStatus::Open,
            price,
            amount,
            filled: 0.0,
            average: price,
        })
    }

    async fn create_market_order(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
    ) -> ExchangeResult<OrderRecord> {
        let inst_id = self.market_inst_id(symbol)?;
        let spec = self.market_spec(symbol).unwrap_or_default();
        let body = serde_json::json!({
            "instId": inst_id,
            "tdMode": "cash",
            "side": side.as_str(),
            "ordType": "market",
            "sz": format!("{amount:.prec$}", prec = spec.amount_precision as usize),
            "tgtCcy": "base_ccy",
        });
        let data = self.post_private("/api/v5/trade/order", body).await?;
        self.spot_cache.invalidate();

        let ord_id = order_ack_id(&data)?;
        Ok(OrderRecord {
            id: ord_id,
            status: OrderStatus::Open,
            price: 0.0,
            amount,
            filled: 0.0,
            average: 0.0,
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<()> {
        let inst_id = self.market_inst_id(symbol)?;
        let body = serde_json::json!({ "instId": inst_id, "ordId": order_id });
        self.post_private("/api/v5/trade/cancel-order", body).await?;
        self.spot_cache.invalidate();
        Ok(())
    }

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderRecord> {
        let inst_id = self.market_inst_id(symbol)?;
        let data = self
            .get_private(&format!(
                "/api/v5/trade/order?instId={inst_id}&ordId={order_id}"
            ))
            .await?;
        let row = data
            .as_array()
            .and_then(|rows| rows.first())
            .ok_or_else(|| ExchangeError::Parse("order data empty".into()))?;
        parse_okx_order(row)
    }

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderRecord>> {
        let inst_id = self.market_inst_id(symbol)?;
        let data = self
            .get_private(&format!("/api/v5/trade/orders-pending?instId={inst_id}"))
            .await?;
        let rows = data
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("orders-pending data is not an array".into()))?;
        rows.iter().map(parse_okx_order).collect()
    }

    async fn fetch_my_trades(&self, symbol: &str, limit: u32) -> ExchangeResult<Vec<FillRecord>> {
        let inst_id = self.market_inst_id(symbol)?;
        let data = self
            .get_private(&format!(
                "/api/v5/trade/fills?instType=SPOT&instId={inst_id}&limit={limit}"
            ))
            .await?;
        let rows = data
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("fills data is not an array".into()))?;

        let mut fills = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(order_id) = row["ordId"].as_str() else {
                continue;
            };
            let price = parse_str_f64(&row["fillPx"]).unwrap_or(0.0);
            let amount = parse_str_f64(&row["fillSz"]).unwrap_or(0.0);
            fills.push(FillRecord {
                order_id: order_id.to_string(),
                timestamp_ms: row["ts"]
                    .as_str()
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0),
                side: if row["side"].as_str() == Some("buy") {
                    Side::Buy
                } else {
                    Side::Sell
                },
                price,
                amount,
                cost: price * amount,
            });
        }
        Ok(fills)
    }

    async fn transfer_spot_to_funding(&self, asset: &str, amount: f64) -> ExchangeResult<()> {
        self.transfer(asset, amount, ACCOUNT_TRADING, ACCOUNT_FUNDING)
            .await
    }

    async fn transfer_funding_to_spot(&self, asset: &str, amount: f64) -> ExchangeResult<()> {
        self.transfer(asset, amount, ACCOUNT_FUNDING, ACCOUNT_TRADING)
            .await
    }

    async fn total_account_value(&self, quote_asset: &str) -> ExchangeResult<f64> {
        if let Some(cached) = self.total_value_cache.get() {
            return Ok(cached);
        }

        let spot = self.fetch_spot_balance().await;
        let funding = self.fetch_funding_balance().await;

        let mut combined: HashMap<String, f64> = HashMap::new();
        for (asset, amount) in &spot.total {
            if *amount > 0.0 {
                *combined.entry(asset.clone()).or_insert(0.0) += amount;
            }
        }
        for (asset, amount) in &funding {
            if *amount > 0.0 {
                *combined.entry(asset.clone()).or_insert(0.0) += amount;
            }
        }

        let mut total_value = 0.0;
        for (asset, amount) in combined {
            let value = if asset == quote_asset {
                amount
            } else {
                let symbol = format!("{asset}/{quote_asset}");
                match self.fetch_ticker(&symbol).await {
                    Ok(ticker) if ticker.last_price > 0.0 => amount * ticker.last_price,
                    _ => continue,
                }
            };
            if value >= MIN_VALUE_THRESHOLD {
                total_value += value;
            }
        }

        self.total_value_cache.put(total_value);
        Ok(total_value)
    }

    async fn close(&self) {
        debug!("okx adapter closed");
    }
}

impl std::fmt::Debug for OkxAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("simulated", &self.simulated)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Unwrap `{code, msg, data}`, mapping non-zero codes to typed errors.
fn classify_okx_response(payload: &serde_json::Value) -> ExchangeResult<serde_json::Value> {
    let code = payload["code"].as_str().unwrap_or("0");
    if code == "0" {
        return Ok(payload["data"].clone());
    }
    let message = payload["msg"].as_str().unwrap_or("").to_string();
    match code {
        // 50102: timestamp request expired.
        "50102" => Err(ExchangeError::ClockSkew(message)),
        // 51008: insufficient balance; 58350: insufficient funds for transfer.
        "51008" | "58350" => Err(ExchangeError::InsufficientFunds(message)),
        _ if message.to_lowercase().contains("insufficient") => {
            Err(ExchangeError::InsufficientFunds(message))
        }
        _ => Err(ExchangeError::Api {
            code: code.parse().unwrap_or(-1),
            message,
        }),
    }
}

/// Pull the order id out of a trade-endpoint ack. OKX reports per-order
/// failures through `sCode` inside an otherwise successful envelope.
fn order_ack_id(data: &serde_json::Value) -> ExchangeResult<String> {
    let row = data
        .as_array()
        .and_then(|rows| rows.first())
        .ok_or_else(|| ExchangeError::Parse("order ack empty".into()))?;

    let s_code = row["sCode"].as_str().unwrap_or("0");
    if s_code != "0" {
        let message = row["sMsg"].as_str().unwrap_or("").to_string();
        if message.to_lowercase().contains("insufficient") {
            return Err(ExchangeError::InsufficientFunds(message));
        }
        return Err(ExchangeError::OrderRejected(format!("{s_code}: {message}")));
    }

    row["ordId"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| ExchangeError::Parse("order ack missing ordId".into()))
}

fn parse_str_f64(val: &serde_json::Value) -> ExchangeResult<f64> {
    if let Some(s) = val.as_str() {
        if s.is_empty() {
            return Ok(0.0);
        }
        s.parse::<f64>()
            .map_err(|_| ExchangeError::Parse(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(ExchangeError::Parse(format!(
            "expected string or number, got: {val}"
        )))
    }
}

fn okx_bar(timeframe: &str) -> String {
    // OKX bars use an upper-case suffix for hours and days: 4h -> 4H.
    match timeframe {
        "1m" | "3m" | "5m" | "15m" | "30m" => timeframe.to_string(),
        other => other.to_uppercase(),
    }
}

fn okx_order_status(state: &str) -> OrderStatus {
    match state {
        "live" | "partially_filled" => OrderStatus::Open,
        "filled" => OrderStatus::Closed,
        "canceled" | "mmp_canceled" => OrderStatus::Canceled,
        _ => OrderStatus::Unknown,
    }
}

fn parse_okx_order(row: &serde_json::Value) -> ExchangeResult<OrderRecord> {
    let id = row["ordId"]
        .as_str()
        .ok_or_else(|| ExchangeError::Parse("order row missing ordId".into()))?;
    let price = parse_str_f64(&row["px"]).unwrap_or(0.0);
    let filled = parse_str_f64(&row["accFillSz"]).unwrap_or(0.0);
    let average = parse_str_f64(&row["avgPx"]).unwrap_or(price);
    Ok(OrderRecord {
        id: id.to_string(),
        status: okx_order_status(row["state"].as_str().unwrap_or("")),
        price,
        amount: parse_str_f64(&row["sz"]).unwrap_or(0.0),
        filled,
        average: if average > 0.0 { average } else { price },
    })
}

fn parse_okx_balance(data: &serde_json::Value) -> SpotBalance {
    let mut balance = SpotBalance::default();
    let Some(details) = data
        .as_array()
        .and_then(|rows| rows.first())
        .and_then(|row| row["details"].as_array())
    else {
        return balance;
    };
    for row in details {
        let Some(asset) = row["ccy"].as_str() else {
            continue;
        };
        let free = parse_str_f64(&row["availBal"]).unwrap_or(0.0);
        let frozen = parse_str_f64(&row["frozenBal"]).unwrap_or(0.0);
        if free == 0.0 && frozen == 0.0 {
            continue;
        }
        balance.free.insert(asset.to_string(), free);
        balance.used.insert(asset.to_string(), frozen);
        balance.total.insert(asset.to_string(), free + frozen);
    }
    balance
}

fn parse_instrument(row: &serde_json::Value) -> Option<(String, OkxMarket)> {
    let inst_id = row["instId"].as_str()?;
    let base = row["baseCcy"].as_str()?;
    let quote = row["quoteCcy"].as_str()?;
    if row["state"].as_str() == Some("suspend") {
        return None;
    }

    let mut spec = MarketSpec::default();
    if let Some(d) = row["lotSz"].as_str().and_then(step_decimals) {
        spec.amount_precision = d;
    }
    if let Some(d) = row["tickSz"].as_str().and_then(step_decimals) {
        spec.price_precision = d;
    }
    if let Ok(min) = parse_str_f64(&row["minSz"]) {
        if min > 0.0 {
            spec.min_amount = min;
        }
    }

    Some((
        format!("{base}/{quote}"),
        OkxMarket {
            inst_id: inst_id.to_string(),
            spec,
        },
    ))
}

fn step_decimals(step: &str) -> Option<u32> {
    let value: f64 = step.parse().ok()?;
    if value <= 0.0 {
        return None;
    }
    match step.split_once('.') {
        Some((_, frac)) => Some(frac.trim_end_matches('0').len() as u32),
        None => Some(0),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_ack_scode_maps_to_typed_errors() {
        let ok = serde_json::json!([{"ordId": "42", "sCode": "0", "sMsg": ""}]);
        assert_eq!(order_ack_id(&ok).unwrap(), "42");

        let rejected = serde_json::json!([{"ordId": "", "sCode": "51121", "sMsg": "Order quantity invalid"}]);
        assert!(matches!(
            order_ack_id(&rejected),
            Err(ExchangeError::OrderRejected(_))
        ));

        let funds = serde_json::json!([{"ordId": "", "sCode": "51008", "sMsg": "Insufficient balance"}]);
        assert!(matches!(
            order_ack_id(&funds),
            Err(ExchangeError::InsufficientFunds(_))
        ));
    }

    #[test]
    fn okx_response_unwrapping() {
        let ok = serde_json::json!({"code": "0", "msg": "", "data": [{"x": 1}]});
        assert!(classify_okx_response(&ok).is_ok());

        let skew = serde_json::json!({"code": "50102", "msg": "Timestamp request expired"});
        assert!(matches!(
            classify_okx_response(&skew),
            Err(ExchangeError::ClockSkew(_))
        ));

        let funds = serde_json::json!({"code": "51008", "msg": "Insufficient balance"});
        assert!(matches!(
            classify_okx_response(&funds),
            Err(ExchangeError::InsufficientFunds(_))
        ));
    }

    #[test]
    fn bar_mapping_uppercases_hours() {
        assert_eq!(okx_bar("4h"), "4H");
        assert_eq!(okx_bar("1m"), "1m");
        assert_eq!(okx_bar("1d"), "1D");
    }

    #[test]
    fn order_state_mapping() {
        assert_eq!(okx_order_status("live"), OrderStatus::Open);
        assert_eq!(okx_order_status("partially_filled"), OrderStatus::Open);
        assert_eq!(okx_order_status("filled"), OrderStatus::Closed);
        assert_eq!(okx_order_status("canceled"), OrderStatus::Canceled);
    }

    #[test]
    fn balance_details_parse() {
        let data = serde_json::json!([{
            "details": [
                {"ccy": "USDT", "availBal": "980.5", "frozenBal": "19.5"},
                {"ccy": "BNB", "availBal": "0.03", "frozenBal": "0"},
                {"ccy": "ZERO", "availBal": "0", "frozenBal": "0"}
            ]
        }]);
        let bal = parse_okx_balance(&data);
        assert_eq!(bal.free_of("USDT"), 980.5);
        assert_eq!(bal.used_of("USDT"), 19.5);
        assert_eq!(bal.free_of("BNB"), 0.03);
        assert!(!bal.free.contains_key("ZERO"));
    }

    #[test]
    fn instrument_parse_builds_spec() {
        let row = serde_json::json!({
            "instId": "BNB-USDT",
            "baseCcy": "BNB",
            "quoteCcy": "USDT",
            "state": "live",
            "lotSz": "0.001",
            "tickSz": "0.01",
            "minSz": "0.001"
        });
        let (symbol, market) = parse_instrument(&row).unwrap();
        assert_eq!(symbol, "BNB/USDT");
        assert_eq!(market.inst_id, "BNB-USDT");
        assert_eq!(market.spec.amount_precision, 3);
        assert_eq!(market.spec.price_precision, 2);
    }
}
