// =============================================================================
// Binance adapter — REST client with HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms; timestamps
// are adjusted by the measured server-time offset so the venue accepts them
// even under local clock drift.
//
// Caching: spot balance, funding balance, and total account value each sit
// behind a 30 s TTL cache. Orders and transfers invalidate the balance caches
// before returning.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use sha2::Sha256;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::precision::SavingsPrecisions;
use crate::types::{
    Candle, FillRecord, FundingBalance, MarketSpec, OrderBookTop, OrderRecord, OrderStatus, Side,
    SpotBalance, Ticker,
};

use super::cache::TtlCache;
use super::error::{ExchangeError, ExchangeResult};
use super::rate_limit::WeightTracker;
use super::{log_funding_update, ExchangeAdapter, Feature};

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Soft TTL shared by the three adapter caches.
const CACHE_TTL: Duration = Duration::from_secs(30);
/// Bounded retry budget for market-data requests.
const MARKET_DATA_ATTEMPTS: u32 = 3;
/// Assets worth less than this (in quote units) are ignored in the account
/// value sum.
const MIN_VALUE_THRESHOLD: f64 = 1.0;

const MAINNET_URL: &str = "https://api.binance.com";
const TESTNET_URL: &str = "https://testnet.binance.vision";

/// Catalogue entry resolved by `load_markets`.
#[derive(Debug, Clone)]
struct BinanceMarket {
    /// Venue-native id, e.g. "BNBUSDT" for "BNB/USDT".
    id: String,
    spec: MarketSpec,
}

pub struct BinanceAdapter {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    /// Signed server-minus-local clock offset in milliseconds.
    time_offset_ms: AtomicI64,
    markets: RwLock<HashMap<String, BinanceMarket>>,
    spot_cache: TtlCache<SpotBalance>,
    funding_cache: TtlCache<FundingBalance>,
    total_value_cache: TtlCache<f64>,
    savings_enabled: bool,
    savings_precisions: SavingsPrecisions,
    weight: WeightTracker,
}

impl BinanceAdapter {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let (api_key, secret) = if config.testnet_mode {
            (
                config.binance_testnet_api_key.clone(),
                config.binance_testnet_api_secret.clone(),
            )
        } else {
            (
                config.binance_api_key.clone(),
                config.binance_api_secret.clone(),
            )
        };

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(60));
        if let Some(proxy) = &config.http_proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let client = builder.build()?;

        let base_url = if config.testnet_mode {
            warn!("testnet mode enabled, routing to {}", TESTNET_URL);
            TESTNET_URL.to_string()
        } else {
            MAINNET_URL.to_string()
        };

        debug!(base_url = %base_url, "BinanceAdapter initialised");

        Ok(Self {
            secret,
            base_url,
            client,
            time_offset_ms: AtomicI64::new(0),
            markets: RwLock::new(HashMap::new()),
            spot_cache: TtlCache::new(CACHE_TTL),
            funding_cache: TtlCache::new(CACHE_TTL),
            total_value_cache: TtlCache::new(CACHE_TTL),
            savings_enabled: config.enable_savings,
            savings_precisions: config.savings_precisions.clone(),
            weight: WeightTracker::new(),
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn adjusted_timestamp_ms(&self) -> i64 {
        let local = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        local + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// Append timestamp, recvWindow, and signature to `params`.
    fn signed_query(&self, params: &str) -> String {
        let ts = self.adjusted_timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn market_id(&self, symbol: &str) -> ExchangeResult<String> {
        self.markets
            .read()
            .get(symbol)
            .map(|m| m.id.clone())
            .ok_or_else(|| ExchangeError::Parse(format!("unknown market {symbol}")))
    }

    // -------------------------------------------------------------------------
    // HTTP layer
    // -------------------------------------------------------------------------

    /// Send one request with bounded retry on transient failures.
    ///
    /// `attempts = 1` for order submission (a timed-out POST may still have
    /// been accepted by the venue; resubmitting would double the order).
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &str,
        signed: bool,
        weight: u32,
        attempts: u32,
    ) -> ExchangeResult<serde_json::Value> {
        let attempts = attempts.max(1);
        let mut attempt: u32 = 1;
        let mut resynced = false;

        loop {
            if let Some(delay) = self.weight.throttle_delay(weight) {
                tokio::time::sleep(delay).await;
            }

            // Signed queries carry a fresh timestamp per attempt.
            let query = if signed {
                self.signed_query(params)
            } else {
                params.to_string()
            };
            let url = if query.is_empty() {
                format!("{}{}", self.base_url, path)
            } else {
                format!("{}{}?{}", self.base_url, path, query)
            };

            let outcome = async {
                let resp = self.client.request(method.clone(), &url).send().await?;
                self.weight.update_from_headers(resp.headers());

                let status = resp.status();
                let retry_after = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok());
                let body: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| ExchangeError::Parse(e.to_string()))?;

                if status.is_success() {
                    return Ok(body);
                }
                Err(classify_http_error(status.as_u16(), retry_after, &body))
            }
            .await;

            match outcome {
                Ok(body) => return Ok(body),
                Err(ExchangeError::ClockSkew(_)) if !resynced => {
                    // Force a resync and retry once; the skew retry does not
                    // consume an attempt.
                    warn!(path, "venue rejected timestamp, forcing time resync");
                    resynced = true;
                    if let Ok(offset) = self.fetch_server_offset().await {
                        self.time_offset_ms.store(offset, Ordering::Relaxed);
                    }
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let backoff = match &e {
                        ExchangeError::RateLimited {
                            retry_after_secs: Some(secs),
                        } => Duration::from_secs(*secs),
                        _ => Duration::from_millis(500 * 2u64.pow(attempt - 1)),
                    };
                    debug!(path, attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "transient error, backing off");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get(&self, path: &str, params: &str, weight: u32) -> ExchangeResult<serde_json::Value> {
        self.request(Method::GET, path, params, false, weight, MARKET_DATA_ATTEMPTS)
            .await
    }

    async fn get_signed(&self, path: &str, params: &str, weight: u32) -> ExchangeResult<serde_json::Value> {
        self.request(Method::GET, path, params, true, weight, MARKET_DATA_ATTEMPTS)
            .await
    }

    // -------------------------------------------------------------------------
    // Savings product lookup
    // -------------------------------------------------------------------------

    /// Measure the server-minus-local offset with a single unretried GET.
    ///
    /// Kept out of the `request` machinery so the clock-skew recovery path
    /// inside `request` cannot recurse into it.
    async fn fetch_server_offset(&self) -> ExchangeResult<i64> {
        let url = format!("{}/api/v3/time", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;
        let server_time = body["serverTime"]
            .as_i64()
            .ok_or_else(|| ExchangeError::Parse("time response missing serverTime".into()))?;
        let local = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok(server_time - local)
    }

    /// Find the active flexible-savings product id for `asset`.
    async fn flexible_product_id(&self, asset: &str) -> ExchangeResult<String> {
        let params = format!("asset={asset}&current=1&size=100");
        let body = self
            .get_signed("/sapi/v1/simple-earn/flexible/list", &params, 1)
            .await?;

        body["rows"]
            .as_array()
            .and_then(|rows| {
                rows.iter().find(|p| {
                    p["asset"].as_str() == Some(asset)
                        && p["status"].as_str() == Some("PURCHASING")
                })
            })
            .and_then(|p| p["productId"].as_str().map(|s| s.to_string()))
            .ok_or_else(|| {
                ExchangeError::Unsupported("no active flexible savings product for asset")
            })
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::SpotTrading => true,
            Feature::FundingAccount => self.savings_enabled,
        }
    }

    async fn load_markets(&self) -> ExchangeResult<()> {
        let body = self.get("/api/v3/exchangeInfo", "", 20).await?;
        let symbols = body["symbols"]
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("exchangeInfo missing 'symbols'".into()))?;

        let mut markets = HashMap::new();
        for entry in symbols {
            let Some(market) = parse_market_entry(entry) else {
                continue;
            };
            markets.insert(market.0, market.1);
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
        let id = self.market_id(symbol)?;
        let body = self
            .get("/api/v3/ticker/24hr", &format!("symbol={id}"), 2)
            .await?;
        Ok(Ticker {
            last_price: parse_f64(&body["lastPrice"])?,
            bid: parse_f64(&body["bidPrice"])?,
            ask: parse_f64(&body["askPrice"])?,
            high_24h: parse_f64(&body["highPrice"])?,
            low_24h: parse_f64(&body["lowPrice"])?,
            quote_volume_24h: parse_f64(&body["quoteVolume"])?,
        })
    }

    async fn fetch_order_book(&self, symbol: &str, depth: u32) -> ExchangeResult<OrderBookTop> {
        let id = self.market_id(symbol)?;
        let body = self
            .get("/api/v3/depth", &format!("symbol={id}&limit={depth}"), 1)
            .await?;

        let best = |side: &str| -> Option<f64> {
            body[side]
                .as_array()
                .and_then(|levels| levels.first())
                .and_then(|level| level.as_array())
                .and_then(|pair| pair.first())
                .and_then(|p| parse_f64(p).ok())
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
        let id = self.market_id(symbol)?;
        let body = self
            .get(
                "/api/v3/klines",
                &format!("symbol={id}&interval={timeframe}&limit={limit}"),
                2,
            )
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            match parse_kline(entry) {
                Some(candle) => candles.push(candle),
                None => warn!(symbol, "skipping malformed kline entry"),
            }
        }
        Ok(candles)
    }

    async fn fetch_spot_balance(&self) -> SpotBalance {
        if let Some(cached) = self.spot_cache.get() {
            return cached;
        }

        match self.get_signed("/api/v3/account", "", 20).await {
            Ok(body) => {
                let balance = parse_account_balances(&body);
                self.spot_cache.put(balance.clone());
                balance
            }
            Err(e) => {
                // Never propagate to the engine: an empty-but-shaped value
                // simply defers trading to the next tick.
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
        let mut all_balances = FundingBalance::new();
        let mut page = 1u32;
        const PAGE_SIZE: usize = 100;

        loop {
            let params = format!("current={page}&size={PAGE_SIZE}");
            let body = match self
                .get_signed("/sapi/v1/simple-earn/flexible/position", &params, 15)
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "failed to fetch funding balance");
                    return previous;
                }
            };

            let rows = body["rows"].as_array().cloned().unwrap_or_default();
            if rows.is_empty() {
                break;
            }
            for item in &rows {
                let Some(asset) = item["asset"].as_str() else {
                    continue;
                };
                let amount = parse_f64(&item["totalAmount"]).unwrap_or(0.0);
                *all_balances.entry(asset.to_string()).or_insert(0.0) += amount;
            }
            if rows.len() < PAGE_SIZE {
                break;
            }
            page += 1;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        log_funding_update(self.name(), &previous, &all_balances);
        self.funding_cache.put(all_balances.clone());
        all_balances
    }

    async fn create_limit_order(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
        price: f64,
    ) -> ExchangeResult<OrderRecord> {
        let id = self.market_id(symbol)?;
        let spec = self.market_spec(symbol).unwrap_or_default();
        let qty = format_decimals(amount, spec.amount_precision);
        let px = format_decimals(price, spec.price_precision);

        let params = format!(
            "symbol={id}&side={}&type=LIMIT&timeInForce=GTC&quantity={qty}&price={px}",
            binance_side(side)
        );
        let body = self
            .request(Method::POST, "/api/v3/order", &params, true, 1, 1)
            .await?;

        // The wallet is mutated the instant the order books; cached balances
        // are stale from here on.
        self.spot_cache.invalidate();
        parse_order(&body, price)
    }

    async fn create_market_order(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
    ) -> ExchangeResult<OrderRecord> {
        let id = self.market_id(symbol)?;
        let spec = self.market_spec(symbol).unwrap_or_default();
        let qty = format_decimals(amount, spec.amount_precision);

        let params = format!("symbol={id}&side={}&type=MARKET&quantity={qty}", binance_side(side));
        let body = self
            .request(Method::POST, "/api/v3/order", &params, true, 1, 1)
            .await?;

        self.spot_cache.invalidate();
        parse_order(&body, 0.0)
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<()> {
        let id = self.market_id(symbol)?;
        let params = format!("symbol={id}&orderId={order_id}");
        self.request(Method::DELETE, "/api/v3/order", &params, true, 1, MARKET_DATA_ATTEMPTS)
            .await?;
        self.spot_cache.invalidate();
        Ok(())
    }

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderRecord> {
        let id = self.market_id(symbol)?;
        let params = format!("symbol={id}&orderId={order_id}");
        let body = self.get_signed("/api/v3/order", &params, 4).await?;
        parse_order(&body, 0.0)
    }

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderRecord>> {
        let id = self.market_id(symbol)?;
        let body = self
            .get_signed("/api/v3/openOrders", &format!("symbol={id}"), 6)
            .await?;
        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("openOrders response is not an array".into()))?;
        raw.iter().map(|o| parse_order(o, 0.0)).collect()
    }

    async fn fetch_my_trades(&self, symbol: &str, limit: u32) -> ExchangeResult<Vec<FillRecord>> {
        let id = self.market_id(symbol)?;
        let body = self
            .get_signed("/api/v3/myTrades", &format!("symbol={id}&limit={limit}"), 20)
            .await?;
        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("myTrades response is not an array".into()))?;

        let mut fills = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(order_id) = json_id(&entry["orderId"]) else {
                // Interest payments and rebates carry no order id; skip them.
                continue;
            };
            let price = parse_f64(&entry["price"]).unwrap_or(0.0);
            let amount = parse_f64(&entry["qty"]).unwrap_or(0.0);
            let cost = parse_f64(&entry["quoteQty"]).unwrap_or(price * amount);
            fills.push(FillRecord {
                order_id,
                timestamp_ms: entry["time"].as_i64().unwrap_or(0),
                side: if entry["isBuyer"].as_bool().unwrap_or(false) {
                    Side::Buy
                } else {
                    Side::Sell
                },
                price,
                amount,
                cost,
            });
        }
        Ok(fills)
    }

    async fn transfer_spot_to_funding(&self, asset: &str, amount: f64) -> ExchangeResult<()> {
        if !self.savings_enabled {
            return Err(ExchangeError::Unsupported("savings disabled"));
        }
        let product_id = self.flexible_product_id(asset).await?;
        let formatted = self.savings_precisions.format_amount(asset, amount);
        let params = format!("productId={product_id}&amount={formatted}&autoSubscribe=false");
        self.request(
            Method::POST,
            "/sapi/v1/simple-earn/flexible/subscribe",
            &params,
            true,
            1,
            1,
        )
        .await?;

        debug!(asset, amount = %formatted, "subscribed to flexible savings");
        self.spot_cache.invalidate();
        self.funding_cache.invalidate();
        Ok(())
    }

    async fn transfer_funding_to_spot(&self, asset: &str, amount: f64) -> ExchangeResult<()> {
        if !self.savings_enabled {
            return Err(ExchangeError::Unsupported("savings disabled"));
        }
        let product_id = self.flexible_product_id(asset).await?;
        let formatted = self.savings_precisions.format_amount(asset, amount);
        let params = format!("productId={product_id}&amount={formatted}&redeemType=FAST");
        self.request(
            Method::POST,
            "/sapi/v1/simple-earn/flexible/redeem",
            &params,
            true,
            1,
            1,
        )
        .await?;

        debug!(asset, amount = %formatted, "redeemed from flexible savings");
        self.spot_cache.invalidate();
        self.funding_cache.invalidate();
        Ok(())
    }

    async fn total_account_value(&self, quote_asset: &str) -> ExchangeResult<f64> {
        if let Some(cached) = self.total_value_cache.get() {
            return Ok(cached);
        }

        let spot = self.fetch_spot_balance().await;
        let funding = self.fetch_funding_balance().await;

        // Merge spot totals (minus savings receipts) with the funding map;
        // the receipts are the same money seen twice.
        let mut combined: HashMap<String, f64> = HashMap::new();
        for (asset, amount) in &spot.total {
            if *amount > 0.0 && !asset.starts_with("LD") {
                *combined.entry(asset.clone()).or_insert(0.0) += amount;
            }
        }
        for (asset, amount) in &funding {
            if *amount > 0.0 {
                // Strip the receipt prefix defensively if the venue ever
                // reports funding rows under it.
                let key = asset.strip_prefix("LD").unwrap_or(asset);
                *combined.entry(key.to_string()).or_insert(0.0) += amount;
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
        debug!("binance adapter closed");
    }
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("savings_enabled", &self.savings_enabled)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn binance_side(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_f64(val: &serde_json::Value) -> ExchangeResult<f64> {
    if let Some(s) = val.as_str() {
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

/// Order ids arrive as numbers on Binance and strings on other venues.
fn json_id(val: &serde_json::Value) -> Option<String> {
    if let Some(n) = val.as_u64() {
        Some(n.to_string())
    } else {
        val.as_str().map(|s| s.to_string())
    }
}

fn format_decimals(value: f64, decimals: u32) -> String {
    format!("{value:.prec$}", prec = decimals as usize)
}

fn classify_http_error(
    status: u16,
    retry_after_secs: Option<u64>,
    body: &serde_json::Value,
) -> ExchangeError {
    if status == 429 || status == 418 {
        return ExchangeError::RateLimited { retry_after_secs };
    }
    if status >= 500 {
        return ExchangeError::Network(format!("HTTP {status}: {body}"));
    }

    let code = body["code"].as_i64().unwrap_or(0);
    let message = body["msg"].as_str().unwrap_or("").to_string();
    match code {
        -1021 => ExchangeError::ClockSkew(message),
        -2010 | -2019 => ExchangeError::InsufficientFunds(message),
        _ if message.to_lowercase().contains("insufficient") => {
            ExchangeError::InsufficientFunds(message)
        }
        _ => ExchangeError::Api { code, message },
    }
}

fn parse_order_status(status: &str) -> OrderStatus {
    match status {
        "NEW" | "PARTIALLY_FILLED" => OrderStatus::Open,
        "FILLED" => OrderStatus::Closed,
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Unknown,
    }
}

fn parse_order(body: &serde_json::Value, fallback_price: f64) -> ExchangeResult<OrderRecord> {
    let id = json_id(&body["orderId"])
        .ok_or_else(|| ExchangeError::Parse("order response missing orderId".into()))?;
    let status = parse_order_status(body["status"].as_str().unwrap_or(""));
    let price = parse_f64(&body["price"]).unwrap_or(fallback_price);
    let amount = parse_f64(&body["origQty"]).unwrap_or(0.0);
    let filled = parse_f64(&body["executedQty"]).unwrap_or(0.0);
    let cumulative_quote = parse_f64(&body["cummulativeQuoteQty"]).unwrap_or(0.0);
    let average = if filled > 0.0 && cumulative_quote > 0.0 {
        cumulative_quote / filled
    } else if price > 0.0 {
        price
    } else {
        fallback_price
    };

    Ok(OrderRecord {
        id,
        status,
        price,
        amount,
        filled,
        average,
    })
}

fn parse_account_balances(body: &serde_json::Value) -> SpotBalance {
    let mut balance = SpotBalance::default();
    let Some(rows) = body["balances"].as_array() else {
        return balance;
    };
    for row in rows {
        let Some(asset) = row["asset"].as_str() else {
            continue;
        };
        let free = parse_f64(&row["free"]).unwrap_or(0.0);
        let locked = parse_f64(&row["locked"]).unwrap_or(0.0);
        if free == 0.0 && locked == 0.0 {
            continue;
        }
        balance.free.insert(asset.to_string(), free);
        balance.used.insert(asset.to_string(), locked);
        balance.total.insert(asset.to_string(), free + locked);
    }
    balance
}

fn parse_kline(entry: &serde_json::Value) -> Option<Candle> {
    let arr = entry.as_array()?;
    if arr.len() < 6 {
        return None;
    }
    Some(Candle {
        open_time: arr[0].as_i64()?,
        open: parse_f64(&arr[1]).ok()?,
        high: parse_f64(&arr[2]).ok()?,
        low: parse_f64(&arr[3]).ok()?,
        close: parse_f64(&arr[4]).ok()?,
        volume: parse_f64(&arr[5]).ok()?,
    })
}

/// Count the decimal places of a filter step size, e.g. "0.00100000" -> 3.
fn decimals_from_step(step: &str) -> Option<u32> {
    let value: f64 = step.parse().ok()?;
    if value <= 0.0 {
        return None;
    }
    let (_, frac) = step.split_once('.')?;
    let trimmed = frac.trim_end_matches('0');
    Some(trimmed.len() as u32)
}

fn parse_market_entry(entry: &serde_json::Value) -> Option<(String, BinanceMarket)> {
    let id = entry["symbol"].as_str()?;
    let base = entry["baseAsset"].as_str()?;
    let quote = entry["quoteAsset"].as_str()?;
    if entry["status"].as_str() == Some("BREAK") {
        return None;
    }

    let mut spec = MarketSpec::default();
    if let Some(filters) = entry["filters"].as_array() {
        for filter in filters {
            match filter["filterType"].as_str() {
                Some("LOT_SIZE") => {
                    if let Some(d) = filter["stepSize"].as_str().and_then(decimals_from_step) {
                        spec.amount_precision = d;
                    }
                    if let Ok(min) = parse_f64(&filter["minQty"]) {
                        if min > 0.0 {
                            spec.min_amount = min;
                        }
                    }
                    if let Ok(max) = parse_f64(&filter["maxQty"]) {
                        if max > 0.0 {
                            spec.max_amount = Some(max);
                        }
                    }
                }
                Some("PRICE_FILTER") => {
                    if let Some(d) = filter["tickSize"].as_str().and_then(decimals_from_step) {
                        spec.price_precision = d;
                    }
                }
                Some("MIN_NOTIONAL") | Some("NOTIONAL") => {
                    if let Ok(min) = parse_f64(&filter["minNotional"]) {
                        if min > 0.0 {
                            spec.min_notional = min;
                        }
                    }
                    if let Ok(max) = parse_f64(&filter["maxNotional"]) {
                        if max > 0.0 {
                            spec.max_notional = Some(max);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    Some((
        format!("{base}/{quote}"),
        BinanceMarket {
            id: id.to_string(),
            spec,
        },
    ))
}
