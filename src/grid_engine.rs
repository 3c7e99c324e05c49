// =============================================================================
// Grid engine — per-symbol mean-reversion state machine
// =============================================================================
//
// Each engine owns one symbol's reference price, grid band, local extrema,
// and latched monitoring flags. The loop is logically single-threaded: no
// field is touched from outside it, and everything the dashboard needs is
// published through a read-only snapshot.
//
// Band rules (buy side; sell is the mirror):
//   - price at or under the lower band latches buy monitoring and ratchets
//     `lowest` downward;
//   - a rebound of one fifth of the grid off `lowest` fires the signal;
//   - climbing back over the band without firing resets the latch.
//
// Execution replaces a stale limit order at a refreshed touch price up to 10
// times, treating a cancel/fill race as a fill. The reference price moves
// only on a confirmed fill.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::exchange::error::ExchangeError;
use crate::exchange::{ExchangeAdapter, Feature};
use crate::notify::Notifier;
use crate::order_tracker::OrderTracker;
use crate::precision::round_price;
use crate::rebalance::{plan_rebalance, RebalanceSnapshot, TransferDirection, MIN_BASE_TRANSFER};
use crate::risk::{RiskController, RiskState};
use crate::sizing::normalize_amount;
use crate::state::EngineState;
use crate::types::{
    FundingBalance, MarketSpec, OrderRecord, OrderStatus, Side, SpotBalance, SymbolPair, Trade,
};
use crate::volatility::{
    self, check_interval_secs, compute_grid_size, push_sample, EwmaState, GRID_CHURN_THRESHOLD,
    SMOOTHING_WINDOW,
};

/// Inter-tick sleep.
const TICK_INTERVAL: Duration = Duration::from_secs(5);
/// Pause after a failed tick before retrying.
const ERROR_SLEEP: Duration = Duration::from_secs(30);
/// Consecutive tick failures tolerated; the next one stops the engine.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Wait between placing a limit order and checking its status.
const ORDER_CHECK_WAIT: Duration = Duration::from_secs(3);
/// Bounded place/wait/cancel cycles per signal.
const MAX_ORDER_RETRIES: u32 = 10;
/// Settle time after a savings redemption before re-reading balances.
const REDEEM_SETTLE_WAIT: Duration = Duration::from_secs(5);
/// Redeem this much more than the shortfall to absorb fees and rounding.
const REDEEM_BUFFER: f64 = 1.05;
/// Main-path order size as a fraction of the pair's total value.
const TARGET_NOTIONAL_FRACTION: f64 = 0.1;
/// Engine-level cache TTL for the pair's total value.
const PAIR_VALUE_TTL: Duration = Duration::from_secs(60);
/// Exchange fills pulled for startup reconciliation.
const RECONCILE_FILL_LIMIT: u32 = 50;

// ---------------------------------------------------------------------------
// Read-only view
// ---------------------------------------------------------------------------

/// Snapshot published for the dashboard and decision modules. Never mutated
/// by readers.
#[derive(Debug, Clone, Serialize, Default)]
pub struct EngineView {
    pub symbol: String,
    pub base_price: f64,
    pub grid_size: f64,
    pub upper_band: f64,
    pub lower_band: f64,
    pub current_price: f64,
    pub last_trade_time: Option<f64>,
    pub last_trade_price: Option<f64>,
    pub risk_state: String,
    pub volatility: Option<f64>,
    pub is_monitoring_buy: bool,
    pub is_monitoring_sell: bool,
    pub trade_count: usize,
    pub win_rate: f64,
    pub payoff_ratio: f64,
}

// ---------------------------------------------------------------------------
// External trade requests (decision-module hook)
// ---------------------------------------------------------------------------

/// Request from an optional decision module, executed through the normal
/// sizing / funds / order pipeline under the same risk gate.
pub struct ExternalTradeRequest {
    pub side: Side,
    /// Fraction of the pair's total value to trade, e.g. 0.1.
    pub notional_fraction: f64,
    pub respond_to: oneshot::Sender<Result<String, String>>,
}

#[derive(Clone)]
pub struct ExternalTradeHandle {
    tx: mpsc::Sender<ExternalTradeRequest>,
}

impl ExternalTradeHandle {
    /// Ask the engine to trade. Resolves once the engine has drained the
    /// request on a tick; a rejection reports the reason back.
    pub async fn request(&self, side: Side, notional_fraction: f64) -> Result<String, String> {
        let (tx, rx) = oneshot::channel();
        let req = ExternalTradeRequest {
            side,
            notional_fraction,
            respond_to: tx,
        };
        self.tx
            .send(req)
            .await
            .map_err(|_| "engine stopped".to_string())?;
        rx.await.map_err(|_| "engine dropped request".to_string())?
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct GridEngine {
    pair: SymbolPair,
    config: Arc<Config>,
    config_rx: watch::Receiver<Arc<Config>>,
    adapter: Arc<dyn ExchangeAdapter>,
    spec: MarketSpec,
    state: EngineState,
    state_path: PathBuf,
    tracker: OrderTracker,
    risk: RiskController,
    notifier: Notifier,
    view: Arc<RwLock<EngineView>>,
    current_price: f64,
    pair_value_cache: Option<(Instant, f64)>,
    external_rx: mpsc::Receiver<ExternalTradeRequest>,
    initialized: bool,
}

impl GridEngine {
    pub fn new(
        pair: SymbolPair,
        config: Arc<Config>,
        config_rx: watch::Receiver<Arc<Config>>,
        adapter: Arc<dyn ExchangeAdapter>,
        notifier: Notifier,
    ) -> (Self, ExternalTradeHandle) {
        let state_path = EngineState::path_for(&config.data_dir, &pair);
        let tracker = OrderTracker::open(OrderTracker::path_for(&config.data_dir, &pair));

        let (min_ratio, max_ratio) = config.position_limits_for(&pair.symbol);
        let per_symbol = config.position_limits.contains_key(&pair.symbol);
        let risk = RiskController::new(pair.clone(), min_ratio, max_ratio, per_symbol);

        let view = Arc::new(RwLock::new(EngineView {
            symbol: pair.symbol.clone(),
            risk_state: RiskState::AllowAll.to_string(),
            ..Default::default()
        }));

        let (tx, external_rx) = mpsc::channel(16);

        let engine = Self {
            pair,
            config,
            config_rx,
            adapter,
            spec: MarketSpec::default(),
            state: EngineState::default(),
            state_path,
            tracker,
            risk,
            notifier,
            view,
            current_price: 0.0,
            pair_value_cache: None,
            external_rx,
            initialized: false,
        };
        (engine, ExternalTradeHandle { tx })
    }

    /// Read-only handle for the web task.
    pub fn view_handle(&self) -> Arc<RwLock<EngineView>> {
        self.view.clone()
    }

    // -------------------------------------------------------------------------
    // Initialization
    // -------------------------------------------------------------------------

    pub async fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        info!(symbol = %self.pair, "initializing grid engine");

        // 1. Previously persisted state wins over configured defaults.
        if let Some(saved) = EngineState::load(&self.state_path) {
            self.state = saved;
        }
        if self.state.grid_size <= 0.0 {
            self.state.grid_size = self.config.initial_grid_for(&self.pair.symbol);
        }
        if self.state.base_price <= 0.0 {
            self.state.base_price = self.config.initial_base_price_for(&self.pair.symbol);
        }

        // 2. Market rules, with documented fallbacks when the catalogue has
        // no entry for this symbol.
        self.spec = match self.adapter.market_spec(&self.pair.symbol) {
            Some(spec) => spec,
            None => {
                warn!(symbol = %self.pair, "no market spec from venue, using defaults");
                MarketSpec::default()
            }
        };

        // 3. Fall back to the live price for the first reference price.
        if self.state.base_price <= 0.0 {
            let ticker = self
                .adapter
                .fetch_ticker(&self.pair.symbol)
                .await
                .map_err(|e| anyhow!("cannot fetch initial price for {}: {e}", self.pair))?;
            if ticker.last_price <= 0.0 {
                return Err(anyhow!("venue returned non-positive price for {}", self.pair));
            }
            self.state.base_price = ticker.last_price;
            info!(symbol = %self.pair, base_price = ticker.last_price, "reference price set from ticker");
        }
        self.current_price = self.state.base_price;

        // 4. Merge recent exchange fills into the local ledger.
        match self
            .adapter
            .fetch_my_trades(&self.pair.symbol, RECONCILE_FILL_LIMIT)
            .await
        {
            Ok(fills) => self.tracker.reconcile_fills(&fills),
            Err(e) => warn!(symbol = %self.pair, error = %e, "fill reconciliation skipped"),
        }

        // 5. Park everything beyond the working-capital target in funding.
        self.run_rebalance(true).await;

        // 6. Persist and announce.
        self.persist_state();
        self.publish_view(None);
        self.initialized = true;

        let threshold = retrace_threshold(self.state.grid_size);
        info!(
            symbol = %self.pair,
            base_price = self.state.base_price,
            grid_size = self.state.grid_size,
            retrace_threshold_pct = threshold * 100.0,
            "grid engine initialized"
        );
        self.notifier.notify(
            &format!("grid engine started: {}", self.pair),
            &format!(
                "base price: {} {}\ngrid size: {}%\nretrace threshold: {:.3}%",
                self.state.base_price,
                self.pair.quote,
                self.state.grid_size,
                threshold * 100.0
            ),
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut consecutive_failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let sleep_for = match self.tick().await {
                Ok(()) => {
                    consecutive_failures = 0;
                    TICK_INTERVAL
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(
                        symbol = %self.pair,
                        consecutive_failures,
                        error = %e,
                        "tick failed"
                    );
                    if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                        let msg = format!(
                            "engine for {} stopped after {consecutive_failures} consecutive failures.\nlast error: {e}",
                            self.pair
                        );
                        error!(symbol = %self.pair, "{msg}");
                        self.notifier
                            .notify(&format!("engine stopped: {}", self.pair), &msg);
                        break;
                    }
                    ERROR_SLEEP
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => break,
            }
        }

        // Shutdown path: keep whatever the loop learned.
        self.persist_state();
        info!(symbol = %self.pair, "grid engine stopped");
    }

    async fn tick(&mut self) -> Result<()> {
        if !self.initialized {
            self.initialize().await?;
        }
        self.apply_config_update();

        let before = self.state.clone();

        // (a) Fresh price; everything downstream keys off it.
        let ticker = self
            .adapter
            .fetch_ticker(&self.pair.symbol)
            .await
            .map_err(|e| anyhow!("ticker unavailable: {e}"))?;
        if !ticker.last_price.is_finite() || ticker.last_price <= 0.0 {
            return Err(anyhow!("invalid ticker price {}", ticker.last_price));
        }
        self.current_price = ticker.last_price;

        // (b) One balance snapshot reused across this tick.
        let spot = self.adapter.fetch_spot_balance().await;
        let funding = self.adapter.fetch_funding_balance().await;

        // (c) Periodic grid maintenance at the volatility-driven cadence.
        let last_vol = self.state.volatility_history.last().copied();
        let interval = check_interval_secs(last_vol, &self.config.dynamic_interval);
        if now_secs() - self.state.last_grid_adjust_time > interval as f64 {
            self.adjust_grid_size().await;
        }

        // (d) Risk gate from the shared snapshot.
        let risk_state = self.risk.check(&spot, &funding, self.current_price);

        // (e) Main trade path: sell first, then buy. Band evaluation runs on
        // every tick so the latches and extrema keep tracking even while the
        // risk gate blocks one side; the gate only withholds execution.
        // A fresh fill inside the minimum trade interval skips evaluation so
        // the latches stay intact for the next tick.
        if self.trade_interval_elapsed() {
            let sell_fired =
                evaluate_sell_signal(&mut self.state, self.current_price, &self.pair);
            let sell_entered = sell_fired && risk_state != RiskState::AllowBuyOnly;
            if sell_entered {
                self.execute_trade(Side::Sell, TARGET_NOTIONAL_FRACTION)
                    .await?;
            }

            let buy_fired = evaluate_buy_signal(&mut self.state, self.current_price, &self.pair);
            // At most one main trade per tick: once the sell path was
            // entered, the buy path is skipped whether or not it filled.
            if !sell_entered && buy_fired && risk_state != RiskState::AllowSellOnly {
                self.execute_trade(Side::Buy, TARGET_NOTIONAL_FRACTION)
                    .await?;
            }
        } else {
            debug!(symbol = %self.pair, "inside minimum trade interval, skipping signal checks");
        }

        // (f) Requests from decision modules, same pipeline and gate.
        self.drain_external_requests(risk_state).await;

        if self.state != before {
            self.persist_state();
        }
        self.publish_view(Some(risk_state));
        Ok(())
    }

    fn trade_interval_elapsed(&self) -> bool {
        match self.state.last_trade_time {
            Some(last) => now_secs() - last >= self.config.min_trade_interval_secs as f64,
            None => true,
        }
    }

    /// Pick up a hot-reloaded config: strategy parameters and risk bounds
    /// refresh, credentials and the reference price never change.
    fn apply_config_update(&mut self) {
        if !self
            .config_rx
            .has_changed()
            .unwrap_or(false)
        {
            return;
        }
        let new_config = self.config_rx.borrow_and_update().clone();

        let new_grid = new_config.initial_grid_for(&self.pair.symbol);
        if let Some(params) = new_config.initial_params.get(&self.pair.symbol) {
            if params.initial_grid.is_some() && (new_grid - self.state.grid_size).abs() > f64::EPSILON
            {
                info!(
                    symbol = %self.pair,
                    old = self.state.grid_size,
                    new = new_grid,
                    "grid size updated from reloaded config"
                );
                self.state.grid_size = new_grid;
                self.persist_state();
            }
        }

        let (min_ratio, max_ratio) = new_config.position_limits_for(&self.pair.symbol);
        let per_symbol = new_config.position_limits.contains_key(&self.pair.symbol);
        self.risk.set_bounds(min_ratio, max_ratio, per_symbol);

        info!(symbol = %self.pair, "configuration reloaded");
        self.config = new_config;
    }

    // -------------------------------------------------------------------------
    // Grid maintenance
    // -------------------------------------------------------------------------

    /// Recompute the hybrid volatility, smooth it, and resize the grid.
    async fn adjust_grid_size(&mut self) {
        self.state.last_grid_adjust_time = now_secs();

        let candles = match self
            .adapter
            .fetch_ohlcv(&self.pair.symbol, "4h", self.config.volatility_window)
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                warn!(symbol = %self.pair, error = %e, "volatility data unavailable, skipping resize");
                return;
            }
        };

        let traditional =
            volatility::traditional_volatility(&candles, self.config.volume_weighting);

        let mut ewma = EwmaState {
            variance: self.state.ewma_volatility,
            last_price: self.state.last_price,
            initialized: self.state.ewma_initialized,
        };
        let ewma_vol = volatility::update_ewma(&mut ewma, self.current_price, self.config.ewma_lambda);
        self.state.ewma_volatility = ewma.variance;
        self.state.last_price = ewma.last_price;
        self.state.ewma_initialized = ewma.initialized;

        let hybrid = volatility::hybrid_volatility(traditional, ewma_vol, self.config.hybrid_weight);
        push_sample(&mut self.state.volatility_history, hybrid, SMOOTHING_WINDOW);

        let Some(smoothed) = volatility::smoothed(&self.state.volatility_history, SMOOTHING_WINDOW)
        else {
            info!(
                symbol = %self.pair,
                collected = self.state.volatility_history.len(),
                window = SMOOTHING_WINDOW,
                instantaneous = format!("{hybrid:.4}"),
                "collecting volatility samples before first resize"
            );
            self.persist_state();
            return;
        };

        let new_grid = compute_grid_size(smoothed, &self.config.grid_continuous, &self.config.grid);
        if (new_grid - self.state.grid_size).abs() > GRID_CHURN_THRESHOLD {
            info!(
                symbol = %self.pair,
                smoothed_volatility = format!("{smoothed:.4}"),
                old_grid = format!("{:.2}%", self.state.grid_size),
                new_grid = format!("{new_grid:.2}%"),
                "grid resized"
            );
            self.state.grid_size = new_grid;
        } else {
            debug!(
                symbol = %self.pair,
                smoothed_volatility = format!("{smoothed:.4}"),
                "grid unchanged (within churn threshold)"
            );
        }
        self.persist_state();
    }

    // -------------------------------------------------------------------------
    // Trade execution
    // -------------------------------------------------------------------------

    /// Run the full signal-execution pipeline: touch pricing, sizing, funds,
    /// place/wait/cancel retries, and fill handling. Returns whether a fill
    /// happened.
    async fn execute_trade(&mut self, side: Side, notional_fraction: f64) -> Result<bool> {
        let mut retry: u32 = 0;

        while retry < MAX_ORDER_RETRIES {
            // 1. Price at the near touch from a fresh book.
            let book = match self.adapter.fetch_order_book(&self.pair.symbol, 5).await {
                Ok(book) => book,
                Err(e) => {
                    warn!(symbol = %self.pair, error = %e, "order book unavailable");
                    retry += 1;
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    continue;
                }
            };
            let raw_price = match side {
                Side::Buy => book.best_ask,
                Side::Sell => book.best_bid,
            };
            let price = round_price(raw_price, self.spec.price_precision);
            if price <= 0.0 {
                warn!(symbol = %self.pair, "empty or invalid order book, aborting attempt");
                retry += 1;
                tokio::time::sleep(Duration::from_secs(3)).await;
                continue;
            }

            // 2. Target notional, normalised against the venue's limits.
            let total_value = self.pair_total_value().await;
            let notional = (total_value * notional_fraction).max(self.config.min_trade_amount);
            let Some(sized) = normalize_amount(notional / price, price, &self.spec) else {
                warn!(
                    symbol = %self.pair,
                    notional = format!("{notional:.2}"),
                    "no venue-acceptable order size, giving up for this tick"
                );
                return Ok(false);
            };

            // 3. Make sure the required asset is spendable on spot.
            if !self.ensure_funds(side, sized.amount, price).await {
                return Ok(false);
            }

            info!(
                symbol = %self.pair,
                side = %side,
                attempt = retry + 1,
                max = MAX_ORDER_RETRIES,
                price,
                amount = sized.amount,
                notional = format!("{:.2}", sized.notional),
                "placing limit order"
            );

            // 4. Place.
            let order = match self
                .adapter
                .create_limit_order(&self.pair.symbol, side, sized.amount, price)
                .await
            {
                Ok(order) => order,
                Err(ExchangeError::InsufficientFunds(msg)) => {
                    // Not retried: the venue disagrees with our balance view.
                    warn!(symbol = %self.pair, side = %side, error = %msg, "order refused for lack of balance");
                    self.notifier.notify(
                        &format!("trade failed: {}", self.pair),
                        &format!("{side} order refused: insufficient funds\n{msg}"),
                    );
                    return Ok(false);
                }
                Err(e) if e.is_transient() => {
                    warn!(symbol = %self.pair, error = %e, "transient order placement failure");
                    retry += 1;
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
                Err(e) => {
                    warn!(symbol = %self.pair, side = %side, error = %e, "order rejected by venue");
                    self.notifier.notify(
                        &format!("trade failed: {}", self.pair),
                        &format!("{side} order rejected: {e}"),
                    );
                    return Ok(false);
                }
            };

            // 5. Give the order a moment, then look again.
            tokio::time::sleep(ORDER_CHECK_WAIT).await;
            match self.adapter.fetch_order(&order.id, &self.pair.symbol).await {
                Ok(updated) if updated.status == OrderStatus::Closed => {
                    self.handle_fill(side, &updated).await;
                    return Ok(true);
                }
                Ok(updated) => {
                    debug!(symbol = %self.pair, order_id = %updated.id, "order still open, cancelling for re-entry");
                }
                Err(e) => {
                    warn!(symbol = %self.pair, order_id = %order.id, error = %e, "order status check failed");
                }
            }

            // 6. Cancel; a cancel error may mean the fill won the race.
            if let Err(cancel_err) = self
                .adapter
                .cancel_order(&order.id, &self.pair.symbol)
                .await
            {
                warn!(symbol = %self.pair, order_id = %order.id, error = %cancel_err, "cancel failed, re-checking order");
                if let Ok(checked) = self.adapter.fetch_order(&order.id, &self.pair.symbol).await {
                    if checked.status == OrderStatus::Closed {
                        info!(symbol = %self.pair, order_id = %checked.id, "order filled during cancel race");
                        self.handle_fill(side, &checked).await;
                        return Ok(true);
                    }
                }
            }

            retry += 1;
            if retry < MAX_ORDER_RETRIES {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        warn!(symbol = %self.pair, side = %side, "order retries exhausted");
        self.notifier.notify(
            &format!("trade failed: {}", self.pair),
            &format!("{side} order not filled after {MAX_ORDER_RETRIES} attempts"),
        );
        Ok(false)
    }

    /// Make sure the asset the order consumes is spendable on spot, pulling
    /// the shortfall out of funding when the venue supports it.
    async fn ensure_funds(&mut self, side: Side, amount: f64, price: f64) -> bool {
        let (asset, required) = match side {
            Side::Buy => (self.pair.quote.clone(), amount * price),
            Side::Sell => (self.pair.base.clone(), amount),
        };

        let spot = self.adapter.fetch_spot_balance().await;
        let available = spot.free_of(&asset) * self.config.safety_margin;
        if available >= required {
            return true;
        }

        if !self.adapter.supports(Feature::FundingAccount) {
            warn!(
                symbol = %self.pair,
                asset = %asset,
                required,
                available,
                "insufficient spot funds and no funding account to draw from"
            );
            self.notifier.notify(
                &format!("insufficient funds: {}", self.pair),
                &format!("{side} needs {required:.4} {asset}, spot has {available:.4}"),
            );
            return false;
        }

        let funding = self.adapter.fetch_funding_balance().await;
        let funding_available = funding.get(&asset).copied().unwrap_or(0.0);
        if available + funding_available < required {
            let msg = format!(
                "{side} needs {required:.4} {asset}; spot {available:.4} + funding {funding_available:.4} is not enough"
            );
            warn!(symbol = %self.pair, "{msg}");
            self.notifier
                .notify(&format!("insufficient total funds: {}", self.pair), &msg);
            return false;
        }

        let redeem = ((required - available) * REDEEM_BUFFER).min(funding_available);
        info!(
            symbol = %self.pair,
            asset = %asset,
            amount = format!("{redeem:.6}"),
            "redeeming from funding to cover the order"
        );
        if let Err(e) = self.adapter.transfer_funding_to_spot(&asset, redeem).await {
            warn!(symbol = %self.pair, asset = %asset, error = %e, "redemption failed");
            return false;
        }
        tokio::time::sleep(REDEEM_SETTLE_WAIT).await;

        // The transfer invalidated the cache; this re-reads from the venue.
        let refreshed = self.adapter.fetch_spot_balance().await;
        let now_available = refreshed.free_of(&asset) * self.config.safety_margin;
        if now_available >= required {
            true
        } else {
            warn!(
                symbol = %self.pair,
                asset = %asset,
                required,
                available = now_available,
                "still short after redemption"
            );
            false
        }
    }

    /// Post-fill bookkeeping: move the reference price, clear the extrema and
    /// latches, record the trade, persist, and re-park excess funds.
    async fn handle_fill(&mut self, side: Side, order: &OrderRecord) {
        let fill_price = if order.average > 0.0 {
            order.average
        } else {
            order.price
        };
        let amount = if order.filled > 0.0 {
            order.filled
        } else {
            order.amount
        };

        let previous_base = self.state.base_price;
        self.state.base_price = fill_price;
        self.state.highest = None;
        self.state.lowest = None;
        self.state.is_monitoring_buy = false;
        self.state.is_monitoring_sell = false;

        let profit = match side {
            Side::Sell => (fill_price - previous_base) * amount,
            Side::Buy => 0.0,
        };
        let now = now_secs();
        self.tracker.add_trade(Trade {
            timestamp: now,
            side,
            price: fill_price,
            amount,
            order_id: order.id.clone(),
            profit,
            strategy_tag: None,
        });
        self.state.last_trade_time = Some(now);
        self.state.last_trade_price = Some(fill_price);
        self.pair_value_cache = None;

        info!(
            symbol = %self.pair,
            side = %side,
            fill_price,
            amount,
            previous_base,
            "order filled, reference price updated"
        );
        self.persist_state();

        self.notifier.notify(
            &format!("order filled: {}", self.pair),
            &format!(
                "{side} {amount:.6} {} @ {fill_price} {}\ngrid size: {:.2}%",
                self.pair.base, self.pair.quote, self.state.grid_size
            ),
        );

        if self.adapter.supports(Feature::FundingAccount) {
            self.run_rebalance(false).await;
        }
    }

    // -------------------------------------------------------------------------
    // Rebalancing
    // -------------------------------------------------------------------------

    /// Move spot holdings toward the working-capital target. `redeem_base`
    /// also tops up a base-leg shortfall (initialization only).
    async fn run_rebalance(&mut self, redeem_base: bool) {
        if !self.adapter.supports(Feature::FundingAccount) {
            debug!(symbol = %self.pair, "funding unsupported, rebalance skipped");
            return;
        }
        if self.current_price <= 0.0 {
            return;
        }

        let spot = self.adapter.fetch_spot_balance().await;
        let funding = self.adapter.fetch_funding_balance().await;
        let snapshot = RebalanceSnapshot {
            free_base: spot.free_of(&self.pair.base),
            free_quote: spot.free_of(&self.pair.quote),
            funding_base: funding.get(&self.pair.base).copied().unwrap_or(0.0),
            funding_quote: funding.get(&self.pair.quote).copied().unwrap_or(0.0),
            price: self.current_price,
            total_value: pair_value_from_snapshot(&spot, &funding, &self.pair, self.current_price),
        };

        let plan = plan_rebalance(
            &self.pair,
            &snapshot,
            self.config.spot_funds_target_ratio,
            MIN_BASE_TRANSFER,
            redeem_base,
        );
        if plan.is_empty() {
            debug!(symbol = %self.pair, "no rebalance transfers needed");
            return;
        }

        for action in plan {
            let result = match action.direction {
                TransferDirection::ToFunding => {
                    self.adapter
                        .transfer_spot_to_funding(&action.asset, action.amount)
                        .await
                }
                TransferDirection::ToSpot => {
                    self.adapter
                        .transfer_funding_to_spot(&action.asset, action.amount)
                        .await
                }
            };
            match result {
                Ok(()) => info!(
                    symbol = %self.pair,
                    asset = %action.asset,
                    amount = format!("{:.6}", action.amount),
                    direction = ?action.direction,
                    "rebalance transfer completed"
                ),
                Err(e) => warn!(
                    symbol = %self.pair,
                    asset = %action.asset,
                    error = %e,
                    "rebalance transfer failed"
                ),
            }
        }
        self.pair_value_cache = None;
    }

    // -------------------------------------------------------------------------
    // External trade requests
    // -------------------------------------------------------------------------

    async fn drain_external_requests(&mut self, risk_state: RiskState) {
        while let Ok(request) = self.external_rx.try_recv() {
            let blocked = matches!(
                (request.side, risk_state),
                (Side::Buy, RiskState::AllowSellOnly) | (Side::Sell, RiskState::AllowBuyOnly)
            );
            let outcome = if blocked {
                Err(format!("blocked by risk state {risk_state}"))
            } else if !(0.0..=1.0).contains(&request.notional_fraction) {
                Err("notional_fraction must be within [0, 1]".to_string())
            } else {
                match self
                    .execute_trade(request.side, request.notional_fraction)
                    .await
                {
                    Ok(true) => Ok("filled".to_string()),
                    Ok(false) => Err("not filled".to_string()),
                    Err(e) => Err(e.to_string()),
                }
            };
            // The requester may have gone away; that is its problem.
            let _ = request.respond_to.send(outcome);
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Total value of this pair's holdings (spot + funding, both legs) in
    /// quote units, cached for 60 s.
    async fn pair_total_value(&mut self) -> f64 {
        if let Some((stamp, value)) = self.pair_value_cache {
            if stamp.elapsed() < PAIR_VALUE_TTL {
                return value;
            }
        }
        let spot = self.adapter.fetch_spot_balance().await;
        let funding = self.adapter.fetch_funding_balance().await;
        let value = pair_value_from_snapshot(&spot, &funding, &self.pair, self.current_price);
        self.pair_value_cache = Some((Instant::now(), value));
        value
    }

    fn persist_state(&self) {
        if let Err(e) = self.state.save(&self.state_path) {
            // Keep the in-memory state; the next persist retries.
            error!(symbol = %self.pair, error = %e, "failed to persist engine state");
        }
    }

    fn publish_view(&self, risk_state: Option<RiskState>) {
        let mut view = self.view.write();
        view.base_price = self.state.base_price;
        view.grid_size = self.state.grid_size;
        view.upper_band = upper_band(&self.state);
        view.lower_band = lower_band(&self.state);
        view.current_price = self.current_price;
        view.last_trade_time = self.state.last_trade_time;
        view.last_trade_price = self.state.last_trade_price;
        if let Some(rs) = risk_state {
            view.risk_state = rs.to_string();
        }
        view.volatility = self.state.volatility_history.last().copied();
        view.is_monitoring_buy = self.state.is_monitoring_buy;
        view.is_monitoring_sell = self.state.is_monitoring_sell;
        view.trade_count = self.tracker.len();
        view.win_rate = self.tracker.win_rate();
        view.payoff_ratio = self.tracker.payoff_ratio();
    }
}

// ---------------------------------------------------------------------------
// Band math and signal evaluation (pure over EngineState)
// ---------------------------------------------------------------------------

pub fn upper_band(state: &EngineState) -> f64 {
    state.base_price * (1.0 + state.grid_size / 100.0)
}

pub fn lower_band(state: &EngineState) -> f64 {
    state.base_price * (1.0 - state.grid_size / 100.0)
}

/// Reversal confirmation distance: one fifth of the grid, as a fraction.
pub fn retrace_threshold(grid_size: f64) -> f64 {
    (grid_size / 5.0) / 100.0
}

/// Buy path: latch under the lower band, ratchet `lowest` downward, fire on a
/// sufficient rebound, reset when price climbs back without firing.
pub fn evaluate_buy_signal(state: &mut EngineState, current_price: f64, pair: &SymbolPair) -> bool {
    let band = lower_band(state);

    if current_price <= band {
        state.is_monitoring_buy = true;

        let old_lowest = state.lowest;
        let new_lowest = match old_lowest {
            Some(lowest) => lowest.min(current_price),
            None => current_price,
        };
        state.lowest = Some(new_lowest);
        if old_lowest.map(|l| new_lowest < l).unwrap_or(true) {
            info!(
                symbol = %pair,
                current_price,
                lower_band = band,
                lowest = new_lowest,
                "buy watch: new low"
            );
        }

        let threshold = retrace_threshold(state.grid_size);
        if current_price >= new_lowest * (1.0 + threshold) {
            state.is_monitoring_buy = false;
            info!(
                symbol = %pair,
                current_price,
                lowest = new_lowest,
                rebound_pct = (current_price / new_lowest - 1.0) * 100.0,
                "buy signal fired"
            );
            return true;
        }
    } else if state.is_monitoring_buy {
        info!(
            symbol = %pair,
            current_price,
            lower_band = band,
            "price recovered above the lower band, buy watch reset"
        );
        // Only this side's extremum: a sell watch latched on the same tick
        // keeps its running high.
        state.is_monitoring_buy = false;
        state.lowest = None;
    }
    false
}

/// Sell path: mirror of the buy path around the upper band.
pub fn evaluate_sell_signal(state: &mut EngineState, current_price: f64, pair: &SymbolPair) -> bool {
    let band = upper_band(state);

    if current_price >= band {
        state.is_monitoring_sell = true;

        let old_highest = state.highest;
        let new_highest = match old_highest {
            Some(highest) => highest.max(current_price),
            None => current_price,
        };
        state.highest = Some(new_highest);
        if old_highest.map(|h| new_highest > h).unwrap_or(true) {
            info!(
                symbol = %pair,
                current_price,
                upper_band = band,
                highest = new_highest,
                "sell watch: new high"
            );
        }

        let threshold = retrace_threshold(state.grid_size);
        if current_price <= new_highest * (1.0 - threshold) {
            state.is_monitoring_sell = false;
            info!(
                symbol = %pair,
                current_price,
                highest = new_highest,
                pullback_pct = (1.0 - current_price / new_highest) * 100.0,
                "sell signal fired"
            );
            return true;
        }
    } else if state.is_monitoring_sell {
        info!(
            symbol = %pair,
            current_price,
            upper_band = band,
            "price fell back under the upper band, sell watch reset"
        );
        // Only this side's extremum: a buy watch latched on the same tick
        // keeps its running low.
        state.is_monitoring_sell = false;
        state.highest = None;
    }
    false
}

/// Pair-scoped holdings value (free + used spot plus funding, both legs).
pub fn pair_value_from_snapshot(
    spot: &SpotBalance,
    funding: &FundingBalance,
    pair: &SymbolPair,
    price: f64,
) -> f64 {
    let base_amount = spot.free_of(&pair.base)
        + spot.used_of(&pair.base)
        + funding.get(&pair.base).copied().unwrap_or(0.0);
    let quote_amount = spot.free_of(&pair.quote)
        + spot.used_of(&pair.quote)
        + funding.get(&pair.quote).copied().unwrap_or(0.0);
    quote_amount + base_amount * price
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> SymbolPair {
        SymbolPair::parse("BNB/USDT").unwrap()
    }

    fn state(base_price: f64, grid_size: f64) -> EngineState {
        EngineState {
            base_price,
            grid_size,
            ..Default::default()
        }
    }

    #[test]
    fn bands_from_reference_price() {
        // base 680 with a 2 % grid brackets at 693.6 / 666.4.
        let s = state(680.0, 2.0);
        assert!((upper_band(&s) - 693.6).abs() < 1e-9);
        assert!((lower_band(&s) - 666.4).abs() < 1e-9);
    }

    #[test]
    fn retrace_threshold_is_one_fifth_of_the_grid() {
        assert!((retrace_threshold(2.0) - 0.004).abs() < 1e-12);
        assert!((retrace_threshold(4.0) - 0.008).abs() < 1e-12);
    }

    #[test]
    fn buy_sequence_latches_ratchets_and_fires() {
        // Price path {680, 666.0, 663.0, 665.7} with a 2 % grid.
        let p = pair();
        let mut s = state(680.0, 2.0);

        assert!(!evaluate_buy_signal(&mut s, 680.0, &p));
        assert!(!s.is_monitoring_buy);

        assert!(!evaluate_buy_signal(&mut s, 666.0, &p));
        assert!(s.is_monitoring_buy);
        assert_eq!(s.lowest, Some(666.0));

        assert!(!evaluate_buy_signal(&mut s, 663.0, &p));
        assert_eq!(s.lowest, Some(663.0));

        // 665.7 >= 663.0 * 1.004 = 665.652 -> fire.
        assert!(evaluate_buy_signal(&mut s, 665.7, &p));
        assert!(!s.is_monitoring_buy);
    }

    #[test]
    fn lowest_is_monotonically_non_increasing_while_latched() {
        let p = pair();
        let mut s = state(680.0, 2.0);

        evaluate_buy_signal(&mut s, 666.0, &p);
        evaluate_buy_signal(&mut s, 664.0, &p);
        // A bounce that does not clear the retrace threshold must not raise
        // `lowest`.
        evaluate_buy_signal(&mut s, 665.0, &p);
        assert_eq!(s.lowest, Some(664.0));
        evaluate_buy_signal(&mut s, 660.0, &p);
        assert_eq!(s.lowest, Some(660.0));
    }

    #[test]
    fn buy_watch_resets_when_price_recovers_without_firing() {
        let p = pair();
        let mut s = state(680.0, 2.0);

        evaluate_buy_signal(&mut s, 666.0, &p);
        assert!(s.is_monitoring_buy);

        // Back above the band without a qualifying rebound off the low.
        assert!(!evaluate_buy_signal(&mut s, 670.0, &p));
        assert!(!s.is_monitoring_buy);
        assert!(s.lowest.is_none());
    }

    #[test]
    fn buy_reset_leaves_a_live_sell_watch_untouched() {
        // A gap from under the lower band to over the upper band latches the
        // sell watch on the same tick the buy watch resets; the recorded
        // high must survive the buy-side reset.
        let p = pair();
        let mut s = state(680.0, 2.0);

        evaluate_buy_signal(&mut s, 660.0, &p);
        assert!(s.is_monitoring_buy);
        assert_eq!(s.lowest, Some(660.0));

        // Next tick at 700: sell evaluation runs first and records the high.
        assert!(!evaluate_sell_signal(&mut s, 700.0, &p));
        assert!(s.is_monitoring_sell);
        assert_eq!(s.highest, Some(700.0));

        // The buy evaluation then resets its own side only.
        assert!(!evaluate_buy_signal(&mut s, 700.0, &p));
        assert!(!s.is_monitoring_buy);
        assert!(s.lowest.is_none());
        assert!(s.is_monitoring_sell);
        assert_eq!(s.highest, Some(700.0));
    }

    #[test]
    fn sell_reset_leaves_a_live_buy_watch_untouched() {
        let p = pair();
        let mut s = state(680.0, 2.0);
        s.is_monitoring_sell = true;
        s.highest = Some(695.0);
        s.is_monitoring_buy = true;
        s.lowest = Some(660.0);

        // Price back inside the band resets the sell side only.
        assert!(!evaluate_sell_signal(&mut s, 680.0, &p));
        assert!(!s.is_monitoring_sell);
        assert!(s.highest.is_none());
        assert!(s.is_monitoring_buy);
        assert_eq!(s.lowest, Some(660.0));
    }

    #[test]
    fn sell_sequence_mirrors_buy() {
        // After a fill at 680: 694 latches the watch, 691.2 fires.
        let p = pair();
        let mut s = state(680.0, 2.0);

        assert!(!evaluate_sell_signal(&mut s, 694.0, &p));
        assert!(s.is_monitoring_sell);
        assert_eq!(s.highest, Some(694.0));

        // 691.2 <= 694 * 0.996 = 691.224 -> fire.
        assert!(evaluate_sell_signal(&mut s, 691.2, &p));
        assert!(!s.is_monitoring_sell);
    }

    #[test]
    fn highest_is_monotonically_non_decreasing_while_latched() {
        let p = pair();
        let mut s = state(680.0, 2.0);

        evaluate_sell_signal(&mut s, 694.0, &p);
        evaluate_sell_signal(&mut s, 696.0, &p);
        // A dip that stays above the retrace trigger must not lower `highest`.
        evaluate_sell_signal(&mut s, 695.0, &p);
        assert_eq!(s.highest, Some(696.0));
    }

    #[test]
    fn firing_threshold_follows_a_resized_grid() {
        // The threshold is read at firing time, so a grid resize
        // between latching and firing uses the newer grid.
        let p = pair();
        let mut s = state(680.0, 2.0);

        evaluate_buy_signal(&mut s, 663.0, &p);
        assert!(s.is_monitoring_buy);
        assert_eq!(s.lowest, Some(663.0));

        // Tighten the grid to 1.5 %: the retrace needed drops from 0.4 % to
        // 0.3 % (663 * 1.003 = 664.989) while 665.0 stays under the new
        // lower band (680 * 0.985 = 669.8), so the latch holds.
        s.grid_size = 1.5;
        // Under the old 2 % grid 665.0 < 663 * 1.004 = 665.652 would NOT
        // have fired; with the newer threshold it does.
        assert!(evaluate_buy_signal(&mut s, 665.0, &p));
        assert!(!s.is_monitoring_buy);
    }

    #[test]
    fn same_tick_latch_and_fire_is_possible() {
        // Price jumps under the band and immediately satisfies the retrace
        // against an older, lower `lowest`.
        let p = pair();
        let mut s = state(680.0, 2.0);
        s.is_monitoring_buy = true;
        s.lowest = Some(660.0);

        // 663.0 <= 666.4 keeps the latch, and 663.0 >= 660 * 1.004 = 662.64.
        assert!(evaluate_buy_signal(&mut s, 663.0, &p));
    }

    #[test]
    fn pair_value_spans_spot_and_funding() {
        let p = pair();
        let mut spot = SpotBalance::default();
        spot.free.insert("BNB".into(), 0.03);
        spot.used.insert("BNB".into(), 0.01);
        spot.free.insert("USDT".into(), 980.0);
        let mut funding = FundingBalance::new();
        funding.insert("USDT".into(), 500.0);
        funding.insert("BNB".into(), 0.5);

        let value = pair_value_from_snapshot(&spot, &funding, &p, 600.0);
        let expected = 980.0 + 500.0 + (0.03 + 0.01 + 0.5) * 600.0;
        assert!((value - expected).abs() < 1e-9);
    }

    #[test]
    fn fill_bookkeeping_resets_monitoring_state() {
        // The post-fill contract on the state fields themselves.
        let mut s = state(680.0, 2.0);
        s.is_monitoring_buy = true;
        s.lowest = Some(663.0);
        s.highest = Some(700.0);

        // Mirror of handle_fill's state mutations.
        s.base_price = 665.7;
        s.highest = None;
        s.lowest = None;
        s.is_monitoring_buy = false;
        s.is_monitoring_sell = false;

        assert_eq!(s.base_price, 665.7);
        assert!(s.highest.is_none() && s.lowest.is_none());
        assert!(!s.is_monitoring_buy && !s.is_monitoring_sell);
    }
}
