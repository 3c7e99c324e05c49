// =============================================================================
// Exchange adapter contract — one interface regardless of venue
// =============================================================================
//
// The adapter is the only component that talks to the venue. Engines query
// capabilities (`supports`) instead of catching "not implemented" errors, and
// they never see raw HTTP failures: the adapter returns typed errors or typed
// empty values.
//
// Thread safety is part of the contract: one adapter instance is shared by
// every grid engine plus the reporter task, so all methods take `&self` and
// internal caches are mutex-guarded.
// =============================================================================

pub mod binance;
pub mod cache;
pub mod error;
pub mod okx;
pub mod rate_limit;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::types::{
    Candle, FillRecord, FundingBalance, MarketSpec, OrderBookTop, OrderRecord, Side, SpotBalance,
    Ticker,
};
use error::{ExchangeError, ExchangeResult};

/// Capabilities an adapter may advertise. Engines degrade when a feature is
/// absent (e.g. the rebalancer becomes a no-op without `FundingAccount`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    SpotTrading,
    FundingAccount,
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Unknown features return `false`; they never panic.
    fn supports(&self, feature: Feature) -> bool;

    /// Load the venue's market catalogue. Must be called once at startup;
    /// retried by the caller (up to 3 times with backoff).
    async fn load_markets(&self) -> ExchangeResult<()>;

    /// Trading rules for `symbol` as resolved by `load_markets`.
    fn market_spec(&self, symbol: &str) -> Option<MarketSpec>;

    /// Measure the server-vs-local clock skew and store the signed offset.
    /// A failure keeps the previous offset.
    async fn sync_time(&self) -> ExchangeResult<()>;

    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker>;
    async fn fetch_order_book(&self, symbol: &str, depth: u32) -> ExchangeResult<OrderBookTop>;
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> ExchangeResult<Vec<Candle>>;

    /// Spot wallet snapshot, served from a 30 s cache. Returns an
    /// empty-but-shaped value on failure; never errors to the engine.
    async fn fetch_spot_balance(&self) -> SpotBalance;

    /// Funding (flexible savings) balance, separate 30 s cache. Returns `{}`
    /// when the feature is disabled or unsupported.
    async fn fetch_funding_balance(&self) -> FundingBalance;

    async fn create_limit_order(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
        price: f64,
    ) -> ExchangeResult<OrderRecord>;
    async fn create_market_order(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
    ) -> ExchangeResult<OrderRecord>;
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<()>;
    async fn fetch_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderRecord>;
    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderRecord>>;
    async fn fetch_my_trades(&self, symbol: &str, limit: u32) -> ExchangeResult<Vec<FillRecord>>;

    /// Subscribe spot funds into the savings product. Invalidates both
    /// balance caches on success.
    async fn transfer_spot_to_funding(&self, asset: &str, amount: f64) -> ExchangeResult<()>;
    /// Redeem savings back to the spot wallet. Invalidates both balance
    /// caches on success.
    async fn transfer_funding_to_spot(&self, asset: &str, amount: f64) -> ExchangeResult<()>;

    /// Whole-account value in `quote_asset`, combining spot (excluding
    /// savings receipts) and funding, 30 s cache.
    async fn total_account_value(&self, quote_asset: &str) -> ExchangeResult<f64>;

    /// Release any venue-side resources. Called last during shutdown.
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Instantiate the adapter selected by `EXCHANGE`.
pub fn build_adapter(config: &Config) -> anyhow::Result<Arc<dyn ExchangeAdapter>> {
    match config.exchange.as_str() {
        "binance" => Ok(Arc::new(binance::BinanceAdapter::new(config)?)),
        "okx" => Ok(Arc::new(okx::OkxAdapter::new(config)?)),
        other => anyhow::bail!("unsupported exchange '{other}' (supported: binance, okx)"),
    }
}

// ---------------------------------------------------------------------------
// Background time sync
// ---------------------------------------------------------------------------

/// Periodically refresh the adapter's server-time offset. Other callers must
/// tolerate the offset changing at any moment (it is stored atomically).
pub async fn run_time_sync_task(
    adapter: Arc<dyn ExchangeAdapter>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    debug!(interval_secs = interval.as_secs(), "time sync task started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = adapter.sync_time().await {
                    // Keep the old offset; a transient sync failure is not fatal.
                    error!(error = %e, "periodic time sync failed");
                }
            }
            _ = shutdown.changed() => {
                debug!("time sync task stopping");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Funding-balance change detection
// ---------------------------------------------------------------------------

/// Relative threshold above which a funding-balance move is worth a log line.
/// Chosen to swallow daily interest accruals.
const FUNDING_CHANGE_THRESHOLD: f64 = 0.001;

/// "Significant change" rule for the funding-balance update log: any asset
/// moved by more than 0.1 % relative, or appeared from zero.
pub fn funding_balance_changed_significantly(
    old: &FundingBalance,
    new: &FundingBalance,
) -> bool {
    if old == new {
        return false;
    }

    let assets: HashSet<&String> = old.keys().chain(new.keys()).collect();
    for asset in assets {
        let old_amount = old.get(asset).copied().unwrap_or(0.0);
        let new_amount = new.get(asset).copied().unwrap_or(0.0);

        if old_amount == 0.0 && new_amount > 0.0 {
            return true;
        }
        let relative = (new_amount - old_amount).abs() / old_amount.max(1e-9);
        if relative > FUNDING_CHANGE_THRESHOLD {
            return true;
        }
    }
    false
}

/// Log a funding-balance update only when it is significant.
pub(crate) fn log_funding_update(venue: &str, old: &FundingBalance, new: &FundingBalance) {
    if funding_balance_changed_significantly(old, new) {
        info!(venue, balances = ?new, "funding balance updated");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn balances(entries: &[(&str, f64)]) -> FundingBalance {
        entries
            .iter()
            .map(|(a, v)| (a.to_string(), *v))
            .collect::<HashMap<_, _>>()
    }

    #[test]
    fn identical_balances_are_not_significant() {
        let old = balances(&[("USDT", 500.0), ("BNB", 1.0)]);
        assert!(!funding_balance_changed_significantly(&old, &old.clone()));
    }

    #[test]
    fn interest_accrual_below_threshold_ignored() {
        let old = balances(&[("USDT", 500.0)]);
        // 0.05 % move — interest, not a transfer.
        let new = balances(&[("USDT", 500.25)]);
        assert!(!funding_balance_changed_significantly(&old, &new));
    }

    #[test]
    fn transfer_sized_move_is_significant() {
        let old = balances(&[("USDT", 500.0)]);
        let new = balances(&[("USDT", 1320.0)]);
        assert!(funding_balance_changed_significantly(&old, &new));
    }

    #[test]
    fn asset_appearing_from_zero_is_significant() {
        let old = balances(&[]);
        let new = balances(&[("BNB", 0.5)]);
        assert!(funding_balance_changed_significantly(&old, &new));
    }

    #[test]
    fn asset_disappearing_is_significant() {
        let old = balances(&[("BNB", 0.5)]);
        let new = balances(&[]);
        assert!(funding_balance_changed_significantly(&old, &new));
    }

    #[test]
    fn threshold_is_relative_not_absolute() {
        // A 10 USDT move on a million-USDT balance is below 0.1 %.
        let old = balances(&[("USDT", 1_000_000.0)]);
        let new = balances(&[("USDT", 1_000_010.0)]);
        assert!(!funding_balance_changed_significantly(&old, &new));

        // The same 10 USDT on a 100 USDT balance is 10 %.
        let old = balances(&[("USDT", 100.0)]);
        let new = balances(&[("USDT", 110.0)]);
        assert!(funding_balance_changed_significantly(&old, &new));
    }
}
