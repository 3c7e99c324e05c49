// =============================================================================
// Order tracker — append-only trade ledger with startup reconciliation
// =============================================================================
//
// One `trade_history_<BASE>_<QUOTE>.json` per symbol, mirrored in memory as
// an ordered list. `add_trade` appends and flushes through the same atomic
// write used for engine state. At startup the last ~50 exchange fills are
// aggregated per order id (partial fills collapse to one volume-weighted
// trade) and merged over the local ledger: same-id entries are overwritten,
// local-only history is never deleted, so the merge is idempotent.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{error, info};

use crate::state::atomic_write_json;
use crate::types::{FillRecord, SymbolPair, Trade};

pub struct OrderTracker {
    path: PathBuf,
    trades: Vec<Trade>,
}

impl OrderTracker {
    /// Path of the ledger file for `pair` under `data_dir`.
    pub fn path_for(data_dir: &Path, pair: &SymbolPair) -> PathBuf {
        data_dir.join(format!("trade_history_{}.json", pair.file_tag()))
    }

    /// Open the ledger, loading any persisted history. A corrupt file is
    /// logged and treated as empty rather than crashing the engine.
    pub fn open(path: PathBuf) -> Self {
        let trades = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<Trade>>(&content) {
                Ok(trades) => {
                    info!(path = %path.display(), count = trades.len(), "trade history loaded");
                    trades
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "trade history corrupt, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self { path, trades }
    }

    /// Append a completed trade and flush to disk. A persistence failure is
    /// logged and the in-memory entry kept; the next flush retries.
    pub fn add_trade(&mut self, trade: Trade) {
        self.trades.push(trade);
        if let Err(e) = self.flush() {
            error!(path = %self.path.display(), error = %e, "failed to persist trade history");
        }
    }

    pub fn trade_history(&self) -> &[Trade] {
        &self.trades
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// Merge recent exchange fills into the ledger (startup reconciliation).
    ///
    /// Multi-fill partials are aggregated per order id into one synthetic
    /// trade priced at the volume-weighted average; aggregates overwrite
    /// same-id local entries and everything is re-sorted by timestamp.
    pub fn reconcile_fills(&mut self, fills: &[FillRecord]) {
        if fills.is_empty() {
            info!(path = %self.path.display(), "reconciliation found no exchange fills");
            return;
        }

        let aggregated = aggregate_fills(fills);

        let mut by_id: HashMap<String, Trade> = self
            .trades
            .drain(..)
            .map(|t| (t.order_id.clone(), t))
            .collect();
        for trade in aggregated {
            by_id.insert(trade.order_id.clone(), trade);
        }

        let mut merged: Vec<Trade> = by_id.into_values().collect();
        merged.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        self.trades = merged;

        if let Err(e) = self.flush() {
            error!(path = %self.path.display(), error = %e, "failed to persist reconciled history");
        }
        info!(path = %self.path.display(), count = self.trades.len(), "trade history reconciled");
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    /// Fraction of recorded trades with positive profit; 0 with no history.
    pub fn win_rate(&self) -> f64 {
        if self.trades.is_empty() {
            return 0.0;
        }
        let wins = self.trades.iter().filter(|t| t.profit > 0.0).count();
        wins as f64 / self.trades.len() as f64
    }

    /// Average win over average loss. Defaults to 1.0 with fewer than 10
    /// trades or when no losses exist to divide by.
    pub fn payoff_ratio(&self) -> f64 {
        if self.trades.len() < 10 {
            return 1.0;
        }
        let wins: Vec<f64> = self
            .trades
            .iter()
            .filter(|t| t.profit > 0.0)
            .map(|t| t.profit)
            .collect();
        let losses: Vec<f64> = self
            .trades
            .iter()
            .filter(|t| t.profit < 0.0)
            .map(|t| t.profit.abs())
            .collect();
        if wins.is_empty() || losses.is_empty() {
            return 1.0;
        }
        let avg_win = wins.iter().sum::<f64>() / wins.len() as f64;
        let avg_loss = losses.iter().sum::<f64>() / losses.len() as f64;
        if avg_loss == 0.0 {
            1.0
        } else {
            avg_win / avg_loss
        }
    }

    fn flush(&self) -> Result<()> {
        atomic_write_json(&self.path, &self.trades)
    }
}

/// Collapse exchange fills into one synthetic trade per order id.
fn aggregate_fills(fills: &[FillRecord]) -> Vec<Trade> {
    struct Bucket {
        timestamp_ms: i64,
        side: crate::types::Side,
        amount: f64,
        cost: f64,
    }

    let mut buckets: HashMap<String, Bucket> = HashMap::new();
    for fill in fills {
        if fill.order_id.is_empty() || fill.amount <= 0.0 {
            continue;
        }
        let bucket = buckets.entry(fill.order_id.clone()).or_insert(Bucket {
            timestamp_ms: fill.timestamp_ms,
            side: fill.side,
            amount: 0.0,
            cost: 0.0,
        });
        bucket.amount += fill.amount;
        bucket.cost += fill.cost;
        // Keep the earliest fill time as the order's time.
        bucket.timestamp_ms = bucket.timestamp_ms.min(fill.timestamp_ms);
    }

    buckets
        .into_iter()
        .map(|(order_id, b)| Trade {
            timestamp: b.timestamp_ms as f64 / 1000.0,
            side: b.side,
            price: b.cost / b.amount,
            amount: b.amount,
            order_id,
            profit: 0.0,
            strategy_tag: None,
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn fill(order_id: &str, ts_ms: i64, side: Side, price: f64, amount: f64) -> FillRecord {
        FillRecord {
            order_id: order_id.to_string(),
            timestamp_ms: ts_ms,
            side,
            price,
            amount,
            cost: price * amount,
        }
    }

    fn trade(order_id: &str, ts: f64, profit: f64) -> Trade {
        Trade {
            timestamp: ts,
            side: Side::Buy,
            price: 680.0,
            amount: 0.1,
            order_id: order_id.to_string(),
            profit,
            strategy_tag: None,
        }
    }

    #[test]
    fn add_trade_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trade_history_BNB_USDT.json");

        let mut tracker = OrderTracker::open(path.clone());
        tracker.add_trade(trade("a1", 100.0, 0.0));
        tracker.add_trade(trade("a2", 101.0, 2.5));
        assert_eq!(tracker.len(), 2);

        let reloaded = OrderTracker::open(path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.trade_history()[1].order_id, "a2");
    }

    #[test]
    fn partial_fills_aggregate_to_vwap() {
        let fills = vec![
            fill("o1", 2000, Side::Buy, 680.0, 0.1),
            fill("o1", 1000, Side::Buy, 682.0, 0.3),
        ];
        let trades = aggregate_fills(&fills);
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert!((t.amount - 0.4).abs() < 1e-12);
        let vwap = (680.0 * 0.1 + 682.0 * 0.3) / 0.4;
        assert!((t.price - vwap).abs() < 1e-9);
        // Earliest fill time wins.
        assert!((t.timestamp - 1.0).abs() < 1e-9);
    }

    #[test]
    fn reconcile_overwrites_same_id_and_keeps_local_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trade_history_BNB_USDT.json");
        let mut tracker = OrderTracker::open(path);

        tracker.add_trade(trade("local-only", 50.0, 1.0));
        tracker.add_trade(Trade {
            price: 600.0,
            ..trade("o1", 60.0, 0.0)
        });

        tracker.reconcile_fills(&[fill("o1", 60_000, Side::Buy, 681.0, 0.2)]);

        assert_eq!(tracker.len(), 2);
        let o1 = tracker
            .trade_history()
            .iter()
            .find(|t| t.order_id == "o1")
            .unwrap();
        // The exchange-side aggregate replaced the stale local price.
        assert!((o1.price - 681.0).abs() < 1e-9);
        assert!(tracker
            .trade_history()
            .iter()
            .any(|t| t.order_id == "local-only"));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trade_history_BNB_USDT.json");
        let mut tracker = OrderTracker::open(path);
        tracker.add_trade(trade("keep", 10.0, 0.5));

        let fills = vec![
            fill("o1", 2000, Side::Buy, 680.0, 0.1),
            fill("o1", 1000, Side::Buy, 682.0, 0.3),
            fill("o2", 3000, Side::Sell, 690.0, 0.2),
        ];

        tracker.reconcile_fills(&fills);
        let first: Vec<Trade> = tracker.trade_history().to_vec();

        tracker.reconcile_fills(&fills);
        let second = tracker.trade_history();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.order_id, b.order_id);
            assert_eq!(a.price, b.price);
            assert_eq!(a.amount, b.amount);
        }
    }

    #[test]
    fn reconcile_sorts_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = OrderTracker::open(dir.path().join("t.json"));
        tracker.reconcile_fills(&[
            fill("late", 9000, Side::Sell, 700.0, 0.1),
            fill("early", 1000, Side::Buy, 650.0, 0.1),
        ]);
        let ids: Vec<&str> = tracker
            .trade_history()
            .iter()
            .map(|t| t.order_id.as_str())
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn zero_amount_fills_are_skipped() {
        let trades = aggregate_fills(&[fill("dust", 1000, Side::Buy, 680.0, 0.0)]);
        assert!(trades.is_empty());
    }

    #[test]
    fn win_rate_and_payoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = OrderTracker::open(dir.path().join("t.json"));
        assert_eq!(tracker.win_rate(), 0.0);
        assert_eq!(tracker.payoff_ratio(), 1.0);

        for i in 0..12 {
            let profit = if i % 3 == 0 { -1.0 } else { 2.0 };
            tracker.add_trade(trade(&format!("t{i}"), i as f64, profit));
        }
        // 8 wins of 12.
        assert!((tracker.win_rate() - 8.0 / 12.0).abs() < 1e-9);
        // avg win 2.0, avg loss 1.0.
        assert!((tracker.payoff_ratio() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn payoff_defaults_below_ten_trades() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = OrderTracker::open(dir.path().join("t.json"));
        for i in 0..5 {
            tracker.add_trade(trade(&format!("t{i}"), i as f64, 3.0));
        }
        assert_eq!(tracker.payoff_ratio(), 1.0);
    }
}
