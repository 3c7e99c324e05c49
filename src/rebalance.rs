// =============================================================================
// Working-capital rebalancer — keeps spot holdings near the configured target
// =============================================================================
//
// The strategy only needs a working-capital fraction of the pair's value
// (default 16 % in each of base and quote) sitting on the spot wallet; the
// rest earns yield in the funding account. Planning is a pure function over a
// balance snapshot so the transfer set is testable without a venue; the
// engine executes the plan through the adapter.
//
// Transfers below the venue's minimum subscription amounts are skipped: the
// quote leg uses a 1-unit floor, the base leg a configurable per-asset floor.
// =============================================================================

use tracing::info;

use crate::types::SymbolPair;

/// Minimum quote-asset amount worth a subscribe/redeem round trip.
const MIN_QUOTE_TRANSFER: f64 = 1.0;
/// Default minimum base-asset transfer.
pub const MIN_BASE_TRANSFER: f64 = 0.01;
/// Redemptions below this are API noise.
const MIN_REDEEM_AMOUNT: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Spot -> funding (subscribe).
    ToFunding,
    /// Funding -> spot (redeem).
    ToSpot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferAction {
    pub direction: TransferDirection,
    pub asset: String,
    pub amount: f64,
}

/// Inputs to one rebalance decision, all in the pair's own units.
#[derive(Debug, Clone, Copy)]
pub struct RebalanceSnapshot {
    pub free_base: f64,
    pub free_quote: f64,
    pub funding_base: f64,
    pub funding_quote: f64,
    pub price: f64,
    /// Per-pair total value in quote units (spot + funding, both legs).
    pub total_value: f64,
}

/// Compute the transfer set that moves spot holdings toward
/// `target_ratio * total_value` per leg.
///
/// `redeem_base` additionally tops up a base-leg deficit from funding; the
/// initial-funds pass wants this, the post-fill pass only redeems quote.
pub fn plan_rebalance(
    pair: &SymbolPair,
    snapshot: &RebalanceSnapshot,
    target_ratio: f64,
    min_base_transfer: f64,
    redeem_base: bool,
) -> Vec<TransferAction> {
    let mut actions = Vec::new();

    if snapshot.price <= 0.0 || snapshot.total_value <= 0.0 {
        return actions;
    }

    let target_quote_hold = snapshot.total_value * target_ratio;
    let target_base_hold = snapshot.total_value * target_ratio / snapshot.price;

    // --- Quote leg -----------------------------------------------------------
    if snapshot.free_quote > target_quote_hold {
        let excess = snapshot.free_quote - target_quote_hold;
        if excess > MIN_QUOTE_TRANSFER {
            actions.push(TransferAction {
                direction: TransferDirection::ToFunding,
                asset: pair.quote.clone(),
                amount: excess,
            });
        } else {
            info!(
                symbol = %pair,
                excess = format!("{excess:.2}"),
                "quote excess below transfer minimum, skipping"
            );
        }
    } else if snapshot.free_quote < target_quote_hold && snapshot.funding_quote > 0.0 {
        let deficit = target_quote_hold - snapshot.free_quote;
        let amount = deficit.min(snapshot.funding_quote);
        if amount >= MIN_REDEEM_AMOUNT {
            actions.push(TransferAction {
                direction: TransferDirection::ToSpot,
                asset: pair.quote.clone(),
                amount,
            });
        }
    }

    // --- Base leg ------------------------------------------------------------
    if snapshot.free_base > target_base_hold {
        let excess = snapshot.free_base - target_base_hold;
        if excess >= min_base_transfer {
            actions.push(TransferAction {
                direction: TransferDirection::ToFunding,
                asset: pair.base.clone(),
                amount: excess,
            });
        } else {
            info!(
                symbol = %pair,
                excess = format!("{excess:.6}"),
                min = min_base_transfer,
                "base excess below transfer minimum, skipping"
            );
        }
    } else if redeem_base && snapshot.free_base < target_base_hold && snapshot.funding_base > 0.0 {
        let deficit = target_base_hold - snapshot.free_base;
        let amount = deficit.min(snapshot.funding_base);
        if amount > 1e-8 {
            actions.push(TransferAction {
                direction: TransferDirection::ToSpot,
                asset: pair.base.clone(),
                amount,
            });
        }
    }

    actions
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

    #[test]
    fn excess_quote_moves_to_funding() {
        // T = 1000 and a 16 % target hold 160 of quote; free quote 980
        // => subscribe ~820 to funding.
        let snapshot = RebalanceSnapshot {
            free_base: 0.03,
            free_quote: 980.0,
            funding_base: 0.0,
            funding_quote: 500.0,
            price: 665.7,
            total_value: 1000.0,
        };
        let actions = plan_rebalance(&pair(), &snapshot, 0.16, MIN_BASE_TRANSFER, false);

        let quote_action = actions
            .iter()
            .find(|a| a.asset == "USDT")
            .expect("expected a quote transfer");
        assert_eq!(quote_action.direction, TransferDirection::ToFunding);
        assert!((quote_action.amount - 820.0).abs() < 1e-9);
    }

    #[test]
    fn quote_deficit_redeems_from_funding_capped_at_balance() {
        let snapshot = RebalanceSnapshot {
            free_base: 0.0,
            free_quote: 50.0,
            funding_base: 0.0,
            funding_quote: 40.0,
            price: 600.0,
            total_value: 1000.0,
        };
        // Target 160, deficit 110, funding only has 40.
        let actions = plan_rebalance(&pair(), &snapshot, 0.16, MIN_BASE_TRANSFER, false);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].direction, TransferDirection::ToSpot);
        assert!((actions[0].amount - 40.0).abs() < 1e-9);
    }

    #[test]
    fn tiny_quote_excess_is_skipped() {
        let snapshot = RebalanceSnapshot {
            free_base: 0.0,
            free_quote: 160.5,
            funding_base: 0.0,
            funding_quote: 0.0,
            price: 600.0,
            total_value: 1000.0,
        };
        // Excess 0.5 < 1.0 floor.
        assert!(plan_rebalance(&pair(), &snapshot, 0.16, MIN_BASE_TRANSFER, false).is_empty());
    }

    #[test]
    fn base_excess_respects_min_transfer() {
        let snapshot = RebalanceSnapshot {
            free_base: 0.27,
            free_quote: 160.0,
            funding_base: 0.0,
            funding_quote: 0.0,
            price: 600.0,
            total_value: 1000.0,
        };
        // Target base hold 160/600 = 0.2667; excess ~0.0033 < 0.01 floor.
        assert!(plan_rebalance(&pair(), &snapshot, 0.16, MIN_BASE_TRANSFER, false).is_empty());

        // With a larger excess the transfer happens.
        let snapshot = RebalanceSnapshot {
            free_base: 0.40,
            ..snapshot
        };
        let actions = plan_rebalance(&pair(), &snapshot, 0.16, MIN_BASE_TRANSFER, false);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].asset, "BNB");
        assert_eq!(actions[0].direction, TransferDirection::ToFunding);
    }

    #[test]
    fn base_deficit_redeemed_only_when_requested() {
        let snapshot = RebalanceSnapshot {
            free_base: 0.0,
            free_quote: 160.0,
            funding_base: 1.0,
            funding_quote: 0.0,
            price: 600.0,
            total_value: 1000.0,
        };
        // Post-fill pass: base deficit ignored.
        assert!(plan_rebalance(&pair(), &snapshot, 0.16, MIN_BASE_TRANSFER, false).is_empty());

        // Initial pass: redeem min(deficit, funding).
        let actions = plan_rebalance(&pair(), &snapshot, 0.16, MIN_BASE_TRANSFER, true);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].direction, TransferDirection::ToSpot);
        assert_eq!(actions[0].asset, "BNB");
        assert!((actions[0].amount - 160.0 / 600.0).abs() < 1e-9);
    }

    #[test]
    fn second_run_after_execution_is_a_noop() {
        // Idempotence: apply the plan, re-plan, expect nothing.
        let snapshot = RebalanceSnapshot {
            free_base: 0.5,
            free_quote: 980.0,
            funding_base: 0.0,
            funding_quote: 0.0,
            price: 600.0,
            total_value: 1280.0,
        };
        let actions = plan_rebalance(&pair(), &snapshot, 0.16, MIN_BASE_TRANSFER, false);
        assert!(!actions.is_empty());

        // Simulate execution of every transfer.
        let mut after = snapshot;
        for action in &actions {
            match (&action.direction, action.asset.as_str()) {
                (TransferDirection::ToFunding, "USDT") => {
                    after.free_quote -= action.amount;
                    after.funding_quote += action.amount;
                }
                (TransferDirection::ToFunding, "BNB") => {
                    after.free_base -= action.amount;
                    after.funding_base += action.amount;
                }
                (TransferDirection::ToSpot, "USDT") => {
                    after.free_quote += action.amount;
                    after.funding_quote -= action.amount;
                }
                (TransferDirection::ToSpot, "BNB") => {
                    after.free_base += action.amount;
                    after.funding_base -= action.amount;
                }
                _ => unreachable!(),
            }
        }

        let second = plan_rebalance(&pair(), &after, 0.16, MIN_BASE_TRANSFER, false);
        assert!(second.is_empty(), "second pass should be a no-op: {second:?}");
    }

    #[test]
    fn invalid_inputs_produce_no_plan() {
        let snapshot = RebalanceSnapshot {
            free_base: 1.0,
            free_quote: 1000.0,
            funding_base: 0.0,
            funding_quote: 0.0,
            price: 0.0,
            total_value: 1000.0,
        };
        assert!(plan_rebalance(&pair(), &snapshot, 0.16, MIN_BASE_TRANSFER, true).is_empty());

        let snapshot = RebalanceSnapshot {
            price: 600.0,
            total_value: 0.0,
            ..snapshot
        };
        assert!(plan_rebalance(&pair(), &snapshot, 0.16, MIN_BASE_TRANSFER, true).is_empty());
    }
}
