// =============================================================================
// Risk controller — coarse position-ratio gate over the main trade path
// =============================================================================
//
// For each tick the controller turns a (spot, funding) balance snapshot into
// one of three gating states. This is a refinement on top of the venue's own
// risk rules, not a substitute: any failure to compute the ratio fails open
// to AllowAll so an observability problem can never freeze trading.
//
// Logging discipline: a WARNING only on the transition into a breached state,
// an INFO "recovered" only on the transition back, and a quantitative line
// only when the ratio moved more than 0.1 percentage points.
// =============================================================================

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::types::{FundingBalance, SpotBalance, SymbolPair};

/// Gating state for the main trade path. Computed per tick, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskState {
    AllowAll,
    AllowBuyOnly,
    AllowSellOnly,
}

impl std::fmt::Display for RiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllowAll => write!(f, "allow_all"),
            Self::AllowBuyOnly => write!(f, "allow_buy_only"),
            Self::AllowSellOnly => write!(f, "allow_sell_only"),
        }
    }
}

/// Quote-denominated share of the pair's value held in the base asset.
///
/// base and quote sums each cover free + used spot plus the funding balance.
/// Returns 0 when the denominator is 0.
pub fn position_ratio(
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

    let base_value = base_amount * price;
    let total = base_value + quote_amount;
    if total <= 0.0 {
        return 0.0;
    }
    base_value / total
}

pub struct RiskController {
    pair: SymbolPair,
    min_ratio: f64,
    max_ratio: f64,
    /// Labels the limit source in log lines ("global" or the symbol).
    limit_scope: &'static str,
    last_logged_ratio: Option<f64>,
    min_breach_logged: bool,
    max_breach_logged: bool,
}

impl RiskController {
    /// `per_symbol` is true when the bounds came from a POSITION_LIMITS_JSON
    /// override rather than the global limits.
    pub fn new(pair: SymbolPair, min_ratio: f64, max_ratio: f64, per_symbol: bool) -> Self {
        Self {
            pair,
            min_ratio,
            max_ratio,
            limit_scope: if per_symbol { "symbol" } else { "global" },
            last_logged_ratio: None,
            min_breach_logged: false,
            max_breach_logged: false,
        }
    }

    /// Replace the limits (hot config reload).
    pub fn set_bounds(&mut self, min_ratio: f64, max_ratio: f64, per_symbol: bool) {
        self.min_ratio = min_ratio;
        self.max_ratio = max_ratio;
        self.limit_scope = if per_symbol { "symbol" } else { "global" };
    }

    /// Map the current snapshot to a gating state.
    ///
    /// Boundary semantics are strict: a ratio exactly equal to a limit is
    /// still in range.
    pub fn check(
        &mut self,
        spot: &SpotBalance,
        funding: &FundingBalance,
        price: f64,
    ) -> RiskState {
        if !price.is_finite() || price <= 0.0 {
            debug!(symbol = %self.pair, price, "invalid price for risk check, failing open");
            return RiskState::AllowAll;
        }

        let ratio = position_ratio(spot, funding, &self.pair, price);
        if !ratio.is_finite() {
            return RiskState::AllowAll;
        }

        // Quantitative line only when the ratio actually moved.
        let moved = self
            .last_logged_ratio
            .map(|last| (ratio - last).abs() > 0.001)
            .unwrap_or(true);
        if moved {
            info!(
                symbol = %self.pair,
                scope = self.limit_scope,
                position_ratio = format!("{:.2}%", ratio * 100.0),
                min = format!("{:.2}%", self.min_ratio * 100.0),
                max = format!("{:.2}%", self.max_ratio * 100.0),
                "position ratio"
            );
            self.last_logged_ratio = Some(ratio);
        }

        if ratio > self.max_ratio {
            if !self.max_breach_logged {
                warn!(
                    symbol = %self.pair,
                    scope = self.limit_scope,
                    position_ratio = format!("{:.2}%", ratio * 100.0),
                    max = format!("{:.2}%", self.max_ratio * 100.0),
                    "position over limit, pausing buys"
                );
                self.max_breach_logged = true;
            }
            self.min_breach_logged = false;
            return RiskState::AllowSellOnly;
        }

        if ratio < self.min_ratio {
            if !self.min_breach_logged {
                warn!(
                    symbol = %self.pair,
                    scope = self.limit_scope,
                    position_ratio = format!("{:.2}%", ratio * 100.0),
                    min = format!("{:.2}%", self.min_ratio * 100.0),
                    "base holding under floor, pausing sells"
                );
                self.min_breach_logged = true;
            }
            self.max_breach_logged = false;
            return RiskState::AllowBuyOnly;
        }

        if self.min_breach_logged || self.max_breach_logged {
            info!(
                symbol = %self.pair,
                position_ratio = format!("{:.2}%", ratio * 100.0),
                "position ratio recovered to normal range"
            );
        }
        self.min_breach_logged = false;
        self.max_breach_logged = false;
        RiskState::AllowAll
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pair() -> SymbolPair {
        SymbolPair::parse("BNB/USDT").unwrap()
    }

    fn snapshot(
        free_base: f64,
        used_base: f64,
        free_quote: f64,
        used_quote: f64,
        funding_base: f64,
        funding_quote: f64,
    ) -> (SpotBalance, FundingBalance) {
        let mut spot = SpotBalance::default();
        spot.free.insert("BNB".into(), free_base);
        spot.used.insert("BNB".into(), used_base);
        spot.free.insert("USDT".into(), free_quote);
        spot.used.insert("USDT".into(), used_quote);
        let mut funding: FundingBalance = HashMap::new();
        funding.insert("BNB".into(), funding_base);
        funding.insert("USDT".into(), funding_quote);
        (spot, funding)
    }

    #[test]
    fn ratio_counts_free_used_and_funding() {
        // 1 BNB spot free + 0.5 used + 0.5 funding at 100 => 200 base value;
        // 100 + 50 + 50 = 200 quote. Ratio 0.5.
        let (spot, funding) = snapshot(1.0, 0.5, 100.0, 50.0, 0.5, 50.0);
        let ratio = position_ratio(&spot, &funding, &pair(), 100.0);
        assert!((ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_account_ratio_is_zero() {
        let (spot, funding) = snapshot(0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        assert_eq!(position_ratio(&spot, &funding, &pair(), 100.0), 0.0);
    }

    #[test]
    fn boundary_values_allow_all() {
        // ratio = 0.9 with max = 0.9: strict inequality keeps trading open.
        let (spot, funding) = snapshot(9.0, 0.0, 100.0, 0.0, 0.0, 0.0);
        let mut ctl = RiskController::new(pair(), 0.1, 0.9, false);
        assert_eq!(ctl.check(&spot, &funding, 100.0), RiskState::AllowAll);
    }

    #[test]
    fn over_limit_blocks_buys() {
        // base 901, quote 99 => ratio 0.901 > 0.9.
        let (spot, funding) = snapshot(9.01, 0.0, 99.0, 0.0, 0.0, 0.0);
        let mut ctl = RiskController::new(pair(), 0.1, 0.9, false);
        assert_eq!(ctl.check(&spot, &funding, 100.0), RiskState::AllowSellOnly);
    }

    #[test]
    fn under_floor_blocks_sells() {
        // base 9.9, quote 90.1 => ratio 0.099 < 0.1.
        let (spot, funding) = snapshot(0.099, 0.0, 90.1, 0.0, 0.0, 0.0);
        let mut ctl = RiskController::new(pair(), 0.1, 0.9, false);
        assert_eq!(ctl.check(&spot, &funding, 100.0), RiskState::AllowBuyOnly);
    }

    #[test]
    fn invalid_price_fails_open() {
        let (spot, funding) = snapshot(100.0, 0.0, 1.0, 0.0, 0.0, 0.0);
        let mut ctl = RiskController::new(pair(), 0.1, 0.9, false);
        assert_eq!(ctl.check(&spot, &funding, 0.0), RiskState::AllowAll);
        assert_eq!(ctl.check(&spot, &funding, f64::NAN), RiskState::AllowAll);
    }

    #[test]
    fn breach_flags_track_transitions() {
        let mut ctl = RiskController::new(pair(), 0.1, 0.9, false);

        let (over_spot, over_funding) = snapshot(9.5, 0.0, 50.0, 0.0, 0.0, 0.0);
        ctl.check(&over_spot, &over_funding, 100.0);
        assert!(ctl.max_breach_logged);
        assert!(!ctl.min_breach_logged);

        // Staying breached must not reset the flag (that would re-log).
        ctl.check(&over_spot, &over_funding, 100.0);
        assert!(ctl.max_breach_logged);

        // Recovery clears both flags.
        let (ok_spot, ok_funding) = snapshot(5.0, 0.0, 500.0, 0.0, 0.0, 0.0);
        assert_eq!(ctl.check(&ok_spot, &ok_funding, 100.0), RiskState::AllowAll);
        assert!(!ctl.max_breach_logged);
        assert!(!ctl.min_breach_logged);
    }

    #[test]
    fn flipping_breach_direction_swaps_flags() {
        let mut ctl = RiskController::new(pair(), 0.1, 0.9, false);

        let (over_spot, over_funding) = snapshot(9.5, 0.0, 50.0, 0.0, 0.0, 0.0);
        assert_eq!(
            ctl.check(&over_spot, &over_funding, 100.0),
            RiskState::AllowSellOnly
        );

        let (under_spot, under_funding) = snapshot(0.05, 0.0, 995.0, 0.0, 0.0, 0.0);
        assert_eq!(
            ctl.check(&under_spot, &under_funding, 100.0),
            RiskState::AllowBuyOnly
        );
        assert!(ctl.min_breach_logged);
        assert!(!ctl.max_breach_logged);
    }

    #[test]
    fn spec_scenario_s5() {
        // base_value 900, quote 100, ratio 0.9 at max 0.9: AllowAll.
        let mut ctl = RiskController::new(pair(), 0.1, 0.9, false);
        let (spot, funding) = snapshot(9.0, 0.0, 100.0, 0.0, 0.0, 0.0);
        assert_eq!(ctl.check(&spot, &funding, 100.0), RiskState::AllowAll);

        // ratio 0.901: sell only.
        let (spot, funding) = snapshot(9.01, 0.0, 99.0, 0.0, 0.0, 0.0);
        assert_eq!(ctl.check(&spot, &funding, 100.0), RiskState::AllowSellOnly);

        // ratio 0.099 with min 0.1: buy only.
        let (spot, funding) = snapshot(0.99, 0.0, 901.0, 0.0, 0.0, 0.0);
        assert_eq!(ctl.check(&spot, &funding, 100.0), RiskState::AllowBuyOnly);
    }
}
