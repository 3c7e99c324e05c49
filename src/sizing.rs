// =============================================================================
// Order sizing — venue limit enforcement for quantity and notional
// =============================================================================
//
// An order amount computed from the 10 % target notional must respect four
// venue limits before submission: min/max quantity and min/max notional.
// Undersized amounts are bumped up to the minimum and re-rounded; amounts
// that still violate a limit after adjustment are rejected (the caller skips
// the trade attempt rather than submitting a doomed order).
// =============================================================================

use crate::precision::round_down;
use crate::types::MarketSpec;

/// A normalised, venue-acceptable order size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedAmount {
    /// Quantity in base units, rounded to the market's amount precision.
    pub amount: f64,
    /// amount * price at the requested limit price.
    pub notional: f64,
}

/// Apply the market's precision and limit rules to a raw base-asset amount at
/// the given `price`. Returns `None` when no acceptable size exists.
pub fn normalize_amount(raw_amount: f64, price: f64, spec: &MarketSpec) -> Option<NormalizedAmount> {
    if !raw_amount.is_finite() || !price.is_finite() || raw_amount <= 0.0 || price <= 0.0 {
        return None;
    }

    let mut amount = raw_amount;

    // Bump up to the minimums first.
    if amount < spec.min_amount {
        amount = spec.min_amount;
    }
    if spec.min_notional > 0.0 && amount * price < spec.min_notional {
        amount = spec.min_notional / price;
    }

    // Cap at the maximums.
    if let Some(max_amount) = spec.max_amount {
        if max_amount > 0.0 && amount > max_amount {
            amount = max_amount;
        }
    }
    if let Some(max_notional) = spec.max_notional {
        if max_notional > 0.0 && amount * price > max_notional {
            amount = max_notional / price;
        }
    }

    // Precision rounding happens after limit adjustment, then every limit is
    // re-checked: rounding down can drop the amount back under a minimum.
    let rounded = round_down(amount, spec.amount_precision);
    if rounded <= 0.0 {
        return None;
    }

    if rounded < spec.min_amount {
        return None;
    }
    if spec.min_notional > 0.0 && rounded * price < spec.min_notional {
        // One more nudge: the smallest representable step above the notional
        // floor, if it exists within the max limits.
        let step = 10f64.powi(-(spec.amount_precision as i32));
        let bumped = rounded + step;
        if bumped * price < spec.min_notional {
            return None;
        }
        if let Some(max_amount) = spec.max_amount {
            if max_amount > 0.0 && bumped > max_amount {
                return None;
            }
        }
        if let Some(max_notional) = spec.max_notional {
            if max_notional > 0.0 && bumped * price > max_notional {
                return None;
            }
        }
        return Some(NormalizedAmount {
            amount: bumped,
            notional: bumped * price,
        });
    }
    if let Some(max_amount) = spec.max_amount {
        if max_amount > 0.0 && rounded > max_amount {
            return None;
        }
    }
    if let Some(max_notional) = spec.max_notional {
        if max_notional > 0.0 && rounded * price > max_notional {
            return None;
        }
    }

    Some(NormalizedAmount {
        amount: rounded,
        notional: rounded * price,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> MarketSpec {
        MarketSpec {
            amount_precision: 3,
            price_precision: 2,
            min_amount: 0.001,
            min_notional: 10.0,
            max_amount: Some(1000.0),
            max_notional: Some(100_000.0),
        }
    }

    #[test]
    fn typical_amount_rounds_down_to_precision() {
        // 100 USDT at 665.70 -> 0.150218... -> 0.150
        let n = normalize_amount(100.0 / 665.70, 665.70, &spec()).unwrap();
        assert_eq!(n.amount, 0.150);
        assert!((n.notional - 0.150 * 665.70).abs() < 1e-9);
    }

    #[test]
    fn undersized_amount_bumped_to_min_notional() {
        // 1 USDT worth at 500 -> below min_notional 10 -> bumped to >= 10/500.
        let n = normalize_amount(0.002, 500.0, &spec()).unwrap();
        assert!(n.notional >= 10.0 - 1e-9, "notional {} below floor", n.notional);
    }

    #[test]
    fn below_min_amount_bumped() {
        let s = MarketSpec {
            min_notional: 0.0,
            ..spec()
        };
        let n = normalize_amount(0.0001, 100_000.0, &s).unwrap();
        assert!(n.amount >= s.min_amount);
    }

    #[test]
    fn hopeless_sizes_rejected() {
        // max_notional below min_notional leaves no valid size.
        let s = MarketSpec {
            max_notional: Some(5.0),
            ..spec()
        };
        assert!(normalize_amount(1.0, 500.0, &s).is_none());
    }

    #[test]
    fn zero_and_negative_inputs_rejected() {
        assert!(normalize_amount(0.0, 500.0, &spec()).is_none());
        assert!(normalize_amount(-1.0, 500.0, &spec()).is_none());
        assert!(normalize_amount(1.0, 0.0, &spec()).is_none());
        assert!(normalize_amount(f64::NAN, 500.0, &spec()).is_none());
    }

    #[test]
    fn max_amount_caps_quantity() {
        let n = normalize_amount(5000.0, 100.0, &spec()).unwrap();
        assert!(n.amount <= 1000.0);
    }

    #[test]
    fn rounding_under_notional_floor_gets_one_step_bump() {
        // price chosen so the rounded amount lands a hair under the floor and
        // a single precision step clears it.
        let s = MarketSpec {
            amount_precision: 2,
            min_amount: 0.01,
            min_notional: 10.0,
            max_amount: None,
            max_notional: None,
            price_precision: 2,
        };
        let n = normalize_amount(10.0 / 667.0, 667.0, &s).unwrap();
        assert!(n.notional >= 10.0 - 1e-9);
    }
}
