// =============================================================================
// Precision helpers — quantity/price rounding and transfer-amount formatting
// =============================================================================
//
// Venues reject orders whose quantity or price carries more decimals than the
// market allows, and savings subscribe/redeem endpoints reject amounts that
// are not formatted to the product's precision. Quantities are always rounded
// DOWN so we never promise more than we hold; prices round half-up.
// =============================================================================

use std::collections::HashMap;

/// Round `value` down to `decimals` decimal places.
///
/// Used for order quantities: truncation guarantees the resulting amount never
/// exceeds the available balance after rounding.
pub fn round_down(value: f64, decimals: u32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let factor = 10f64.powi(decimals as i32);
    (value * factor).floor() / factor
}

/// Round `value` to `decimals` decimal places (half-up).
///
/// Used for limit prices taken off the top of the book.
pub fn round_price(value: f64, decimals: u32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Per-asset decimal precision for savings transfer amounts.
///
/// The venue's subscribe/redeem endpoints take the amount as a decimal string;
/// the default covers assets without an explicit entry.
#[derive(Debug, Clone)]
pub struct SavingsPrecisions {
    per_asset: HashMap<String, u32>,
    default: u32,
}

impl SavingsPrecisions {
    pub fn new(per_asset: HashMap<String, u32>, default: u32) -> Self {
        Self { per_asset, default }
    }

    pub fn decimals_for(&self, asset: &str) -> u32 {
        self.per_asset.get(asset).copied().unwrap_or(self.default)
    }

    /// Format a transfer amount to the asset's precision.
    ///
    /// Idempotent: formatting an already-formatted amount yields the same
    /// string, so retried transfers carry identical payloads.
    pub fn format_amount(&self, asset: &str, amount: f64) -> String {
        let decimals = self.decimals_for(asset) as usize;
        format!("{amount:.decimals$}")
    }
}

impl Default for SavingsPrecisions {
    fn default() -> Self {
        let mut per_asset = HashMap::new();
        per_asset.insert("USDT".to_string(), 2);
        per_asset.insert("BNB".to_string(), 6);
        Self {
            per_asset,
            default: 8,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_down_truncates() {
        assert_eq!(round_down(0.123456789, 6), 0.123456);
        assert_eq!(round_down(1.999999, 2), 1.99);
        assert_eq!(round_down(5.0, 3), 5.0);
    }

    #[test]
    fn round_down_never_exceeds_input() {
        for &(v, d) in &[(0.1234567, 4u32), (123.456, 1), (0.00001, 8), (99.999, 0)] {
            assert!(round_down(v, d) <= v, "round_down({v}, {d}) exceeded input");
        }
    }

    #[test]
    fn round_price_half_up() {
        assert_eq!(round_price(665.655, 2), 665.66);
        assert_eq!(round_price(665.654, 2), 665.65);
        assert_eq!(round_price(680.0, 2), 680.0);
    }

    #[test]
    fn non_finite_inputs_collapse_to_zero() {
        assert_eq!(round_down(f64::NAN, 2), 0.0);
        assert_eq!(round_down(f64::INFINITY, 2), 0.0);
        assert_eq!(round_price(f64::NAN, 2), 0.0);
    }

    #[test]
    fn savings_precisions_defaults() {
        let p = SavingsPrecisions::default();
        assert_eq!(p.decimals_for("USDT"), 2);
        assert_eq!(p.decimals_for("BNB"), 6);
        assert_eq!(p.decimals_for("ETH"), 8);
    }

    #[test]
    fn format_amount_is_idempotent() {
        let p = SavingsPrecisions::default();
        for &(asset, amount) in &[
            ("USDT", 819.8765432),
            ("BNB", 0.123456789),
            ("ETH", 1.5),
            ("USDT", 0.004),
        ] {
            let once = p.format_amount(asset, amount);
            let twice = p.format_amount(asset, once.parse::<f64>().unwrap());
            assert_eq!(once, twice, "format_amount not idempotent for {asset}");
        }
    }

    #[test]
    fn format_amount_quote_uses_two_decimals() {
        let p = SavingsPrecisions::default();
        assert_eq!(p.format_amount("USDT", 819.876), "819.88");
        assert_eq!(p.format_amount("BNB", 0.1234567), "0.123457");
    }
}
