// =============================================================================
// Volatility estimation — hybrid of a rolling-window estimator and EWMA
// =============================================================================
//
// Two estimators are blended:
//
//   traditional — sample standard deviation of 4h log returns over a 7-day
//                 window (42 bars), optionally volume-weighted, annualised
//                 by sqrt(365 * 6). Falls back to 0.20 on insufficient data.
//   ewma        — RiskMetrics variance recursion with lambda = 0.94 updated
//                 on every observed price, annualised by sqrt(252).
//
//   hybrid = w * ewma + (1 - w) * traditional, default w = 0.7; traditional
//   alone while the EWMA is warming up.
//
// The hybrid samples are smoothed over a bounded buffer before they drive
// grid sizing; until the buffer is full no resize happens.
// =============================================================================

use crate::config::{ContinuousGridParams, DynamicIntervalParams, GridParams};
use crate::types::Candle;

/// Default annualised volatility returned when the window has too little data.
const FALLBACK_VOLATILITY: f64 = 0.2;
/// 4h bars per year: 365 days of 6 bars.
const BARS_PER_YEAR: f64 = 365.0 * 6.0;
/// Trading days per year for the EWMA annualisation.
const EWMA_PERIODS_PER_YEAR: f64 = 252.0;
/// Samples kept in the smoothing buffer.
pub const SMOOTHING_WINDOW: usize = 3;
/// Floor on the dynamic check interval.
const MIN_INTERVAL_SECS: u64 = 5 * 60;
/// Grid updates smaller than this (in percentage points) are ignored.
pub const GRID_CHURN_THRESHOLD: f64 = 0.01;

// ---------------------------------------------------------------------------
// Traditional estimator
// ---------------------------------------------------------------------------

/// Annualised volatility from 4h candles. `volume_weighted` scales each log
/// return by its bar's volume relative to the window mean.
pub fn traditional_volatility(candles: &[Candle], volume_weighted: bool) -> f64 {
    if candles.len() < 2 {
        return FALLBACK_VOLATILITY;
    }

    let mut returns = Vec::with_capacity(candles.len() - 1);
    for window in candles.windows(2) {
        let (prev, curr) = (window[0].close, window[1].close);
        if prev <= 0.0 || curr <= 0.0 {
            return FALLBACK_VOLATILITY;
        }
        returns.push((curr / prev).ln());
    }

    if volume_weighted {
        // The return between bar i-1 and i is attributed to bar i's volume.
        let volumes: Vec<f64> = candles[1..].iter().map(|c| c.volume).collect();
        let mean_volume = volumes.iter().sum::<f64>() / volumes.len() as f64;
        if mean_volume > 0.0 {
            for (r, v) in returns.iter_mut().zip(&volumes) {
                *r *= v / mean_volume;
            }
        }
    }

    std_dev(&returns) * BARS_PER_YEAR.sqrt()
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

// ---------------------------------------------------------------------------
// EWMA estimator
// ---------------------------------------------------------------------------

/// EWMA variance state. Mirrors the persisted engine-state fields so the
/// recursion survives restarts.
#[derive(Debug, Clone, Copy, Default)]
pub struct EwmaState {
    pub variance: Option<f64>,
    pub last_price: Option<f64>,
    pub initialized: bool,
}

/// Feed one price observation into the EWMA recursion.
///
/// Returns the annualised volatility, or `None` while warming up (the first
/// observation only seeds `last_price`).
pub fn update_ewma(state: &mut EwmaState, price: f64, lambda: f64) -> Option<f64> {
    let Some(last) = state.last_price else {
        state.last_price = Some(price);
        return None;
    };

    let return_squared = if last > 0.0 && price > 0.0 {
        (price / last).ln().powi(2)
    } else {
        0.0
    };

    let variance = if !state.initialized {
        state.initialized = true;
        return_squared
    } else {
        lambda * state.variance.unwrap_or(return_squared) + (1.0 - lambda) * return_squared
    };

    state.variance = Some(variance);
    state.last_price = Some(price);
    Some((variance * EWMA_PERIODS_PER_YEAR).sqrt())
}

// ---------------------------------------------------------------------------
// Hybrid
// ---------------------------------------------------------------------------

/// Blend the two estimators; traditional alone while EWMA is not ready.
pub fn hybrid_volatility(traditional: f64, ewma: Option<f64>, weight: f64) -> f64 {
    match ewma {
        Some(e) => weight * e + (1.0 - weight) * traditional,
        None => traditional,
    }
}

// ---------------------------------------------------------------------------
// Smoothing
// ---------------------------------------------------------------------------

/// Push a hybrid sample into the bounded history buffer.
pub fn push_sample(history: &mut Vec<f64>, sample: f64, window: usize) {
    history.push(sample);
    while history.len() > window {
        history.remove(0);
    }
}

/// Mean of the buffer once it is full; `None` while still collecting.
pub fn smoothed(history: &[f64], window: usize) -> Option<f64> {
    if history.len() < window {
        return None;
    }
    Some(history.iter().sum::<f64>() / history.len() as f64)
}

// ---------------------------------------------------------------------------
// Grid sizing
// ---------------------------------------------------------------------------

/// Continuous resize formula, clamped to the configured grid bounds.
pub fn compute_grid_size(
    smoothed_vol: f64,
    continuous: &ContinuousGridParams,
    bounds: &GridParams,
) -> f64 {
    let raw = continuous.base_grid
        + continuous.sensitivity_k * (smoothed_vol - continuous.center_volatility);
    raw.clamp(bounds.min, bounds.max)
}

// ---------------------------------------------------------------------------
// Dynamic check interval
// ---------------------------------------------------------------------------

/// Seconds until the next grid-resize evaluation for the given volatility.
/// Unknown volatility falls back to the default interval; the result never
/// drops below the 5-minute floor.
pub fn check_interval_secs(volatility: Option<f64>, params: &DynamicIntervalParams) -> u64 {
    let hours = match volatility {
        Some(vol) => params
            .volatility_to_interval_hours
            .iter()
            .find(|rule| vol >= rule.range[0] && vol < rule.range[1])
            .map(|rule| rule.interval_hours)
            .unwrap_or(params.default_interval_hours),
        None => params.default_interval_hours,
    };
    ((hours * 3600.0) as u64).max(MIN_INTERVAL_SECS)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                open_time: i as i64 * 14_400_000,
                open: close,
                high: close * 1.01,
                low: close * 0.99,
                close,
                volume: 100.0,
            })
            .collect()
    }

    #[test]
    fn insufficient_data_returns_fallback() {
        assert_eq!(traditional_volatility(&[], false), 0.2);
        assert_eq!(
            traditional_volatility(&candles_from_closes(&[680.0]), false),
            0.2
        );
    }

    #[test]
    fn constant_prices_have_zero_volatility() {
        let candles = candles_from_closes(&[680.0; 42]);
        assert_eq!(traditional_volatility(&candles, false), 0.0);
    }

    #[test]
    fn alternating_prices_give_positive_annualised_vol() {
        let closes: Vec<f64> = (0..42)
            .map(|i| if i % 2 == 0 { 680.0 } else { 686.8 })
            .collect();
        let vol = traditional_volatility(&candles_from_closes(&closes), false);
        // 1 % swings every 4 hours annualise far above the fallback.
        assert!(vol > 0.2, "expected high vol, got {vol}");
    }

    #[test]
    fn uniform_volume_weighting_matches_unweighted() {
        let closes: Vec<f64> = (0..42).map(|i| 680.0 + i as f64).collect();
        let candles = candles_from_closes(&closes);
        let plain = traditional_volatility(&candles, false);
        let weighted = traditional_volatility(&candles, true);
        assert!((plain - weighted).abs() < 1e-12);
    }

    #[test]
    fn volume_weighting_amplifies_high_volume_moves() {
        let closes: Vec<f64> = (0..42)
            .map(|i| if i % 2 == 0 { 680.0 } else { 686.8 })
            .collect();
        let mut candles = candles_from_closes(&closes);
        // Concentrate volume on a handful of bars.
        for (i, c) in candles.iter_mut().enumerate() {
            c.volume = if i % 7 == 0 { 1000.0 } else { 10.0 };
        }
        let plain = traditional_volatility(&candles, false);
        let weighted = traditional_volatility(&candles, true);
        assert_ne!(plain, weighted);
    }

    #[test]
    fn ewma_warms_up_on_first_observation() {
        let mut state = EwmaState::default();
        assert!(update_ewma(&mut state, 680.0, 0.94).is_none());
        assert_eq!(state.last_price, Some(680.0));
        assert!(!state.initialized);

        let vol = update_ewma(&mut state, 686.8, 0.94).unwrap();
        assert!(state.initialized);
        // First ready step seeds sigma^2 = r^2.
        let r2 = (686.8f64 / 680.0).ln().powi(2);
        assert!((vol - (r2 * 252.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn ewma_recursion_applies_lambda() {
        let mut state = EwmaState::default();
        update_ewma(&mut state, 680.0, 0.94);
        update_ewma(&mut state, 686.8, 0.94);
        let sigma2 = state.variance.unwrap();

        update_ewma(&mut state, 680.0, 0.94);
        let r2 = (680.0f64 / 686.8).ln().powi(2);
        let expected = 0.94 * sigma2 + 0.06 * r2;
        assert!((state.variance.unwrap() - expected).abs() < 1e-15);
    }

    #[test]
    fn hybrid_blends_with_weight() {
        assert_eq!(hybrid_volatility(0.2, Some(0.4), 0.7), 0.7 * 0.4 + 0.3 * 0.2);
        // EWMA not ready: traditional only.
        assert_eq!(hybrid_volatility(0.2, None, 0.7), 0.2);
    }

    #[test]
    fn smoothing_requires_full_buffer() {
        let mut history = Vec::new();
        push_sample(&mut history, 0.2, SMOOTHING_WINDOW);
        assert!(smoothed(&history, SMOOTHING_WINDOW).is_none());
        push_sample(&mut history, 0.25, SMOOTHING_WINDOW);
        assert!(smoothed(&history, SMOOTHING_WINDOW).is_none());
        push_sample(&mut history, 0.3, SMOOTHING_WINDOW);
        let mean = smoothed(&history, SMOOTHING_WINDOW).unwrap();
        assert!((mean - 0.25).abs() < 1e-12);
    }

    #[test]
    fn smoothing_buffer_is_bounded() {
        let mut history = Vec::new();
        for i in 0..10 {
            push_sample(&mut history, i as f64, SMOOTHING_WINDOW);
        }
        assert_eq!(history, vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn grid_size_follows_continuous_formula() {
        let continuous = ContinuousGridParams::default();
        let bounds = GridParams::default();
        // At the center volatility the grid equals the base grid.
        assert_eq!(compute_grid_size(0.25, &continuous, &bounds), 2.5);
        // +5 pp of volatility moves the grid by k * 0.05 = 0.5.
        assert!((compute_grid_size(0.30, &continuous, &bounds) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn grid_size_clamps_to_bounds() {
        let continuous = ContinuousGridParams::default();
        let bounds = GridParams::default();
        assert_eq!(compute_grid_size(0.0, &continuous, &bounds), 1.0);
        assert_eq!(compute_grid_size(0.9, &continuous, &bounds), 4.0);
    }

    #[test]
    fn interval_lookup_matches_bands() {
        let params = DynamicIntervalParams::default();
        assert_eq!(check_interval_secs(Some(0.05), &params), 3600);
        assert_eq!(check_interval_secs(Some(0.15), &params), 1800);
        assert_eq!(check_interval_secs(Some(0.25), &params), 900);
        assert_eq!(check_interval_secs(Some(0.35), &params), 450);
        // Band edges are half-open: exactly 0.10 belongs to the second band.
        assert_eq!(check_interval_secs(Some(0.10), &params), 1800);
    }

    #[test]
    fn interval_floor_and_fallback() {
        let params = DynamicIntervalParams {
            default_interval_hours: 1.0,
            volatility_to_interval_hours: vec![crate::config::IntervalRule {
                range: [0.0, 999.0],
                interval_hours: 0.01,
            }],
        };
        // 36 s requested, floored to 5 minutes.
        assert_eq!(check_interval_secs(Some(0.2), &params), 300);
        // Unavailable volatility uses the default interval.
        assert_eq!(
            check_interval_secs(None, &DynamicIntervalParams::default()),
            3600
        );
    }
}
