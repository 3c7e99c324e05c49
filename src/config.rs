// =============================================================================
// Configuration — environment-driven, validated once, passed by value
// =============================================================================
//
// The bootstrapper is the only component that reads the environment. Every
// constructor receives an immutable `Arc<Config>`; no module reaches for env
// vars on its own. JSON-blob options are parsed with serde and fall back to
// documented defaults when unset.
//
// Hot reload replaces the whole `Arc<Config>` (engines pick it up on their
// next tick) but never touches credentials or a running engine's base price.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::precision::SavingsPrecisions;
use crate::types::SymbolPair;

// =============================================================================
// Parameter blocks
// =============================================================================

/// Per-symbol starting values from INITIAL_PARAMS_JSON.
#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct InitialParams {
    #[serde(default)]
    pub initial_base_price: f64,
    #[serde(default)]
    pub initial_grid: Option<f64>,
}

/// Per-symbol position-ratio bounds from POSITION_LIMITS_JSON. When present
/// these fully override the global limits.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PositionLimits {
    pub min: f64,
    pub max: f64,
}

/// Hard bounds on the grid size, in percent.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GridParams {
    #[serde(default = "default_grid_min")]
    pub min: f64,
    #[serde(default = "default_grid_max")]
    pub max: f64,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            min: default_grid_min(),
            max: default_grid_max(),
        }
    }
}

/// Continuous grid-resize formula:
/// new_grid = base_grid + sensitivity_k * (smoothed_vol - center_volatility).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ContinuousGridParams {
    #[serde(default = "default_base_grid")]
    pub base_grid: f64,
    #[serde(default = "default_center_volatility")]
    pub center_volatility: f64,
    #[serde(default = "default_sensitivity_k")]
    pub sensitivity_k: f64,
}

impl Default for ContinuousGridParams {
    fn default() -> Self {
        Self {
            base_grid: default_base_grid(),
            center_volatility: default_center_volatility(),
            sensitivity_k: default_sensitivity_k(),
        }
    }
}

/// One volatility band of the dynamic check-interval lookup.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct IntervalRule {
    /// Half-open volatility range [min, max).
    pub range: [f64; 2],
    pub interval_hours: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynamicIntervalParams {
    #[serde(default = "default_interval_hours")]
    pub default_interval_hours: f64,
    #[serde(default = "default_interval_rules")]
    pub volatility_to_interval_hours: Vec<IntervalRule>,
}

impl Default for DynamicIntervalParams {
    fn default() -> Self {
        Self {
            default_interval_hours: default_interval_hours(),
            volatility_to_interval_hours: default_interval_rules(),
        }
    }
}

// --- serde default helpers ---------------------------------------------------

fn default_grid_min() -> f64 {
    1.0
}
fn default_grid_max() -> f64 {
    4.0
}
fn default_base_grid() -> f64 {
    2.5
}
fn default_center_volatility() -> f64 {
    0.25
}
fn default_sensitivity_k() -> f64 {
    10.0
}
fn default_interval_hours() -> f64 {
    1.0
}
fn default_interval_rules() -> Vec<IntervalRule> {
    vec![
        IntervalRule {
            range: [0.0, 0.10],
            interval_hours: 1.0,
        },
        IntervalRule {
            range: [0.10, 0.20],
            interval_hours: 0.5,
        },
        IntervalRule {
            range: [0.20, 0.30],
            interval_hours: 0.25,
        },
        IntervalRule {
            range: [0.30, 999.0],
            interval_hours: 0.125,
        },
    ]
}

// =============================================================================
// Config
// =============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    // --- Venue ---------------------------------------------------------------
    pub exchange: String,
    pub testnet_mode: bool,
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub binance_testnet_api_key: String,
    pub binance_testnet_api_secret: String,
    pub okx_api_key: String,
    pub okx_api_secret: String,
    pub okx_passphrase: String,
    pub http_proxy: Option<String>,

    // --- Symbols & strategy --------------------------------------------------
    pub symbols: Vec<SymbolPair>,
    pub initial_params: HashMap<String, InitialParams>,
    /// Global default grid size in percent.
    pub initial_grid: f64,
    /// Venue-minimum guard on order notional, in quote units.
    pub min_trade_amount: f64,
    pub grid: GridParams,
    pub grid_continuous: ContinuousGridParams,
    pub dynamic_interval: DynamicIntervalParams,

    // --- Risk ----------------------------------------------------------------
    pub max_position_ratio: f64,
    pub min_position_ratio: f64,
    pub position_limits: HashMap<String, PositionLimits>,

    // --- Volatility ----------------------------------------------------------
    /// Number of 4h bars fed into the traditional estimator (7 days = 42).
    pub volatility_window: u32,
    pub ewma_lambda: f64,
    pub hybrid_weight: f64,
    pub volume_weighting: bool,

    // --- Savings / working capital ------------------------------------------
    pub enable_savings: bool,
    pub savings_precisions: SavingsPrecisions,
    /// Fraction of the pair's total value kept spendable on spot, per leg.
    pub spot_funds_target_ratio: f64,

    // --- Trade-path guards ---------------------------------------------------
    /// Discount applied to free spot balances before sufficiency checks.
    pub safety_margin: f64,
    /// Minimum seconds between two main-path fills on one symbol.
    pub min_trade_interval_secs: u64,

    // --- Process -------------------------------------------------------------
    pub data_dir: PathBuf,
    pub web_bind_addr: String,
    pub notify_webhook_url: Option<String>,
    pub debug_mode: bool,
}

impl Config {
    /// Load and validate from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_provider(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key/value provider (tests feed maps).
    pub fn from_provider(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let exchange = get("EXCHANGE")
            .unwrap_or_else(|| "binance".to_string())
            .to_lowercase();
        let testnet_mode = parse_bool(get("TESTNET_MODE"), false);

        let symbols = parse_symbols(&get("SYMBOLS").unwrap_or_else(|| "BNB/USDT".to_string()))?;

        let initial_grid = parse_f64(get("INITIAL_GRID"), 2.0)?;
        if !(0.1..=10.0).contains(&initial_grid) {
            bail!("INITIAL_GRID must be within 0.1..10 percent, got {initial_grid}");
        }

        let min_trade_amount = parse_f64(get("MIN_TRADE_AMOUNT"), 20.0)?;
        if min_trade_amount < 10.0 {
            bail!("MIN_TRADE_AMOUNT must be >= 10 (venue minimum), got {min_trade_amount}");
        }

        let max_position_ratio = parse_f64(get("MAX_POSITION_RATIO"), 0.9)?;
        let min_position_ratio = parse_f64(get("MIN_POSITION_RATIO"), 0.1)?;
        if min_position_ratio >= max_position_ratio {
            bail!(
                "MIN_POSITION_RATIO ({min_position_ratio}) must be below MAX_POSITION_RATIO ({max_position_ratio})"
            );
        }

        let grid: GridParams = parse_json_blob(get("GRID_PARAMS_JSON"), "GRID_PARAMS_JSON")?;
        if grid.min > grid.max {
            bail!("grid min ({}) must not exceed grid max ({})", grid.min, grid.max);
        }
        let grid_continuous: ContinuousGridParams =
            parse_json_blob(get("GRID_CONTINUOUS_PARAMS_JSON"), "GRID_CONTINUOUS_PARAMS_JSON")?;
        let dynamic_interval: DynamicIntervalParams = parse_json_blob(
            get("DYNAMIC_INTERVAL_PARAMS_JSON"),
            "DYNAMIC_INTERVAL_PARAMS_JSON",
        )?;

        let initial_params: HashMap<String, InitialParams> =
            parse_json_blob(get("INITIAL_PARAMS_JSON"), "INITIAL_PARAMS_JSON")?;
        let position_limits: HashMap<String, PositionLimits> =
            parse_json_blob(get("POSITION_LIMITS_JSON"), "POSITION_LIMITS_JSON")?;
        for (symbol, limits) in &position_limits {
            if limits.min >= limits.max {
                bail!("POSITION_LIMITS_JSON for {symbol}: min must be below max");
            }
        }

        let savings_precisions = parse_savings_precisions(get("SAVINGS_PRECISIONS"))?;

        let ewma_lambda = parse_f64(get("VOLATILITY_EWMA_LAMBDA"), 0.94)?;
        if !(0.0..1.0).contains(&ewma_lambda) {
            bail!("VOLATILITY_EWMA_LAMBDA must be in (0, 1), got {ewma_lambda}");
        }
        let hybrid_weight = parse_f64(get("VOLATILITY_HYBRID_WEIGHT"), 0.7)?;
        if !(0.0..=1.0).contains(&hybrid_weight) {
            bail!("VOLATILITY_HYBRID_WEIGHT must be in [0, 1], got {hybrid_weight}");
        }

        let spot_funds_target_ratio = parse_f64(get("SPOT_FUNDS_TARGET_RATIO"), 0.16)?;
        if !(0.0..0.5).contains(&spot_funds_target_ratio) {
            bail!("SPOT_FUNDS_TARGET_RATIO must be in [0, 0.5), got {spot_funds_target_ratio}");
        }

        let config = Self {
            exchange,
            testnet_mode,
            binance_api_key: get("BINANCE_API_KEY").unwrap_or_default(),
            binance_api_secret: get("BINANCE_API_SECRET").unwrap_or_default(),
            binance_testnet_api_key: get("BINANCE_TESTNET_API_KEY").unwrap_or_default(),
            binance_testnet_api_secret: get("BINANCE_TESTNET_API_SECRET").unwrap_or_default(),
            okx_api_key: get("OKX_API_KEY").unwrap_or_default(),
            okx_api_secret: get("OKX_API_SECRET").unwrap_or_default(),
            okx_passphrase: get("OKX_PASSPHRASE").unwrap_or_default(),
            http_proxy: get("HTTP_PROXY").filter(|s| !s.is_empty()),
            symbols,
            initial_params,
            initial_grid,
            min_trade_amount,
            grid,
            grid_continuous,
            dynamic_interval,
            max_position_ratio,
            min_position_ratio,
            position_limits,
            volatility_window: parse_f64(get("VOLATILITY_WINDOW"), 42.0)? as u32,
            ewma_lambda,
            hybrid_weight,
            volume_weighting: parse_bool(get("ENABLE_VOLUME_WEIGHTING"), false),
            enable_savings: parse_bool(get("ENABLE_SAVINGS_FUNCTION"), true),
            savings_precisions,
            spot_funds_target_ratio,
            safety_margin: parse_f64(get("SAFETY_MARGIN"), 0.95)?,
            min_trade_interval_secs: parse_f64(get("MIN_TRADE_INTERVAL"), 30.0)? as u64,
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "data".to_string())),
            web_bind_addr: get("WEB_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3001".to_string()),
            notify_webhook_url: get("NOTIFY_WEBHOOK_URL").filter(|s| !s.is_empty()),
            debug_mode: parse_bool(get("DEBUG_MODE"), false),
        };

        Ok(config)
    }

    // -------------------------------------------------------------------------
    // Per-symbol lookups
    // -------------------------------------------------------------------------

    /// Starting grid size for `symbol`: the per-symbol override when present,
    /// else the global INITIAL_GRID.
    pub fn initial_grid_for(&self, symbol: &str) -> f64 {
        self.initial_params
            .get(symbol)
            .and_then(|p| p.initial_grid)
            .unwrap_or(self.initial_grid)
    }

    /// Configured starting base price for `symbol`; 0 means "use the live
    /// ticker at initialization".
    pub fn initial_base_price_for(&self, symbol: &str) -> f64 {
        self.initial_params
            .get(symbol)
            .map(|p| p.initial_base_price)
            .unwrap_or(0.0)
    }

    /// (min, max) position-ratio bounds for `symbol`. Per-symbol limits fully
    /// override the globals.
    pub fn position_limits_for(&self, symbol: &str) -> (f64, f64) {
        match self.position_limits.get(symbol) {
            Some(limits) => (limits.min, limits.max),
            None => (self.min_position_ratio, self.max_position_ratio),
        }
    }
}

// =============================================================================
// Parse helpers
// =============================================================================

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.as_deref() {
        Some(s) => matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn parse_f64(value: Option<String>, default: f64) -> Result<f64> {
    match value {
        Some(s) if !s.trim().is_empty() => s
            .trim()
            .parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as a number")),
        _ => Ok(default),
    }
}

fn parse_json_blob<T: serde::de::DeserializeOwned + Default>(
    value: Option<String>,
    key: &str,
) -> Result<T> {
    match value {
        Some(s) if !s.trim().is_empty() => {
            serde_json::from_str(&s).with_context(|| format!("{key} is not valid JSON"))
        }
        _ => Ok(T::default()),
    }
}

/// Parse the SYMBOLS list and require a single shared quote asset.
fn parse_symbols(raw: &str) -> Result<Vec<SymbolPair>> {
    let mut pairs = Vec::new();
    for part in raw.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let pair = SymbolPair::parse(&trimmed.to_uppercase())
            .with_context(|| format!("invalid symbol '{trimmed}', expected BASE/QUOTE"))?;
        pairs.push(pair);
    }
    if pairs.is_empty() {
        bail!("SYMBOLS must name at least one BASE/QUOTE pair");
    }

    let quote = &pairs[0].quote;
    if pairs.iter().any(|p| &p.quote != quote) {
        bail!("all SYMBOLS must share the same quote asset");
    }
    Ok(pairs)
}

fn parse_savings_precisions(value: Option<String>) -> Result<SavingsPrecisions> {
    let Some(raw) = value.filter(|s| !s.trim().is_empty()) else {
        return Ok(SavingsPrecisions::default());
    };
    let mut map: HashMap<String, u32> =
        serde_json::from_str(&raw).context("SAVINGS_PRECISIONS is not a valid JSON object")?;
    let default = map.remove("DEFAULT").unwrap_or_else(|| {
        warn!("SAVINGS_PRECISIONS missing DEFAULT entry, using 8");
        8
    });
    Ok(SavingsPrecisions::new(map, default))
}
