// =============================================================================
// Shared types used across the Lattice grid-trading engine
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

/// A trading pair in `BASE/QUOTE` notation, parsed once at engine construction
/// and stable for the engine's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolPair {
    /// Canonical "BASE/QUOTE" form, e.g. "BNB/USDT".
    pub symbol: String,
    pub base: String,
    pub quote: String,
}

impl SymbolPair {
    /// Parse a `"BASE/QUOTE"` string. Both legs must be non-empty.
    pub fn parse(symbol: &str) -> Option<Self> {
        let (base, quote) = symbol.split_once('/')?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Self {
            symbol: symbol.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
        })
    }

    /// File-name-safe form, e.g. "BNB_USDT".
    pub fn file_tag(&self) -> String {
        format!("{}_{}", self.base, self.quote)
    }
}

impl std::fmt::Display for SymbolPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

// ---------------------------------------------------------------------------
// Order side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Fresh 24h ticker snapshot. Fetched before every signal evaluation and never
/// cached longer than one loop tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub last_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub quote_volume_24h: f64,
}

/// Top of the order book, used to price limit orders at the near touch.
#[derive(Debug, Clone, Copy)]
pub struct OrderBookTop {
    pub best_bid: f64,
    pub best_ask: f64,
}

/// One OHLCV bar (oldest-first in slices).
#[derive(Debug, Clone, Copy)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Per-symbol trading rules from the venue's market catalogue. Resolved at
/// startup and treated as immutable for the session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketSpec {
    /// Decimal places for order quantity.
    pub amount_precision: u32,
    /// Decimal places for order price.
    pub price_precision: u32,
    pub min_amount: f64,
    pub min_notional: f64,
    pub max_amount: Option<f64>,
    pub max_notional: Option<f64>,
}

impl Default for MarketSpec {
    /// Fallbacks used when the venue catalogue is missing precision or limit
    /// information for a symbol.
    fn default() -> Self {
        Self {
            amount_precision: 6,
            price_precision: 2,
            min_amount: 1e-4,
            min_notional: 10.0,
            max_amount: None,
            max_notional: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

/// Spot wallet snapshot: free / used / total per asset.
///
/// Entries whose asset starts with "LD" are the venue's flexible-savings
/// receipts mirrored into the spot wallet; they must be excluded from spot
/// sums to avoid double-counting against the funding balance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpotBalance {
    pub free: HashMap<String, f64>,
    pub used: HashMap<String, f64>,
    pub total: HashMap<String, f64>,
}

impl SpotBalance {
    pub fn free_of(&self, asset: &str) -> f64 {
        self.free.get(asset).copied().unwrap_or(0.0)
    }

    pub fn used_of(&self, asset: &str) -> f64 {
        self.used.get(asset).copied().unwrap_or(0.0)
    }
}

/// Flexible-savings ("funding") balance: flat asset -> amount map.
pub type FundingBalance = HashMap<String, f64>;

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Rejected,
    Unknown,
}

/// Normalised order record returned by the adapter for create/fetch calls.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub id: String,
    pub status: OrderStatus,
    pub price: f64,
    pub amount: f64,
    pub filled: f64,
    /// Volume-weighted average fill price when the venue reports it, else the
    /// limit price.
    pub average: f64,
}

/// One exchange-side fill (a partial execution of an order), used for startup
/// reconciliation against the local ledger.
#[derive(Debug, Clone)]
pub struct FillRecord {
    pub order_id: String,
    /// Unix milliseconds.
    pub timestamp_ms: i64,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub cost: f64,
}

// ---------------------------------------------------------------------------
// Trades (local ledger)
// ---------------------------------------------------------------------------

/// A completed trade as persisted by the order tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Unix seconds (fractional).
    pub timestamp: f64,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub order_id: String,
    #[serde(default)]
    pub profit: f64,
    #[serde(default)]
    pub strategy_tag: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_pair_parses_base_and_quote() {
        let pair = SymbolPair::parse("BNB/USDT").unwrap();
        assert_eq!(pair.base, "BNB");
        assert_eq!(pair.quote, "USDT");
        assert_eq!(pair.symbol, "BNB/USDT");
        assert_eq!(pair.file_tag(), "BNB_USDT");
    }

    #[test]
    fn symbol_pair_rejects_malformed_input() {
        assert!(SymbolPair::parse("BNBUSDT").is_none());
        assert!(SymbolPair::parse("/USDT").is_none());
        assert!(SymbolPair::parse("BNB/").is_none());
        assert!(SymbolPair::parse("").is_none());
    }

    #[test]
    fn spot_balance_defaults_to_zero_for_unknown_assets() {
        let bal = SpotBalance::default();
        assert_eq!(bal.free_of("BNB"), 0.0);
        assert_eq!(bal.used_of("BNB"), 0.0);
    }

    #[test]
    fn market_spec_fallbacks() {
        let spec = MarketSpec::default();
        assert_eq!(spec.amount_precision, 6);
        assert_eq!(spec.price_precision, 2);
        assert!((spec.min_notional - 10.0).abs() < f64::EPSILON);
        assert!((spec.min_amount - 1e-4).abs() < f64::EPSILON);
    }

    #[test]
    fn side_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"buy\"");
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"sell\"");
        let s: Side = serde_json::from_str("\"sell\"").unwrap();
        assert_eq!(s, Side::Sell);
    }
}
