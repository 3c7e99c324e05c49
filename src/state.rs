// =============================================================================
// Engine state persistence — per-symbol JSON snapshot with atomic writes
// =============================================================================
//
// One `trader_state_<BASE>_<QUOTE>.json` per symbol. The write path is
// tmp + rename so a crash mid-write leaves either the previous valid file or
// the new one, never a torn file. The live file is never opened for write.
//
// All fields carry `#[serde(default)]` so files written by older builds keep
// loading after new fields are added.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::types::SymbolPair;

/// Core per-symbol strategy state, persisted on every change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineState {
    /// Reference price; strictly positive once the engine is initialized.
    #[serde(default)]
    pub base_price: f64,
    /// Grid size in percent (2.0 = 2 %).
    #[serde(default)]
    pub grid_size: f64,
    /// Running local extrema, reset on every filled trade.
    #[serde(default)]
    pub highest: Option<f64>,
    #[serde(default)]
    pub lowest: Option<f64>,
    /// Unix seconds of the last grid-resize evaluation.
    #[serde(default)]
    pub last_grid_adjust_time: f64,
    #[serde(default)]
    pub last_trade_time: Option<f64>,
    #[serde(default)]
    pub last_trade_price: Option<f64>,
    /// EWMA variance estimate (not annualised).
    #[serde(default)]
    pub ewma_volatility: Option<f64>,
    /// Previous observation for the EWMA return calculation.
    #[serde(default)]
    pub last_price: Option<f64>,
    #[serde(default)]
    pub ewma_initialized: bool,
    /// Latched band-watch flags.
    #[serde(default)]
    pub is_monitoring_buy: bool,
    #[serde(default)]
    pub is_monitoring_sell: bool,
    /// Bounded buffer of the last smoothed-volatility samples.
    #[serde(default)]
    pub volatility_history: Vec<f64>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            base_price: 0.0,
            grid_size: 0.0,
            highest: None,
            lowest: None,
            last_grid_adjust_time: 0.0,
            last_trade_time: None,
            last_trade_price: None,
            ewma_volatility: None,
            last_price: None,
            ewma_initialized: false,
            is_monitoring_buy: false,
            is_monitoring_sell: false,
            volatility_history: Vec::new(),
        }
    }
}

impl EngineState {
    /// Path of the state file for `pair` under `data_dir`.
    pub fn path_for(data_dir: &Path, pair: &SymbolPair) -> PathBuf {
        data_dir.join(format!("trader_state_{}.json", pair.file_tag()))
    }

    /// Load a previously persisted state. Returns `None` when the file is
    /// missing or unreadable; a corrupt file is logged and ignored so the
    /// engine starts from defaults instead of crashing.
    pub fn load(path: &Path) -> Option<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no state file found, starting from defaults");
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Self>(&content) {
                Ok(state) => {
                    info!(
                        path = %path.display(),
                        base_price = state.base_price,
                        grid_size = state.grid_size,
                        ewma_initialized = state.ewma_initialized,
                        "engine state loaded"
                    );
                    Some(state)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "state file corrupt, ignoring");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read state file");
                None
            }
        }
    }

    /// Persist atomically: write `<path>.tmp`, fsync, rename over `<path>`.
    /// The tmp file is removed on any failure.
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }
}

/// Shared atomic JSON write used by the engine state and the trade ledger.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let content = serde_json::to_string_pretty(value).context("failed to serialise state")?;
    let tmp_path = path.with_extension("json.tmp");

    let result = (|| -> Result<()> {
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            file.write_all(content.as_bytes())
                .with_context(|| format!("failed to write {}", tmp_path.display()))?;
            // Best effort: push the bytes to disk before the rename makes the
            // file the live copy.
            let _ = file.sync_all();
        }
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp file to {}", path.display()))?;
        Ok(())
    })();

    if result.is_err() && tmp_path.exists() {
        if let Err(e) = std::fs::remove_file(&tmp_path) {
            error!(path = %tmp_path.display(), error = %e, "failed to remove tmp state file");
        }
    }
    result
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
    fn state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = EngineState::path_for(dir.path(), &pair());

        let state = EngineState {
            base_price: 680.0,
            grid_size: 2.0,
            highest: Some(694.0),
            lowest: None,
            last_grid_adjust_time: 1_700_000_000.0,
            last_trade_time: Some(1_700_000_100.0),
            last_trade_price: Some(665.7),
            ewma_volatility: Some(0.0004),
            last_price: Some(682.0),
            ewma_initialized: true,
            is_monitoring_buy: false,
            is_monitoring_sell: true,
            volatility_history: vec![0.21, 0.24, 0.26],
        };
        state.save(&path).unwrap();

        let loaded = EngineState::load(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn state_file_name_embeds_symbol() {
        let path = EngineState::path_for(Path::new("data"), &pair());
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "trader_state_BNB_USDT.json"
        );
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EngineState::load(&dir.path().join("nope.json")).is_none());
    }

    #[test]
    fn corrupt_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trader_state_BNB_USDT.json");
        std::fs::write(&path, "{\"base_price\": 680.0, TRUNC").unwrap();
        assert!(EngineState::load(&path).is_none());
    }

    #[test]
    fn save_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = EngineState::path_for(dir.path(), &pair());
        EngineState::default().save(&path).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn save_overwrites_previous_state_completely() {
        let dir = tempfile::tempdir().unwrap();
        let path = EngineState::path_for(dir.path(), &pair());

        let mut state = EngineState {
            base_price: 680.0,
            grid_size: 2.0,
            ..Default::default()
        };
        state.save(&path).unwrap();

        state.base_price = 665.7;
        state.highest = None;
        state.save(&path).unwrap();

        let loaded = EngineState::load(&path).unwrap();
        assert_eq!(loaded.base_price, 665.7);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, r#"{"base_price": 500.0, "grid_size": 1.5}"#).unwrap();

        let loaded = EngineState::load(&path).unwrap();
        assert_eq!(loaded.base_price, 500.0);
        assert_eq!(loaded.grid_size, 1.5);
        assert!(loaded.highest.is_none());
        assert!(!loaded.is_monitoring_buy);
        assert!(loaded.volatility_history.is_empty());
    }
}
