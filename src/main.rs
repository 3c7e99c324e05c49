// =============================================================================
// Lattice — multi-symbol spot grid trader, main entry point
// =============================================================================
//
// Startup order matters: config first (exit non-zero on a bad one), then one
// shared exchange adapter (time sync + market catalogue, fatal on failure —
// nothing has traded yet), then one grid engine per configured symbol. The
// engines run as independent tasks over the shared adapter; ancillary tasks
// (time resync, dashboard API, global value reporter, config reload) run
// alongside. Shutdown drains the engines first and closes the adapter last.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod exchange;
mod grid_engine;
mod notify;
mod order_tracker;
mod precision;
mod rebalance;
mod risk;
mod sizing;
mod state;
mod types;
mod volatility;
mod web;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::exchange::{build_adapter, run_time_sync_task, ExchangeAdapter};
use crate::grid_engine::GridEngine;
use crate::notify::Notifier;
use crate::web::{run_web_task, WebState};

/// Cadence of the background server-time resync.
const TIME_SYNC_INTERVAL: Duration = Duration::from_secs(3600);
/// Cadence of the global account-value report.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);
/// Retry budget for the initial market-catalogue load.
const MARKET_LOAD_ATTEMPTS: u32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ── 1. Configuration ─────────────────────────────────────────────────
    let config = Arc::new(Config::from_env().context("configuration error")?);
    info!(
        exchange = %config.exchange,
        testnet = config.testnet_mode,
        symbols = ?config.symbols.iter().map(|p| p.symbol.as_str()).collect::<Vec<_>>(),
        savings = config.enable_savings,
        "lattice starting"
    );

    // ── 2. Shared exchange adapter ───────────────────────────────────────
    let adapter = build_adapter(&config).context("failed to build exchange adapter")?;
    if !adapter.supports(exchange::Feature::SpotTrading) {
        anyhow::bail!("adapter '{}' does not support spot trading", adapter.name());
    }
    adapter
        .sync_time()
        .await
        .context("initial time sync failed, venue unreachable")?;
    load_markets_with_retry(&adapter).await?;

    let notifier = Notifier::new(config.notify_webhook_url.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (config_tx, config_rx) = watch::channel(config.clone());

    // ── 3. Grid engines, one per symbol ──────────────────────────────────
    let mut engine_handles = Vec::new();
    let mut view_handles = Vec::new();
    let mut external_handles = Vec::new();

    for pair in &config.symbols {
        let (mut engine, external) = GridEngine::new(
            pair.clone(),
            config.clone(),
            config_rx.clone(),
            adapter.clone(),
            notifier.clone(),
        );
        engine
            .initialize()
            .await
            .with_context(|| format!("engine initialization failed for {pair}"))?;

        view_handles.push(engine.view_handle());
        external_handles.push((pair.clone(), external));
        engine_handles.push(tokio::spawn(engine.run(shutdown_rx.clone())));
    }
    info!(count = engine_handles.len(), "grid engines running");

    // ── 4. Ancillary tasks ───────────────────────────────────────────────
    tokio::spawn(run_time_sync_task(
        adapter.clone(),
        TIME_SYNC_INTERVAL,
        shutdown_rx.clone(),
    ));

    let web_state = Arc::new(WebState {
        engines: view_handles,
        start_time: Instant::now(),
    });
    tokio::spawn(run_web_task(
        web_state,
        config.web_bind_addr.clone(),
        shutdown_rx.clone(),
    ));

    tokio::spawn(run_value_reporter(
        adapter.clone(),
        config.symbols[0].quote.clone(),
        shutdown_rx.clone(),
    ));

    #[cfg(unix)]
    tokio::spawn(run_config_reload_task(config_tx, shutdown_rx.clone()));
    #[cfg(not(unix))]
    drop(config_tx);

    // ── 5. Run until signalled ───────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("shutdown signal received, stopping engines");

    let _ = shutdown_tx.send(true);
    for handle in engine_handles {
        if let Err(e) = handle.await {
            error!(error = %e, "engine task join failed");
        }
    }
    drop(external_handles);

    // The adapter goes last so late persistence and notifications can still
    // reach the venue.
    adapter.close().await;
    info!("lattice shut down cleanly");
    Ok(())
}

/// Load the market catalogue with bounded retry; failure here is fatal.
async fn load_markets_with_retry(adapter: &Arc<dyn ExchangeAdapter>) -> anyhow::Result<()> {
    let mut last_err = None;
    for attempt in 1..=MARKET_LOAD_ATTEMPTS {
        match adapter.load_markets().await {
            Ok(()) => {
                info!(attempt, "market catalogue loaded");
                return Ok(());
            }
            Err(e) => {
                warn!(attempt, max = MARKET_LOAD_ATTEMPTS, error = %e, "market load failed");
                last_err = Some(e);
                if attempt < MARKET_LOAD_ATTEMPTS {
                    tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
                }
            }
        }
    }
    Err(anyhow::anyhow!(
        "could not load markets after {MARKET_LOAD_ATTEMPTS} attempts: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/// Periodically compute the whole-account value in `quote_asset`, logging
/// only when it moved more than 1 % since the last logged figure.
async fn run_value_reporter(
    adapter: Arc<dyn ExchangeAdapter>,
    quote_asset: String,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = REPORT_INTERVAL.as_secs(), "global value reporter started");
    let mut last_logged: f64 = 0.0;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(REPORT_INTERVAL) => {}
            _ = shutdown.changed() => break,
        }

        match adapter.total_account_value(&quote_asset).await {
            Ok(value) => {
                let moved = (value - last_logged).abs() / last_logged.max(1e-9);
                if moved > 0.01 {
                    info!(
                        total_value = format!("{value:.2}"),
                        quote = %quote_asset,
                        change = format!("{:+.2}", value - last_logged),
                        "global account value"
                    );
                    last_logged = value;
                }
            }
            Err(e) => warn!(error = %e, "global value calculation failed"),
        }
    }
}

/// Re-read the environment on SIGHUP and broadcast the refreshed config.
/// Engines apply strategy parameters on their next tick; credentials and
/// reference prices are never touched by a reload.
#[cfg(unix)]
async fn run_config_reload_task(
    config_tx: watch::Sender<Arc<Config>>,
    mut shutdown: watch::Receiver<bool>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGHUP, hot reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                let _ = dotenv::dotenv();
                match Config::from_env() {
                    Ok(new_config) => {
                        info!("configuration reloaded from environment");
                        let _ = config_tx.send(Arc::new(new_config));
                    }
                    Err(e) => warn!(error = %e, "config reload rejected, keeping previous settings"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
