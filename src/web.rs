// =============================================================================
// Read-only dashboard API — Axum 0.7
// =============================================================================
//
// Exposes per-engine snapshots for observability. Strictly read-only: the
// handlers clone published views and never reach into an engine. CORS is
// permissive for development use.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use parking_lot::RwLock;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::grid_engine::EngineView;

pub struct WebState {
    pub engines: Vec<Arc<RwLock<EngineView>>>,
    pub start_time: Instant,
}

/// Build the dashboard router.
pub fn router(state: Arc<WebState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/engines", get(engines))
        .route("/api/v1/engines/:symbol", get(engine_by_symbol))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until shutdown is signalled.
pub async fn run_web_task(
    state: Arc<WebState>,
    bind_addr: String,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let app = router(state);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "failed to bind dashboard API");
            return;
        }
    };
    info!(addr = %bind_addr, "dashboard API listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    });
    if let Err(e) = serve.await {
        error!(error = %e, "dashboard API failed");
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    engine_count: usize,
}

async fn health(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        engine_count: state.engines.len(),
    })
}

async fn engines(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    let views: Vec<EngineView> = state.engines.iter().map(|v| v.read().clone()).collect();
    Json(views)
}

/// Symbols appear in URLs with `-` or `_` in place of the slash
/// (e.g. `/api/v1/engines/BNB-USDT`).
async fn engine_by_symbol(
    State(state): State<Arc<WebState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let wanted = symbol.replace(['-', '_'], "/").to_uppercase();
    for view in &state.engines {
        let snapshot = view.read().clone();
        if snapshot.symbol == wanted {
            return Json(snapshot).into_response();
        }
    }
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("no engine for {wanted}") })),
    )
        .into_response()
}
