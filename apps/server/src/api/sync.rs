use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{info, warn};

use eventsync_core::config::SyncConfiguration;
use eventsync_core::health::SyncStatus;
use eventsync_core::ledger::BatchSyncResult;

use crate::error::ApiResult;
use crate::main_lib::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelResponse {
    cancel_requested: bool,
}

/// Runs a manual batch and waits for its result. A batch already in flight
/// answers with a `coalesced` result.
async fn trigger_sync(State(state): State<Arc<AppState>>) -> ApiResult<Json<BatchSyncResult>> {
    let result = state.engine.trigger_sync().await?;
    info!(
        "Manual sync {} finished as {}",
        result.batch_id.as_deref().unwrap_or("-"),
        result.status.as_str()
    );
    Ok(Json(result))
}

async fn cancel_sync(State(state): State<Arc<AppState>>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancel_requested: state.engine.cancel_batch(),
    })
}

async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<SyncStatus>> {
    Ok(Json(state.engine.status().await?))
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<SyncConfiguration> {
    Json(state.engine.config().await)
}

/// Persists and applies a new configuration. The System A and System B
/// clients are built at startup, so endpoint changes only apply after a restart.
async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<SyncConfiguration>,
) -> ApiResult<Json<SyncConfiguration>> {
    let current = state.engine.config().await;
    if current.system_a != config.system_a || current.system_b != config.system_b {
        warn!("Endpoint changes are persisted but take effect after a restart");
    }
    Ok(Json(state.engine.reconfigure(config).await?))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sync/trigger", post(trigger_sync))
        .route("/sync/cancel", post(cancel_sync))
        .route("/sync/status", get(get_status))
        .route("/config", get(get_config).put(update_config))
}
