use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use eventsync_core::conflicts::{DataConflict, ResolutionPolicy, ResolvedPatch};
use eventsync_core::ledger::{OperationStatus, SyncOperation};

use crate::error::{ApiError, ApiResult};
use crate::main_lib::AppState;

const DEFAULT_OPERATION_LIMIT: usize = 100;
const MAX_OPERATION_LIMIT: usize = 1_000;

async fn list_conflicts(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<DataConflict>>> {
    let conflicts = state
        .ledger
        .list_conflicts(None)?
        .into_iter()
        .filter(|conflict| !conflict.is_resolved())
        .collect();
    Ok(Json(conflicts))
}

/// Body is `{ "policy": "source_wins" | "target_wins" | "custom", "value"?: any }`.
async fn resolve_conflict(
    State(state): State<Arc<AppState>>,
    Path(conflict_id): Path<String>,
    Json(policy): Json<ResolutionPolicy>,
) -> ApiResult<Json<ResolvedPatch>> {
    Ok(Json(state.engine.resolve_conflict(&conflict_id, policy).await?))
}

#[derive(Debug, Deserialize)]
struct OperationsQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_operations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OperationsQuery>,
) -> ApiResult<Json<Vec<SyncOperation>>> {
    let status = query
        .status
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .map(str::parse::<OperationStatus>)
        .transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_OPERATION_LIMIT);
    if limit == 0 || limit > MAX_OPERATION_LIMIT {
        return Err(ApiError::bad_request(format!(
            "limit must be in [1, {}]",
            MAX_OPERATION_LIMIT
        )));
    }
    Ok(Json(state.ledger.list_operations(status, limit)?))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/{id}/resolve", post(resolve_conflict))
        .route("/operations", get(list_operations))
}
