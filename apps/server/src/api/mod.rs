//! HTTP routes of the sync server.

mod conflicts;
mod events;
mod sync;
mod webhooks;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::main_lib::AppState;

pub fn app_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .merge(sync::router())
        .merge(webhooks::router())
        .merge(conflicts::router())
        .merge(events::router());

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[cfg(test)]
pub(crate) mod tests;
