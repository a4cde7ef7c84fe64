use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::debug;

use eventsync_core::config::SystemId;
use eventsync_core::errors::Error as SyncError;
use eventsync_core::sync::WebhookPayload;

use crate::error::ApiResult;
use crate::main_lib::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DeliveryMode {
    #[default]
    Inline,
    Async,
}

#[derive(Debug, Deserialize)]
struct WebhookQuery {
    #[serde(default)]
    mode: DeliveryMode,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuedResponse {
    status: &'static str,
    event_id: String,
}

/// Accepts a notification from either system. Inline delivery answers with the
/// handling outcome; `?mode=async` only queues it.
async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
    Query(query): Query<WebhookQuery>,
    Json(payload): Json<WebhookPayload>,
) -> ApiResult<Response> {
    let source = source.parse::<SystemId>()?;
    if source != payload.source_system {
        return Err(SyncError::validation(format!(
            "Webhook posted to {} but payload names {}",
            source, payload.source_system
        ))
        .into());
    }
    debug!(
        "Webhook {} {} for {} from {}",
        payload.event_id,
        payload.event_type.as_str(),
        payload.record_id,
        source
    );

    match query.mode {
        DeliveryMode::Inline => {
            let result = state.engine.handle_webhook(payload).await?;
            Ok(Json(result).into_response())
        }
        DeliveryMode::Async => {
            let event_id = payload.event_id.clone();
            state.engine.enqueue_webhook(payload)?;
            Ok((
                StatusCode::ACCEPTED,
                Json(QueuedResponse {
                    status: "queued",
                    event_id,
                }),
            )
                .into_response())
        }
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/webhooks/{source}", post(receive_webhook))
}
