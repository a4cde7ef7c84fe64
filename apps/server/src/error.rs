use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use eventsync_core::errors::Error as SyncError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Sync(err) => match err {
                SyncError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                SyncError::ConflictInFlight { .. } | SyncError::LinkIntegrity(_) => {
                    StatusCode::CONFLICT
                }
                SyncError::NotFound(_) => StatusCode::NOT_FOUND,
                // Webhook transports redeliver on 503.
                SyncError::Connection(_) | SyncError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("Request failed with {}: {}", status, self);
        }
        let code = match &self {
            Self::BadRequest(_) => None,
            Self::Sync(err) => Some(err.kind().as_str()),
        };
        let body = ErrorBody {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}
