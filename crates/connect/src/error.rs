//! Error types for the connector crate.

use thiserror::Error;

/// Result type alias for connector operations.
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Retry policy class for API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Errors that can occur while talking to System A or System B.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// HTTP transport error (connect, timeout, body read)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success response from the remote system
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (bad base URL, missing data, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication error (malformed token)
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl ConnectError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => ApiRetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => ApiRetryClass::Retryable,
                500..=599 => ApiRetryClass::Retryable,
                _ => ApiRetryClass::Permanent,
            },
            Self::Http(err) if err.is_builder() => ApiRetryClass::Permanent,
            Self::Http(_) => ApiRetryClass::Retryable,
            Self::Json(_) => ApiRetryClass::Permanent,
            Self::InvalidRequest(_) => ApiRetryClass::Permanent,
            Self::Auth(_) => ApiRetryClass::ReauthRequired,
        }
    }
}

impl From<ConnectError> for eventsync_core::Error {
    fn from(err: ConnectError) -> Self {
        use eventsync_core::Error;

        if err.status_code() == Some(404) {
            return Error::not_found(err.to_string());
        }
        match (&err, err.retry_class()) {
            (ConnectError::Json(_), _) => Error::validation(err.to_string()),
            (_, ApiRetryClass::Retryable) => Error::connection(err.to_string()),
            (_, ApiRetryClass::ReauthRequired) => Error::configuration(err.to_string()),
            (ConnectError::InvalidRequest(_), _) | (ConnectError::Http(_), _) => {
                Error::configuration(err.to_string())
            }
            _ => Error::validation(err.to_string()),
        }
    }
}
