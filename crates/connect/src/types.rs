//! Wire types shared by the System A and System B APIs.

use serde::{Deserialize, Serialize};

use eventsync_core::records::{ExternalRecord, InternalRecord};

/// Error body returned by both systems on non-success responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    pub code: String,
    pub message: String,
}

/// One page of System A events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub events: Vec<ExternalRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// One page of System B records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPage {
    pub records: Vec<InternalRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedRecord {
    pub id: String,
}
