use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SystemId;
use crate::errors::{Error, Result};

/// Push notification kinds delivered by either system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    Created,
    Updated,
    Deleted,
    /// Behaves like `updated`, but jumps the queue.
    ContractSigned,
}

impl WebhookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::ContractSigned => "contract_signed",
        }
    }

    pub fn is_priority(&self) -> bool {
        matches!(self, Self::ContractSigned)
    }
}

/// Inbound notification, identical for webhooks and the push stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_id: String,
    pub source_system: SystemId,
    pub event_type: WebhookEventType,
    pub record_id: String,
    /// Advisory only; the whole field table is reconciled regardless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_fields: Option<Vec<String>>,
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    pub fn new(
        event_id: impl Into<String>,
        source_system: SystemId,
        event_type: WebhookEventType,
        record_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            source_system,
            event_type,
            record_id: record_id.into(),
            changed_fields: None,
            timestamp: Utc::now(),
        }
    }

    /// Ledger idempotency key, `<source>:<event_id>`.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.source_system.as_str(), self.event_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_id.trim().is_empty() {
            return Err(Error::validation("Webhook payload is missing event_id"));
        }
        if self.record_id.trim().is_empty() {
            return Err(Error::validation(format!(
                "Webhook {} is missing record_id",
                self.event_id
            )));
        }
        Ok(())
    }
}

/// How a handled webhook ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Created,
    Updated,
    Deleted,
    Unchanged,
    Conflicted,
    /// Nothing to do for this event under the current configuration.
    Skipped,
    /// Already processed earlier; not applied again.
    Duplicate,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Unchanged => "unchanged",
            Self::Conflicted => "conflicted",
            Self::Skipped => "skipped",
            Self::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResult {
    pub outcome: WebhookOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}
