use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// How much a disagreement matters operationally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPriority {
    Low,
    Medium,
    High,
}

/// Lifecycle: `pending -> resolving -> resolved`. A failed apply returns to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolving,
    Resolved,
}

/// Policy applied to settle one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Adopt the value of the system authoritative for the field.
    SourceWins,
    /// Keep the value held by the non-authoritative side.
    TargetWins,
    /// Use an explicit replacement value.
    Custom { value: Value },
}

impl ResolutionPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SourceWins => "source_wins",
            Self::TargetWins => "target_wins",
            Self::Custom { .. } => "custom",
        }
    }
}

/// The write produced by resolving a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPatch {
    pub conflict_id: String,
    /// Internal (System B) field name.
    pub field: String,
    /// External (System A) field name.
    pub external_field: String,
    pub value: Value,
    pub write_internal: bool,
    pub write_external: bool,
    /// Value both sides are considered to agree on after the write.
    pub baseline_value: Value,
    pub policy: ResolutionPolicy,
}

/// One unresolved or settled disagreement on a single field of a linked pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConflict {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub external_id: String,
    pub internal_id: String,
    /// Internal (System B) field name.
    pub field: String,
    /// External (System A) field name.
    pub external_field: String,
    pub external_value: Value,
    pub internal_value: Value,
    pub external_modified_at: DateTime<Utc>,
    pub internal_modified_at: DateTime<Utc>,
    pub priority: ConflictPriority,
    pub status: ConflictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolvedPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DataConflict {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        external_id: impl Into<String>,
        internal_id: impl Into<String>,
        field: impl Into<String>,
        external_field: impl Into<String>,
        external_value: Value,
        internal_value: Value,
        external_modified_at: DateTime<Utc>,
        internal_modified_at: DateTime<Utc>,
        priority: ConflictPriority,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            operation_id: None,
            external_id: external_id.into(),
            internal_id: internal_id.into(),
            field: field.into(),
            external_field: external_field.into(),
            external_value,
            internal_value,
            external_modified_at,
            internal_modified_at,
            priority,
            status: ConflictStatus::Pending,
            resolution: None,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }
}

/// Outcome of claiming a conflict for resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictClaim {
    /// The conflict moved `pending -> resolving` and belongs to the caller.
    Claimed(DataConflict),
    /// The conflict had already been settled earlier.
    AlreadyResolved(DataConflict),
}
