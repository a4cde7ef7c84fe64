use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Tracked field values keyed by the owning system's field names.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// An event as shaped by System A. Immutable snapshot fetched per pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRecord {
    pub id: String,
    pub last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub fields: FieldMap,
}

impl ExternalRecord {
    pub fn new(id: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            last_modified,
            owner_id: None,
            fields: FieldMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// The System B counterpart, optionally pointing back at its external origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub fields: FieldMap,
}

impl InternalRecord {
    pub fn new(id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            external_id: None,
            updated_at,
            fields: FieldMap::new(),
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Partial update for a System B record. Only listed fields are touched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalRecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub fields: FieldMap,
}

impl InternalRecordPatch {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Applies the patch over `record`, leaving unlisted fields untouched.
    pub fn apply_to(&self, record: &mut InternalRecord) {
        for (name, value) in &self.fields {
            record.fields.insert(name.clone(), value.clone());
        }
        if let Some(external_id) = &self.external_id {
            record.external_id = Some(external_id.clone());
        }
    }
}

/// Partial update for a System A event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRecordPatch {
    pub fields: FieldMap,
}

impl ExternalRecordPatch {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn apply_to(&self, record: &mut ExternalRecord) {
        for (name, value) in &self.fields {
            record.fields.insert(name.clone(), value.clone());
        }
    }
}

/// Selection of System A events for a batch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

/// Selection of System B records, by id or by back-reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalRecordFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_ids: Vec<String>,
}

impl InternalRecordFilter {
    pub fn by_ids(ids: Vec<String>) -> Self {
        Self {
            ids,
            external_ids: Vec::new(),
        }
    }

    pub fn by_external_ids(external_ids: Vec<String>) -> Self {
        Self {
            ids: Vec::new(),
            external_ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.external_ids.is_empty()
    }
}
