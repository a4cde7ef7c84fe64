use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conflicts::ConflictPriority;

/// Value type of a tracked field, used for normalization and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Date,
    Time,
    Integer,
    Decimal,
    Status,
}

/// One row of the field comparison table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    /// Field name on System A.
    pub external: String,
    /// Field name on System B.
    pub internal: String,
    pub kind: FieldKind,
    pub priority: ConflictPriority,
}

impl FieldMapping {
    pub fn new(
        external: impl Into<String>,
        internal: impl Into<String>,
        kind: FieldKind,
        priority: ConflictPriority,
    ) -> Self {
        Self {
            external: external.into(),
            internal: internal.into(),
            kind,
            priority,
        }
    }
}

/// The tracked fields of an event/booking record.
pub fn default_field_table() -> Vec<FieldMapping> {
    vec![
        FieldMapping::new("event_name", "name", FieldKind::Text, ConflictPriority::Medium),
        FieldMapping::new("event_date", "date", FieldKind::Date, ConflictPriority::High),
        FieldMapping::new("start_time", "time", FieldKind::Time, ConflictPriority::High),
        FieldMapping::new("venue", "location", FieldKind::Text, ConflictPriority::Medium),
        FieldMapping::new(
            "guest_count",
            "guests",
            FieldKind::Integer,
            ConflictPriority::High,
        ),
        FieldMapping::new("stage", "status", FieldKind::Status, ConflictPriority::Medium),
        FieldMapping::new("budget", "budget", FieldKind::Decimal, ConflictPriority::Medium),
        FieldMapping::new("notes", "notes", FieldKind::Text, ConflictPriority::Low),
    ]
}

/// Canonical form of a field value, or a description of why it does not fit `kind`.
///
/// `null` is a legitimate value for every kind and is returned unchanged.
pub fn normalize_value(kind: FieldKind, value: &Value) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match kind {
        FieldKind::Text => match value {
            Value::String(s) => Ok(Value::String(s.trim().to_string())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(format!("expected text, got {}", value)),
        },
        FieldKind::Status => match value {
            Value::String(s) => Ok(Value::String(s.trim().to_lowercase())),
            _ => Err(format!("expected status string, got {}", value)),
        },
        FieldKind::Date => {
            let raw = value
                .as_str()
                .ok_or_else(|| format!("expected date string, got {}", value))?
                .trim();
            let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.date_naive()))
                .map_err(|_| format!("invalid date '{}'", raw))?;
            Ok(Value::String(date.format("%Y-%m-%d").to_string()))
        }
        FieldKind::Time => {
            let raw = value
                .as_str()
                .ok_or_else(|| format!("expected time string, got {}", value))?
                .trim();
            let time = NaiveTime::parse_from_str(raw, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
                .map_err(|_| format!("invalid time '{}'", raw))?;
            Ok(Value::String(time.format("%H:%M:%S").to_string()))
        }
        FieldKind::Integer => {
            let parsed = match value {
                Value::Number(n) => n.as_i64().or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                }),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            };
            parsed
                .map(Value::from)
                .ok_or_else(|| format!("expected integer, got {}", value))
        }
        FieldKind::Decimal => {
            let parsed = match value {
                Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
                Value::String(s) => Decimal::from_str(s.trim()).ok(),
                _ => None,
            };
            parsed
                .map(|d| Value::String(d.normalize().to_string()))
                .ok_or_else(|| format!("expected decimal, got {}", value))
        }
    }
}

/// Equality after normalization. Values that fail to normalize compare raw.
pub fn values_equal(kind: FieldKind, left: &Value, right: &Value) -> bool {
    match (normalize_value(kind, left), normalize_value(kind, right)) {
        (Ok(l), Ok(r)) => l == r,
        _ => left == right,
    }
}
