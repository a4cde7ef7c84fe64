use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::records::EventFilter;

/// Default cadence of the background batch sync.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 15 * 60;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 250;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 8_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_BATCH_CONCURRENCY: usize = 4;
pub const DEFAULT_WEBHOOK_QUEUE_CAPACITY: usize = 256;

/// One of the two systems of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemId {
    /// External sales/CRM system owning event records.
    SystemA,
    /// Internal operations system.
    SystemB,
}

impl SystemId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemA => "system_a",
            Self::SystemB => "system_b",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::SystemA => Self::SystemB,
            Self::SystemB => Self::SystemA,
        }
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SystemId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "system_a" | "a" => Ok(Self::SystemA),
            "system_b" | "b" => Ok(Self::SystemB),
            other => Err(Error::validation(format!("Unknown source system '{}'", other))),
        }
    }
}

/// Which way changes are allowed to flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncDirection {
    #[serde(rename = "a_to_b")]
    AToB,
    #[serde(rename = "b_to_a")]
    BToA,
    #[serde(rename = "bidirectional")]
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AToB => "a_to_b",
            Self::BToA => "b_to_a",
            Self::Bidirectional => "bidirectional",
        }
    }

    /// Changes from System A may be written to System B.
    pub fn allows_to_internal(&self) -> bool {
        matches!(self, Self::AToB | Self::Bidirectional)
    }

    /// Changes from System B may be written to System A.
    pub fn allows_to_external(&self) -> bool {
        matches!(self, Self::BToA | Self::Bidirectional)
    }

    /// Whether a write into `target` is permitted.
    pub fn allows_write_to(&self, target: SystemId) -> bool {
        match target {
            SystemId::SystemB => self.allows_to_internal(),
            SystemId::SystemA => self.allows_to_external(),
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "a_to_b" => Ok(Self::AToB),
            "b_to_a" => Ok(Self::BToA),
            "bidirectional" => Ok(Self::Bidirectional),
            other => Err(Error::configuration(format!(
                "Unknown sync direction '{}'",
                other
            ))),
        }
    }
}

/// Endpoint of one collaborator system. The token is opaque to the engine.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

impl EndpointConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Configuration for one organization's sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfiguration {
    pub organization_id: String,
    pub system_a: EndpointConfig,
    pub system_b: EndpointConfig,
    pub direction: SyncDirection,
    /// System whose value wins under `source_wins` when syncing bidirectionally.
    pub authoritative_system: SystemId,
    /// Per-field overrides of the authoritative system, keyed by internal field name.
    #[serde(default)]
    pub field_authority: BTreeMap<String, SystemId>,
    pub auto_sync_enabled: bool,
    pub sync_interval_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub batch_concurrency: usize,
    pub webhook_queue_capacity: usize,
    #[serde(default)]
    pub default_filter: EventFilter,
}

impl SyncConfiguration {
    pub fn new(
        organization_id: impl Into<String>,
        system_a: EndpointConfig,
        system_b: EndpointConfig,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            system_a,
            system_b,
            direction: SyncDirection::Bidirectional,
            authoritative_system: SystemId::SystemA,
            field_authority: BTreeMap::new(),
            auto_sync_enabled: false,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
            webhook_queue_capacity: DEFAULT_WEBHOOK_QUEUE_CAPACITY,
            default_filter: EventFilter::default(),
        }
    }

    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_auto_sync(mut self, interval_secs: u64) -> Self {
        self.auto_sync_enabled = true;
        self.sync_interval_secs = interval_secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delays(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.retry_base_delay_ms = base_ms;
        self.retry_max_delay_ms = max_ms;
        self
    }

    /// System nominated as authoritative for the given internal field.
    ///
    /// One-way directions make the source side authoritative; bidirectional sync
    /// falls back to the per-field override and then the configured default.
    pub fn authority_for(&self, internal_field: &str) -> SystemId {
        match self.direction {
            SyncDirection::AToB => SystemId::SystemA,
            SyncDirection::BToA => SystemId::SystemB,
            SyncDirection::Bidirectional => self
                .field_authority
                .get(internal_field)
                .copied()
                .unwrap_or(self.authoritative_system),
        }
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.organization_id.trim().is_empty() {
            return Err(Error::configuration("organizationId must not be empty"));
        }
        for (label, endpoint) in [("systemA", &self.system_a), ("systemB", &self.system_b)] {
            let url = endpoint.base_url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::configuration(format!(
                    "{}.baseUrl must start with http:// or https://",
                    label
                )));
            }
        }
        if self.max_retries == 0 {
            return Err(Error::configuration("maxRetries must be at least 1"));
        }
        if self.auto_sync_enabled && self.sync_interval_secs == 0 {
            return Err(Error::configuration(
                "syncIntervalSecs must be positive when auto sync is enabled",
            ));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(Error::configuration(
                "retryMaxDelayMs must not be smaller than retryBaseDelayMs",
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::configuration("requestTimeoutSecs must be positive"));
        }
        if self.batch_concurrency == 0 || self.webhook_queue_capacity == 0 {
            return Err(Error::configuration(
                "batchConcurrency and webhookQueueCapacity must be positive",
            ));
        }
        Ok(())
    }
}
