use std::collections::HashMap;
use std::env;
use std::fmt;

use thiserror::Error;

use eventsync_core::config::{EndpointConfig, SyncConfiguration, SyncDirection};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// SQLite file path; a `sqlite://` prefix is accepted and stripped.
    pub database_path: String,
    pub organization_id: String,
    pub system_a_url: String,
    pub system_a_token: Option<String>,
    pub system_b_url: String,
    pub system_b_token: Option<String>,
    pub direction: SyncDirection,
    pub sync_interval_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub auto_sync: bool,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("organization_id", &self.organization_id)
            .field("system_a_url", &self.system_a_url)
            .field("system_a_token", &self.system_a_token.as_ref().map(|_| "[REDACTED]"))
            .field("system_b_url", &self.system_b_url)
            .field("system_b_token", &self.system_b_token.as_ref().map(|_| "[REDACTED]"))
            .field("direction", &self.direction)
            .field("sync_interval_secs", &self.sync_interval_secs)
            .field("max_retries", &self.max_retries)
            .field("auto_sync", &self.auto_sync)
            .finish()
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "EVENTSYNC_BIND_ADDR", "127.0.0.1:8080");

        let database_url = value_or_default(&lookup, "EVENTSYNC_DATABASE_URL", "./data/eventsync.db");
        let database_path = database_url
            .strip_prefix("sqlite://")
            .unwrap_or(&database_url)
            .to_string();
        if database_path.is_empty() {
            return Err(ConfigError::Invalid(
                "EVENTSYNC_DATABASE_URL must name a file".to_string(),
            ));
        }

        let organization_id = required_trimmed(&lookup, "EVENTSYNC_ORG_ID")?;

        let system_a_url = required_trimmed(&lookup, "SYSTEM_A_API_URL")?;
        if !is_http_url(&system_a_url) {
            return Err(ConfigError::Invalid(
                "SYSTEM_A_API_URL must start with http:// or https://".to_string(),
            ));
        }
        let system_b_url = required_trimmed(&lookup, "SYSTEM_B_API_URL")?;
        if !is_http_url(&system_b_url) {
            return Err(ConfigError::Invalid(
                "SYSTEM_B_API_URL must start with http:// or https://".to_string(),
            ));
        }

        let direction = value_or_default(&lookup, "EVENTSYNC_DIRECTION", "bidirectional")
            .parse::<SyncDirection>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "EVENTSYNC_DIRECTION must be a_to_b, b_to_a or bidirectional".to_string(),
                )
            })?;

        let sync_interval_secs = optional_trimmed(&lookup, "EVENTSYNC_SYNC_INTERVAL_SECS")
            .map(|value| {
                value.parse::<u64>().ok().filter(|secs| *secs > 0).ok_or_else(|| {
                    ConfigError::Invalid(
                        "EVENTSYNC_SYNC_INTERVAL_SECS must be a positive integer".to_string(),
                    )
                })
            })
            .transpose()?;

        let max_retries = optional_trimmed(&lookup, "EVENTSYNC_MAX_RETRIES")
            .map(|value| {
                value.parse::<u32>().ok().filter(|n| (1..=20).contains(n)).ok_or_else(|| {
                    ConfigError::Invalid("EVENTSYNC_MAX_RETRIES must be in [1, 20]".to_string())
                })
            })
            .transpose()?;

        let auto_sync = match optional_trimmed(&lookup, "EVENTSYNC_AUTO_SYNC")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("false") | Some("0") | Some("no") => false,
            Some("true") | Some("1") | Some("yes") => true,
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "EVENTSYNC_AUTO_SYNC must be true or false".to_string(),
                ))
            }
        };

        Ok(Self {
            bind_addr,
            database_path,
            organization_id,
            system_a_url,
            system_a_token: optional_trimmed(&lookup, "SYSTEM_A_API_TOKEN"),
            system_b_url,
            system_b_token: optional_trimmed(&lookup, "SYSTEM_B_API_TOKEN"),
            direction,
            sync_interval_secs,
            max_retries,
            auto_sync,
        })
    }

    /// Engine configuration derived from the environment alone.
    pub fn sync_configuration(&self) -> SyncConfiguration {
        let endpoint = |url: &str, token: &Option<String>| {
            let endpoint = EndpointConfig::new(url);
            match token {
                Some(token) => endpoint.with_token(token.clone()),
                None => endpoint,
            }
        };

        let mut config = SyncConfiguration::new(
            self.organization_id.clone(),
            endpoint(&self.system_a_url, &self.system_a_token),
            endpoint(&self.system_b_url, &self.system_b_token),
        )
        .with_direction(self.direction);
        if let Some(secs) = self.sync_interval_secs {
            config.sync_interval_secs = secs;
        }
        if let Some(max_retries) = self.max_retries {
            config = config.with_max_retries(max_retries);
        }
        config.auto_sync_enabled = self.auto_sync;
        config
    }
}

fn required_trimmed(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn value_or_default(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}
