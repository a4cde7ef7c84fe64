//! HTTP client for System A, the CRM holding client-facing event records.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Method;

use eventsync_core::config::{EndpointConfig, SyncConfiguration};
use eventsync_core::records::{EventFilter, ExternalEventClientTrait, ExternalRecord, ExternalRecordPatch};

use crate::error::Result;
use crate::http::{with_query, ApiClient};
use crate::types::EventPage;

/// Upper bound on pages followed for one listing.
const MAX_PAGES: usize = 1_000;

/// Client for the CRM events API.
///
/// * `GET    /events?dateFrom&dateTo&status&ownerId&cursor`
/// * `GET    /events/{id}`
/// * `PATCH  /events/{id}` with `{ "fields": { .. } }`
/// * `GET    /health`
#[derive(Debug, Clone)]
pub struct SystemAClient {
    api: ApiClient,
}

impl SystemAClient {
    pub fn new(endpoint: &EndpointConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(endpoint, timeout, "SystemA")?,
        })
    }

    pub fn from_config(config: &SyncConfiguration) -> Result<Self> {
        Self::new(&config.system_a, config.request_timeout())
    }

    fn filter_params(filter: &EventFilter) -> Vec<(&'static str, String)> {
        vec![
            (
                "dateFrom",
                filter.date_from.map(|d| d.to_string()).unwrap_or_default(),
            ),
            (
                "dateTo",
                filter.date_to.map(|d| d.to_string()).unwrap_or_default(),
            ),
            ("status", filter.statuses.join(",")),
            ("ownerId", filter.owner_id.clone().unwrap_or_default()),
        ]
    }

    async fn fetch_events(&self, filter: &EventFilter) -> Result<Vec<ExternalRecord>> {
        let base = self.api.url(&["events"]);
        let mut events = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut params = Self::filter_params(filter);
            params.push(("cursor", cursor.clone().unwrap_or_default()));
            let page: EventPage = self.api.get_json(&with_query(&base, &params)).await?;
            events.extend(page.events);

            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                Some(_) => {
                    warn!("[SystemA] Cursor did not advance, stopping pagination");
                    break;
                }
                None => break,
            }
        }

        debug!("[SystemA] Listed {} events", events.len());
        Ok(events)
    }
}

#[async_trait]
impl ExternalEventClientTrait for SystemAClient {
    async fn list_events(&self, filter: &EventFilter) -> eventsync_core::Result<Vec<ExternalRecord>> {
        Ok(self.fetch_events(filter).await?)
    }

    async fn get_event(&self, id: &str) -> eventsync_core::Result<ExternalRecord> {
        Ok(self.api.get_json(&self.api.url(&["events", id])).await?)
    }

    async fn update_event(&self, id: &str, patch: &ExternalRecordPatch) -> eventsync_core::Result<()> {
        self.api
            .send_empty(Method::PATCH, &self.api.url(&["events", id]), Some(patch))
            .await?;
        Ok(())
    }

    async fn ping(&self) -> eventsync_core::Result<()> {
        self.api
            .send_empty::<()>(Method::GET, &self.api.url(&["health"]), None)
            .await?;
        Ok(())
    }
}
