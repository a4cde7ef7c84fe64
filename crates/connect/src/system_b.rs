//! HTTP client for System B, the internal operations record store.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Method;

use eventsync_core::config::{EndpointConfig, SyncConfiguration};
use eventsync_core::records::{
    InternalRecord, InternalRecordClientTrait, InternalRecordFilter, InternalRecordPatch,
};

use crate::error::{ConnectError, Result};
use crate::http::{with_query, ApiClient};
use crate::types::{CreatedRecord, RecordPage};

const MAX_PAGES: usize = 1_000;

/// Client for the operations records API.
///
/// * `GET    /records?ids&externalIds&cursor`
/// * `GET    /records/{id}`
/// * `POST   /records` returning `{ "id": .. }`
/// * `PATCH  /records/{id}`
/// * `DELETE /records/{id}`
/// * `GET    /health`
#[derive(Debug, Clone)]
pub struct SystemBClient {
    api: ApiClient,
}

impl SystemBClient {
    pub fn new(endpoint: &EndpointConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(endpoint, timeout, "SystemB")?,
        })
    }

    pub fn from_config(config: &SyncConfiguration) -> Result<Self> {
        Self::new(&config.system_b, config.request_timeout())
    }

    async fn fetch_records(&self, filter: &InternalRecordFilter) -> Result<Vec<InternalRecord>> {
        let base = self.api.url(&["records"]);
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let params = [
                ("ids", filter.ids.join(",")),
                ("externalIds", filter.external_ids.join(",")),
                ("cursor", cursor.clone().unwrap_or_default()),
            ];
            let page: RecordPage = self.api.get_json(&with_query(&base, &params)).await?;
            records.extend(page.records);

            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                Some(_) => {
                    warn!("[SystemB] Cursor did not advance, stopping pagination");
                    break;
                }
                None => break,
            }
        }

        debug!("[SystemB] Listed {} records", records.len());
        Ok(records)
    }
}

#[async_trait]
impl InternalRecordClientTrait for SystemBClient {
    async fn list_records(
        &self,
        filter: &InternalRecordFilter,
    ) -> eventsync_core::Result<Vec<InternalRecord>> {
        Ok(self.fetch_records(filter).await?)
    }

    async fn create_record(&self, patch: &InternalRecordPatch) -> eventsync_core::Result<String> {
        let created: CreatedRecord = self
            .api
            .send_json(Method::POST, &self.api.url(&["records"]), patch)
            .await?;
        if created.id.trim().is_empty() {
            return Err(ConnectError::invalid_request("Created record has no id").into());
        }
        info!("[SystemB] Created record {}", created.id);
        Ok(created.id)
    }

    async fn update_record(&self, id: &str, patch: &InternalRecordPatch) -> eventsync_core::Result<()> {
        self.api
            .send_empty(Method::PATCH, &self.api.url(&["records", id]), Some(patch))
            .await?;
        Ok(())
    }

    async fn delete_record(&self, id: &str) -> eventsync_core::Result<()> {
        match self
            .api
            .send_empty::<()>(Method::DELETE, &self.api.url(&["records", id]), None)
            .await
        {
            Ok(()) => Ok(()),
            // Already gone counts as deleted.
            Err(err) if err.status_code() == Some(404) => {
                debug!("[SystemB] Record {} already deleted", id);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn ping(&self) -> eventsync_core::Result<()> {
        self.api
            .send_empty::<()>(Method::GET, &self.api.url(&["health"]), None)
            .await?;
        Ok(())
    }

    async fn get_record(&self, id: &str) -> eventsync_core::Result<Option<InternalRecord>> {
        match self
            .api
            .get_json::<InternalRecord>(&self.api.url(&["records", id]))
            .await
        {
            Ok(record) => Ok(Some(record)),
            Err(err) if err.status_code() == Some(404) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
