//! Request plumbing shared by both system clients.

use std::time::Duration;

use log::{debug, error};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;

use eventsync_core::config::EndpointConfig;

use crate::error::{ConnectError, Result};
use crate::types::ApiErrorResponse;

const MAX_LOG_BODY_CHARS: usize = 512;

/// A base URL, an optional bearer token and a timeout-bounded reqwest client.
#[derive(Debug, Clone)]
pub(crate) struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    tag: &'static str,
}

impl ApiClient {
    pub(crate) fn new(endpoint: &EndpointConfig, timeout: Duration, tag: &'static str) -> Result<Self> {
        let base_url = endpoint.base_url.trim().trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConnectError::invalid_request(format!(
                "Base URL must be http(s): {}",
                endpoint.base_url
            )));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            token: endpoint.api_token.clone(),
            tag,
        })
    }

    /// Joins `segments` onto the base URL, percent-encoding each one.
    pub(crate) fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if let Some(token) = &self.token {
            let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ConnectError::auth("Invalid API token format"))?;
            headers.insert(AUTHORIZATION, auth_value);
        }

        Ok(headers)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!("[{}] GET {}", self.tag, url);
        let response = self
            .client
            .get(url)
            .headers(self.headers()?)
            .send()
            .await?;
        self.parse_response(response).await
    }

    pub(crate) async fn send_json<B, T>(&self, method: Method, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!("[{}] {} {}", self.tag, method, url);
        let response = self
            .client
            .request(method, url)
            .headers(self.headers()?)
            .json(body)
            .send()
            .await?;
        self.parse_response(response).await
    }

    /// Sends a request whose success body, if any, is ignored.
    pub(crate) async fn send_empty<B>(&self, method: Method, url: &str, body: Option<&B>) -> Result<()>
    where
        B: Serialize + ?Sized,
    {
        debug!("[{}] {} {}", self.tag, method, url);
        let mut request = self.client.request(method, url).headers(self.headers()?);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        let body = response.text().await?;
        self.log_response(status, &body);
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::api_error(status, &body))
        }
    }

    async fn parse_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        self.log_response(status, &body);

        if !status.is_success() {
            return Err(Self::api_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            error!("[{}] Failed to deserialize response: {}", self.tag, e);
            ConnectError::Json(e)
        })
    }

    fn api_error(status: reqwest::StatusCode, body: &str) -> ConnectError {
        if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(body) {
            return ConnectError::api(
                status.as_u16(),
                format!("{}: {}", error.code, error.message),
            );
        }
        ConnectError::api(status.as_u16(), format!("Request failed: {}", preview(body)))
    }

    fn log_response(&self, status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("[{}] API response status: {}", self.tag, status);
            return;
        }
        debug!("[{}] API response error ({}): {}", self.tag, status, preview(body));
    }
}

fn preview(body: &str) -> String {
    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    preview
}

/// Appends `params` as an encoded query string, skipping empty values.
pub(crate) fn with_query(url: &str, params: &[(&str, String)]) -> String {
    let query = params
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(name, value)| format!("{}={}", name, urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    if query.is_empty() {
        url.to_string()
    } else {
        format!("{}?{}", url, query)
    }
}
