use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::{
    config::RunConfig,
    error::{IngestError, Result},
    model::RawPayload,
};

use super::WeatherSource;

/// Client for the weatherstack `current` endpoint.
#[derive(Clone)]
pub struct WeatherstackClient {
    api_key: String,
    endpoint: String,
    http: Client,
}

impl std::fmt::Debug for WeatherstackClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherstackClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl WeatherstackClient {
    /// Fails with a configuration error when the key is blank; no request is made.
    pub fn new(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(IngestError::Config("weather API key must not be empty".into()));
        }

        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| IngestError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn from_config(config: &RunConfig) -> Result<Self> {
        Self::new(config.api_key.clone(), config.endpoint.clone(), config.http_timeout)
    }

    fn current_url(&self) -> String {
        format!("{}/current", self.endpoint)
    }
}

/// weatherstack reports failures as `{"success": false, "error": {...}}` with HTTP 200.
#[derive(Debug, Deserialize)]
struct WsError {
    #[serde(default)]
    code: i64,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    info: String,
}

#[async_trait]
impl WeatherSource for WeatherstackClient {
    async fn fetch(&self, location: &str) -> Result<RawPayload> {
        if location.trim().is_empty() {
            return Err(IngestError::Config("location must not be empty".into()));
        }

        let res = self
            .http
            .get(self.current_url())
            .query(&[("access_key", self.api_key.as_str()), ("query", location)])
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| IngestError::Transport(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(IngestError::HttpStatus {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| IngestError::Parse(format!("response is not valid JSON: {e}")))?;

        if let Some(error) = value.get("error").filter(|e| e.is_object()) {
            let upstream: WsError = serde_json::from_value(error.clone()).unwrap_or(WsError {
                code: 0,
                kind: String::new(),
                info: error.to_string(),
            });
            return Err(IngestError::Upstream {
                code: upstream.code,
                kind: upstream.kind,
                info: upstream.info,
            });
        }

        debug!(location, payload = %value, "weather API responded");
        Ok(RawPayload(value))
    }
}

fn classify_send_error(err: reqwest::Error) -> IngestError {
    if err.is_builder() {
        return IngestError::Config(format!("invalid weather API request: {err}"));
    }

    let what = if err.is_timeout() {
        "request timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    IngestError::Transport(format!("{what}: {err}"))
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
