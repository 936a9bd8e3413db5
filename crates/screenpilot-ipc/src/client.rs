use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::paths::api_base_url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Daemon not reachable: {0}")]
    NotReachable(String),
    #[error("Request timed out")]
    Timeout,
    #[error("API error: {message}")]
    Api { message: String },
    #[error("Invalid response from daemon")]
    InvalidResponse,
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_connect() {
            ClientError::NotReachable(err.to_string())
        } else {
            ClientError::Api {
                message: err.to_string(),
            }
        }
    }
}

/// Loopback HTTP client for the daemon's Control API. Used by the CLI
/// subcommands and by the stdio tool server's dispatch.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new() -> Result<Self, ClientError> {
        Self::with_base_url(api_base_url())
    }

    pub fn with_base_url(base_url: String) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ClientError::NotReachable(e.to_string()))?;
        Ok(Self { http, base_url })
    }

    pub async fn get(&self, path: &str) -> Result<Value, ClientError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        Self::unwrap_envelope(response.json().await?)
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;
        Self::unwrap_envelope(response.json().await?)
    }

    pub async fn get_status(&self) -> Result<Value, ClientError> {
        self.get("/api/status").await
    }

    pub async fn record_start(&self, body: Value) -> Result<Value, ClientError> {
        self.post("/api/record/start", body).await
    }

    pub async fn record_stop(&self) -> Result<Value, ClientError> {
        self.post("/api/record/stop", Value::Null).await
    }

    pub async fn get_context(&self, channel: &str) -> Result<Value, ClientError> {
        self.get(&format!("/api/context/{}", channel)).await
    }

    /// Every Control API response is a `{status: "ok"|"error", ...}`
    /// envelope; an error envelope becomes a `ClientError::Api`.
    fn unwrap_envelope(value: Value) -> Result<Value, ClientError> {
        match value.get("status").and_then(|s| s.as_str()) {
            Some("ok") => Ok(value),
            Some("error") => {
                let message = value
                    .get("message")
                    .and_then(|e| e.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                Err(ClientError::Api { message })
            }
            _ => Err(ClientError::InvalidResponse),
        }
    }
}
