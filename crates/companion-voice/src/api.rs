//! Call-session REST collaborator: `POST /api/call/start`.

use crate::error::TransportError;
use crate::protocol::RemoteStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Session record returned by the call service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub companion_id: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub duration: u64,
}

/// Creates call sessions on the backend before the channel is opened.
#[async_trait]
pub trait CallApi: Send + Sync {
    async fn create_session(&self, companion_id: &str) -> Result<SessionRecord, TransportError>;
}

/// reqwest-backed `CallApi`.
#[derive(Debug, Clone)]
pub struct HttpCallApi {
    /// Base URL without trailing slash (e.g. http://127.0.0.1:8000).
    pub base_url: String,
    client: reqwest::Client,
}

impl HttpCallApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }
}

#[async_trait]
impl CallApi for HttpCallApi {
    async fn create_session(&self, companion_id: &str) -> Result<SessionRecord, TransportError> {
        let url = format!("{}/api/call/start", self.base_url.trim_end_matches('/'));
        debug!(target: "companion::call", %url, companion_id, "Creating call session");
        let res = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "companion_id": companion_id }))
            .send()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(TransportError::ConnectFailed(format!(
                "call API error {}: {}",
                status, body
            )));
        }
        res.json::<SessionRecord>()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))
    }
}
