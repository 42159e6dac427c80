//! Control channel to the external face-recognition engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::{CampId, GroupId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("engine returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadIndexRequest<'a> {
    camp_id: CampId,
    group_ids: &'a [GroupId],
    force_reload: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnloadIndexRequest {
    camp_id: CampId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadIndexResponse {
    pub success: bool,
    #[serde(default)]
    pub face_count: u32,
    #[serde(default)]
    pub groups: Vec<GroupId>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnloadIndexResponse {
    pub success: bool,
    #[serde(default)]
    pub face_count: u32,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub healthy: bool,
    pub model_name: String,
    #[serde(default)]
    pub loaded_camp_count: u32,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Commands the coordinator can issue to the engine.
#[async_trait]
pub trait EngineControl: Send + Sync {
    async fn load_index(
        &self,
        camp_id: CampId,
        group_ids: &[GroupId],
        force_reload: bool,
    ) -> Result<LoadIndexResponse, EngineError>;

    async fn unload_index(&self, camp_id: CampId) -> Result<UnloadIndexResponse, EngineError>;

    async fn health_check(&self) -> Result<EngineHealth, EngineError>;
}

/// JSON-over-HTTP engine client.
pub struct HttpEngineClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEngineClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, EngineError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl EngineControl for HttpEngineClient {
    async fn load_index(
        &self,
        camp_id: CampId,
        group_ids: &[GroupId],
        force_reload: bool,
    ) -> Result<LoadIndexResponse, EngineError> {
        tracing::debug!(%camp_id, groups = group_ids.len(), force_reload, "engine: load index");
        let response = self
            .client
            .post(self.url("/api/index/load"))
            .json(&LoadIndexRequest {
                camp_id,
                group_ids,
                force_reload,
            })
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn unload_index(&self, camp_id: CampId) -> Result<UnloadIndexResponse, EngineError> {
        tracing::debug!(%camp_id, "engine: unload index");
        let response = self
            .client
            .post(self.url("/api/index/unload"))
            .json(&UnloadIndexRequest { camp_id })
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn health_check(&self) -> Result<EngineHealth, EngineError> {
        let response = self.client.get(self.url("/api/health")).send().await?;
        Self::decode(response).await
    }
}
