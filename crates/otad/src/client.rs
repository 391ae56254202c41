//! Deployment server API client.
//!
//! Thin typed wrapper over the device-facing HTTP API: authorization,
//! deployment polling, artifact download, status reporting, deployment logs,
//! and inventory submission. The client is policy-free; classifying failures
//! as transient or fatal happens in [`crate::agent`] via
//! [`ApiError::into_agent_error`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ota_artifact::PayloadSource;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AgentError;
use crate::inventory::InventoryAttribute;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Applied to every API call, but not to artifact downloads.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const AUTH_PATH: &str = "/api/devices/v1/authentication/auth_requests";
const DEPLOYMENTS_PATH: &str = "/api/devices/v1/deployments/device/deployments";
const INVENTORY_PATH: &str = "/api/devices/v1/inventory/device/attributes";

/// Signature header accompanying an authorization request body.
pub const AUTH_SIGNATURE_HEADER: &str = "X-Auth-Request-Signature";

/// Descriptor of a pending deployment, carried verbatim from the update
/// check through fetch, install, reboot, and the final status report so every
/// report references the same deployment ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub id: String,
    pub artifact: ArtifactDescriptor,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub artifact_name: String,
    pub device_type: String,
    pub source: ImageLocation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageLocation {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// What the device is currently running; sent with every update check.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentUpdate {
    pub artifact_name: String,
    pub device_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Downloading,
    Installing,
    Rebooting,
    Success,
    Failure,
    AlreadyInstalled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Downloading => "downloading",
            DeploymentStatus::Installing => "installing",
            DeploymentStatus::Rebooting => "rebooting",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failure => "failure",
            DeploymentStatus::AlreadyInstalled => "already-installed",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request rejected: not authorized")]
    Unauthorized,
    #[error("deployment aborted by the server")]
    DeploymentAborted,
    #[error("unexpected server response: {0}")]
    Status(StatusCode),
    #[error("malformed server response: {0}")]
    Payload(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        match self {
            // The token gets cleared and the next cycle re-authorizes.
            ApiError::Unauthorized => true,
            ApiError::DeploymentAborted => false,
            ApiError::Status(code) => code.is_server_error(),
            ApiError::Payload(_) => true,
            ApiError::Transport(_) => true,
        }
    }

    pub fn into_agent_error(self) -> AgentError {
        if self.is_transient() {
            AgentError::transient(self)
        } else {
            AgentError::fatal(self)
        }
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    pub fn new(server_url: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(format!("otad/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base: server_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Submit an authorization request; the body is signed by the caller.
    /// Returns the token exactly as the server issued it.
    pub async fn authorize(&self, body: &[u8], signature: &str) -> Result<Vec<u8>, ApiError> {
        let resp = self
            .http
            .post(self.url(AUTH_PATH))
            .timeout(REQUEST_TIMEOUT)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTH_SIGNATURE_HEADER, signature)
            .body(body.to_vec())
            .send()
            .await?;
        match resp.status() {
            status if status.is_success() => Ok(resp.bytes().await?.to_vec()),
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            status => Err(ApiError::Status(status)),
        }
    }

    /// Poll for a pending deployment. 204 means none.
    pub async fn check_update(
        &self,
        token: &str,
        current: &CurrentUpdate,
    ) -> Result<Option<UpdateResponse>, ApiError> {
        let resp = self
            .http
            .get(self.url(&format!("{DEPLOYMENTS_PATH}/next")))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(token)
            .query(&[
                ("artifact_name", current.artifact_name.as_str()),
                ("device_type", current.device_type.as_str()),
            ])
            .send()
            .await?;
        match resp.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let body = resp.bytes().await?;
                let update = serde_json::from_slice(&body)
                    .map_err(|e| ApiError::Payload(e.to_string()))?;
                Ok(Some(update))
            }
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            status => Err(ApiError::Status(status)),
        }
    }

    /// Open the artifact download. Returns the body as a chunk source plus
    /// the advertised length (0 when the server did not say).
    pub async fn fetch_update(&self, uri: &str) -> Result<(ResponseSource, u64), ApiError> {
        let resp = self.http.get(uri).send().await?;
        match resp.status() {
            status if status.is_success() => {
                let size = resp.content_length().unwrap_or(0);
                Ok((ResponseSource(resp), size))
            }
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            status => Err(ApiError::Status(status)),
        }
    }

    /// Report deployment progress. A 409 means the server aborted the
    /// deployment and the agent must abandon it.
    pub async fn report_status(
        &self,
        token: &str,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), ApiError> {
        let resp = self
            .http
            .put(self.url(&format!("{DEPLOYMENTS_PATH}/{deployment_id}/status")))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(token)
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            StatusCode::CONFLICT => Err(ApiError::DeploymentAborted),
            status => Err(ApiError::Status(status)),
        }
    }

    pub async fn upload_log(
        &self,
        token: &str,
        deployment_id: &str,
        logs: &serde_json::Value,
    ) -> Result<(), ApiError> {
        let resp = self
            .http
            .put(self.url(&format!("{DEPLOYMENTS_PATH}/{deployment_id}/log")))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(token)
            .json(logs)
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            status => Err(ApiError::Status(status)),
        }
    }

    pub async fn submit_inventory(
        &self,
        token: &str,
        attrs: &[InventoryAttribute],
    ) -> Result<(), ApiError> {
        let resp = self
            .http
            .patch(self.url(INVENTORY_PATH))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(token)
            .json(attrs)
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            status => Err(ApiError::Status(status)),
        }
    }
}

/// Artifact download body exposed as a chunk source. Dropping it closes the
/// underlying connection.
pub struct ResponseSource(reqwest::Response);

#[async_trait]
impl PayloadSource for ResponseSource {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        self.0.chunk().await.map_err(std::io::Error::other)
    }
}
