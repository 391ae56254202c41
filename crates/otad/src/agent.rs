//! The controller facade consumed by the state machine.
//!
//! [`Controller`] is the full capability surface (bootstrap, authorization,
//! update check, artifact streaming, partition installation, status
//! reporting, commit) and [`Agent`] is its production implementor,
//! composing the server client, the dual-partition device, the key store,
//! and the persistent store. States never talk to those collaborators
//! directly; everything they can do is on this trait, which is what makes
//! the state machine testable against a scripted mock.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use ed25519_dalek::pkcs8::spki::DecodePublicKey;
use ed25519_dalek::VerifyingKey;
use ota_artifact::{ArtifactReader, PayloadSource};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::{self, IdentityData};
use crate::client::{ApiClient, ApiError, CurrentUpdate, DeploymentStatus, UpdateResponse};
use crate::config::Config;
use crate::device::{Device, ImageReader};
use crate::error::AgentError;
use crate::inventory;
use crate::keystore::{Keystore, KeystoreError};
use crate::kvfile;
use crate::store::{Store, StoreError, AUTH_TOKEN_KEY, DEPLOYMENT_KEY};

/// An open artifact download. Ownership passes to the install step, which
/// drains it; dropping it on any exit path closes the connection.
pub type ImageStream = Box<dyn PayloadSource>;

/// Cause carried by the transient error `check_update` returns when the
/// offered artifact is the one already running. The accompanying response
/// lets callers identify the deployment; they distinguish the condition by
/// downcasting the cause, not by inspecting the message.
#[derive(Debug, Error)]
#[error("update already installed")]
pub struct UpdateAlreadyInstalled {
    pub update: UpdateResponse,
}

#[async_trait]
pub trait Controller: Send {
    async fn bootstrap(&mut self) -> Result<(), AgentError>;
    /// Make the next `bootstrap` regenerate the device key.
    fn force_bootstrap(&mut self);
    async fn authorize(&mut self) -> Result<(), AgentError>;
    async fn check_update(&mut self) -> Result<Option<UpdateResponse>, AgentError>;
    async fn fetch_update(&mut self, uri: &str) -> Result<(ImageStream, u64), AgentError>;
    async fn install_update(&mut self, image: ImageStream, size: u64) -> Result<(), AgentError>;
    async fn enable_updated_partition(&mut self) -> Result<(), AgentError>;
    async fn commit_update(&mut self) -> Result<(), AgentError>;
    async fn reboot(&mut self) -> Result<(), AgentError>;
    async fn report_update_status(
        &mut self,
        update: &UpdateResponse,
        status: DeploymentStatus,
    ) -> Result<(), AgentError>;
    async fn upload_log(
        &mut self,
        update: &UpdateResponse,
        logs: &serde_json::Value,
    ) -> Result<(), AgentError>;
    async fn has_upgrade(&mut self) -> Result<bool, AgentError>;
    /// Persist the in-flight deployment descriptor so the post-reboot commit
    /// can report against the right deployment ID.
    async fn store_deployment(&mut self, update: &UpdateResponse) -> Result<(), AgentError>;
    async fn stored_deployment(&mut self) -> Option<UpdateResponse>;
    fn update_poll_interval(&self) -> Duration;
    fn inventory_poll_interval(&self) -> Duration;
    fn current_artifact_name(&self) -> Result<String, AgentError>;
    async fn inventory_refresh(&mut self) -> Result<(), AgentError>;
}

pub struct Agent {
    config: Config,
    store: Box<dyn Store>,
    device: Box<dyn Device>,
    client: ApiClient,
    keystore: Keystore,
    identity: IdentityData,
    auth_token: Option<String>,
    force_bootstrap: bool,
    artifact_trust_key: Option<VerifyingKey>,
}

impl Agent {
    pub fn new(
        config: Config,
        store: Box<dyn Store>,
        device: Box<dyn Device>,
    ) -> anyhow::Result<Self> {
        let client = ApiClient::new(&config.server.url)
            .map_err(|e| anyhow!("failed to build API client: {e}"))?;

        let mut keystore = Keystore::new();
        match keystore.load(store.as_ref()) {
            Ok(()) => debug!("device key loaded"),
            Err(KeystoreError::NoKeys) => {
                debug!("no device key yet; bootstrap will generate one")
            }
            Err(e) => warn!("failed to load device key, will regenerate: {e}"),
        }

        let identity = IdentityData::collect(&config);
        if identity.is_empty() {
            warn!("no identity attributes available; authorization will likely be rejected");
        }

        let artifact_trust_key = match &config.device.artifact_verify_key {
            Some(path) => {
                let pem = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read artifact verify key {path}"))?;
                Some(
                    VerifyingKey::from_public_key_pem(&pem)
                        .map_err(|e| anyhow!("bad artifact verify key {path}: {e}"))?,
                )
            }
            None => None,
        };

        Ok(Self {
            config,
            store,
            device,
            client,
            keystore,
            identity,
            auth_token: None,
            force_bootstrap: false,
            artifact_trust_key,
        })
    }

    pub fn needs_bootstrap(&self) -> bool {
        !self.keystore.has_key()
    }

    fn device_type(&self) -> Result<String, AgentError> {
        kvfile::lookup(Path::new(&self.config.device.device_type_file), "device_type")
            .map(|v| v.unwrap_or_default())
            .map_err(AgentError::fatal)
    }

    fn clear_auth_token(&mut self) {
        self.auth_token = None;
        if let Err(e) = self.store.remove(AUTH_TOKEN_KEY) {
            warn!("failed to remove cached auth token: {e}");
        }
    }

    fn token(&mut self) -> Result<String, AgentError> {
        if let Some(token) = &self.auth_token {
            return Ok(token.clone());
        }
        match self.store.read(AUTH_TOKEN_KEY) {
            Ok(raw) => {
                let token = String::from_utf8_lossy(&raw).into_owned();
                self.auth_token = Some(token.clone());
                Ok(token)
            }
            Err(_) => Err(AgentError::transient(anyhow!("no auth token available"))),
        }
    }

    /// Map an API failure to an `AgentError`, clearing the cached token when
    /// the server no longer accepts it.
    fn handle_api_error(&mut self, err: ApiError) -> AgentError {
        if matches!(err, ApiError::Unauthorized) {
            info!("server rejected auth token; clearing cached token");
            self.clear_auth_token();
        }
        err.into_agent_error()
    }
}

/// Artifact stream after header validation; hands verified payload chunks to
/// the device.
struct VerifiedImage(ArtifactReader<ImageStream>);

#[async_trait]
impl ImageReader for VerifiedImage {
    async fn next_chunk(&mut self) -> anyhow::Result<Option<Bytes>> {
        Ok(self.0.next_payload_chunk().await?)
    }
}

#[async_trait]
impl Controller for Agent {
    async fn bootstrap(&mut self) -> Result<(), AgentError> {
        if !self.needs_bootstrap() && !self.force_bootstrap {
            debug!("device key present, bootstrap not needed");
            return Ok(());
        }

        info!(regenerate = self.force_bootstrap, "generating device key");
        self.keystore.generate();
        match self.keystore.save(self.store.as_mut()) {
            Ok(()) => {
                self.force_bootstrap = false;
                info!("device key persisted");
                Ok(())
            }
            Err(e @ KeystoreError::Store(StoreError::ReadOnly))
            | Err(e @ KeystoreError::Store(StoreError::Disabled)) => Err(AgentError::fatal(e)),
            Err(KeystoreError::Store(e)) => Err(AgentError::transient(e)),
            Err(e) => Err(AgentError::fatal(e)),
        }
    }

    fn force_bootstrap(&mut self) {
        self.force_bootstrap = true;
    }

    async fn authorize(&mut self) -> Result<(), AgentError> {
        if self.auth_token.is_some() {
            debug!("already authorized");
            return Ok(());
        }
        if let Ok(raw) = self.store.read(AUTH_TOKEN_KEY) {
            debug!("using cached auth token");
            self.auth_token = Some(String::from_utf8_lossy(&raw).into_owned());
            return Ok(());
        }

        if !self.keystore.has_key() {
            // Without key material there is nothing to sign with and no
            // amount of retrying will fix it.
            return Err(AgentError::fatal(anyhow!(
                "cannot authorize without a device key"
            )));
        }

        let (body, signature) = auth::build_auth_request(
            &self.keystore,
            &self.identity,
            self.config.server.tenant_token.as_deref(),
        )
        .map_err(AgentError::fatal)?;

        match self.client.authorize(&body, &signature).await {
            Ok(raw) => {
                let token = String::from_utf8_lossy(&raw).into_owned();
                if let Err(e) = self.store.write(AUTH_TOKEN_KEY, token.as_bytes()) {
                    warn!("failed to cache auth token: {e}");
                }
                self.auth_token = Some(token);
                info!("device authorized");
                Ok(())
            }
            Err(ApiError::Unauthorized) => Err(AgentError::transient(anyhow!(
                "authorization denied by server"
            ))),
            Err(e) => Err(e.into_agent_error()),
        }
    }

    async fn check_update(&mut self) -> Result<Option<UpdateResponse>, AgentError> {
        let artifact_name = self.current_artifact_name()?;
        let device_type = self.device_type()?;
        let current = CurrentUpdate {
            artifact_name: artifact_name.clone(),
            device_type,
        };

        let token = self.token()?;
        let update = match self.client.check_update(&token, &current).await {
            Ok(update) => update,
            Err(e) => return Err(self.handle_api_error(e)),
        };

        let Some(update) = update else {
            debug!("no deployment pending");
            return Ok(None);
        };

        if !artifact_name.is_empty() && update.artifact.artifact_name == artifact_name {
            info!(artifact = %artifact_name, "offered update is already installed");
            // Tell the server so it can close out the deployment instead of
            // re-offering it forever.
            if let Err(e) = self
                .client
                .report_status(&token, &update.id, DeploymentStatus::AlreadyInstalled)
                .await
            {
                warn!("failed to report already-installed status: {e}");
            }
            return Err(AgentError::transient(UpdateAlreadyInstalled { update }));
        }

        info!(
            deployment = %update.id,
            artifact = %update.artifact.artifact_name,
            "new deployment available"
        );
        Ok(Some(update))
    }

    async fn fetch_update(&mut self, uri: &str) -> Result<(ImageStream, u64), AgentError> {
        debug!(%uri, "fetching artifact");
        match self.client.fetch_update(uri).await {
            Ok((source, size)) => Ok((Box::new(source) as ImageStream, size)),
            Err(e) => Err(self.handle_api_error(e)),
        }
    }

    async fn install_update(&mut self, image: ImageStream, size: u64) -> Result<(), AgentError> {
        let device_type = self.device_type()?;
        if size > 0 {
            debug!(bytes = size, "installing artifact");
        } else {
            debug!("installing artifact of unknown length, reading to end of stream");
        }

        let artifact = ArtifactReader::open(image, self.artifact_trust_key.as_ref())
            .await
            .map_err(AgentError::transient)?;
        artifact
            .ensure_compatible(&device_type)
            .map_err(AgentError::transient)?;

        let mut verified = VerifiedImage(artifact);
        self.device
            .install_image(&mut verified)
            .await
            .map_err(AgentError::transient)?;
        info!("artifact installed onto inactive partition");
        Ok(())
    }

    async fn enable_updated_partition(&mut self) -> Result<(), AgentError> {
        self.device
            .enable_updated_partition()
            .await
            .map_err(AgentError::transient)
    }

    async fn commit_update(&mut self) -> Result<(), AgentError> {
        // A failed commit means the next reboot rolls back; retrying in a
        // loop cannot help, so this is fatal by classification.
        self.device.commit_update().await.map_err(AgentError::fatal)?;
        if let Err(e) = self.store.remove(DEPLOYMENT_KEY) {
            warn!("failed to drop deployment record: {e}");
        }
        info!("update committed");
        Ok(())
    }

    async fn reboot(&mut self) -> Result<(), AgentError> {
        self.device.reboot().await.map_err(AgentError::fatal)
    }

    async fn report_update_status(
        &mut self,
        update: &UpdateResponse,
        status: DeploymentStatus,
    ) -> Result<(), AgentError> {
        if update.id.is_empty() {
            warn!(status = %status, "no deployment id on record, skipping status report");
            return Ok(());
        }
        let token = self.token()?;
        info!(deployment = %update.id, status = %status, "reporting deployment status");
        match self.client.report_status(&token, &update.id, status).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.handle_api_error(e)),
        }
    }

    async fn upload_log(
        &mut self,
        update: &UpdateResponse,
        logs: &serde_json::Value,
    ) -> Result<(), AgentError> {
        if update.id.is_empty() {
            return Ok(());
        }
        let token = self.token()?;
        match self.client.upload_log(&token, &update.id, logs).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.handle_api_error(e)),
        }
    }

    async fn has_upgrade(&mut self) -> Result<bool, AgentError> {
        self.device
            .has_update_in_progress()
            .await
            .map_err(AgentError::transient)
    }

    async fn store_deployment(&mut self, update: &UpdateResponse) -> Result<(), AgentError> {
        let raw = serde_json::to_vec(update)
            .map_err(|e| AgentError::transient(anyhow!("failed to encode deployment record: {e}")))?;
        self.store
            .write(DEPLOYMENT_KEY, &raw)
            .map_err(AgentError::transient)
    }

    async fn stored_deployment(&mut self) -> Option<UpdateResponse> {
        let raw = self.store.read(DEPLOYMENT_KEY).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(update) => Some(update),
            Err(e) => {
                warn!("discarding unreadable deployment record: {e}");
                None
            }
        }
    }

    fn update_poll_interval(&self) -> Duration {
        self.config.update_poll_interval()
    }

    fn inventory_poll_interval(&self) -> Duration {
        self.config.inventory_poll_interval()
    }

    fn current_artifact_name(&self) -> Result<String, AgentError> {
        // A broken artifact-info file is a provisioning problem, not
        // something a retry loop can repair.
        kvfile::lookup(
            Path::new(&self.config.device.artifact_info_file),
            "artifact_name",
        )
        .map(|v| v.unwrap_or_default())
        .map_err(AgentError::fatal)
    }

    async fn inventory_refresh(&mut self) -> Result<(), AgentError> {
        let device_type = self.device_type()?;
        let artifact_name = self.current_artifact_name()?;
        let mut attrs = inventory::builtin_attributes(
            &device_type,
            if artifact_name.is_empty() {
                "unknown"
            } else {
                &artifact_name
            },
        );
        attrs.extend(inventory::gather(&self.config.inventory_dir()).await);

        let token = self.token()?;
        match self.client.submit_inventory(&token, &attrs).await {
            Ok(()) => {
                debug!(attributes = attrs.len(), "inventory submitted");
                Ok(())
            }
            Err(e) => Err(self.handle_api_error(e)),
        }
    }
}
