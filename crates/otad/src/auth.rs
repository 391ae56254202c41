//! Device identity and authorization requests.
//!
//! The device proves who it is with a JSON identity blob (device type plus
//! machine id) and an ed25519 signature over the whole request body. The
//! server answers with an opaque token the agent presents on every
//! subsequent call.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::keystore::{Keystore, KeystoreError};
use crate::kvfile;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
    #[error("failed to encode auth request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Identity attributes, ordered so the serialized form is stable across runs.
#[derive(Debug, Clone, Default)]
pub struct IdentityData {
    attrs: BTreeMap<String, String>,
}

impl IdentityData {
    /// Gather identity from the device-type file and the machine id. Missing
    /// sources are skipped; identity may legitimately be sparse on first
    /// boot.
    pub fn collect(config: &Config) -> Self {
        let mut attrs = BTreeMap::new();

        match kvfile::lookup(
            std::path::Path::new(&config.device.device_type_file),
            "device_type",
        ) {
            Ok(Some(device_type)) => {
                attrs.insert("device_type".to_string(), device_type);
            }
            Ok(None) => {}
            Err(e) => debug!("device type unavailable for identity: {e}"),
        }

        for candidate in [
            config.data_dir().join("machine-id"),
            "/etc/machine-id".into(),
        ] {
            if let Ok(id) = std::fs::read_to_string(&candidate) {
                let id = id.trim();
                if !id.is_empty() {
                    attrs.insert("machine_id".to_string(), id.to_string());
                    break;
                }
            }
        }

        Self { attrs }
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.attrs)
    }

    #[cfg(test)]
    pub fn from_attrs(attrs: &[(&str, &str)]) -> Self {
        Self {
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    id_data: String,
    pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_token: Option<&'a str>,
}

/// Build the signed authorization request: the JSON body and the detached
/// base64 signature that goes into the signature header.
pub fn build_auth_request(
    keystore: &Keystore,
    identity: &IdentityData,
    tenant_token: Option<&str>,
) -> Result<(Vec<u8>, String), AuthError> {
    let request = AuthRequest {
        id_data: identity.to_json()?,
        pubkey: keystore.public_key_pem()?,
        tenant_token,
    };
    let body = serde_json::to_vec(&request)?;
    let signature = keystore.sign(&body)?;
    Ok((body, signature))
}
