//! Device identity key management.
//!
//! The device authenticates to the deployment server with an ed25519
//! keypair, generated on first bootstrap and persisted as PKCS#8 PEM under
//! the `device-key` store entry. Losing the key means re-bootstrapping and
//! re-accepting the device server-side, so the key is only ever regenerated
//! on an explicit force-bootstrap.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::spki::EncodePublicKey;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signer, SigningKey};
use thiserror::Error;

use crate::store::{Store, StoreError, DEVICE_KEY_NAME};

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("no device key loaded")]
    NoKeys,
    #[error("malformed device key: {0}")]
    Malformed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Default)]
pub struct Keystore {
    key: Option<SigningKey>,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Load the private key from the store. Missing key material is reported
    /// as [`KeystoreError::NoKeys`] so bootstrap can tell "generate one" from
    /// "storage is broken".
    pub fn load(&mut self, store: &dyn Store) -> Result<(), KeystoreError> {
        let pem = match store.read(DEVICE_KEY_NAME) {
            Ok(data) => data,
            Err(StoreError::NoSuchKey(_)) => return Err(KeystoreError::NoKeys),
            Err(e) => return Err(e.into()),
        };
        let pem = String::from_utf8(pem)
            .map_err(|e| KeystoreError::Malformed(format!("key is not valid UTF-8: {e}")))?;
        self.key = Some(
            SigningKey::from_pkcs8_pem(&pem)
                .map_err(|e| KeystoreError::Malformed(e.to_string()))?,
        );
        Ok(())
    }

    /// Generate a fresh keypair, replacing any loaded key. Not persisted
    /// until [`Keystore::save`].
    pub fn generate(&mut self) {
        self.key = Some(SigningKey::from_bytes(&rand::random::<[u8; 32]>()));
    }

    pub fn save(&self, store: &mut dyn Store) -> Result<(), KeystoreError> {
        let key = self.key.as_ref().ok_or(KeystoreError::NoKeys)?;
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeystoreError::Malformed(e.to_string()))?;
        store.write(DEVICE_KEY_NAME, pem.as_bytes())?;
        Ok(())
    }

    /// Sign `data`, returning the base64 signature carried in auth requests.
    pub fn sign(&self, data: &[u8]) -> Result<String, KeystoreError> {
        let key = self.key.as_ref().ok_or(KeystoreError::NoKeys)?;
        Ok(BASE64.encode(key.sign(data).to_bytes()))
    }

    pub fn public_key_pem(&self) -> Result<String, KeystoreError> {
        let key = self.key.as_ref().ok_or(KeystoreError::NoKeys)?;
        key.verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeystoreError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use ed25519_dalek::{Signature, Verifier};

    #[test]
    fn test_generate_save_load_roundtrip() {
        let mut store = MemStore::new();
        let mut ks = Keystore::new();
        assert!(!ks.has_key());
        assert!(matches!(ks.load(&store), Err(KeystoreError::NoKeys)));

        ks.generate();
        ks.save(&mut store).unwrap();
        let pem = store.read(DEVICE_KEY_NAME).unwrap();
        assert!(std::str::from_utf8(&pem)
            .unwrap()
            .contains("BEGIN PRIVATE KEY"));

        let original_pub = ks.public_key_pem().unwrap();

        let mut reloaded = Keystore::new();
        reloaded.load(&store).unwrap();
        assert_eq!(reloaded.public_key_pem().unwrap(), original_pub);
    }

    #[test]
    fn test_sign_verifies_against_public_key() {
        use base64::Engine;

        let mut ks = Keystore::new();
        ks.generate();

        let sig_b64 = ks.sign(b"auth request body").unwrap();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(sig_b64)
            .unwrap();
        let sig = Signature::from_slice(&raw).unwrap();

        // Recover the verifying key through the PEM surface.
        use ed25519_dalek::pkcs8::spki::DecodePublicKey;
        let pubkey =
            ed25519_dalek::VerifyingKey::from_public_key_pem(&ks.public_key_pem().unwrap())
                .unwrap();
        pubkey.verify(b"auth request body", &sig).unwrap();
    }

    #[test]
    fn test_save_to_read_only_store_fails() {
        let mut store = MemStore::new();
        store.set_read_only(true);

        let mut ks = Keystore::new();
        ks.generate();
        assert!(matches!(
            ks.save(&mut store),
            Err(KeystoreError::Store(StoreError::ReadOnly))
        ));
    }

    #[test]
    fn test_sign_without_key_fails() {
        let ks = Keystore::new();
        assert!(matches!(ks.sign(b"data"), Err(KeystoreError::NoKeys)));
    }

    #[test]
    fn test_malformed_key_in_store() {
        let mut store = MemStore::new();
        store.write(DEVICE_KEY_NAME, b"not a pem").unwrap();

        let mut ks = Keystore::new();
        assert!(matches!(ks.load(&store), Err(KeystoreError::Malformed(_))));
    }
}
