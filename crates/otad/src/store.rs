//! Persistent key-value store.
//!
//! The agent keeps a handful of small records on disk: the device key, the
//! cached auth token, and the in-flight deployment descriptor. [`DirStore`]
//! maps each key to one file under the data directory and writes atomically
//! (tempfile in the same directory, then rename) so a power cut never leaves
//! a half-written record. [`MemStore`] backs tests and can simulate
//! read-only and unavailable storage.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use thiserror::Error;

/// Store key for the cached authorization token.
pub const AUTH_TOKEN_KEY: &str = "authtoken";
/// Store key for the PEM-encoded device private key.
pub const DEVICE_KEY_NAME: &str = "device-key";
/// Store key for the persisted in-flight deployment descriptor.
pub const DEPLOYMENT_KEY: &str = "deployment";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such key: {0}")]
    NoSuchKey(String),
    #[error("store is read-only")]
    ReadOnly,
    #[error("store is unavailable")]
    Disabled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait Store: Send {
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

/// One file per key under a directory.
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Store for DirStore {
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match std::fs::read(self.dir.join(key)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NoSuchKey(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        // Tempfile in the same directory so the final rename stays on one
        // filesystem and is atomic.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(map_write_err)?;
        tmp.write_all(data).map_err(map_write_err)?;
        tmp.as_file().sync_all().map_err(map_write_err)?;
        tmp.persist(self.dir.join(key))
            .map_err(|e| map_write_err(e.error))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.dir.join(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn map_write_err(e: std::io::Error) -> StoreError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        StoreError::ReadOnly
    } else {
        e.into()
    }
}

/// In-memory store with fault toggles, for tests.
#[derive(Default)]
pub struct MemStore {
    entries: HashMap<String, Vec<u8>>,
    read_only: bool,
    disabled: bool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }
}

impl Store for MemStore {
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        if self.disabled {
            return Err(StoreError::Disabled);
        }
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchKey(key.to_string()))
    }

    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        if self.disabled {
            return Err(StoreError::Disabled);
        }
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.entries.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        if self.disabled {
            return Err(StoreError::Disabled);
        }
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_store_roundtrip() {
        let td = tempfile::tempdir().unwrap();
        let mut store = DirStore::new(td.path());

        assert!(matches!(
            store.read(AUTH_TOKEN_KEY),
            Err(StoreError::NoSuchKey(_))
        ));

        store.write(AUTH_TOKEN_KEY, b"tokendata").unwrap();
        assert_eq!(store.read(AUTH_TOKEN_KEY).unwrap(), b"tokendata");

        store.write(AUTH_TOKEN_KEY, b"newer").unwrap();
        assert_eq!(store.read(AUTH_TOKEN_KEY).unwrap(), b"newer");

        store.remove(AUTH_TOKEN_KEY).unwrap();
        assert!(matches!(
            store.read(AUTH_TOKEN_KEY),
            Err(StoreError::NoSuchKey(_))
        ));
        // Removing a missing key is not an error.
        store.remove(AUTH_TOKEN_KEY).unwrap();
    }

    #[test]
    fn test_mem_store_read_only() {
        let mut store = MemStore::new();
        store.write("k", b"v").unwrap();

        store.set_read_only(true);
        assert!(matches!(store.write("k", b"w"), Err(StoreError::ReadOnly)));
        assert_eq!(store.read("k").unwrap(), b"v");

        store.set_read_only(false);
        store.write("k", b"w").unwrap();
        assert_eq!(store.read("k").unwrap(), b"w");
    }

    #[test]
    fn test_mem_store_disabled() {
        let mut store = MemStore::new();
        store.set_disabled(true);
        assert!(matches!(store.read("k"), Err(StoreError::Disabled)));
        assert!(matches!(store.write("k", b"v"), Err(StoreError::Disabled)));
    }
}
