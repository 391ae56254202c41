//! Dual-partition device abstraction.
//!
//! The device boots one of two rootfs partitions, selected by the boot
//! environment. An update is written onto the inactive partition and marked
//! *tentative* (`upgrade_available=1`, `boot_part` pointing at it,
//! `bootcount=0`); the bootloader falls back to the old partition unless the
//! agent later confirms the new one with `upgrade_available=0`. A device
//! that comes up with `upgrade_available=1` is running tentative firmware
//! that still needs committing.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::Config;
use crate::kvfile;

/// Verified image bytes, pulled chunk by chunk during installation.
#[async_trait]
pub trait ImageReader: Send {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

#[async_trait]
pub trait Device: Send {
    /// Stream an image onto the inactive partition.
    async fn install_image(&mut self, image: &mut dyn ImageReader) -> Result<()>;
    /// Mark the freshly written partition as the tentative next boot target.
    async fn enable_updated_partition(&mut self) -> Result<()>;
    /// Confirm the currently running partition so the bootloader stops
    /// considering a rollback.
    async fn commit_update(&mut self) -> Result<()>;
    /// True when the device booted into a tentative, not yet committed image.
    async fn has_update_in_progress(&mut self) -> Result<bool>;
    /// Initiate a clean reboot. Returns only on failure.
    async fn reboot(&mut self) -> Result<()>;
}

/// Access to the bootloader environment.
#[async_trait]
pub trait BootEnv: Send {
    async fn read(&mut self, keys: &[&str]) -> Result<HashMap<String, String>>;
    async fn write(&mut self, vars: &[(&str, &str)]) -> Result<()>;
}

/// Boot environment driven by the U-Boot userspace tools.
pub struct UBootEnv {
    printenv: String,
    setenv: String,
}

impl Default for UBootEnv {
    fn default() -> Self {
        Self {
            printenv: "fw_printenv".to_string(),
            setenv: "fw_setenv".to_string(),
        }
    }
}

#[async_trait]
impl BootEnv for UBootEnv {
    async fn read(&mut self, keys: &[&str]) -> Result<HashMap<String, String>> {
        let output = Command::new(&self.printenv)
            .args(keys)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.printenv))?;
        // fw_printenv exits non-zero when any requested variable is unset;
        // whatever it did print is still valid.
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(kvfile::parse_attrs(&stdout).into_iter().collect())
    }

    async fn write(&mut self, vars: &[(&str, &str)]) -> Result<()> {
        for (key, value) in vars {
            let status = Command::new(&self.setenv)
                .arg(key)
                .arg(value)
                .status()
                .await
                .with_context(|| format!("failed to run {}", self.setenv))?;
            if !status.success() {
                bail!("{} {}={} exited with {}", self.setenv, key, value, status);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    A,
    B,
}

impl Slot {
    fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Slot::A => "a",
            Slot::B => "b",
        }
    }
}

/// Production device: two raw rootfs partitions plus a boot environment.
pub struct BlockDevice {
    part_a: String,
    part_b: String,
    env: Box<dyn BootEnv>,
}

impl BlockDevice {
    pub fn new(
        part_a: impl Into<String>,
        part_b: impl Into<String>,
        env: Box<dyn BootEnv>,
    ) -> Self {
        Self {
            part_a: part_a.into(),
            part_b: part_b.into(),
            env,
        }
    }

    pub fn from_config(config: &Config, env: Box<dyn BootEnv>) -> Self {
        Self::new(
            config.device.rootfs_part_a.clone(),
            config.device.rootfs_part_b.clone(),
            env,
        )
    }

    async fn active_slot(&mut self) -> Result<Slot> {
        let vars = self.env.read(&["boot_part"]).await?;
        match vars.get("boot_part").map(String::as_str) {
            Some("a") | None => Ok(Slot::A),
            Some("b") => Ok(Slot::B),
            Some(other) => bail!("unrecognized boot_part value {other:?}"),
        }
    }

    fn partition(&self, slot: Slot) -> &str {
        match slot {
            Slot::A => &self.part_a,
            Slot::B => &self.part_b,
        }
    }
}

#[async_trait]
impl Device for BlockDevice {
    async fn install_image(&mut self, image: &mut dyn ImageReader) -> Result<()> {
        let target_slot = self.active_slot().await?.other();
        let target = self.partition(target_slot).to_string();
        info!(partition = %target, "writing image to inactive partition");

        let mut out = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target)
            .await
            .with_context(|| format!("failed to open partition {target}"))?;

        let mut written: u64 = 0;
        while let Some(chunk) = image.next_chunk().await? {
            out.write_all(&chunk)
                .await
                .with_context(|| format!("write to {target} failed"))?;
            written += chunk.len() as u64;
        }
        out.sync_all()
            .await
            .with_context(|| format!("sync of {target} failed"))?;
        info!(partition = %target, bytes = written, "image written");
        Ok(())
    }

    async fn enable_updated_partition(&mut self) -> Result<()> {
        let target = self.active_slot().await?.other();
        debug!(slot = target.as_str(), "marking partition tentative");
        self.env
            .write(&[
                ("upgrade_available", "1"),
                ("boot_part", target.as_str()),
                ("bootcount", "0"),
            ])
            .await
    }

    async fn commit_update(&mut self) -> Result<()> {
        debug!("confirming running partition");
        self.env.write(&[("upgrade_available", "0")]).await
    }

    async fn has_update_in_progress(&mut self) -> Result<bool> {
        let vars = self.env.read(&["upgrade_available"]).await?;
        Ok(vars.get("upgrade_available").map(String::as_str) == Some("1"))
    }

    async fn reboot(&mut self) -> Result<()> {
        info!("requesting reboot");
        let status = Command::new("reboot")
            .status()
            .await
            .context("failed to run reboot")?;
        if !status.success() {
            bail!("reboot exited with {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MemBootEnv {
        vars: Arc<Mutex<HashMap<String, String>>>,
    }

    #[async_trait]
    impl BootEnv for MemBootEnv {
        async fn read(&mut self, keys: &[&str]) -> Result<HashMap<String, String>> {
            let vars = self.vars.lock().unwrap();
            Ok(keys
                .iter()
                .filter_map(|k| vars.get(*k).map(|v| (k.to_string(), v.clone())))
                .collect())
        }

        async fn write(&mut self, pairs: &[(&str, &str)]) -> Result<()> {
            let mut vars = self.vars.lock().unwrap();
            for (k, v) in pairs {
                vars.insert(k.to_string(), v.to_string());
            }
            Ok(())
        }
    }

    struct VecImage {
        chunks: Vec<Bytes>,
    }

    #[async_trait]
    impl ImageReader for VecImage {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
            if self.chunks.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.chunks.remove(0)))
            }
        }
    }

    fn test_device(td: &tempfile::TempDir, env: MemBootEnv) -> BlockDevice {
        BlockDevice::new(
            td.path().join("part_a").display().to_string(),
            td.path().join("part_b").display().to_string(),
            Box::new(env),
        )
    }

    #[tokio::test]
    async fn test_install_writes_inactive_partition() {
        let td = tempfile::tempdir().unwrap();
        let env = MemBootEnv::default();
        env.vars
            .lock()
            .unwrap()
            .insert("boot_part".to_string(), "a".to_string());
        let mut device = test_device(&td, env);

        let mut image = VecImage {
            chunks: vec![Bytes::from_static(b"new "), Bytes::from_static(b"rootfs")],
        };
        device.install_image(&mut image).await.unwrap();

        let written = std::fs::read(td.path().join("part_b")).unwrap();
        assert_eq!(written, b"new rootfs");
        assert!(!td.path().join("part_a").exists());
    }

    #[tokio::test]
    async fn test_enable_marks_other_slot_tentative() {
        let td = tempfile::tempdir().unwrap();
        let env = MemBootEnv::default();
        env.vars
            .lock()
            .unwrap()
            .insert("boot_part".to_string(), "a".to_string());
        let mut device = test_device(&td, env.clone());

        device.enable_updated_partition().await.unwrap();
        let vars = env.vars.lock().unwrap().clone();
        assert_eq!(vars.get("boot_part").unwrap(), "b");
        assert_eq!(vars.get("upgrade_available").unwrap(), "1");
        assert_eq!(vars.get("bootcount").unwrap(), "0");
    }

    #[tokio::test]
    async fn test_commit_clears_upgrade_flag() {
        let td = tempfile::tempdir().unwrap();
        let env = MemBootEnv::default();
        env.vars
            .lock()
            .unwrap()
            .insert("upgrade_available".to_string(), "1".to_string());
        let mut device = test_device(&td, env.clone());

        assert!(device.has_update_in_progress().await.unwrap());
        device.commit_update().await.unwrap();
        assert!(!device.has_update_in_progress().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_boot_part_defaults_to_slot_a() {
        let td = tempfile::tempdir().unwrap();
        let mut device = test_device(&td, MemBootEnv::default());
        assert_eq!(device.active_slot().await.unwrap(), Slot::A);
    }

    #[tokio::test]
    async fn test_bogus_boot_part_rejected() {
        let td = tempfile::tempdir().unwrap();
        let env = MemBootEnv::default();
        env.vars
            .lock()
            .unwrap()
            .insert("boot_part".to_string(), "c".to_string());
        let mut device = test_device(&td, env);
        assert!(device.active_slot().await.is_err());
    }
}
