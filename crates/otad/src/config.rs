//! Agent configuration.
//!
//! TOML file with compiled-in defaults. Poll intervals are stored as seconds
//! and converted to [`Duration`] on read. The data directory (key material,
//! cached token, deployment record, inventory scripts) can be overridden via
//! the `OTAD_DATA_DIR` environment variable without touching the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const SYSTEM_CONFIG_FILE: &str = "/etc/otad/otad.toml";
pub const DATA_DIR_ENV: &str = "OTAD_DATA_DIR";

const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the deployment server, e.g. `https://updates.example.com`.
    #[serde(default)]
    pub url: String,
    /// Optional tenant token included in authorization requests.
    #[serde(default)]
    pub tenant_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    #[serde(default = "default_inventory_interval")]
    pub inventory_interval_secs: u64,
}

fn default_update_interval() -> u64 {
    1800
}

fn default_inventory_interval() -> u64 {
    28800
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: default_update_interval(),
            inventory_interval_secs: default_inventory_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_type_file: String,
    pub artifact_info_file: String,
    pub rootfs_part_a: String,
    pub rootfs_part_b: String,
    /// PEM public key used to verify artifact signatures. Unset disables
    /// signature enforcement.
    #[serde(default)]
    pub artifact_verify_key: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_type_file: "/var/lib/otad/device_type".to_string(),
            artifact_info_file: "/etc/ota/artifact_info".to_string(),
            rootfs_part_a: "/dev/mmcblk0p2".to_string(),
            rootfs_part_b: "/dev/mmcblk0p3".to_string(),
            artifact_verify_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub data_dir: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: "/var/lib/otad".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Abandon a deployment when a status report cannot be delivered. Off by
    /// default: the server catching up later beats failing a good update.
    #[serde(default)]
    pub fail_deployment_on_report_error: bool,
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).expect("invalid built-in default config")
    }
}

impl Config {
    /// Load configuration from `path` (or the system location), falling back
    /// to built-in defaults when the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let path = path.unwrap_or(Path::new(SYSTEM_CONFIG_FILE));
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn update_poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.update_interval_secs)
    }

    pub fn inventory_poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.inventory_interval_secs)
    }

    /// Data directory, honoring the `OTAD_DATA_DIR` override.
    pub fn data_dir(&self) -> PathBuf {
        match std::env::var(DATA_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from(&self.daemon.data_dir),
        }
    }

    pub fn inventory_dir(&self) -> PathBuf {
        self.data_dir().join("inventory")
    }
}
