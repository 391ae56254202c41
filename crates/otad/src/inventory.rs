//! Inventory gathering.
//!
//! Executables dropped into `<data_dir>/inventory` are run on each refresh;
//! their stdout is parsed as `key=value` lines. Script output is merged with
//! the built-in attributes (device type, running artifact, client version).
//! Duplicate names are allowed and all values are submitted; the server
//! aggregates multi-valued attributes itself.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::kvfile;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAttribute {
    pub name: String,
    pub value: String,
}

impl InventoryAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Attributes every device reports regardless of installed scripts.
pub fn builtin_attributes(device_type: &str, artifact_name: &str) -> Vec<InventoryAttribute> {
    vec![
        InventoryAttribute::new("device_type", device_type),
        InventoryAttribute::new("artifact_name", artifact_name),
        InventoryAttribute::new("client_version", env!("CARGO_PKG_VERSION")),
    ]
}

/// Run every executable in `dir` and collect the attributes they print.
///
/// A missing directory or a misbehaving script is not an error; the refresh
/// proceeds with whatever could be gathered.
pub async fn gather(dir: &Path) -> Vec<InventoryAttribute> {
    let mut scripts: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_executable(p))
            .collect(),
        Err(e) => {
            debug!(dir = %dir.display(), "no inventory scripts: {e}");
            return Vec::new();
        }
    };
    scripts.sort();

    let mut attrs = Vec::new();
    for script in scripts {
        match Command::new(&script).output().await {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                for (name, value) in kvfile::parse_attrs(&stdout) {
                    attrs.push(InventoryAttribute::new(name, value));
                }
            }
            Ok(output) => {
                warn!(
                    script = %script.display(),
                    "inventory script exited with {}",
                    output.status
                );
            }
            Err(e) => {
                warn!(script = %script.display(), "failed to run inventory script: {e}");
            }
        }
    }
    attrs
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
