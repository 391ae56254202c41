//! Shared test fixtures: a scripted deployment server speaking just enough
//! HTTP/1.1 for the agent, a fake dual-partition device, and config helpers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use otad::config::Config;
use otad::device::{Device, ImageReader};

const AUTH_PATH: &str = "/api/devices/v1/authentication/auth_requests";
const DEPLOYMENTS_PATH: &str = "/api/devices/v1/deployments/device/deployments";
const INVENTORY_PATH: &str = "/api/devices/v1/inventory/device/attributes";

#[derive(Default)]
pub struct ServerState {
    pub auth_authorize: bool,
    pub auth_token: Vec<u8>,
    pub auth_called: bool,
    /// When set, authenticated endpoints require this bearer token.
    pub expect_token: Option<String>,
    pub update: Option<serde_json::Value>,
    pub update_unauthorized: bool,
    pub status_aborted: bool,
    pub statuses: Vec<(String, String)>,
    pub log_body: Option<serde_json::Value>,
    pub inventory_called: bool,
    pub inventory_attrs: Vec<(String, String)>,
    pub download: Vec<u8>,
}

pub struct TestServer {
    addr: SocketAddr,
    pub state: Arc<Mutex<ServerState>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(ServerState::default()));

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let conn_state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_conn(stream, conn_state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn download_url(&self) -> String {
        format!("{}/download", self.url())
    }
}

async fn handle_conn(
    mut stream: TcpStream,
    state: Arc<Mutex<ServerState>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 64 * 1024 {
            return Ok(());
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();

    let mut content_length = 0usize;
    let mut authorization = String::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "authorization" => authorization = value.trim().to_string(),
                _ => {}
            }
        }
    }

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }

    let path = target.split('?').next().unwrap_or("").to_string();
    let (status, body_out) = route(&method, &path, &authorization, &body, &state);

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
        body_out.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(&body_out).await?;
    stream.shutdown().await?;
    Ok(())
}

fn route(
    method: &str,
    path: &str,
    authorization: &str,
    body: &[u8],
    state: &Arc<Mutex<ServerState>>,
) -> (&'static str, Vec<u8>) {
    let mut st = state.lock().unwrap();

    if method == "POST" && path == AUTH_PATH {
        st.auth_called = true;
        return if st.auth_authorize {
            ("200 OK", st.auth_token.clone())
        } else {
            ("401 Unauthorized", Vec::new())
        };
    }

    let authorized = match &st.expect_token {
        None => true,
        Some(token) => authorization == format!("Bearer {token}"),
    };

    if method == "GET" && path == format!("{DEPLOYMENTS_PATH}/next") {
        if st.update_unauthorized || !authorized {
            return ("401 Unauthorized", Vec::new());
        }
        return match &st.update {
            Some(update) => ("200 OK", serde_json::to_vec(update).unwrap()),
            None => ("204 No Content", Vec::new()),
        };
    }

    if method == "PUT" && path.starts_with(DEPLOYMENTS_PATH) && path.ends_with("/status") {
        if !authorized {
            return ("401 Unauthorized", Vec::new());
        }
        if st.status_aborted {
            return ("409 Conflict", Vec::new());
        }
        let deployment = path.split('/').rev().nth(1).unwrap_or("").to_string();
        let parsed: serde_json::Value = serde_json::from_slice(body).unwrap_or_default();
        let status = parsed["status"].as_str().unwrap_or("").to_string();
        st.statuses.push((deployment, status));
        return ("204 No Content", Vec::new());
    }

    if method == "PUT" && path.starts_with(DEPLOYMENTS_PATH) && path.ends_with("/log") {
        if !authorized {
            return ("401 Unauthorized", Vec::new());
        }
        st.log_body = serde_json::from_slice(body).ok();
        return ("204 No Content", Vec::new());
    }

    if method == "PATCH" && path == INVENTORY_PATH {
        if !authorized {
            return ("401 Unauthorized", Vec::new());
        }
        st.inventory_called = true;
        if let Ok(attrs) = serde_json::from_slice::<Vec<HashMap<String, String>>>(body) {
            st.inventory_attrs = attrs
                .into_iter()
                .filter_map(|a| Some((a.get("name")?.clone(), a.get("value")?.clone())))
                .collect();
        }
        return ("200 OK", Vec::new());
    }

    if method == "GET" && path == "/download" {
        return ("200 OK", st.download.clone());
    }

    ("404 Not Found", Vec::new())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Default)]
pub struct FakeDeviceState {
    pub installed: Vec<u8>,
    pub install_error: Option<String>,
    pub enabled: bool,
    pub committed: bool,
    pub rebooted: bool,
    pub has_update: bool,
    pub has_update_error: Option<String>,
}

/// In-memory device; clones share state so tests can inspect it after the
/// agent takes ownership.
#[derive(Clone, Default)]
pub struct FakeDevice {
    pub state: Arc<Mutex<FakeDeviceState>>,
}

#[async_trait]
impl Device for FakeDevice {
    async fn install_image(&mut self, image: &mut dyn ImageReader) -> anyhow::Result<()> {
        if let Some(msg) = self.state.lock().unwrap().install_error.clone() {
            bail!("{msg}");
        }
        let mut data = Vec::new();
        while let Some(chunk) = image.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        self.state.lock().unwrap().installed = data;
        Ok(())
    }

    async fn enable_updated_partition(&mut self) -> anyhow::Result<()> {
        self.state.lock().unwrap().enabled = true;
        Ok(())
    }

    async fn commit_update(&mut self) -> anyhow::Result<()> {
        self.state.lock().unwrap().committed = true;
        Ok(())
    }

    async fn has_update_in_progress(&mut self) -> anyhow::Result<bool> {
        let st = self.state.lock().unwrap();
        if let Some(msg) = &st.has_update_error {
            bail!("{msg}");
        }
        Ok(st.has_update)
    }

    async fn reboot(&mut self) -> anyhow::Result<()> {
        self.state.lock().unwrap().rebooted = true;
        Ok(())
    }
}

/// Payload source that fails on the first read.
pub struct ErrSource;

#[async_trait]
impl ota_artifact::PayloadSource for ErrSource {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        Err(std::io::Error::other("failed"))
    }
}

/// Config pointed entirely into the test's temp directory.
pub fn test_config(td: &tempfile::TempDir, server_url: &str) -> Config {
    let mut config = Config::default();
    config.server.url = server_url.to_string();
    config.daemon.data_dir = td.path().display().to_string();
    config.device.device_type_file = td.path().join("device_type").display().to_string();
    config.device.artifact_info_file = td.path().join("artifact_info").display().to_string();
    config
}

pub fn write_file(path: impl AsRef<Path>, content: &str) {
    std::fs::write(path, content).unwrap();
}
