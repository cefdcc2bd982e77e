//! Discovery file advertising a running daemon's control endpoint.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Information about a running daemon instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonInfo {
    /// `host:port` of the control socket.
    pub endpoint: String,
    pub pid: u32,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

/// Owns the discovery file while the daemon runs; removes it on drop.
#[derive(Debug)]
pub struct EndpointFile {
    path: PathBuf,
}

impl EndpointFile {
    pub fn write(path: &Path, endpoint: &str) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let info = DaemonInfo {
            endpoint: endpoint.to_string(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&info).map_err(std::io::Error::other)?;
        std::fs::write(path, json)?;
        info!("[kerneld] Wrote endpoint file {:?}", path);

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EndpointFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("[kerneld] Failed to remove {:?}: {}", self.path, e);
            }
        }
    }
}

/// Read the discovery file, if a daemon left one.
pub fn read_daemon_info(path: &Path) -> Option<DaemonInfo> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}
