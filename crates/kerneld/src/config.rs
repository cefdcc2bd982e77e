//! Daemon and session configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use kernel_launch::{ProcessManagerConfig, DEFAULT_PORT_RANGE};
use serde::{Deserialize, Serialize};

/// Default comm target for the UI channel opened on every session.
pub const DEFAULT_UI_COMM_TARGET: &str = "erdos.ui";

/// Per-user state directory (`~/.cache/kerneld` on Linux).
pub fn default_state_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("kerneld")
}

/// Where a running daemon advertises its control endpoint.
pub fn default_endpoint_file() -> PathBuf {
    default_state_dir().join("kerneld.json")
}

/// Configuration for the kernel daemon.
///
/// Every field has a default, so a JSON config file only needs the keys it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Control surface address. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub startup_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub stop_grace_ms: u64,
    pub scratch_root: PathBuf,
    pub resource_dir: Option<PathBuf>,
    pub endpoint_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            port_range_start: *DEFAULT_PORT_RANGE.start(),
            port_range_end: *DEFAULT_PORT_RANGE.end(),
            startup_timeout_ms: 30_000,
            poll_interval_ms: 100,
            stop_grace_ms: 2_000,
            scratch_root: default_state_dir().join("kernels"),
            resource_dir: None,
            endpoint_file: default_endpoint_file(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port_range_start > self.port_range_end {
            anyhow::bail!(
                "port range {}-{} is empty",
                self.port_range_start,
                self.port_range_end
            );
        }
        Ok(())
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }

    pub fn process_config(&self) -> ProcessManagerConfig {
        ProcessManagerConfig {
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            scratch_root: self.scratch_root.clone(),
            resource_dir: self.resource_dir.clone(),
        }
    }
}

/// Per-session protocol settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Target name of the UI comm opened during startup.
    pub ui_comm_target: String,
    /// Bound on each startup handshake step and on `create_client`.
    pub handshake_timeout: Duration,
    pub is_complete_timeout: Duration,
    pub complete_timeout: Duration,
    pub rpc_timeout: Duration,
    /// How long to wait for `shutdown_reply` before tearing down anyway.
    pub shutdown_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ui_comm_target: DEFAULT_UI_COMM_TARGET.to_string(),
            handshake_timeout: Duration::from_secs(10),
            is_complete_timeout: Duration::from_secs(5),
            complete_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}
