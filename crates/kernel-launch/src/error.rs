//! Error types for kernel launching.

use std::path::PathBuf;
use std::time::Duration;

use crate::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Ports(#[from] PortError),

    #[error("Failed to create scratch directory {path:?}: {source}")]
    ScratchDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Kernel launch spec has an empty argv")]
    EmptyCommand,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Kernel did not accept connections on port {port} within {timeout:?}")]
    StartupTimeout { port: u16, timeout: Duration },

    #[error("Kernel exited during startup (exit code {code:?})")]
    ExitedDuringStartup { code: Option<i32> },

    #[error("Session {0} already has a running kernel")]
    AlreadyRunning(String),
}

impl LaunchError {
    pub fn is_port_exhausted(&self) -> bool {
        matches!(self, LaunchError::Ports(PortError::Exhausted { .. }))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid kernel spec {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}
