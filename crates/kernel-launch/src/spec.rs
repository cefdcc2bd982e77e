//! Kernel launch specs and `kernel.json` discovery.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kernel_wire::KernelFamily;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::SpecError;

const WEBSOCKET_PORT: &str = "{websocket_port}";
const LOG_FILE: &str = "{log_file}";
const PROFILE_FILE: &str = "{profile_file}";
const RESOURCE_DIR: &str = "{resource_dir}";

/// How to start a kernel. Loaded from `kernel.json` or built by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelLaunchSpec {
    pub language: String,
    #[serde(default)]
    pub display_name: String,
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub family: KernelFamily,
    /// The kernel serves its control channel on `websocket_port + 1`.
    #[serde(default = "default_true")]
    pub control_channel: bool,
}

fn default_true() -> bool {
    true
}

/// Values substituted into the argv template for one launch.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub websocket_port: u16,
    pub log_file: PathBuf,
    pub profile_file: PathBuf,
    pub resource_dir: PathBuf,
}

impl LaunchContext {
    /// Context rooted at a kernel's scratch directory.
    pub fn in_scratch(scratch: &Path, websocket_port: u16, resource_dir: Option<&Path>) -> Self {
        Self {
            websocket_port,
            log_file: scratch.join("kernel.log"),
            profile_file: scratch.join("profile"),
            resource_dir: resource_dir.map_or_else(|| scratch.to_path_buf(), Path::to_path_buf),
        }
    }

    fn substitute(&self, arg: &str) -> String {
        arg.replace(WEBSOCKET_PORT, &self.websocket_port.to_string())
            .replace(LOG_FILE, &self.log_file.to_string_lossy())
            .replace(PROFILE_FILE, &self.profile_file.to_string_lossy())
            .replace(RESOURCE_DIR, &self.resource_dir.to_string_lossy())
    }
}

impl KernelLaunchSpec {
    pub fn new(language: impl Into<String>, argv: Vec<String>) -> Self {
        let language = language.into();
        Self {
            display_name: language.clone(),
            language,
            argv,
            env: BTreeMap::new(),
            working_dir: None,
            family: KernelFamily::default(),
            control_channel: true,
        }
    }

    /// Number of consecutive ports the kernel listens on.
    pub fn port_count(&self) -> u16 {
        if self.control_channel {
            2
        } else {
            1
        }
    }

    /// The argv with every placeholder replaced.
    pub fn resolve_args(&self, ctx: &LaunchContext) -> Vec<String> {
        self.argv.iter().map(|arg| ctx.substitute(arg)).collect()
    }

    pub async fn from_file(path: &Path) -> Result<Self, SpecError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| SpecError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| SpecError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Directories searched for `<name>/kernel.json`, most specific first.
pub fn kernelspec_dirs() -> Vec<PathBuf> {
    let mut dirs_out = Vec::new();
    if let Some(config) = dirs::config_dir() {
        dirs_out.push(config.join("kerneld").join("kernels"));
    }
    if let Some(data) = dirs::data_dir() {
        dirs_out.push(data.join("kerneld").join("kernels"));
    }
    dirs_out
}

/// All readable specs under `dirs`, keyed by directory name. Unreadable or
/// malformed specs are skipped with a warning.
pub async fn list_kernelspecs(dirs: &[PathBuf]) -> Vec<(String, KernelLaunchSpec)> {
    let mut found = Vec::new();
    for dir in dirs {
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            continue;
        };
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        for name in names {
            let path = dir.join(&name).join("kernel.json");
            if !path.exists() {
                continue;
            }
            match KernelLaunchSpec::from_file(&path).await {
                Ok(spec) => found.push((name, spec)),
                Err(e) => warn!("[kernelspec] Skipping {}: {}", path.display(), e),
            }
        }
    }
    found
}

/// First spec whose language matches (case-insensitive).
pub async fn find_kernelspec(language: &str, dirs: &[PathBuf]) -> Option<KernelLaunchSpec> {
    list_kernelspecs(dirs)
        .await
        .into_iter()
        .map(|(_, spec)| spec)
        .find(|spec| spec.language.eq_ignore_ascii_case(language))
}
