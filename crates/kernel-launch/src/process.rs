//! Kernel process lifecycle: spawn, readiness, exit monitoring, teardown.
//!
//! Each spawned kernel gets a monitor task that owns the `Child`. The monitor
//! is the only place that reaps the process, and it always releases the
//! kernel's ports and removes its scratch directory before publishing the
//! exit, so anyone who has observed the exit can rely on cleanup being done.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::LaunchError;
use crate::ports::PortAllocator;
use crate::spec::{KernelLaunchSpec, LaunchContext};
use kernel_wire::KernelFamily;

#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    /// How long to wait for the kernel's listeners to accept connections.
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL when stopping.
    pub stop_grace: Duration,
    /// Parent of the per-kernel scratch directories.
    pub scratch_root: PathBuf,
    pub resource_dir: Option<PathBuf>,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            stop_grace: Duration::from_secs(2),
            scratch_root: std::env::temp_dir().join("kerneld"),
            resource_dir: None,
        }
    }
}

/// How a kernel process ended. `code` is `None` when it was killed by a
/// signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelExit {
    pub code: Option<i32>,
}

/// Serializable snapshot of a kernel, used in listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub kernel_id: String,
    pub session_id: String,
    pub language: String,
    pub display_name: String,
    pub family: KernelFamily,
    pub pid: Option<u32>,
    pub shell_port: u16,
    pub control_port: Option<u16>,
    pub scratch_dir: PathBuf,
    pub alive: bool,
}

struct HandleInner {
    kernel_id: String,
    session_id: String,
    language: String,
    display_name: String,
    family: KernelFamily,
    pid: Option<u32>,
    shell_port: u16,
    control_port: Option<u16>,
    scratch_dir: PathBuf,
    stop_grace: Duration,
    exit_rx: watch::Receiver<Option<KernelExit>>,
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

/// Handle to one running (or exited) kernel process.
///
/// Cheap to clone. When the last clone is dropped the kernel is killed.
#[derive(Clone)]
pub struct KernelProcessHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for KernelProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelProcessHandle")
            .field("kernel_id", &self.inner.kernel_id)
            .field("session_id", &self.inner.session_id)
            .field("pid", &self.inner.pid)
            .field("shell_port", &self.inner.shell_port)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl KernelProcessHandle {
    pub fn kernel_id(&self) -> &str {
        &self.inner.kernel_id
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn family(&self) -> KernelFamily {
        self.inner.family
    }

    pub fn shell_port(&self) -> u16 {
        self.inner.shell_port
    }

    pub fn control_port(&self) -> Option<u16> {
        self.inner.control_port
    }

    pub fn scratch_dir(&self) -> &std::path::Path {
        &self.inner.scratch_dir
    }

    pub fn is_alive(&self) -> bool {
        self.inner.exit_rx.borrow().is_none()
    }

    pub fn exit_status(&self) -> Option<KernelExit> {
        *self.inner.exit_rx.borrow()
    }

    /// Watch that flips to `Some` once the process has exited and its
    /// resources have been released.
    pub fn exit_watch(&self) -> watch::Receiver<Option<KernelExit>> {
        self.inner.exit_rx.clone()
    }

    /// Wait for the process to exit and its resources to be released.
    pub async fn wait(&self) -> KernelExit {
        let mut rx = self.inner.exit_rx.clone();
        let result = rx.wait_for(Option::is_some).await.map(|exit| *exit);
        match result {
            Ok(exit) => exit.unwrap_or_default(),
            // Monitor went away without reporting
            Err(_) => KernelExit::default(),
        }
    }

    /// Kill the process group immediately.
    pub fn kill(&self) {
        let sender = self.inner.kill_tx.lock().ok().and_then(|mut tx| tx.take());
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
    }

    /// SIGTERM the process group, then kill it if it is still running after
    /// the grace period. Returns once cleanup is complete.
    pub async fn terminate(&self) -> KernelExit {
        if let Some(exit) = self.exit_status() {
            return exit;
        }

        #[cfg(unix)]
        if let Some(pid) = self.inner.pid {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        self.kill();

        match tokio::time::timeout(self.inner.stop_grace, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    "[kernel-manager] Kernel {} ignored SIGTERM for {:?}, killing",
                    self.inner.kernel_id, self.inner.stop_grace
                );
                self.kill();
                self.wait().await
            }
        }
    }

    pub fn info(&self) -> KernelInfo {
        KernelInfo {
            kernel_id: self.inner.kernel_id.clone(),
            session_id: self.inner.session_id.clone(),
            language: self.inner.language.clone(),
            display_name: self.inner.display_name.clone(),
            family: self.inner.family,
            pid: self.inner.pid,
            shell_port: self.inner.shell_port,
            control_port: self.inner.control_port,
            scratch_dir: self.inner.scratch_dir.clone(),
            alive: self.is_alive(),
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        if e != nix::errno::Errno::ESRCH {
            error!(
                "[kernel-manager] Failed to send {:?} to process group {}: {}",
                signal, pid, e
            );
        }
    }
}

/// Spawns and tracks kernel processes, one per session.
pub struct KernelProcessManager {
    config: ProcessManagerConfig,
    ports: Arc<PortAllocator>,
    kernels: StdMutex<HashMap<String, KernelProcessHandle>>,
}

impl KernelProcessManager {
    pub fn new(config: ProcessManagerConfig, ports: Arc<PortAllocator>) -> Self {
        Self {
            config,
            ports,
            kernels: StdMutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ProcessManagerConfig {
        &self.config
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Launch a kernel for `session_id` and wait until every listener it
    /// owns accepts TCP connections.
    pub async fn start_kernel(
        &self,
        session_id: &str,
        spec: &KernelLaunchSpec,
    ) -> Result<KernelProcessHandle, LaunchError> {
        if self.get(session_id).is_some() {
            return Err(LaunchError::AlreadyRunning(session_id.to_string()));
        }
        if spec.argv.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }

        let block = spec.port_count();
        let shell_port = self.ports.allocate_block(block).await?;
        let leased: Vec<u16> = (0..block).map(|i| shell_port + i).collect();
        let control_port = spec.control_channel.then_some(shell_port + 1);

        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let scratch_dir = self
            .config
            .scratch_root
            .join(format!("kernel-{}", Uuid::new_v4()));

        if let Err(source) = tokio::fs::create_dir_all(&scratch_dir).await {
            self.release_ports(&leased).await;
            return Err(LaunchError::ScratchDir {
                path: scratch_dir,
                source,
            });
        }

        let ctx = LaunchContext::in_scratch(
            &scratch_dir,
            shell_port,
            self.config.resource_dir.as_deref(),
        );
        let args = spec.resolve_args(&ctx);
        let program = args[0].clone();

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args[1..])
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.kill_on_drop(true).spawn() {
            Ok(child) => child,
            Err(source) => {
                self.release_ports(&leased).await;
                remove_scratch(&scratch_dir).await;
                return Err(LaunchError::Spawn { program, source });
            }
        };
        let pid = child.id();

        info!(
            "[kernel-manager] Spawned {} kernel {} for session {} (pid {:?}, port {})",
            spec.language, kernel_id, session_id, pid, shell_port
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(monitor(
            child,
            kill_rx,
            exit_tx,
            self.ports.clone(),
            leased.clone(),
            scratch_dir.clone(),
            kernel_id.clone(),
        ));

        let handle = KernelProcessHandle {
            inner: Arc::new(HandleInner {
                kernel_id,
                session_id: session_id.to_string(),
                language: spec.language.clone(),
                display_name: spec.display_name.clone(),
                family: spec.family,
                pid,
                shell_port,
                control_port,
                scratch_dir,
                stop_grace: self.config.stop_grace,
                exit_rx,
                kill_tx: StdMutex::new(Some(kill_tx)),
            }),
        };

        if let Err(e) = self.wait_for_listeners(&handle, &leased).await {
            warn!(
                "[kernel-manager] Kernel {} failed to start: {}",
                handle.kernel_id(),
                e
            );
            handle.kill();
            handle.wait().await;
            return Err(e);
        }

        if let Ok(mut kernels) = self.kernels.lock() {
            kernels.retain(|_, h| h.is_alive());
            kernels.insert(session_id.to_string(), handle.clone());
        }
        Ok(handle)
    }

    async fn wait_for_listeners(
        &self,
        handle: &KernelProcessHandle,
        ports: &[u16],
    ) -> Result<(), LaunchError> {
        let timeout = self.config.startup_timeout;
        let poll = self.config.poll_interval;
        let deadline = Instant::now() + timeout;
        let mut waiting: Vec<u16> = ports.to_vec();

        loop {
            if let Some(exit) = handle.exit_status() {
                return Err(LaunchError::ExitedDuringStartup { code: exit.code });
            }

            let mut still_waiting = Vec::with_capacity(waiting.len());
            for port in waiting {
                let attempt =
                    tokio::time::timeout(poll, TcpStream::connect(("127.0.0.1", port))).await;
                if !matches!(attempt, Ok(Ok(_))) {
                    still_waiting.push(port);
                }
            }
            waiting = still_waiting;

            if waiting.is_empty() {
                debug!(
                    "[kernel-manager] Kernel {} is accepting connections",
                    handle.kernel_id()
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LaunchError::StartupTimeout {
                    port: waiting[0],
                    timeout,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Stop the kernel for `session_id`. Returns `false` when the session
    /// has no kernel. Safe to call repeatedly.
    pub async fn stop_kernel(&self, session_id: &str) -> bool {
        let handle = self.kernels.lock().ok().and_then(|mut k| k.remove(session_id));
        match handle {
            Some(handle) => {
                let exit = handle.terminate().await;
                info!(
                    "[kernel-manager] Stopped kernel {} for session {} ({:?})",
                    handle.kernel_id(),
                    session_id,
                    exit
                );
                true
            }
            None => false,
        }
    }

    /// The live kernel for `session_id`. A handle whose process has exited
    /// is dropped from the table.
    pub fn get(&self, session_id: &str) -> Option<KernelProcessHandle> {
        let mut kernels = self.kernels.lock().ok()?;
        let handle = kernels.get(session_id)?.clone();
        if handle.is_alive() {
            Some(handle)
        } else {
            kernels.remove(session_id);
            None
        }
    }

    /// Live kernels. Exited kernels are pruned.
    pub fn list_kernels(&self) -> Vec<KernelInfo> {
        let Ok(mut kernels) = self.kernels.lock() else {
            return Vec::new();
        };
        kernels.retain(|_, h| h.is_alive());
        let mut infos: Vec<KernelInfo> = kernels.values().map(|h| h.info()).collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    pub async fn shutdown_all(&self) {
        let sessions: Vec<String> = self
            .kernels
            .lock()
            .map(|k| k.keys().cloned().collect())
            .unwrap_or_default();
        futures::future::join_all(sessions.iter().map(|s| self.stop_kernel(s))).await;
    }

    async fn release_ports(&self, ports: &[u16]) {
        for port in ports {
            self.ports.release(*port).await;
        }
    }
}

async fn monitor(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<KernelExit>>,
    ports: Arc<PortAllocator>,
    leased: Vec<u16>,
    scratch_dir: PathBuf,
    kernel_id: String,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        // Fires on explicit kill and when every handle has been dropped
        _ = kill_rx => {
            #[cfg(unix)]
            if let Some(pid) = pid {
                signal_group(pid, nix::sys::signal::Signal::SIGKILL);
            }
            if let Err(e) = child.start_kill() {
                debug!("[kernel-manager] start_kill for {}: {}", kernel_id, e);
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => KernelExit {
            code: status.code(),
        },
        Err(e) => {
            error!("[kernel-manager] Failed to wait on kernel {}: {}", kernel_id, e);
            KernelExit::default()
        }
    };

    // Anything the kernel left in its group goes too
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }

    for port in &leased {
        ports.release(*port).await;
    }
    remove_scratch(&scratch_dir).await;

    info!("[kernel-manager] Kernel {} exited ({:?})", kernel_id, exit);
    let _ = exit_tx.send(Some(exit));
}

async fn remove_scratch(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                "[kernel-manager] Failed to remove scratch dir {}: {}",
                path.display(),
                e
            );
        }
    }
}
