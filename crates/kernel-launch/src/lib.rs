//! Kernel launching for the kernel bridge.
//!
//! This crate owns everything that happens before a session can connect to
//! a kernel:
//!
//! - [`PortAllocator`]: leases ports from a bounded range, serialized so
//!   concurrent launches never receive the same port
//! - [`KernelLaunchSpec`]: argv templates with `{websocket_port}`,
//!   `{log_file}`, `{profile_file}` and `{resource_dir}` placeholders, plus
//!   `kernel.json` discovery
//! - [`KernelProcessManager`]: spawns kernels, waits for their listeners and
//!   tears everything down again (process group, ports, scratch directory)
//!
//! ```ignore
//! use std::sync::Arc;
//! use kernel_launch::{KernelProcessManager, PortAllocator, ProcessManagerConfig};
//!
//! let ports = Arc::new(PortAllocator::default());
//! let manager = KernelProcessManager::new(ProcessManagerConfig::default(), ports);
//! let handle = manager.start_kernel("session-1", &spec).await?;
//! println!("shell listening on {}", handle.shell_port());
//! ```

pub mod error;
pub mod ports;
pub mod process;
pub mod spec;

pub use error::{LaunchError, SpecError};
pub use ports::{PortAllocator, PortError, DEFAULT_PORT_RANGE};
pub use process::{
    KernelExit, KernelInfo, KernelProcessHandle, KernelProcessManager, ProcessManagerConfig,
};
pub use spec::{find_kernelspec, kernelspec_dirs, list_kernelspecs, KernelLaunchSpec, LaunchContext};
