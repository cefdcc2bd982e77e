//! Port leasing for kernel listeners.
//!
//! Every allocation goes through one async mutex, so two launches racing for
//! ports are serialized and never see the same free port. Candidates are
//! shuffled to spread kernels over the range (and away from whatever else
//! on the machine grabbed the low end), and each candidate is verified by
//! binding it on loopback before it is handed out.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;

use log::debug;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;

/// Default range kernels are placed in.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 8000..=8999;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("No free block of {size} port(s) in range {start}-{end}")]
    Exhausted { start: u16, end: u16, size: u16 },

    #[error("Invalid port block size {0}")]
    InvalidBlock(u16),
}

/// Leases ports from a fixed range.
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    leased: Mutex<BTreeSet<u16>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE)
    }
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            leased: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }

    /// Lease a single free port.
    pub async fn allocate(&self) -> Result<u16, PortError> {
        self.allocate_block(1).await
    }

    /// Lease `size` consecutive free ports and return the first one.
    pub async fn allocate_block(&self, size: u16) -> Result<u16, PortError> {
        let (start, end) = (*self.range.start(), *self.range.end());
        if size == 0 || start > end || u32::from(size) > u32::from(end - start) + 1 {
            return Err(PortError::InvalidBlock(size));
        }

        let mut leased = self.leased.lock().await;

        let mut candidates: Vec<u16> = (start..=end - (size - 1)).collect();
        candidates.shuffle(&mut rand::thread_rng());

        for base in candidates {
            let block: Vec<u16> = (0..size).map(|i| base + i).collect();
            if block.iter().any(|p| leased.contains(p)) {
                continue;
            }
            if !block.iter().all(|p| is_bindable(*p)) {
                continue;
            }

            leased.extend(block.iter().copied());
            debug!("[port-allocator] Leased {:?}", block);
            return Ok(base);
        }

        Err(PortError::Exhausted { start, end, size })
    }

    /// Return a port to the pool. Releasing a port that isn't leased is a
    /// no-op.
    pub async fn release(&self, port: u16) {
        if self.leased.lock().await.remove(&port) {
            debug!("[port-allocator] Released {}", port);
        }
    }

    /// Ports currently leased, in ascending order.
    pub async fn leased(&self) -> Vec<u16> {
        self.leased.lock().await.iter().copied().collect()
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
