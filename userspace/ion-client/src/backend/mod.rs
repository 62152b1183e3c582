// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Allocation service seam and backend selection
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - trait AllocService: allocate/release/heaps/sync/disconnect primitives
//!   - enum Backend: Auto | Device(path) | Host(config)
//!   - DeviceService: `/dev/ion` via ION_IOC_ALLOC (buffers are dma-buf descriptors)
//!   - HostService: memfd-backed emulation with a configurable heap table
//!
//! ERROR CONDITIONS:
//!   - IonError::ServiceUnavailable: device missing, unreadable, or connection closed
//!   - IonError::OutOfMemory / InvalidHeap / PermissionDenied: allocation refused

use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use log::warn;

use crate::{AllocFlags, HeapMask, HeapType, Result};

mod device;
mod host;

pub use device::DeviceService;
pub use host::{HostConfig, HostHeap, HostService};

/// Default ION device node.
pub const DEFAULT_DEVICE: &str = "/dev/ion";

/// A freshly allocated buffer as returned by a backend.
#[derive(Debug)]
pub struct Allocation {
    /// Descriptor referencing the allocation.
    pub fd: OwnedFd,
    /// Heap that satisfied the request, when the backend knows it.
    pub heap_id: Option<u32>,
}

/// Description of one heap exposed by a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapInfo {
    /// Heap id; bit position in a [`HeapMask`].
    pub id: u32,
    /// Human readable heap name.
    pub name: String,
    /// Heap implementation type.
    pub heap_type: HeapType,
}

impl HeapInfo {
    /// Mask selecting exactly this heap.
    pub fn mask(&self) -> HeapMask {
        HeapMask::from_id(self.id)
    }
}

/// Allocation service primitives consumed by a [`crate::Session`].
///
/// Implementations must be safe to share between threads; the session serialises nothing on
/// their behalf.
pub trait AllocService: Send + Sync {
    /// Short backend name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Allocates `len` bytes (already validated non-zero) from a heap in `heap_mask`.
    fn allocate(&self, len: u64, heap_mask: HeapMask, flags: AllocFlags) -> Result<Allocation>;

    /// Drops the allocating reference; the memory lives on while other descriptors exist.
    fn release(&self, fd: OwnedFd, len: u64, heap_id: Option<u32>) -> Result<()>;

    /// Lists the heaps this service can allocate from.
    fn heaps(&self) -> Result<Vec<HeapInfo>>;

    /// Opens a CPU access window on a cached buffer.
    fn begin_cpu_access(&self, buffer: BorrowedFd<'_>) -> Result<()>;

    /// Closes the CPU access window so a device observes CPU writes.
    fn sync_for_device(&self, buffer: BorrowedFd<'_>) -> Result<()>;

    /// Closes the service connection; later requests fail with `ServiceUnavailable`.
    fn disconnect(&self);
}

/// Which allocation service a session connects to.
#[derive(Clone, Debug)]
pub enum Backend {
    /// The device at `device` when it exists, otherwise the host emulation.
    Auto {
        /// Device node probed first.
        device: PathBuf,
    },
    /// An ION device node.
    Device(PathBuf),
    /// In-process memfd emulation.
    Host(HostConfig),
}

impl Default for Backend {
    fn default() -> Self {
        Self::Auto { device: PathBuf::from(DEFAULT_DEVICE) }
    }
}

impl Backend {
    /// Opens the selected service.
    pub fn connect(&self) -> Result<Box<dyn AllocService>> {
        match self {
            Self::Auto { device } => {
                if Path::new(device).exists() {
                    Ok(Box::new(DeviceService::open(device)?))
                } else {
                    warn!(
                        "ion: {} not present, falling back to host memfd backend",
                        device.display()
                    );
                    Ok(Box::new(HostService::new(HostConfig::default())))
                }
            }
            Self::Device(path) => Ok(Box::new(DeviceService::open(path)?)),
            Self::Host(config) => Ok(Box::new(HostService::new(config.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IonError;

    #[test]
    fn missing_device_is_service_unavailable() {
        let backend = Backend::Device(PathBuf::from("/nonexistent/ion"));
        let err = backend.connect().err().expect("device absent");
        assert!(matches!(err, IonError::ServiceUnavailable(_)));
    }

    #[test]
    fn auto_falls_back_to_host() {
        let backend = Backend::Auto { device: PathBuf::from("/nonexistent/ion") };
        let service = backend.connect().expect("host fallback");
        assert_eq!(service.name(), "host");
    }

    #[test]
    fn heap_info_mask() {
        let info = HeapInfo { id: 4, name: "dma".into(), heap_type: HeapType::Dma };
        assert_eq!(info.mask(), HeapMask::DMA);
    }
}
