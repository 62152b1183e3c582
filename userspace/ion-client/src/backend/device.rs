// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::fs::OpenOptions;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use ion_abi::{ioctl, DmaBufSyncFlags, HeapType};
use log::{debug, trace};
use parking_lot::Mutex;

use super::{AllocService, Allocation, HeapInfo};
use crate::{AllocFlags, HeapMask, IonError, Result};

/// ION character device connection.
///
/// Buffers are dma-buf descriptors; releasing one is closing it, and the kernel frees the
/// memory once the last descriptor (in any process) is gone.
pub struct DeviceService {
    path: PathBuf,
    device: Mutex<Option<OwnedFd>>,
}

impl DeviceService {
    /// Opens the device node at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|err| IonError::ServiceUnavailable(format!("{}: {err}", path.display())))?;
        debug!("ion: opened {}", path.display());
        Ok(Self { path, device: Mutex::new(Some(OwnedFd::from(file))) })
    }

    fn with_device<T>(&self, op: impl FnOnce(BorrowedFd<'_>) -> Result<T>) -> Result<T> {
        let guard = self.device.lock();
        let device = guard.as_ref().ok_or_else(|| {
            IonError::ServiceUnavailable(format!("{}: connection closed", self.path.display()))
        })?;
        op(device.as_fd())
    }
}

impl AllocService for DeviceService {
    fn name(&self) -> &'static str {
        "device"
    }

    fn allocate(&self, len: u64, heap_mask: HeapMask, flags: AllocFlags) -> Result<Allocation> {
        self.with_device(|device| {
            let fd = ioctl::ion_alloc(device, len, heap_mask, flags)
                .map_err(|err| IonError::from_alloc(err, heap_mask.bits()))?;
            Ok(Allocation { fd, heap_id: None })
        })
    }

    fn release(&self, fd: OwnedFd, _len: u64, _heap_id: Option<u32>) -> Result<()> {
        drop(fd);
        Ok(())
    }

    fn heaps(&self) -> Result<Vec<HeapInfo>> {
        self.with_device(|device| {
            let heaps = ioctl::ion_heap_query(device)?;
            Ok(heaps
                .iter()
                .map(|heap| HeapInfo {
                    id: heap.heap_id,
                    name: heap.name(),
                    heap_type: HeapType::from_raw(heap.heap_type),
                })
                .collect())
        })
    }

    fn begin_cpu_access(&self, buffer: BorrowedFd<'_>) -> Result<()> {
        trace!("ion: dma-buf sync start");
        ioctl::dma_buf_sync(buffer, DmaBufSyncFlags::READ | DmaBufSyncFlags::WRITE)?;
        Ok(())
    }

    fn sync_for_device(&self, buffer: BorrowedFd<'_>) -> Result<()> {
        trace!("ion: dma-buf sync end");
        ioctl::dma_buf_sync(
            buffer,
            DmaBufSyncFlags::READ | DmaBufSyncFlags::WRITE | DmaBufSyncFlags::END,
        )?;
        Ok(())
    }

    fn disconnect(&self) {
        if self.device.lock().take().is_some() {
            debug!("ion: closed {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // /dev/null opens fine but answers every ION ioctl with ENOTTY.
    #[test]
    fn non_ion_node_fails_requests_without_panicking() {
        let service = DeviceService::open("/dev/null").expect("open");
        let err = service
            .allocate(4096, HeapMask::SYSTEM, AllocFlags::empty())
            .expect_err("not an ion device");
        assert!(matches!(err, IonError::Io(_)));
        assert!(service.heaps().is_err());
    }

    #[test]
    fn disconnect_makes_service_unavailable() {
        let service = DeviceService::open("/dev/null").expect("open");
        service.disconnect();
        let err = service
            .allocate(4096, HeapMask::SYSTEM, AllocFlags::empty())
            .expect_err("closed");
        assert!(matches!(err, IonError::ServiceUnavailable(_)));
    }
}
