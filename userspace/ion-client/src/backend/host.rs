// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host emulation of the ION allocation service on sealed memfds
//!
//! Buffers are real descriptors, so mapping, descriptor passing and kernel reference counting
//! behave exactly as with dma-bufs. Only heap policy is emulated: a fixed table of heaps with
//! byte capacities, charged on allocate and credited when the last local handle of the
//! allocation (the allocating handle or one of its duplicates) is released.
//!
//! Accounting is per allocating session. A descriptor imported by another process does not hold
//! the charge, so the heap is credited once the allocating side lets go even though the peer can
//! still map the memory.
//!
//! Selection walks the mask from the lowest id. Restricted heaps refuse callers; a mask that
//! names no configured heap is InvalidHeap; if every candidate is full the request fails with
//! OutOfMemory, otherwise a restricted candidate yields PermissionDenied.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ion_abi::memfd;
use log::{debug, trace};
use parking_lot::Mutex;

use super::{AllocService, Allocation, HeapInfo};
use crate::{page_size, AllocFlags, HeapMask, HeapType, IonError, Result};

const MIB: u64 = 1024 * 1024;

/// One emulated heap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostHeap {
    /// Heap id; bit position in a [`HeapMask`].
    pub id: u32,
    /// Heap name.
    pub name: String,
    /// Reported heap type.
    pub heap_type: HeapType,
    /// Bytes that may be outstanding at once.
    pub capacity: u64,
    /// Callers are refused with `PermissionDenied`.
    pub restricted: bool,
}

impl HostHeap {
    /// Unrestricted heap.
    pub fn new(id: u32, name: impl Into<String>, heap_type: HeapType, capacity: u64) -> Self {
        Self { id, name: name.into(), heap_type, capacity, restricted: false }
    }

    /// Marks the heap as refusing allocations from this client.
    pub fn restricted(mut self) -> Self {
        self.restricted = true;
        self
    }
}

/// Heap table for [`HostService`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostConfig {
    /// Emulated heaps; ids must be unique and below 32.
    pub heaps: Vec<HostHeap>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            heaps: vec![
                HostHeap::new(0, "system", HeapType::System, 256 * MIB),
                HostHeap::new(1, "system-contig", HeapType::SystemContig, 64 * MIB),
                HostHeap::new(2, "carveout", HeapType::Carveout, 16 * MIB),
                HostHeap::new(4, "dma", HeapType::Dma, 64 * MIB),
            ],
        }
    }
}

struct HeapState {
    heap: HostHeap,
    used: u64,
}

/// memfd-backed allocation service.
pub struct HostService {
    heaps: Mutex<Vec<HeapState>>,
    connected: AtomicBool,
    serial: AtomicU64,
}

impl HostService {
    /// Creates a service over `config`.
    pub fn new(config: HostConfig) -> Self {
        let mut heaps: Vec<HeapState> = config
            .heaps
            .into_iter()
            .filter(|heap| heap.id < u32::BITS)
            .map(|heap| HeapState { heap, used: 0 })
            .collect();
        heaps.sort_by_key(|state| state.heap.id);
        heaps.dedup_by_key(|state| state.heap.id);
        Self { heaps: Mutex::new(heaps), connected: AtomicBool::new(true), serial: AtomicU64::new(0) }
    }

    /// Bytes currently charged against heap `id`.
    pub fn heap_usage(&self, id: u32) -> Option<u64> {
        self.heaps.lock().iter().find(|state| state.heap.id == id).map(|state| state.used)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(IonError::ServiceUnavailable("host backend disconnected".into()))
        }
    }
}

fn page_align(len: u64) -> Option<u64> {
    let page = page_size() as u64;
    len.checked_add(page - 1).map(|end| end & !(page - 1))
}

impl AllocService for HostService {
    fn name(&self) -> &'static str {
        "host"
    }

    fn allocate(&self, len: u64, heap_mask: HeapMask, flags: AllocFlags) -> Result<Allocation> {
        self.ensure_connected()?;
        let size = page_align(len).ok_or(IonError::OutOfMemory)?;

        let (heap_id, name) = {
            let mut heaps = self.heaps.lock();
            let mut candidates = heaps
                .iter_mut()
                .filter(|state| heap_mask.contains(HeapMask::from_id(state.heap.id)))
                .peekable();
            if candidates.peek().is_none() {
                return Err(IonError::InvalidHeap(heap_mask.bits()));
            }
            let (mut denied, mut exhausted) = (false, false);
            let mut chosen = None;
            for state in candidates {
                if state.heap.restricted {
                    denied = true;
                    continue;
                }
                if state.used.saturating_add(size) > state.heap.capacity {
                    exhausted = true;
                    continue;
                }
                state.used += size;
                chosen = Some((state.heap.id, state.heap.name.clone()));
                break;
            }
            match chosen {
                Some(chosen) => chosen,
                None if exhausted => return Err(IonError::OutOfMemory),
                None => {
                    debug_assert!(denied);
                    return Err(IonError::PermissionDenied);
                }
            }
        };

        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        match memfd::create(&format!("ion-{name}-{serial}"), size) {
            Ok(fd) => {
                trace!("ion(host): {size} bytes from heap {heap_id} flags {:#x}", flags.bits());
                Ok(Allocation { fd, heap_id: Some(heap_id) })
            }
            Err(err) => {
                self.credit(heap_id, size);
                Err(IonError::from_alloc(err, heap_mask.bits()))
            }
        }
    }

    fn release(&self, fd: OwnedFd, len: u64, heap_id: Option<u32>) -> Result<()> {
        drop(fd);
        if let (Some(heap_id), Some(size)) = (heap_id, page_align(len)) {
            self.credit(heap_id, size);
        }
        Ok(())
    }

    fn heaps(&self) -> Result<Vec<HeapInfo>> {
        self.ensure_connected()?;
        Ok(self
            .heaps
            .lock()
            .iter()
            .map(|state| HeapInfo {
                id: state.heap.id,
                name: state.heap.name.clone(),
                heap_type: state.heap.heap_type,
            })
            .collect())
    }

    // CPU and device share coherent memory here.
    fn begin_cpu_access(&self, _buffer: BorrowedFd<'_>) -> Result<()> {
        Ok(())
    }

    fn sync_for_device(&self, _buffer: BorrowedFd<'_>) -> Result<()> {
        trace!("ion(host): sync_for_device is a no-op");
        Ok(())
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!("ion(host): disconnected");
        }
    }
}

impl HostService {
    fn credit(&self, heap_id: u32, size: u64) {
        if let Some(state) = self.heaps.lock().iter_mut().find(|state| state.heap.id == heap_id) {
            state.used = state.used.saturating_sub(size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> HostConfig {
        HostConfig {
            heaps: vec![
                HostHeap::new(0, "system", HeapType::System, 2 * MIB),
                HostHeap::new(3, "secure", HeapType::Custom(16), 2 * MIB).restricted(),
            ],
        }
    }

    #[test]
    fn capacity_is_charged_and_credited() {
        let service = HostService::new(small_config());
        let page = page_size() as u64;
        let first = service.allocate(1, HeapMask::SYSTEM, AllocFlags::empty()).expect("alloc");
        assert_eq!(first.heap_id, Some(0));
        assert_eq!(service.heap_usage(0), Some(page));
        service.release(first.fd, 1, first.heap_id).expect("release");
        assert_eq!(service.heap_usage(0), Some(0));
    }

    #[test]
    fn exhausted_heap_reports_out_of_memory() {
        let service = HostService::new(small_config());
        let held = service.allocate(2 * MIB, HeapMask::SYSTEM, AllocFlags::empty()).expect("fill");
        let err = service.allocate(1, HeapMask::SYSTEM, AllocFlags::empty()).expect_err("full");
        assert!(matches!(err, IonError::OutOfMemory));
        service.release(held.fd, 2 * MIB, held.heap_id).expect("release");
        service.allocate(1, HeapMask::SYSTEM, AllocFlags::empty()).expect("room again");
    }

    #[test]
    fn unknown_and_restricted_heaps() {
        let service = HostService::new(small_config());
        let err = service.allocate(4096, HeapMask::CARVEOUT, AllocFlags::empty()).expect_err("no heap 2");
        assert!(matches!(err, IonError::InvalidHeap(0b100)));
        let err = service.allocate(4096, HeapMask::from_id(3), AllocFlags::empty()).expect_err("restricted");
        assert!(matches!(err, IonError::PermissionDenied));
    }

    #[test]
    fn mixed_mask_uses_first_open_heap() {
        let service = HostService::new(small_config());
        let mask = HeapMask::from_id(3) | HeapMask::SYSTEM;
        let got = service.allocate(4096, mask, AllocFlags::empty()).expect("system satisfies the mask");
        assert_eq!(got.heap_id, Some(0));
    }

    #[test]
    fn disconnected_service_refuses_requests() {
        let service = HostService::new(HostConfig::default());
        service.disconnect();
        assert!(matches!(
            service.allocate(4096, HeapMask::SYSTEM, AllocFlags::empty()),
            Err(IonError::ServiceUnavailable(_))
        ));
        assert!(matches!(service.heaps(), Err(IonError::ServiceUnavailable(_))));
    }
}
