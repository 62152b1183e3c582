// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Raw ION and dma-buf ioctl wrappers.
//!
//! Errors are returned as [`std::io::Error`] carrying the kernel errno; callers classify them.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use crate::{
    AllocFlags, DmaBufSync, DmaBufSyncFlags, HeapMask, IonAllocationData, IonHeapData,
    IonHeapQuery, DMA_BUF_IOCTL_SYNC, ION_IOC_ALLOC, ION_IOC_HEAP_QUERY,
};

/// Upper bound on heaps accepted from `ION_IOC_HEAP_QUERY`.
pub const MAX_HEAPS: u32 = 32;

fn retry_eintr(mut call: impl FnMut() -> libc::c_int) -> io::Result<()> {
    loop {
        if call() >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Allocates `len` bytes from the heaps in `heap_mask` and returns the dma-buf descriptor.
pub fn ion_alloc(
    ion: BorrowedFd<'_>,
    len: u64,
    heap_mask: HeapMask,
    flags: AllocFlags,
) -> io::Result<OwnedFd> {
    let mut data = IonAllocationData {
        len,
        heap_id_mask: heap_mask.bits(),
        flags: flags.bits(),
        ..IonAllocationData::default()
    };
    retry_eintr(|| {
        // SAFETY: `data` is a live `ion_allocation_data` for the whole call and the request
        // code encodes its exact size.
        unsafe { libc::ioctl(ion.as_raw_fd(), ION_IOC_ALLOC as _, &mut data as *mut IonAllocationData) }
    })?;
    let raw = i32::try_from(data.fd).map_err(|_| io::Error::from_raw_os_error(libc::EBADF))?;
    if raw < 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    // SAFETY: the kernel installed `raw` in our descriptor table for this allocation and
    // ownership passes to the caller exclusively.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Enumerates the heaps exposed by the ION device.
pub fn ion_heap_query(ion: BorrowedFd<'_>) -> io::Result<Vec<IonHeapData>> {
    let mut query = IonHeapQuery::default();
    retry_eintr(|| {
        // SAFETY: `query` is a live `ion_heap_query`; `heaps == 0` asks only for the count.
        unsafe { libc::ioctl(ion.as_raw_fd(), ION_IOC_HEAP_QUERY as _, &mut query as *mut IonHeapQuery) }
    })?;
    let count = query.cnt.min(MAX_HEAPS);
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut heaps = vec![IonHeapData::default(); count as usize];
    query = IonHeapQuery {
        cnt: count,
        heaps: heaps.as_mut_ptr() as u64,
        ..IonHeapQuery::default()
    };
    retry_eintr(|| {
        // SAFETY: `heaps` holds `count` writable entries and outlives the call.
        unsafe { libc::ioctl(ion.as_raw_fd(), ION_IOC_HEAP_QUERY as _, &mut query as *mut IonHeapQuery) }
    })?;
    heaps.truncate(query.cnt.min(count) as usize);
    Ok(heaps)
}

/// Issues `DMA_BUF_IOCTL_SYNC` on a dma-buf descriptor.
pub fn dma_buf_sync(buf: BorrowedFd<'_>, flags: DmaBufSyncFlags) -> io::Result<()> {
    let mut sync = DmaBufSync { flags: flags.bits() };
    retry_eintr(|| {
        // SAFETY: `sync` is a live `dma_buf_sync` for the whole call.
        unsafe { libc::ioctl(buf.as_raw_fd(), DMA_BUF_IOCTL_SYNC as _, &mut sync as *mut DmaBufSync) }
    })
}
