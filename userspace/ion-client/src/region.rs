// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mapped windows over buffer handles
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - MappedRegion: byte accessors, pattern helpers, cache sync, unmap
//!
//! INVARIANTS:
//!   - offset is page aligned, len > 0 and offset + len <= buffer size
//!   - A region borrows its handle, so the handle cannot be freed while mapped
//!   - Accessors are bounds checked and honour the region's protection (AccessDenied)
//!   - Every CPU access window opened on a cached buffer is closed exactly once: by
//!     sync_for_device, by unmap, or when the region is dropped

use std::fmt;
use std::io;

use ion_abi::Mapping;
use log::{trace, warn};

use crate::{page_size, BufferHandle, HandleId, IonError, Prot, Result, Sharing};

const PATTERN_CHUNK: usize = 4096;

// Open CPU access window (dma-buf SYNC_START sent); closing sends the matching SYNC_END.
struct CpuWindow<'h> {
    handle: &'h BufferHandle,
}

impl<'h> CpuWindow<'h> {
    fn open(handle: &'h BufferHandle) -> Result<Self> {
        handle.session().service().begin_cpu_access(handle.live_fd()?)?;
        Ok(Self { handle })
    }

    fn close(self) -> Result<()> {
        let handle = self.handle;
        std::mem::forget(self);
        end_cpu_access(handle)
    }
}

impl Drop for CpuWindow<'_> {
    fn drop(&mut self) {
        if let Err(err) = end_cpu_access(self.handle) {
            warn!("ion: closing cpu access window on {} failed: {err}", self.handle.id());
        }
    }
}

fn end_cpu_access(handle: &BufferHandle) -> Result<()> {
    handle.session().service().sync_for_device(handle.live_fd()?)
}

/// An mmap'd window over part of a [`BufferHandle`].
pub struct MappedRegion<'h> {
    handle: &'h BufferHandle,
    // Declared before `mapping` so the window closes before munmap on drop.
    cpu_window: Option<CpuWindow<'h>>,
    mapping: Mapping,
    offset: u64,
    sharing: Sharing,
}

impl<'h> MappedRegion<'h> {
    pub(crate) fn new(
        handle: &'h BufferHandle,
        len: usize,
        prot: Prot,
        sharing: Sharing,
        offset: u64,
    ) -> Result<Self> {
        let fd = handle.live_fd()?;
        let size = handle.size();
        let invalid = IonError::InvalidOffset { offset, len: len as u64, size };
        if len == 0 || offset % page_size() as u64 != 0 {
            return Err(invalid);
        }
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => {}
            _ => return Err(invalid),
        }
        let mapping = Mapping::map(fd, len, prot, sharing, offset)
            .map_err(|err| IonError::from_map(err, offset, len as u64, size))?;
        trace!("ion: mapped {} [{offset:#x}, +{len:#x}) at {:#x}", handle.id(), mapping.addr());
        Ok(Self { handle, cpu_window: None, mapping, offset, sharing })
    }

    /// Handle this region maps.
    pub fn handle_id(&self) -> HandleId {
        self.handle.id()
    }

    /// Length of the window in bytes.
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    /// Always `false`; zero-length regions cannot be created.
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Offset of the window within the buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Page protection of the window.
    pub fn prot(&self) -> Prot {
        self.mapping.prot()
    }

    /// Shared or private mapping.
    pub fn sharing(&self) -> Sharing {
        self.sharing
    }

    /// Virtual address of the first byte; diagnostics only.
    pub fn addr(&self) -> usize {
        self.mapping.addr()
    }

    fn access_error(&self, err: io::Error, offset: usize, count: usize) -> IonError {
        match err.kind() {
            io::ErrorKind::PermissionDenied => IonError::AccessDenied,
            io::ErrorKind::InvalidInput => IonError::InvalidOffset {
                offset: offset as u64,
                len: count as u64,
                size: self.mapping.len() as u64,
            },
            _ => IonError::Io(err),
        }
    }

    /// Copies `buf.len()` bytes starting at `offset` (relative to the window) into `buf`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let count = buf.len();
        self.mapping.read_at(offset, buf).map_err(|err| self.access_error(err, offset, count))
    }

    /// Copies `bytes` into the window at `offset`.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.mapping
            .write_at(offset, bytes)
            .map_err(|err| self.access_error(err, offset, bytes.len()))
    }

    /// Sets `count` bytes at `offset` to `byte`.
    pub fn fill(&mut self, offset: usize, count: usize, byte: u8) -> Result<()> {
        self.mapping.fill(offset, count, byte).map_err(|err| self.access_error(err, offset, count))
    }

    /// Reads a single byte.
    pub fn byte_at(&self, offset: usize) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_at(offset, &mut byte)?;
        Ok(byte[0])
    }

    /// Writes `i mod 256` at every window offset `i`.
    pub fn write_pattern(&mut self) -> Result<()> {
        let mut chunk = [0u8; PATTERN_CHUNK];
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let len = self.len();
        let mut at = 0;
        while at < len {
            let n = PATTERN_CHUNK.min(len - at);
            // PATTERN_CHUNK is a multiple of 256, so every chunk starts at pattern phase 0.
            self.write_at(at, &chunk[..n])?;
            at += n;
        }
        Ok(())
    }

    /// Checks the [`MappedRegion::write_pattern`] pattern; returns the first mismatching offset.
    pub fn verify_pattern(&self) -> Result<Option<usize>> {
        let mut chunk = [0u8; PATTERN_CHUNK];
        let len = self.len();
        let mut at = 0;
        while at < len {
            let n = PATTERN_CHUNK.min(len - at);
            self.read_at(at, &mut chunk[..n])?;
            if let Some(i) = chunk[..n].iter().enumerate().position(|(i, byte)| *byte != i as u8) {
                return Ok(Some(at + i));
            }
            at += n;
        }
        Ok(None)
    }

    /// Writes `text` followed by a NUL terminator.
    pub fn write_cstr(&mut self, offset: usize, text: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        self.write_at(offset, &bytes)
    }

    /// Reads bytes from `offset` up to the first NUL or the end of the window.
    pub fn read_cstr(&self, offset: usize) -> Result<String> {
        let available = self.len().checked_sub(offset).ok_or(IonError::InvalidOffset {
            offset: offset as u64,
            len: 0,
            size: self.len() as u64,
        })?;
        let mut bytes = vec![0u8; available];
        self.read_at(offset, &mut bytes)?;
        if let Some(nul) = bytes.iter().position(|byte| *byte == 0) {
            bytes.truncate(nul);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Opens a CPU access window; a no-op on uncached buffers or when one is already open.
    ///
    /// The window stays open until [`MappedRegion::sync_for_device`], [`MappedRegion::unmap`]
    /// or drop closes it.
    pub fn begin_cpu_access(&mut self) -> Result<()> {
        if !self.handle.is_cached() || self.cpu_window.is_some() {
            return Ok(());
        }
        self.cpu_window = Some(CpuWindow::open(self.handle)?);
        Ok(())
    }

    /// `true` while a CPU access window is open.
    pub fn in_cpu_access(&self) -> bool {
        self.cpu_window.is_some()
    }

    /// Makes CPU writes visible to devices; a no-op on uncached buffers.
    ///
    /// Closes the open CPU access window, or runs a complete start/end round when none is open.
    pub fn sync_for_device(&mut self) -> Result<()> {
        if !self.handle.is_cached() {
            return Ok(());
        }
        match self.cpu_window.take() {
            Some(window) => window.close(),
            None => CpuWindow::open(self.handle)?.close(),
        }
    }

    /// Removes the mapping, closing an open CPU access window first.
    pub fn unmap(self) -> Result<()> {
        let id = self.handle.id();
        let Self { cpu_window, mapping, .. } = self;
        let synced = cpu_window.map_or(Ok(()), CpuWindow::close);
        let unmapped = mapping.unmap().map_err(|_| IonError::InvalidRegion);
        synced?;
        unmapped?;
        trace!("ion: unmapped window of {id}");
        Ok(())
    }
}

impl fmt::Debug for MappedRegion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("handle", &self.handle.id())
            .field("offset", &self.offset)
            .field("len", &self.mapping.len())
            .field("prot", &self.mapping.prot())
            .field("sharing", &self.sharing)
            .field("cpu_access", &self.cpu_window.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::{BorrowedFd, OwnedFd};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::backend::{AllocService, Allocation, HeapInfo, HostConfig, HostService};
    use crate::{AllocFlags, HeapMask, Session};

    fn host_session() -> Session {
        Session::with_service(Box::new(HostService::new(HostConfig::default())))
    }

    #[derive(Default)]
    struct SyncCounts {
        starts: AtomicUsize,
        ends: AtomicUsize,
    }

    impl SyncCounts {
        fn get(&self) -> (usize, usize) {
            (self.starts.load(Ordering::SeqCst), self.ends.load(Ordering::SeqCst))
        }
    }

    // Host backend that records the sync calls it sees.
    struct Counting {
        inner: HostService,
        counts: Arc<SyncCounts>,
    }

    impl AllocService for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn allocate(&self, len: u64, heap_mask: HeapMask, flags: AllocFlags) -> Result<Allocation> {
            self.inner.allocate(len, heap_mask, flags)
        }

        fn release(&self, fd: OwnedFd, len: u64, heap_id: Option<u32>) -> Result<()> {
            self.inner.release(fd, len, heap_id)
        }

        fn heaps(&self) -> Result<Vec<HeapInfo>> {
            self.inner.heaps()
        }

        fn begin_cpu_access(&self, buffer: BorrowedFd<'_>) -> Result<()> {
            self.counts.starts.fetch_add(1, Ordering::SeqCst);
            self.inner.begin_cpu_access(buffer)
        }

        fn sync_for_device(&self, buffer: BorrowedFd<'_>) -> Result<()> {
            self.counts.ends.fetch_add(1, Ordering::SeqCst);
            self.inner.sync_for_device(buffer)
        }

        fn disconnect(&self) {
            self.inner.disconnect()
        }
    }

    fn counting_session() -> (Session, Arc<SyncCounts>) {
        let counts = Arc::new(SyncCounts::default());
        let service = Counting { inner: HostService::new(HostConfig::default()), counts: Arc::clone(&counts) };
        (Session::with_service(Box::new(service)), counts)
    }

    #[test]
    fn cpu_access_windows_are_always_closed() {
        let (session, counts) = counting_session();
        let handle = session.allocate(4096, HeapMask::SYSTEM, AllocFlags::CACHED).expect("alloc");

        // Closed by unmap.
        let mut region = handle.map_all().expect("map");
        region.begin_cpu_access().expect("begin");
        region.begin_cpu_access().expect("already open");
        assert!(region.in_cpu_access());
        region.fill(0, 4096, 0xaa).expect("fill");
        region.unmap().expect("unmap");
        assert_eq!(counts.get(), (1, 1));

        // Closed explicitly, then nothing left for unmap.
        let mut region = handle.map_all().expect("map");
        region.begin_cpu_access().expect("begin");
        region.sync_for_device().expect("sync");
        assert!(!region.in_cpu_access());
        region.unmap().expect("unmap");
        assert_eq!(counts.get(), (2, 2));

        // Closed by drop.
        let mut region = handle.map_all().expect("map");
        region.begin_cpu_access().expect("begin");
        drop(region);
        assert_eq!(counts.get(), (3, 3));

        // A sync without an open window is a full round.
        let mut region = handle.map_all().expect("map");
        region.sync_for_device().expect("sync");
        region.unmap().expect("unmap");
        assert_eq!(counts.get(), (4, 4));

        handle.free().expect("free");
        session.close().expect("close");
    }

    #[test]
    fn uncached_buffers_skip_sync() {
        let (session, counts) = counting_session();
        let handle = session.allocate(4096, HeapMask::SYSTEM, AllocFlags::empty()).expect("alloc");
        let mut region = handle.map_all().expect("map");
        region.begin_cpu_access().expect("begin");
        assert!(!region.in_cpu_access());
        region.sync_for_device().expect("sync");
        region.unmap().expect("unmap");
        assert_eq!(counts.get(), (0, 0));
        handle.free().expect("free");
        session.close().expect("close");
    }

    #[test]
    fn window_validation() {
        let session = host_session();
        let page = page_size();
        let handle = session.allocate(2 * page, HeapMask::SYSTEM, AllocFlags::empty()).expect("alloc");
        let rw = Prot::READ | Prot::WRITE;
        for (len, offset) in [(0, 0), (page, 1), (page, 2 * page as u64), (3 * page, 0)] {
            let err = handle.map(len, rw, Sharing::Shared, offset).expect_err("invalid window");
            assert!(matches!(err, IonError::InvalidOffset { .. }), "len {len} offset {offset}: {err}");
        }
        let tail = handle.map(page, rw, Sharing::Shared, page as u64).expect("second page");
        assert_eq!(tail.offset(), page as u64);
        tail.unmap().expect("unmap");
        handle.free().expect("free");
        session.close().expect("close");
    }

    #[test]
    fn protection_is_enforced() {
        let session = host_session();
        let handle = session.allocate(4096, HeapMask::SYSTEM, AllocFlags::empty()).expect("alloc");
        let mut none = handle.map(4096, Prot::empty(), Sharing::Shared, 0).expect("PROT_NONE map");
        assert!(matches!(none.byte_at(0), Err(IonError::AccessDenied)));
        assert!(matches!(none.write_at(0, b"x"), Err(IonError::AccessDenied)));
        none.unmap().expect("unmap");

        let reader = handle.map(4096, Prot::READ, Sharing::Shared, 0).expect("read-only");
        assert_eq!(reader.byte_at(0).expect("read"), 0);
        assert!(matches!(reader.byte_at(4096), Err(IonError::InvalidOffset { .. })));
        reader.unmap().expect("unmap");
        handle.free().expect("free");
        session.close().expect("close");
    }

    #[test]
    fn private_mapping_does_not_leak_writes() {
        let session = host_session();
        let handle = session.allocate(4096, HeapMask::SYSTEM, AllocFlags::empty()).expect("alloc");
        let mut private = handle.map(4096, Prot::READ | Prot::WRITE, Sharing::Private, 0).expect("map");
        private.fill(0, 16, 0x5a).expect("fill");
        let shared = handle.map_all().expect("shared");
        assert_eq!(shared.byte_at(0).expect("read"), 0);
        assert_eq!(private.byte_at(0).expect("read"), 0x5a);
        private.unmap().expect("unmap");
        shared.unmap().expect("unmap");
        handle.free().expect("free");
        session.close().expect("close");
    }

    #[test]
    fn pattern_and_cstr_helpers() {
        let session = host_session();
        let handle = session.allocate(3 * 4096 + 100, HeapMask::SYSTEM, AllocFlags::empty()).expect("alloc");
        let mut region = handle.map_all().expect("map");
        region.write_pattern().expect("pattern");
        assert_eq!(region.verify_pattern().expect("verify"), None);
        assert_eq!(region.byte_at(300).expect("byte"), 44);
        region.fill(5000, 1, 0).expect("corrupt");
        assert_eq!(region.verify_pattern().expect("verify"), Some(5000));

        region.write_cstr(0, "master").expect("cstr");
        assert_eq!(region.read_cstr(0).expect("read cstr"), "master");
        region.unmap().expect("unmap");
        handle.free().expect("free");
        session.close().expect("close");
    }

    #[test]
    fn region_fails_after_session_close() {
        let session = host_session();
        let handle = session.allocate(4096, HeapMask::SYSTEM, AllocFlags::empty()).expect("alloc");
        assert!(session.close().is_err());
        assert!(matches!(handle.map_all(), Err(IonError::InvalidHandle)));
    }
}
