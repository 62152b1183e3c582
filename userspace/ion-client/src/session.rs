// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Allocation-service session and its ledger of live buffer handles
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - Session::open()/with_service(): connect to a backend
//!   - Session::allocate(): new BufferHandle, recorded in the ledger
//!   - Session::outstanding()/outstanding_handles(): leak diagnostics
//!   - Session::close(): disconnect; OutstandingHandles(n) when handles are still live
//!   - SessionId / HandleId: process-qualified identifiers
//!
//! INVARIANTS:
//!   - Every live BufferHandle has exactly one ledger entry in its owning session
//!   - Ledger entries are removed before their descriptor is closed, so a recycled descriptor
//!     number never aliases a stale entry
//!   - Closing does not release outstanding handles; they stay in the ledger and fail later
//!     operations with InvalidHandle

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use ion_abi::fd;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::backend::{AllocService, Backend, HeapInfo};
use crate::buffer::{BufferHandle, Charge, Origin};
use crate::transfer::wire::HandleMeta;
use crate::{AllocFlags, HeapMask, IonError, Result};

static NEXT_SESSION: AtomicU32 = AtomicU32::new(1);

/// Identifies a session: owning process plus a per-process sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId {
    pid: u32,
    seq: u32,
}

impl SessionId {
    fn next() -> Self {
        Self { pid: std::process::id(), seq: NEXT_SESSION.fetch_add(1, Ordering::Relaxed) }
    }

    /// Process that opened the session.
    pub fn pid(self) -> u32 {
        self.pid
    }

    /// Per-process sequence number.
    pub fn seq(self) -> u32 {
        self.seq
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pid, self.seq)
    }
}

/// Local identifier of one buffer handle.
///
/// Qualified by session, so handles in different processes never compare equal even when
/// the kernel hands out the same descriptor number on both sides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId {
    session: SessionId,
    fd: RawFd,
}

impl HandleId {
    /// Encoded length of [`HandleId::to_bytes`].
    pub const ENCODED_LEN: usize = 12;

    /// Session that owns the handle.
    pub fn session(self) -> SessionId {
        self.session
    }

    /// Descriptor number in the owning process.
    pub fn raw_fd(self) -> RawFd {
        self.fd
    }

    /// Little-endian `pid:u32 | seq:u32 | fd:i32`.
    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.session.pid.to_le_bytes());
        out[4..8].copy_from_slice(&self.session.seq.to_le_bytes());
        out[8..12].copy_from_slice(&self.fd.to_le_bytes());
        out
    }

    /// Decodes [`HandleId::to_bytes`]; `None` if `bytes` has the wrong length.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; Self::ENCODED_LEN] = bytes.try_into().ok()?;
        let word = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];
        Some(Self {
            session: SessionId { pid: u32::from_le_bytes(word(0)), seq: u32::from_le_bytes(word(4)) },
            fd: i32::from_le_bytes(word(8)),
        })
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session, self.fd)
    }
}

struct LedgerEntry {
    origin: Origin,
    size: u64,
}

pub(crate) struct SessionInner {
    id: SessionId,
    service: Box<dyn AllocService>,
    ledger: Mutex<HashMap<RawFd, LedgerEntry>>,
    closed: AtomicBool,
}

impl SessionInner {
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn service(&self) -> &dyn AllocService {
        self.service.as_ref()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn record(&self, fd: RawFd, origin: Origin, size: u64) {
        self.ledger.lock().insert(fd, LedgerEntry { origin, size });
    }

    /// Removes the ledger entry for `id`; `false` if it was not live.
    pub(crate) fn forget(&self, id: HandleId) -> bool {
        id.session == self.id && self.ledger.lock().remove(&id.fd).is_some()
    }

    fn outstanding(&self) -> usize {
        self.ledger.lock().len()
    }

    fn shutdown(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.service.disconnect();
        let outstanding = self.outstanding();
        if outstanding > 0 {
            let ledger = self.ledger.lock();
            let mut live: Vec<_> = ledger.iter().map(|(fd, entry)| (*fd, entry.origin, entry.size)).collect();
            live.sort_unstable_by_key(|(fd, _, _)| *fd);
            for (fd, origin, size) in live {
                warn!("ion: session {} leaked {origin:?} handle {fd} ({size} bytes)", self.id);
            }
        }
        outstanding
    }
}

/// Connection to an allocation service plus the set of handles opened through it.
///
/// One per process is the normal shape; several can coexist (each has its own id and
/// ledger), which is how tests stand in for two cooperating processes.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Connects to `backend`; fails with `ServiceUnavailable` when it cannot be reached.
    pub fn open(backend: &Backend) -> Result<Self> {
        Ok(Self::with_service(backend.connect()?))
    }

    /// Wraps an already connected service.
    pub fn with_service(service: Box<dyn AllocService>) -> Self {
        let id = SessionId::next();
        debug!("ion: session {id} opened on {} backend", service.name());
        Self {
            inner: Arc::new(SessionInner {
                id,
                service,
                ledger: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Name of the connected backend.
    pub fn backend_name(&self) -> &'static str {
        self.inner.service.name()
    }

    /// Allocates `len` bytes from a heap in `heap_mask`.
    pub fn allocate(&self, len: usize, heap_mask: HeapMask, flags: AllocFlags) -> Result<BufferHandle> {
        if self.inner.is_closed() {
            return Err(IonError::ServiceUnavailable(format!("session {} closed", self.inner.id)));
        }
        if len == 0 {
            return Err(IonError::InvalidSize);
        }
        if heap_mask.is_empty() {
            return Err(IonError::InvalidHeap(0));
        }
        let len = len as u64;
        let allocation = self.inner.service.allocate(len, heap_mask, flags)?;
        // Devices round up to whole pages; report what was actually allocated.
        let size = fd::len(allocation.fd.as_fd()).ok().filter(|size| *size >= len).unwrap_or(len);
        let raw = allocation.fd.as_raw_fd();
        self.inner.record(raw, Origin::Allocated, size);
        let id = HandleId { session: self.inner.id, fd: raw };
        debug!("ion: allocated {id} size {size} mask {:#x} flags {:#x}", heap_mask.bits(), flags.bits());
        Ok(BufferHandle::new(
            Arc::clone(&self.inner),
            id,
            allocation.fd,
            HandleMeta { size, heap_mask, flags },
            allocation.heap_id,
            Origin::Allocated,
            Some(Charge::new(size, allocation.heap_id)),
        ))
    }

    /// Heaps the service can allocate from.
    pub fn heaps(&self) -> Result<Vec<HeapInfo>> {
        self.inner.service.heaps()
    }

    /// Number of handles opened through this session and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding()
    }

    /// Identifiers of the live handles, lowest descriptor first.
    pub fn outstanding_handles(&self) -> Vec<HandleId> {
        let mut ids: Vec<_> = self
            .inner
            .ledger
            .lock()
            .keys()
            .map(|fd| HandleId { session: self.inner.id, fd: *fd })
            .collect();
        ids.sort_unstable_by_key(|id| id.fd);
        ids
    }

    /// Closes the connection.
    ///
    /// Outstanding handles are not freed: each is logged at warn level and the call returns
    /// [`IonError::OutstandingHandles`] even though the connection is closed.
    pub fn close(self) -> Result<()> {
        let outstanding = self.inner.shutdown();
        debug!("ion: session {} closed", self.inner.id);
        if outstanding > 0 {
            return Err(IonError::OutstandingHandles(outstanding));
        }
        Ok(())
    }

    /// Adopts a descriptor received from a peer as a new handle in this session.
    pub(crate) fn import(&self, fd: OwnedFd, meta: HandleMeta) -> Result<BufferHandle> {
        if self.inner.is_closed() {
            return Err(IonError::InvalidHandle);
        }
        match fd::len(fd.as_fd()) {
            Ok(actual) if actual != meta.size => {
                return Err(IonError::Protocol(format!(
                    "received buffer is {actual} bytes, sender announced {}",
                    meta.size
                )));
            }
            Ok(_) => {}
            Err(err) => debug!("ion: cannot probe received buffer size: {err}"),
        }
        let raw = fd.as_raw_fd();
        self.inner.record(raw, Origin::Imported, meta.size);
        let id = HandleId { session: self.inner.id, fd: raw };
        debug!("ion: imported {id} size {}", meta.size);
        Ok(BufferHandle::new(Arc::clone(&self.inner), id, fd, meta, None, Origin::Imported, None))
    }

    /// Records a duplicate descriptor of an existing handle; it shares the original's charge.
    pub(crate) fn adopt_duplicate(
        inner: &Arc<SessionInner>,
        fd: OwnedFd,
        meta: HandleMeta,
        heap_id: Option<u32>,
        charge: Option<Arc<Charge>>,
    ) -> Result<BufferHandle> {
        if inner.is_closed() {
            return Err(IonError::InvalidHandle);
        }
        let raw = fd.as_raw_fd();
        inner.record(raw, Origin::Duplicated, meta.size);
        let id = HandleId { session: inner.id, fd: raw };
        Ok(BufferHandle::new(Arc::clone(inner), id, fd, meta, heap_id, Origin::Duplicated, charge))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.service.name())
            .field("outstanding", &self.inner.outstanding())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.inner.is_closed() {
            warn!("ion: session {} dropped without close", self.inner.id);
            self.inner.shutdown();
        }
    }
}
