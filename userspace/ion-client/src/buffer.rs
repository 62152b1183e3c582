// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Buffer handles: one descriptor, one ledger entry, released exactly once
//! OWNERS: @runtime
//!
//! A handle is either allocated through its session, imported from a transfer channel, or a
//! local duplicate. An allocated handle and its duplicates share one `Charge`; the backend
//! gets the charge back when the last of them is released. Imported handles carry no charge
//! and releasing them only closes the descriptor. The memory itself lives until every
//! descriptor, in every process, is gone.

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use log::{debug, warn};

use crate::region::MappedRegion;
use crate::session::{HandleId, Session, SessionId, SessionInner};
use crate::transfer::wire::HandleMeta;
use crate::{AllocFlags, HeapMask, IonError, Prot, Result, Sharing};

/// How a handle came into its session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Returned by [`Session::allocate`].
    Allocated,
    /// Received over a [`crate::TransferChannel`].
    Imported,
    /// Produced by [`BufferHandle::duplicate`].
    Duplicated,
}

/// Backend accounting for one allocation, shared by every local handle that references it.
#[derive(Debug)]
pub(crate) struct Charge {
    size: u64,
    heap_id: Option<u32>,
}

impl Charge {
    pub(crate) fn new(size: u64, heap_id: Option<u32>) -> Arc<Self> {
        Arc::new(Self { size, heap_id })
    }
}

/// Reference to a shared-memory buffer owned by one [`Session`].
///
/// Dropping a handle without [`BufferHandle::free`] still releases it but logs a warning.
pub struct BufferHandle {
    id: HandleId,
    fd: Option<OwnedFd>,
    meta: HandleMeta,
    heap_id: Option<u32>,
    origin: Origin,
    charge: Option<Arc<Charge>>,
    session: Arc<SessionInner>,
}

impl BufferHandle {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        id: HandleId,
        fd: OwnedFd,
        meta: HandleMeta,
        heap_id: Option<u32>,
        origin: Origin,
        charge: Option<Arc<Charge>>,
    ) -> Self {
        Self { id, fd: Some(fd), meta, heap_id, origin, charge, session }
    }

    /// Process-local identifier.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Session the handle belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Buffer size in bytes (page-rounded by the backend).
    pub fn size(&self) -> u64 {
        self.meta.size
    }

    /// Heap mask the buffer was requested with.
    pub fn heap_mask(&self) -> HeapMask {
        self.meta.heap_mask
    }

    /// Allocation flags the buffer was requested with.
    pub fn flags(&self) -> AllocFlags {
        self.meta.flags
    }

    /// Heap that satisfied the allocation, when known.
    pub fn heap_id(&self) -> Option<u32> {
        self.heap_id
    }

    /// Where this handle came from.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// `true` when CPU access needs explicit sync calls.
    pub fn is_cached(&self) -> bool {
        self.meta.flags.contains(AllocFlags::CACHED)
    }

    pub(crate) fn meta(&self) -> HandleMeta {
        self.meta
    }

    /// Borrows the descriptor; fails once the owning session is closed.
    pub(crate) fn live_fd(&self) -> Result<BorrowedFd<'_>> {
        if self.session.is_closed() {
            return Err(IonError::InvalidHandle);
        }
        self.fd.as_ref().map(AsFd::as_fd).ok_or(IonError::InvalidHandle)
    }

    pub(crate) fn session(&self) -> &SessionInner {
        &self.session
    }

    /// Maps `len` bytes starting at the page-aligned `offset`.
    pub fn map(&self, len: usize, prot: Prot, sharing: Sharing, offset: u64) -> Result<MappedRegion<'_>> {
        MappedRegion::new(self, len, prot, sharing, offset)
    }

    /// Maps the whole buffer read/write and shared.
    pub fn map_all(&self) -> Result<MappedRegion<'_>> {
        let len = usize::try_from(self.meta.size).map_err(|_| IonError::OutOfAddressSpace)?;
        self.map(len, Prot::READ | Prot::WRITE, Sharing::Shared, 0)
    }

    /// New handle in the same session referencing the same memory.
    pub fn duplicate(&self) -> Result<BufferHandle> {
        let fd = self.live_fd()?.try_clone_to_owned()?;
        let dup = Session::adopt_duplicate(
            &self.session,
            fd,
            self.meta,
            self.heap_id,
            self.charge.clone(),
        )?;
        debug!("ion: duplicated {} as {}", self.id, dup.id);
        Ok(dup)
    }

    /// Releases this handle.
    ///
    /// Fails with `InvalidHandle` when the owning session was already closed; the descriptor is
    /// closed either way.
    pub fn free(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let fd = self.fd.take().ok_or(IonError::InvalidHandle)?;
        if self.session.is_closed() {
            return Err(IonError::InvalidHandle);
        }
        if !self.session.forget(self.id) {
            return Err(IonError::InvalidHandle);
        }
        debug!("ion: released {} ({:?}, {} bytes)", self.id, self.origin, self.meta.size);
        match self.charge.take().and_then(Arc::into_inner) {
            Some(charge) => self.session.service().release(fd, charge.size, charge.heap_id),
            None => {
                drop(fd);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.id)
            .field("size", &self.meta.size)
            .field("heap_mask", &self.meta.heap_mask)
            .field("flags", &self.meta.flags)
            .field("origin", &self.origin)
            .finish()
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if self.fd.is_none() || self.session.is_closed() {
            return;
        }
        warn!("ion: handle {} dropped without free", self.id);
        if let Err(err) = self.release() {
            warn!("ion: releasing dropped handle {} failed: {err}", self.id);
        }
    }
}
