// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::io;

use thiserror::Error;

/// Result alias for allocator client operations.
pub type Result<T> = core::result::Result<T, IonError>;

/// Errors surfaced by sessions, handles, regions and transfer channels.
#[derive(Debug, Error)]
pub enum IonError {
    /// The allocation service could not be reached or the connection is closed.
    #[error("allocation service unavailable: {0}")]
    ServiceUnavailable(String),
    /// No selected heap had room for the request.
    #[error("out of memory")]
    OutOfMemory,
    /// The heap mask selects no heap the service knows.
    #[error("no usable heap in mask {0:#x}")]
    InvalidHeap(u32),
    /// The service refused the request for the caller.
    #[error("permission denied")]
    PermissionDenied,
    /// Allocations must be at least one byte.
    #[error("allocation size must be non-zero")]
    InvalidSize,
    /// The handle was already released or its session is closed.
    #[error("invalid or closed buffer handle")]
    InvalidHandle,
    /// The region was already unmapped or the kernel rejected the unmap.
    #[error("invalid or already unmapped region")]
    InvalidRegion,
    /// Misaligned or out-of-bounds mapping window.
    #[error("invalid mapping window: offset {offset:#x} len {len:#x} buffer size {size:#x}")]
    InvalidOffset {
        /// Requested offset into the buffer.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Size of the underlying buffer.
        size: u64,
    },
    /// The kernel could not place the mapping.
    #[error("no address space left for mapping")]
    OutOfAddressSpace,
    /// Access not permitted by the region's protection.
    #[error("access not permitted by region protection")]
    AccessDenied,
    /// A session was closed while handles were still open.
    #[error("session closed with {0} outstanding handle(s)")]
    OutstandingHandles(usize),
    /// The peer endpoint hung up.
    #[error("transfer channel closed by peer")]
    ChannelClosed,
    /// A handle was expected but the message carried none.
    #[error("message carried no buffer handle")]
    NoHandleAttached,
    /// Non-blocking operation could not make progress.
    #[error("operation would block")]
    WouldBlock,
    /// The requested wait budget elapsed.
    #[error("operation timed out")]
    Timeout,
    /// Malformed or unexpected transfer message.
    #[error("transfer protocol error: {0}")]
    Protocol(String),
    /// Unclassified operating-system failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl IonError {
    /// Classifies an errno returned by an allocation request.
    pub(crate) fn from_alloc(err: io::Error, heap_mask: u32) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOMEM) => Self::OutOfMemory,
            Some(libc::ENODEV | libc::EINVAL) => Self::InvalidHeap(heap_mask),
            Some(libc::EPERM | libc::EACCES) => Self::PermissionDenied,
            _ => Self::Io(err),
        }
    }

    /// Classifies an errno returned by mmap.
    pub(crate) fn from_map(err: io::Error, offset: u64, len: u64, size: u64) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOMEM) => Self::OutOfAddressSpace,
            Some(libc::EBADF | libc::ENODEV) => Self::InvalidHandle,
            Some(libc::EACCES | libc::EPERM) => Self::PermissionDenied,
            Some(libc::EINVAL | libc::EOVERFLOW) => Self::InvalidOffset { offset, len, size },
            _ => Self::Io(err),
        }
    }
}
