// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Handle-based ION buffer allocation and cross-process sharing
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + integration tests under tests/
//!
//! PUBLIC API:
//!   - Session: owns the allocation-service connection and the ledger of live handles
//!   - BufferHandle: descriptor-backed allocation owned by one Session
//!   - MappedRegion: bounded mmap window borrowed from a BufferHandle
//!   - TransferChannel: blocking duplex channel carrying a payload plus at most one handle
//!   - AllocService: seam for allocation backends (ION device, host memfd emulation)
//!   - IonError: error taxonomy shared by all of the above
//!
//! DEPENDENCIES:
//!   - ion-abi: uapi definitions and the raw syscalls (all unsafe code lives there)
//!   - parking_lot::Mutex: ledger and backend state
//!   - log: warnings for leaked handles and sessions
//!
//! INVARIANTS:
//!   - A handle is released at most once; the ledger refuses a second release
//!   - A MappedRegion cannot outlive the BufferHandle it maps (borrow), so unmap precedes free
//!   - Closing a Session with live handles is reported as OutstandingHandles, never silently

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod backend;
mod buffer;
mod error;
mod region;
mod session;
pub mod transfer;

pub use backend::{
    AllocService, Allocation, Backend, DeviceService, HeapInfo, HostConfig, HostHeap,
    HostService, DEFAULT_DEVICE,
};
pub use buffer::{BufferHandle, Origin};
pub use error::{IonError, Result};
pub use ion_abi::{page_size, AllocFlags, HeapMask, HeapType, Prot, Sharing};
pub use region::MappedRegion;
pub use session::{HandleId, Session, SessionId};
pub use transfer::{channel_pair, TransferChannel, TransferMessage, Wait};
