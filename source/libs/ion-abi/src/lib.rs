// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![deny(clippy::all, missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

//! CONTEXT: ION / dma-buf uapi definitions shared by the userland allocator client
//! OWNERS: @runtime
//! PUBLIC API: HeapMask, AllocFlags, HeapType, IonAllocationData, IonHeapQuery, IonHeapData,
//!             DmaBufSync; modules ioctl, mman, memfd, scm, fd
//! DEPENDS_ON: libc, bitflags
//! INVARIANTS: Struct layouts match include/uapi/linux/ion.h (4.12+ interface) and
//!             include/uapi/linux/dma-buf.h; request codes use the asm-generic _IOC encoding;
//!             every unsafe block wraps exactly one syscall or one pointer access

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("ion-abi: ION and dma-buf descriptors only exist on Linux and Android targets");

use core::mem::size_of;

pub mod fd;
pub mod ioctl;
pub mod memfd;
pub mod mman;
pub mod scm;

pub use mman::{page_size, Mapping, Prot, Sharing};

/// Maximum length of a heap name reported by `ION_IOC_HEAP_QUERY`, NUL included.
pub const MAX_HEAP_NAME: usize = 32;

bitflags::bitflags! {
    /// Heap selector passed to `ION_IOC_ALLOC`; bit `n` selects heap id `n`.
    ///
    /// The named bits follow the legacy convention where heap id equals heap type. Platforms
    /// with custom heap numbering pass raw bits, which are retained as-is.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct HeapMask: u32 {
        /// Vmalloc-style system heap.
        const SYSTEM = 1 << 0;
        /// Physically contiguous system heap.
        const SYSTEM_CONTIG = 1 << 1;
        /// Reserved carveout region.
        const CARVEOUT = 1 << 2;
        /// Chunk heap.
        const CHUNK = 1 << 3;
        /// CMA-backed DMA heap.
        const DMA = 1 << 4;
        const _ = !0;
    }
}

impl HeapMask {
    /// Mask selecting the single heap `id`; ids beyond 31 yield an empty mask.
    pub const fn from_id(id: u32) -> Self {
        if id >= u32::BITS {
            Self::empty()
        } else {
            Self::from_bits_retain(1 << id)
        }
    }

    /// Iterates the heap ids selected by this mask, lowest first.
    pub fn ids(self) -> impl Iterator<Item = u32> {
        let bits = self.bits();
        (0..u32::BITS).filter(move |id| bits & (1 << id) != 0)
    }
}

bitflags::bitflags! {
    /// Allocation flags passed to `ION_IOC_ALLOC`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// CPU mappings may be cached; device access requires explicit sync.
        const CACHED = 1 << 0;
        /// Legacy hint that cached mappings are synced on fault rather than on map.
        const CACHED_NEEDS_SYNC = 1 << 1;
        const _ = !0;
    }
}

/// Heap implementation type reported by `ION_IOC_HEAP_QUERY`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// `ION_HEAP_TYPE_SYSTEM`.
    System,
    /// `ION_HEAP_TYPE_SYSTEM_CONTIG`.
    SystemContig,
    /// `ION_HEAP_TYPE_CARVEOUT`.
    Carveout,
    /// `ION_HEAP_TYPE_CHUNK`.
    Chunk,
    /// `ION_HEAP_TYPE_DMA`.
    Dma,
    /// Vendor-defined heap types.
    Custom(u32),
}

impl HeapType {
    /// Decodes the raw uapi value.
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::System,
            1 => Self::SystemContig,
            2 => Self::Carveout,
            3 => Self::Chunk,
            4 => Self::Dma,
            other => Self::Custom(other),
        }
    }

    /// Encodes the uapi value.
    pub const fn raw(self) -> u32 {
        match self {
            Self::System => 0,
            Self::SystemContig => 1,
            Self::Carveout => 2,
            Self::Chunk => 3,
            Self::Dma => 4,
            Self::Custom(other) => other,
        }
    }
}

impl core::fmt::Display for HeapType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::SystemContig => f.write_str("system-contig"),
            Self::Carveout => f.write_str("carveout"),
            Self::Chunk => f.write_str("chunk"),
            Self::Dma => f.write_str("dma"),
            Self::Custom(raw) => write!(f, "custom-{raw}"),
        }
    }
}

/// `struct ion_allocation_data`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IonAllocationData {
    /// Requested length in bytes.
    pub len: u64,
    /// Heap selector.
    pub heap_id_mask: u32,
    /// Allocation flags.
    pub flags: u32,
    /// Returned dma-buf descriptor.
    pub fd: u32,
    /// Padding.
    pub unused: u32,
}

/// `struct ion_heap_data`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IonHeapData {
    /// NUL-padded heap name.
    pub name: [u8; MAX_HEAP_NAME],
    /// Raw [`HeapType`].
    pub heap_type: u32,
    /// Heap id; bit position in [`HeapMask`].
    pub heap_id: u32,
    /// Reserved.
    pub reserved0: u32,
    /// Reserved.
    pub reserved1: u32,
    /// Reserved.
    pub reserved2: u32,
}

impl IonHeapData {
    /// Returns the heap name up to the first NUL byte.
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(MAX_HEAP_NAME);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

/// `struct ion_heap_query`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IonHeapQuery {
    /// In: capacity of `heaps`; out: number of heaps.
    pub cnt: u32,
    /// Reserved.
    pub reserved0: u32,
    /// User pointer to an array of [`IonHeapData`].
    pub heaps: u64,
    /// Reserved.
    pub reserved1: u32,
    /// Reserved.
    pub reserved2: u32,
}

/// `struct dma_buf_sync`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DmaBufSync {
    /// [`DmaBufSyncFlags`] bits.
    pub flags: u64,
}

bitflags::bitflags! {
    /// Flags for `DMA_BUF_IOCTL_SYNC`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DmaBufSyncFlags: u64 {
        /// CPU reads are bracketed.
        const READ = 1 << 0;
        /// CPU writes are bracketed.
        const WRITE = 1 << 1;
        /// Ends the CPU access window; without it the call starts one.
        const END = 1 << 2;
    }
}

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// Encodes an ioctl request number (`_IOC`).
pub const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
}

/// ION ioctl magic.
pub const ION_IOC_MAGIC: u8 = b'I';
/// `ION_IOC_ALLOC`: allocate and return a dma-buf descriptor.
pub const ION_IOC_ALLOC: u32 =
    ioc(IOC_READ | IOC_WRITE, ION_IOC_MAGIC, 0, size_of::<IonAllocationData>());
/// `ION_IOC_HEAP_QUERY`: enumerate heaps.
pub const ION_IOC_HEAP_QUERY: u32 =
    ioc(IOC_READ | IOC_WRITE, ION_IOC_MAGIC, 8, size_of::<IonHeapQuery>());
/// dma-buf ioctl magic.
pub const DMA_BUF_BASE: u8 = b'b';
/// `DMA_BUF_IOCTL_SYNC`: bracket CPU access to a dma-buf.
pub const DMA_BUF_IOCTL_SYNC: u32 = ioc(IOC_WRITE, DMA_BUF_BASE, 0, size_of::<DmaBufSync>());
