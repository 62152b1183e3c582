// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Owned mmap windows over buffer descriptors
//! OWNERS: @runtime
//! PUBLIC API: Mapping, Prot, Sharing, page_size()
//! INVARIANTS:
//!   - A Mapping owns its address range exclusively and unmaps it on drop
//!   - Byte accessors never touch memory outside `[0, len)`
//!   - Reads require Prot::READ and writes require Prot::WRITE, so a PROT_NONE or read-only
//!     window reports PermissionDenied instead of faulting

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

bitflags::bitflags! {
    /// Page protection for a mapping; the empty set is `PROT_NONE`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Prot: i32 {
        /// `PROT_READ`.
        const READ = libc::PROT_READ;
        /// `PROT_WRITE`.
        const WRITE = libc::PROT_WRITE;
        /// `PROT_EXEC`.
        const EXEC = libc::PROT_EXEC;
    }
}

/// Visibility of writes made through a mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Sharing {
    /// `MAP_SHARED`: writes reach the underlying buffer.
    #[default]
    Shared,
    /// `MAP_PRIVATE`: copy-on-write, invisible to other mappings.
    Private,
}

impl Sharing {
    const fn raw(self) -> libc::c_int {
        match self {
            Self::Shared => libc::MAP_SHARED,
            Self::Private => libc::MAP_PRIVATE,
        }
    }
}

/// Returns the system page size.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf has no memory-safety preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(raw).ok().filter(|size| *size > 0).unwrap_or(4096)
    })
}

/// An mmap'd window over a descriptor.
#[derive(Debug)]
pub struct Mapping {
    base: NonNull<u8>,
    len: usize,
    prot: Prot,
}

// SAFETY: the mapping is exclusively owned and carries no thread-affine state; moving it
// between threads only moves the right to access and unmap the range.
unsafe impl Send for Mapping {}

impl Mapping {
    /// Maps `len` bytes of `fd` starting at `offset`.
    pub fn map(
        fd: BorrowedFd<'_>,
        len: usize,
        prot: Prot,
        sharing: Sharing,
        offset: u64,
    ) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let offset =
            libc::off_t::try_from(offset).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        // SAFETY: a NULL hint lets the kernel pick a fresh range, so no existing Rust object
        // is aliased; the result is checked against MAP_FAILED before use.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot.bits(),
                sharing.raw(),
                fd.as_raw_fd(),
                offset,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        Ok(Self { base, len, prot })
    }

    /// Unmaps the window, reporting the kernel's verdict.
    pub fn unmap(self) -> io::Result<()> {
        let (base, len) = (self.base, self.len);
        std::mem::forget(self);
        // SAFETY: `base..base+len` was returned by mmap and, with `self` forgotten, no
        // accessor can reach it afterwards.
        let rc = unsafe { libc::munmap(base.as_ptr().cast(), len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Length of the window in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; zero-length mappings are rejected at creation.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Virtual address of the first byte.
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Protection the window was mapped with.
    pub fn prot(&self) -> Prot {
        self.prot
    }

    fn check(&self, offset: usize, count: usize, need: Prot) -> io::Result<()> {
        if !self.prot.contains(need) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        match offset.checked_add(count) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "access outside mapping")),
        }
    }

    /// Copies `buf.len()` bytes starting at `offset` out of the window.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        self.check(offset, buf.len(), Prot::READ)?;
        // SAFETY: bounds and PROT_READ were checked above; `buf` is a distinct local slice.
        unsafe {
            ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copies `bytes` into the window starting at `offset`.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> io::Result<()> {
        self.check(offset, bytes.len(), Prot::WRITE)?;
        // SAFETY: bounds and PROT_WRITE were checked above; `bytes` cannot alias the window
        // because `&mut self` excludes any slice borrowed from it.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.as_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Sets `count` bytes starting at `offset` to `byte`.
    pub fn fill(&mut self, offset: usize, count: usize, byte: u8) -> io::Result<()> {
        self.check(offset, count, Prot::WRITE)?;
        // SAFETY: bounds and PROT_WRITE were checked above.
        unsafe {
            ptr::write_bytes(self.base.as_ptr().add(offset), byte, count);
        }
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: the range came from mmap and is released exactly once here.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}
