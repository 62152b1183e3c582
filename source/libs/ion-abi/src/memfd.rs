// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sealed anonymous memory files, used as stand-in buffers where no ION device exists.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Creates a memfd of exactly `len` bytes, sealed against growing and shrinking.
pub fn create(name: &str, len: u64) -> io::Result<OwnedFd> {
    let name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "memfd name contains NUL"))?;
    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: memfd_create returned a fresh descriptor that nothing else owns.
    let file = File::from(unsafe { OwnedFd::from_raw_fd(raw) });
    file.set_len(len)?;

    let seals = libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL;
    // SAFETY: F_ADD_SEALS takes an integer argument and touches no user memory.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_ADD_SEALS, seals) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(OwnedFd::from(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd;
    use std::os::fd::AsFd;

    #[test]
    fn memfd_has_requested_length_and_cannot_grow() {
        let memfd = create("memfd-test", 8192).expect("memfd");
        assert_eq!(fd::len(memfd.as_fd()).expect("len"), 8192);
        let file = File::from(memfd);
        let err = file.set_len(16384).expect_err("sealed against growth");
        assert_eq!(err.raw_os_error(), Some(libc::EPERM));
    }

    #[test]
    fn interior_nul_is_rejected() {
        let err = create("bad\0name", 4096).expect_err("nul in name");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
