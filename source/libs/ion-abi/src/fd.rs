// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Descriptor helpers: buffer length probing and inheritance across exec.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Returns the size of a dma-buf or memfd by seeking to its end.
///
/// The position is rewound to zero afterwards; dma-buf only supports these two seeks.
pub fn len(fd: BorrowedFd<'_>) -> io::Result<u64> {
    // SAFETY: lseek takes integer arguments only.
    let end = unsafe { libc::lseek(fd.as_raw_fd(), 0, libc::SEEK_END) };
    if end < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    let rc = unsafe { libc::lseek(fd.as_raw_fd(), 0, libc::SEEK_SET) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(end as u64)
}

/// Sets or clears `FD_CLOEXEC`.
pub fn set_inheritable(fd: BorrowedFd<'_>, inheritable: bool) -> io::Result<()> {
    // SAFETY: F_GETFD takes no argument.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let updated = if inheritable {
        flags & !libc::FD_CLOEXEC
    } else {
        flags | libc::FD_CLOEXEC
    };
    // SAFETY: F_SETFD takes an integer argument.
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, updated) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Takes ownership of a descriptor inherited from the parent process.
///
/// The number must be open (checked with `F_GETFD`) and must not be owned by anything else
/// in this process; it is marked close-on-exec again once adopted.
pub fn adopt_inherited(raw: RawFd) -> io::Result<OwnedFd> {
    if raw < 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    // SAFETY: F_GETFD only probes whether `raw` is open.
    if unsafe { libc::fcntl(raw, libc::F_GETFD) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the descriptor is open and, by contract, was handed to this process for its
    // exclusive use by the parent.
    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
    set_inheritable(std::os::fd::AsFd::as_fd(&owned), false)?;
    Ok(owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn inheritable_flag_roundtrip() {
        let file = std::fs::File::open("/dev/null").expect("open");
        set_inheritable(file.as_fd(), true).expect("clear cloexec");
        // SAFETY: probing flags on a descriptor we own.
        let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);
        set_inheritable(file.as_fd(), false).expect("set cloexec");
        // SAFETY: as above.
        let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn adopting_a_closed_descriptor_fails() {
        assert!(adopt_inherited(-1).is_err());
        assert!(adopt_inherited(1 << 20).is_err());
    }
}
