// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Transfer channel frame codec (pure byte-level helpers).
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal (framing is private to the two channel endpoints)
//! TEST_COVERAGE: Unit tests (host)
//!
//! Frame shape (little endian, 24-byte header):
//! `[I,T,ver,flags, payload_len:u32, size:u64, heap_mask:u32, alloc_flags:u32, payload...]`
//!
//! The descriptor itself travels out of band in `SCM_RIGHTS`; the header carries the handle
//! attributes the receiver needs to rebuild a BufferHandle around it.
//!
//! INVARIANTS:
//!   - Never panics on malformed/truncated input
//!   - payload_len matches the bytes following the header exactly
//!   - Handle fields are zero when FLAG_HANDLE is clear

use core::fmt;

use crate::{AllocFlags, HeapMask};

/// Frame magic (byte 0).
pub const MAGIC0: u8 = b'I';
/// Frame magic (byte 1).
pub const MAGIC1: u8 = b'T';
/// Protocol version.
pub const VERSION: u8 = 1;
/// A descriptor accompanies the frame.
pub const FLAG_HANDLE: u8 = 0x01;
/// Header length in bytes.
pub const HEADER_LEN: usize = 24;
/// Maximum payload length in bytes.
pub const MAX_PAYLOAD: usize = 4096;
/// Largest frame a receiver must accept.
pub const MAX_FRAME: usize = HEADER_LEN + MAX_PAYLOAD;

/// Attributes of a transferred handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleMeta {
    /// Buffer size in bytes.
    pub size: u64,
    /// Heap mask the buffer was allocated with.
    pub heap_mask: HeapMask,
    /// Allocation flags.
    pub flags: AllocFlags,
}

/// Decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload bytes following the header.
    pub payload_len: u32,
    /// Handle attributes when a descriptor is attached.
    pub handle: Option<HandleMeta>,
}

/// Errors when encoding or decoding transfer frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireError {
    /// Buffer is shorter than the header.
    Truncated,
    /// Magic bytes were incorrect.
    BadMagic,
    /// Unsupported protocol version.
    BadVersion(u8),
    /// Unknown flag bits set.
    BadFlags(u8),
    /// Payload exceeds [`MAX_PAYLOAD`].
    TooLarge(usize),
    /// Declared payload length disagrees with the frame length.
    LengthMismatch {
        /// Length from the header.
        declared: u32,
        /// Bytes actually following the header.
        actual: usize,
    },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "frame shorter than {HEADER_LEN}-byte header"),
            Self::BadMagic => write!(f, "bad frame magic"),
            Self::BadVersion(version) => write!(f, "unsupported frame version {version}"),
            Self::BadFlags(flags) => write!(f, "unknown frame flags {flags:#04x}"),
            Self::TooLarge(len) => write!(f, "payload of {len} bytes exceeds {MAX_PAYLOAD}"),
            Self::LengthMismatch { declared, actual } => {
                write!(f, "header declares {declared} payload bytes, frame carries {actual}")
            }
        }
    }
}

/// Encodes a frame.
pub fn encode_frame(payload: &[u8], handle: Option<HandleMeta>) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[MAGIC0, MAGIC1, VERSION]);
    out.push(if handle.is_some() { FLAG_HANDLE } else { 0 });
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let meta = handle.unwrap_or(HandleMeta {
        size: 0,
        heap_mask: HeapMask::empty(),
        flags: AllocFlags::empty(),
    });
    out.extend_from_slice(&meta.size.to_le_bytes());
    out.extend_from_slice(&meta.heap_mask.bits().to_le_bytes());
    out.extend_from_slice(&meta.flags.bits().to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Decodes a frame into its header and payload.
pub fn decode_frame(buf: &[u8]) -> Result<(FrameHeader, &[u8]), WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    if buf[0] != MAGIC0 || buf[1] != MAGIC1 {
        return Err(WireError::BadMagic);
    }
    if buf[2] != VERSION {
        return Err(WireError::BadVersion(buf[2]));
    }
    let flags = buf[3];
    if flags & !FLAG_HANDLE != 0 {
        return Err(WireError::BadFlags(flags));
    }
    let payload_len = u32_at(buf, 4);
    let payload = &buf[HEADER_LEN..];
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::TooLarge(payload.len()));
    }
    if payload_len as usize != payload.len() {
        return Err(WireError::LengthMismatch { declared: payload_len, actual: payload.len() });
    }
    let handle = (flags & FLAG_HANDLE != 0).then(|| HandleMeta {
        size: u64::from_le_bytes([
            buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
        ]),
        heap_mask: HeapMask::from_bits_retain(u32_at(buf, 16)),
        flags: AllocFlags::from_bits_retain(u32_at(buf, 20)),
    });
    Ok((FrameHeader { payload_len, handle }, payload))
}
