// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Duplex channel carrying a payload plus at most one buffer handle per message
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/transfer.rs
//!
//! PUBLIC API:
//!   - channel_pair(): two connected endpoints
//!   - TransferChannel::send(payload, Option<&BufferHandle>, Wait)
//!   - TransferChannel::receive(&Session, Wait) -> TransferMessage
//!   - TransferChannel::into_inheritable_fd()/from_inherited_fd(): hand an endpoint to a child
//!   - Wait: Blocking | NonBlocking | Timeout(d)
//!
//! The transport is an `AF_UNIX` sequenced-packet socket pair: one frame per message, the
//! handle's descriptor attached as `SCM_RIGHTS`. The receiver gets a new descriptor number for
//! the same memory and adopts it into its own session as an imported handle.
//!
//! BLOCKING SEMANTICS:
//!   - `Wait::Blocking` waits until the transport accepts the frame (send) or a frame arrives
//!     (receive). There is no cancellation: a receive with no matching peer send blocks forever
//!     unless the peer closes its endpoint, which surfaces as `ChannelClosed`.
//!   - Endpoints must alternate strictly (send, receive, send, receive). Both sides sending
//!     without matching receives can fill the socket buffers and deadlock; nothing here detects
//!     or breaks that.
//!   - `Wait::NonBlocking` and `Wait::Timeout` turn the waits into `WouldBlock` / `Timeout`.
//!
//! ERROR CONDITIONS:
//!   - ChannelClosed: the peer endpoint is gone
//!   - NoHandleAttached: a handle was required but the message carried none
//!   - Protocol: malformed frame, surplus descriptors, or size mismatch; any received
//!     descriptor is closed before returning

use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use ion_abi::{fd, scm};
use log::{debug, trace};

use crate::{BufferHandle, IonError, Result, Session};

pub mod wire;

use wire::{decode_frame, encode_frame, MAX_FRAME};

/// Wait behaviour for a channel operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Wait {
    /// Block until the operation completes or the peer hangs up.
    #[default]
    Blocking,
    /// Return `WouldBlock` if no progress can be made.
    NonBlocking,
    /// Block at most this long, then return `Timeout`. A zero duration behaves as NonBlocking.
    Timeout(Duration),
}

impl Wait {
    /// Returns `true` when the caller requested a non-blocking attempt.
    pub const fn is_non_blocking(self) -> bool {
        matches!(self, Self::NonBlocking)
    }

    /// Converts a [`Wait::Timeout`] variant into its [`Duration`].
    pub const fn timeout(self) -> Option<Duration> {
        match self {
            Self::Timeout(duration) => Some(duration),
            Self::Blocking | Self::NonBlocking => None,
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Send,
    Receive,
}

/// A received message.
#[derive(Debug)]
pub struct TransferMessage {
    payload: Vec<u8>,
    handle: Option<BufferHandle>,
}

impl TransferMessage {
    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Attached handle, if any.
    pub fn handle(&self) -> Option<&BufferHandle> {
        self.handle.as_ref()
    }

    /// Splits into payload and optional handle.
    pub fn into_parts(self) -> (Vec<u8>, Option<BufferHandle>) {
        (self.payload, self.handle)
    }

    /// Takes the attached handle; `NoHandleAttached` if there is none.
    pub fn into_handle(self) -> Result<BufferHandle> {
        self.handle.ok_or(IonError::NoHandleAttached)
    }
}

/// Creates two connected channel endpoints.
pub fn channel_pair() -> Result<(TransferChannel, TransferChannel)> {
    let (a, b) = scm::seqpacket_pair()?;
    Ok((TransferChannel::from_fd(a), TransferChannel::from_fd(b)))
}

/// One endpoint of a handle transfer channel.
pub struct TransferChannel {
    socket: UnixStream,
}

impl TransferChannel {
    /// Wraps a connected `SOCK_SEQPACKET` socket.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { socket: UnixStream::from(fd) }
    }

    /// Adopts an endpoint inherited across exec; validates `raw` and marks it close-on-exec.
    pub fn from_inherited_fd(raw: RawFd) -> Result<Self> {
        let fd = fd::adopt_inherited(raw)?;
        debug!("ion: adopted inherited channel fd {raw}");
        Ok(Self::from_fd(fd))
    }

    /// Releases the endpoint as a descriptor that survives exec in a child process.
    pub fn into_inheritable_fd(self) -> Result<OwnedFd> {
        let fd = OwnedFd::from(self.socket);
        fd::set_inheritable(fd.as_fd(), true)?;
        Ok(fd)
    }

    fn arm(&self, wait: Wait, direction: Direction) -> Result<bool> {
        let timeout = match wait {
            Wait::Blocking => None,
            Wait::NonBlocking => return Ok(true),
            Wait::Timeout(duration) if duration.is_zero() => return Ok(true),
            Wait::Timeout(duration) => Some(duration),
        };
        match direction {
            Direction::Send => self.socket.set_write_timeout(timeout)?,
            Direction::Receive => self.socket.set_read_timeout(timeout)?,
        }
        Ok(false)
    }

    /// Sends `payload` and, optionally, a handle.
    ///
    /// The local handle stays valid; the peer receives its own handle to the same memory.
    pub fn send(&mut self, payload: &[u8], handle: Option<&BufferHandle>, wait: Wait) -> Result<()> {
        let attached = match handle {
            Some(handle) => Some((handle.live_fd()?, handle.meta())),
            None => None,
        };
        let frame = encode_frame(payload, attached.map(|(_, meta)| meta))
            .map_err(|err| IonError::Protocol(err.to_string()))?;
        let nonblocking = self.arm(wait, Direction::Send)?;
        let sent = scm::send_with_fd(
            self.socket.as_fd(),
            &frame,
            attached.map(|(fd, _)| fd),
            nonblocking,
        )
        .map_err(|err| channel_error(err, wait))?;
        if sent != frame.len() {
            return Err(IonError::Protocol(format!("short send: {sent} of {} bytes", frame.len())));
        }
        trace!(
            "ion: sent {} payload bytes{}",
            payload.len(),
            handle.map(|handle| format!(" with {}", handle.id())).unwrap_or_default()
        );
        Ok(())
    }

    /// Receives the next message; an attached handle is imported into `session`.
    pub fn receive(&mut self, session: &Session, wait: Wait) -> Result<TransferMessage> {
        let nonblocking = self.arm(wait, Direction::Receive)?;
        let mut buf = vec![0u8; MAX_FRAME];
        let mut received = scm::recv_with_fds(self.socket.as_fd(), &mut buf, nonblocking)
            .map_err(|err| channel_error(err, wait))?;
        if received.len == 0 && received.fds.is_empty() && !received.truncated {
            return Err(IonError::ChannelClosed);
        }
        if received.truncated {
            return Err(IonError::Protocol("message or control data truncated".into()));
        }
        let (header, payload) = decode_frame(&buf[..received.len])
            .map_err(|err| IonError::Protocol(err.to_string()))?;
        let handle = match (header.handle, received.fds.len()) {
            (None, 0) => None,
            (Some(meta), 1) => match received.fds.pop() {
                Some(fd) => Some(session.import(fd, meta)?),
                None => None,
            },
            (Some(_), 0) => {
                return Err(IonError::Protocol("handle flag set but no descriptor attached".into()))
            }
            (_, count) => {
                return Err(IonError::Protocol(format!("{count} descriptor(s) for one message")))
            }
        };
        trace!("ion: received {} payload bytes", payload.len());
        Ok(TransferMessage { payload: payload.to_vec(), handle })
    }

    /// Receives a message that must carry a handle.
    pub fn receive_handle(&mut self, session: &Session, wait: Wait) -> Result<(Vec<u8>, BufferHandle)> {
        let (payload, handle) = self.receive(session, wait)?.into_parts();
        Ok((payload, handle.ok_or(IonError::NoHandleAttached)?))
    }
}

impl AsFd for TransferChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl fmt::Debug for TransferChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferChannel").field("socket", &self.socket.as_fd()).finish()
    }
}

fn channel_error(err: io::Error, wait: Wait) -> IonError {
    match err.raw_os_error() {
        Some(libc::EPIPE | libc::ECONNRESET | libc::ENOTCONN) => IonError::ChannelClosed,
        Some(libc::EAGAIN) => match wait.timeout() {
            Some(duration) if !duration.is_zero() => IonError::Timeout,
            _ => IonError::WouldBlock,
        },
        _ => IonError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostConfig, HostService};
    use crate::{AllocFlags, HeapMask, Origin};

    fn host_session() -> Session {
        Session::with_service(Box::new(HostService::new(HostConfig::default())))
    }

    #[test]
    fn payload_only_message() {
        let session = host_session();
        let (mut a, mut b) = channel_pair().expect("pair");
        a.send(b"ping", None, Wait::Blocking).expect("send");
        let message = b.receive(&session, Wait::Blocking).expect("receive");
        assert_eq!(message.payload(), b"ping");
        assert!(message.handle().is_none());
        assert!(matches!(message.into_handle(), Err(IonError::NoHandleAttached)));
        session.close().expect("close");
    }

    #[test]
    fn handle_is_imported_with_new_identity() {
        let sender = host_session();
        let receiver = host_session();
        let (mut a, mut b) = channel_pair().expect("pair");
        let handle = sender.allocate(8192, HeapMask::SYSTEM, AllocFlags::CACHED).expect("alloc");
        a.send(b"buf", Some(&handle), Wait::Blocking).expect("send");

        let (payload, imported) = b.receive_handle(&receiver, Wait::Blocking).expect("receive");
        assert_eq!(payload, b"buf");
        assert_eq!(imported.origin(), Origin::Imported);
        assert_eq!(imported.size(), handle.size());
        assert_eq!(imported.flags(), AllocFlags::CACHED);
        assert_ne!(imported.id(), handle.id());
        assert_eq!(receiver.outstanding(), 1);

        imported.free().expect("free imported");
        handle.free().expect("free original");
        receiver.close().expect("close receiver");
        sender.close().expect("close sender");
    }

    #[test]
    fn missing_handle_is_reported() {
        let session = host_session();
        let (mut a, mut b) = channel_pair().expect("pair");
        a.send(b"no handle", None, Wait::Blocking).expect("send");
        let err = b.receive_handle(&session, Wait::Blocking).expect_err("no handle");
        assert!(matches!(err, IonError::NoHandleAttached));
        session.close().expect("close");
    }

    #[test]
    fn peer_close_is_channel_closed() {
        let session = host_session();
        let (mut a, b) = channel_pair().expect("pair");
        drop(b);
        assert!(matches!(a.send(b"x", None, Wait::Blocking), Err(IonError::ChannelClosed)));
        assert!(matches!(a.receive(&session, Wait::Blocking), Err(IonError::ChannelClosed)));
        session.close().expect("close");
    }

    #[test]
    fn wait_policies() {
        let session = host_session();
        let (_a, mut b) = channel_pair().expect("pair");
        assert!(matches!(b.receive(&session, Wait::NonBlocking), Err(IonError::WouldBlock)));
        let err = b
            .receive(&session, Wait::Timeout(Duration::from_millis(20)))
            .expect_err("nothing sent");
        assert!(matches!(err, IonError::Timeout));
        session.close().expect("close");
    }

    #[test]
    fn oversized_payload_is_refused() {
        let (mut a, _b) = channel_pair().expect("pair");
        let big = vec![0u8; wire::MAX_PAYLOAD + 1];
        assert!(matches!(a.send(&big, None, Wait::Blocking), Err(IonError::Protocol(_))));
    }

    #[test]
    fn handle_flag_without_descriptor_is_protocol_error() {
        let session = host_session();
        let (a, mut b) = channel_pair().expect("pair");
        let meta = wire::HandleMeta { size: 4096, heap_mask: HeapMask::SYSTEM, flags: AllocFlags::empty() };
        let frame = encode_frame(b"", Some(meta)).expect("encode");
        scm::send_with_fd(a.as_fd(), &frame, None, false).expect("raw send");
        assert!(matches!(b.receive(&session, Wait::Blocking), Err(IonError::Protocol(_))));
        assert_eq!(session.outstanding(), 0);
        session.close().expect("close");
    }

    #[test]
    fn descriptor_without_handle_flag_is_closed() {
        let session = host_session();
        let (a, mut b) = channel_pair().expect("pair");
        let stray = ion_abi::memfd::create("stray", 4096).expect("memfd");
        let frame = encode_frame(b"", None).expect("encode");
        scm::send_with_fd(a.as_fd(), &frame, Some(stray.as_fd()), false).expect("raw send");
        assert!(matches!(b.receive(&session, Wait::Blocking), Err(IonError::Protocol(_))));
        assert_eq!(session.outstanding(), 0);
        session.close().expect("close");
    }

    #[test]
    fn size_mismatch_is_protocol_error() {
        let session = host_session();
        let (a, mut b) = channel_pair().expect("pair");
        let buffer = ion_abi::memfd::create("short", 4096).expect("memfd");
        let meta = wire::HandleMeta { size: 8192, heap_mask: HeapMask::SYSTEM, flags: AllocFlags::empty() };
        let frame = encode_frame(b"", Some(meta)).expect("encode");
        scm::send_with_fd(a.as_fd(), &frame, Some(buffer.as_fd()), false).expect("raw send");
        assert!(matches!(b.receive(&session, Wait::Blocking), Err(IonError::Protocol(_))));
        assert_eq!(session.outstanding(), 0);
        session.close().expect("close");
    }
}
