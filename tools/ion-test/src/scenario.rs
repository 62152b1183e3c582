// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Operator scenarios: alloc, map, share (parent/child) and the per-heap map suite
//! OWNERS: @runtime
//!
//! Every scenario frees what it allocated and closes its session even when a step fails; the
//! first failure is what gets reported.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::process::Command;

use ion_client::{
    channel_pair, page_size, AllocFlags, BufferHandle, HandleId, HeapMask, MappedRegion, Prot,
    Session, Sharing, TransferChannel,
};
use log::{debug, info, warn};

use crate::{HarnessError, ScenarioConfig};

/// Text the parent writes before handing the buffer over.
pub const MASTER: &str = "master";
/// Text the child writes back.
pub const CHILD: &str = "child";
/// Buffer sizes exercised by the map suite.
pub const SUITE_SIZES: [usize; 4] = [4 * 1024, 64 * 1024, 1024 * 1024, 2 * 1024 * 1024];

/// Operator-selectable scenario.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    /// Allocate then free one buffer.
    Alloc,
    /// Allocate, map, write and verify `i mod 256`, unmap, free.
    Map,
    /// Hand a buffer to a child process and observe its write.
    Share,
    /// Map suite over every heap the service reports.
    Suite,
}

impl Scenario {
    /// Name used in the pass/fail line.
    pub fn name(self) -> &'static str {
        match self {
            Self::Alloc => "alloc",
            Self::Map => "map",
            Self::Share => "share",
            Self::Suite => "map suite",
        }
    }
}

fn with_buffer(
    session: &Session,
    len: usize,
    heap_mask: HeapMask,
    flags: AllocFlags,
    body: impl FnOnce(&BufferHandle) -> Result<(), HarnessError>,
) -> Result<(), HarnessError> {
    let handle = session.allocate(len, heap_mask, flags)?;
    debug!("allocated {} ({} bytes)", handle.id(), handle.size());
    let outcome = body(&handle);
    let freed = handle.free();
    outcome?;
    freed?;
    Ok(())
}

fn with_session(
    config: &ScenarioConfig,
    body: impl FnOnce(&Session) -> Result<(), HarnessError>,
) -> Result<(), HarnessError> {
    let session = Session::open(&config.backend())?;
    info!("session {} on {} backend", session.id(), session.backend_name());
    let outcome = body(&session);
    let closed = session.close();
    outcome?;
    closed?;
    Ok(())
}

fn expect_byte(region: &MappedRegion<'_>, offset: usize, expected: u8, what: &'static str) -> Result<(), HarnessError> {
    let found = region.byte_at(offset)?;
    if found != expected {
        return Err(HarnessError::Mismatch { what, offset, expected, found });
    }
    Ok(())
}

/// Allocates one buffer with the configured parameters and frees it.
pub fn alloc_test(config: &ScenarioConfig) -> Result<(), HarnessError> {
    with_session(config, |session| {
        with_buffer(session, config.len, config.heap_mask(), config.alloc_flags(), |_| Ok(()))
    })
}

/// Writes `i mod 256` through a mapping and reads it back.
pub fn map_test(config: &ScenarioConfig) -> Result<(), HarnessError> {
    with_session(config, |session| {
        with_buffer(session, config.len, config.heap_mask(), config.alloc_flags(), |handle| {
            let mut region = handle.map(config.len, config.prot, config.map_flags, 0)?;
            region.write_pattern()?;
            if let Some(offset) = region.verify_pattern()? {
                let found = region.byte_at(offset)?;
                return Err(HarnessError::Mismatch { what: "map", offset, expected: offset as u8, found });
            }
            region.unmap()?;
            Ok(())
        })
    })
}

/// Runs the share scenario with the child side in a re-executed copy of `exe`.
///
/// The child gets its channel endpoint as an inherited descriptor (`--peer-fd`) and the
/// configuration as JSON (`--peer-config`).
pub fn share_test(config: &ScenarioConfig, exe: &Path) -> Result<(), HarnessError> {
    let (parent_end, child_end) = channel_pair()?;
    let child_fd = child_end.into_inheritable_fd()?;
    let mut child = Command::new(exe)
        .arg("--peer-fd")
        .arg(child_fd.as_raw_fd().to_string())
        .arg("--peer-config")
        .arg(config.to_json()?)
        .spawn()
        .map_err(|err| HarnessError::Peer(format!("spawn {}: {err}", exe.display())))?;
    drop(child_fd);
    info!("child process {}", child.id());

    let outcome = share_parent(config, parent_end);
    let status = child.wait().map_err(|err| HarnessError::Peer(format!("wait: {err}")))?;
    outcome?;
    if !status.success() {
        return Err(HarnessError::Peer(format!("child {status}")));
    }
    Ok(())
}

/// Parent side of the share scenario.
///
/// Writes [`MASTER`], sends the handle, waits for the child's reply carrying its own handle
/// id, checks the unchanged mapping now reads [`CHILD`], then a ping/pong round.
pub fn share_parent(config: &ScenarioConfig, mut channel: TransferChannel) -> Result<(), HarnessError> {
    let wait = config.wait();
    with_session(config, |session| {
        with_buffer(session, config.len, config.heap_mask(), config.alloc_flags(), |handle| {
            let mut region = handle.map(config.len, config.prot, config.map_flags, 0)?;
            region.write_cstr(0, MASTER)?;
            info!("master? [{}] should be [{MASTER}]", region.read_cstr(0)?);
            channel.send(b"buf", Some(handle), wait)?;

            let reply = channel.receive(session, wait)?;
            let seen = region.read_cstr(0)?;
            info!("master? [{seen}] should be [{CHILD}]");
            if seen != CHILD {
                return Err(HarnessError::Share(format!("parent mapping reads {seen:?}, expected {CHILD:?}")));
            }
            let peer = HandleId::from_bytes(reply.payload())
                .ok_or_else(|| HarnessError::Share("reply does not carry the child's handle id".into()))?;
            info!("master handle {}, child handle {peer}", handle.id());
            if peer == handle.id() {
                return Err(HarnessError::Share(format!("child reports the parent's handle id {peer}")));
            }

            channel.send(b"ping", None, wait)?;
            let pong = channel.receive(session, wait)?;
            if pong.payload() != b"pong" {
                return Err(HarnessError::Share("child did not answer ping".into()));
            }
            region.unmap()?;
            Ok(())
        })
    })
}

/// Child side of the share scenario.
pub fn share_child(config: &ScenarioConfig, mut channel: TransferChannel) -> Result<(), HarnessError> {
    let wait = config.wait();
    with_session(config, |session| {
        let (_, handle) = channel.receive_handle(session, wait)?;
        info!("child {}", handle.id());
        let outcome = child_rounds(config, &handle, session, &mut channel);
        let freed = handle.free();
        outcome?;
        freed?;
        Ok(())
    })
}

fn child_rounds(
    config: &ScenarioConfig,
    handle: &BufferHandle,
    session: &Session,
    channel: &mut TransferChannel,
) -> Result<(), HarnessError> {
    let wait = config.wait();
    let mut region = handle.map(config.len, config.prot, config.map_flags, 0)?;
    let seen = region.read_cstr(0)?;
    info!("child? [{seen}] should be [{MASTER}]");
    if seen != MASTER {
        return Err(HarnessError::Share(format!("child mapping reads {seen:?}, expected {MASTER:?}")));
    }
    region.write_cstr(0, CHILD)?;
    channel.send(&handle.id().to_bytes(), None, wait)?;

    let ping = channel.receive(session, wait)?;
    if ping.payload() != b"ping" {
        return Err(HarnessError::Share("unexpected message instead of ping".into()));
    }
    channel.send(b"pong", None, wait)?;
    region.unmap()?;
    Ok(())
}

/// Result of one map suite case.
#[derive(Debug)]
pub struct CaseOutcome {
    /// Case name.
    pub case: &'static str,
    /// Heap the case ran on.
    pub heap: String,
    /// Buffer size.
    pub size: usize,
    /// Pass or the first failure.
    pub result: Result<(), HarnessError>,
}

/// All map suite outcomes.
#[derive(Debug, Default)]
pub struct SuiteReport {
    /// Outcomes in execution order.
    pub cases: Vec<CaseOutcome>,
}

impl SuiteReport {
    /// Number of failed cases.
    pub fn failures(&self) -> usize {
        self.cases.iter().filter(|case| case.result.is_err()).count()
    }

    /// `Ok` when every case passed.
    pub fn into_result(self) -> Result<(), HarnessError> {
        match self.failures() {
            0 => Ok(()),
            failed => Err(HarnessError::SuiteFailed { failed, total: self.cases.len() }),
        }
    }
}

fn map_fd(session: &Session, mask: HeapMask, size: usize) -> Result<(), HarnessError> {
    with_buffer(session, size, mask, AllocFlags::empty(), |handle| {
        let mut region = handle.map(size, Prot::READ | Prot::WRITE, Sharing::Shared, 0)?;
        region.fill(0, size, 0xaa)?;
        expect_byte(&region, size - 1, 0xaa, "map_fd")?;
        region.unmap()?;
        Ok(())
    })
}

fn map_offset(session: &Session, mask: HeapMask) -> Result<(), HarnessError> {
    let page = page_size();
    with_buffer(session, 2 * page, mask, AllocFlags::empty(), |handle| {
        let mut whole = handle.map(2 * page, Prot::READ | Prot::WRITE, Sharing::Shared, 0)?;
        whole.fill(0, page, 0)?;
        whole.fill(page, page, 0xaa)?;
        whole.unmap()?;

        let second = handle.map(page, Prot::READ | Prot::WRITE, Sharing::Shared, page as u64)?;
        expect_byte(&second, 0, 0xaa, "map_offset")?;
        expect_byte(&second, page - 1, 0xaa, "map_offset")?;
        second.unmap()?;
        Ok(())
    })
}

fn map_cached(session: &Session, mask: HeapMask, size: usize, flags: AllocFlags) -> Result<(), HarnessError> {
    with_buffer(session, size, mask, flags, |handle| {
        let mut region = handle.map(size, Prot::READ | Prot::WRITE, Sharing::Shared, 0)?;
        region.begin_cpu_access()?;
        region.fill(0, size, 0xaa)?;
        if flags.contains(AllocFlags::CACHED_NEEDS_SYNC) {
            region.sync_for_device()?;
        }
        expect_byte(&region, 0, 0xaa, "map_cached")?;
        // Closes the CPU access window when no explicit sync did.
        region.unmap()?;
        Ok(())
    })
}

/// Runs `map_fd`, `map_offset`, `map_cached` and `map_cached_needs_sync` on every heap.
pub fn map_suite(config: &ScenarioConfig) -> Result<SuiteReport, HarnessError> {
    map_suite_on(Session::open(&config.backend())?)
}

/// [`map_suite`] on an already open session; the session is closed on every path.
pub fn map_suite_on(session: Session) -> Result<SuiteReport, HarnessError> {
    let heaps = match session.heaps() {
        Ok(heaps) => heaps,
        Err(err) => {
            if let Err(close_err) = session.close() {
                warn!("closing session after failed heap query: {close_err}");
            }
            return Err(err.into());
        }
    };
    let mut report = SuiteReport::default();
    for heap in &heaps {
        let mask = heap.mask();
        let mut record = |case: &'static str, size: usize, result: Result<(), HarnessError>| {
            debug!("{case} heap {} size {size}: {}", heap.name, if result.is_ok() { "ok" } else { "FAILED" });
            report.cases.push(CaseOutcome { case, heap: heap.name.clone(), size, result });
        };
        for size in SUITE_SIZES {
            record("map_fd", size, map_fd(&session, mask, size));
        }
        record("map_offset", 2 * page_size(), map_offset(&session, mask));
        for size in SUITE_SIZES {
            record("map_cached", size, map_cached(&session, mask, size, AllocFlags::CACHED));
        }
        for size in SUITE_SIZES {
            let flags = AllocFlags::CACHED | AllocFlags::CACHED_NEEDS_SYNC;
            record("map_cached_needs_sync", size, map_cached(&session, mask, size, flags));
        }
    }
    session.close()?;
    Ok(report)
}
