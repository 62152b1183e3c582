// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for handle transfer between two sessions
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 integration tests
//!
//! TEST_SCOPE:
//!   - Master/child exchange: content is shared, identities differ
//!   - Memory outlives the sender's free while the receiver holds a handle
//!   - Peer failure surfaces as ChannelClosed rather than a hang
//!
//! TEST_SCENARIOS:
//!   - master_child_exchange(): child reads "master", writes "child"; parent's mapping sees it
//!   - received_buffer_survives_sender_free(): receiver still reads after sender freed
//!   - peer_exit_is_channel_closed(): receive on an endpoint whose peer thread exited
//!
//! DEPENDENCIES:
//!   - ion_client::{Session, TransferChannel}: two host sessions stand in for two processes

use std::thread;

use ion_client::{
    channel_pair, AllocFlags, Backend, HandleId, HeapMask, HostConfig, IonError, Origin, Session,
    Wait,
};

fn host() -> Session {
    Session::open(&Backend::Host(HostConfig::default())).expect("host session")
}

#[test]
fn master_child_exchange() {
    let parent = host();
    let (mut to_child, mut to_parent) = channel_pair().expect("pair");

    let child = thread::spawn(move || -> ion_client::Result<HandleId> {
        let session = host();
        let (_, handle) = to_parent.receive_handle(&session, Wait::Blocking)?;
        let id = handle.id();
        {
            let mut region = handle.map_all()?;
            assert_eq!(region.read_cstr(0)?, "master");
            region.write_cstr(0, "child")?;
            region.unmap()?;
        }
        handle.free()?;
        to_parent.send(b"done", None, Wait::Blocking)?;
        session.close()?;
        Ok(id)
    });

    let handle = parent.allocate(4096, HeapMask::SYSTEM, AllocFlags::empty()).expect("alloc");
    let mut region = handle.map_all().expect("map");
    region.write_cstr(0, "master").expect("write master");
    to_child.send(b"buf", Some(&handle), Wait::Blocking).expect("send handle");

    let reply = to_child.receive(&parent, Wait::Blocking).expect("reply");
    assert_eq!(reply.payload(), b"done");
    assert_eq!(region.read_cstr(0).expect("read"), "child");

    let child_id = child.join().expect("child thread").expect("child side");
    assert_ne!(child_id, handle.id());
    assert_ne!(child_id.session(), handle.session_id());

    region.unmap().expect("unmap");
    handle.free().expect("free");
    parent.close().expect("close");
}

#[test]
fn received_buffer_survives_sender_free() {
    let sender = host();
    let receiver = host();
    let (mut a, mut b) = channel_pair().expect("pair");

    let handle = sender.allocate(8192, HeapMask::SYSTEM, AllocFlags::empty()).expect("alloc");
    {
        let mut region = handle.map_all().expect("map");
        region.write_pattern().expect("pattern");
        region.unmap().expect("unmap");
    }
    a.send(&[], Some(&handle), Wait::Blocking).expect("send");
    handle.free().expect("sender free");
    sender.close().expect("sender close");

    let imported = b.receive(&receiver, Wait::Blocking).expect("receive").into_handle().expect("handle");
    assert_eq!(imported.origin(), Origin::Imported);
    let region = imported.map_all().expect("map imported");
    assert_eq!(region.verify_pattern().expect("verify"), None);
    region.unmap().expect("unmap");
    imported.free().expect("free");
    receiver.close().expect("receiver close");
}

#[test]
fn peer_exit_is_channel_closed() {
    let session = host();
    let (mut parent_end, child_end) = channel_pair().expect("pair");
    thread::spawn(move || drop(child_end)).join().expect("peer thread");
    let err = parent_end.receive(&session, Wait::Blocking).expect_err("peer gone");
    assert!(matches!(err, IonError::ChannelClosed));
    session.close().expect("close");
}
