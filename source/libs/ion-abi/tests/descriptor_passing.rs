// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration test for descriptor passing plus shared mappings at the raw ABI level
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 1 integration test
//!
//! TEST_SCENARIOS:
//!   - passed_descriptor_maps_same_memory(): bytes written through the sender's mapping are
//!     visible through a mapping of the received descriptor, and vice versa
//!
//! DEPENDENCIES:
//!   - ion_abi::{memfd, scm, mman}

use std::os::fd::AsFd;

use ion_abi::{memfd, page_size, scm, Mapping, Prot, Sharing};

#[test]
fn passed_descriptor_maps_same_memory() {
    let page = page_size();
    let buffer = memfd::create("abi-pass", page as u64).expect("memfd");
    let mut sender = Mapping::map(buffer.as_fd(), page, Prot::READ | Prot::WRITE, Sharing::Shared, 0)
        .expect("sender map");
    sender.write_at(0, b"master\0").expect("write master");

    let (a, b) = scm::seqpacket_pair().expect("pair");
    scm::send_with_fd(a.as_fd(), b"buf", Some(buffer.as_fd()), false).expect("send");
    drop(buffer);

    let mut bytes = [0u8; 8];
    let received = scm::recv_with_fds(b.as_fd(), &mut bytes, false).expect("recv");
    let peer_fd = received.fds.into_iter().next().expect("descriptor attached");
    let mut receiver =
        Mapping::map(peer_fd.as_fd(), page, Prot::READ | Prot::WRITE, Sharing::Shared, 0)
            .expect("receiver map");

    let mut seen = [0u8; 7];
    receiver.read_at(0, &mut seen).expect("read");
    assert_eq!(&seen, b"master\0");

    receiver.write_at(0, b"child\0").expect("write child");
    let mut back = [0u8; 6];
    sender.read_at(0, &mut back).expect("read back");
    assert_eq!(&back, b"child\0");

    receiver.unmap().expect("unmap receiver");
    sender.unmap().expect("unmap sender");
}
