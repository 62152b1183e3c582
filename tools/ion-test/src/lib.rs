// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: ION allocator test harness (library half of the `ion-test` binary)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal
//! TEST_COVERAGE: Unit tests per module + tests/cli.rs
//!
//! PUBLIC API:
//!   - ScenarioConfig: parameters shared by every scenario (JSON + CLI overrides)
//!   - alloc_test / map_test / share_test / map_suite (map_suite_on): operator scenarios
//!   - share_parent / share_child: the two halves of the share scenario over a channel
//!   - HarnessError: scenario failure taxonomy
//!
//! DEPENDENCIES:
//!   - ion-client: sessions, handles, mappings, transfer channel
//!   - serde/serde_json: config files and the child's config hand-off
//!   - clap: value enums for the command line

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod config;
mod scenario;

use ion_client::IonError;
use thiserror::Error;

pub use config::{
    format_prot, format_sharing, parse_len, parse_number, parse_prot, parse_sharing, parse_u32,
    BackendKind, ScenarioConfig,
};
pub use scenario::{
    alloc_test, map_suite, map_suite_on, map_test, share_child, share_parent, share_test,
    CaseOutcome, Scenario, SuiteReport, CHILD, MASTER, SUITE_SIZES,
};

/// Reasons a scenario fails.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Allocator, mapping or channel failure.
    #[error(transparent)]
    Ion(#[from] IonError),
    /// Unreadable or invalid configuration.
    #[error("config: {0}")]
    Config(String),
    /// Memory did not hold the expected byte.
    #[error("{what}: byte {offset:#x} reads {found:#04x}, expected {expected:#04x}")]
    Mismatch {
        /// Check that failed.
        what: &'static str,
        /// Offset within the mapping.
        offset: usize,
        /// Byte that should be there.
        expected: u8,
        /// Byte that was read.
        found: u8,
    },
    /// The share exchange observed the wrong content or identity.
    #[error("share: {0}")]
    Share(String),
    /// The child process could not be started or exited unsuccessfully.
    #[error("peer process: {0}")]
    Peer(String),
    /// One or more map suite cases failed.
    #[error("{failed} of {total} suite cases failed")]
    SuiteFailed {
        /// Failed cases.
        failed: usize,
        /// Cases run.
        total: usize,
    },
}
