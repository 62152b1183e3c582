// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Scenario configuration (JSON file + command line overrides)
//! OWNERS: @runtime
//!
//! Defaults: 1 MiB buffers from heap mask 0x1, no allocation flags, PROT_READ|PROT_WRITE,
//! MAP_SHARED, auto backend on /dev/ion, blocking channel waits.
//!
//! `--prot` takes `PROT_*` names and `--map-flags` takes `MAP_*` names. Numbers accept decimal
//! or `0x` hex.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use ion_client::{AllocFlags, Backend, HeapMask, HostConfig, Prot, Sharing, Wait, DEFAULT_DEVICE};
use serde::{Deserialize, Serialize};

use crate::HarnessError;

/// Which allocation backend the scenarios use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The ION device when present, host emulation otherwise.
    #[default]
    Auto,
    /// The ION device only.
    Device,
    /// memfd host emulation.
    Host,
}

/// Parameters shared by every scenario.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Buffer length in bytes.
    pub len: usize,
    /// Raw heap selector.
    pub heap_mask: u32,
    /// Raw allocation flags.
    pub alloc_flags: u32,
    /// Mapping protection.
    #[serde(with = "prot_names")]
    pub prot: Prot,
    /// Mapping visibility.
    #[serde(with = "sharing_names")]
    pub map_flags: Sharing,
    /// Allocation backend.
    pub backend: BackendKind,
    /// Device node for the `auto` and `device` backends.
    pub device: PathBuf,
    /// Channel wait budget; blocking when absent.
    pub timeout_ms: Option<u64>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            len: 1024 * 1024,
            heap_mask: 1,
            alloc_flags: 0,
            prot: Prot::READ | Prot::WRITE,
            map_flags: Sharing::Shared,
            backend: BackendKind::Auto,
            device: PathBuf::from(DEFAULT_DEVICE),
            timeout_ms: None,
        }
    }
}

impl ScenarioConfig {
    /// Loads a JSON config file; absent keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let text = fs::read_to_string(path)
            .map_err(|err| HarnessError::Config(format!("{}: {err}", path.display())))?;
        Self::from_json(&text).map_err(|err| match err {
            HarnessError::Config(message) => {
                HarnessError::Config(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    /// Parses a JSON document.
    pub fn from_json(text: &str) -> Result<Self, HarnessError> {
        serde_json::from_str(text).map_err(|err| HarnessError::Config(err.to_string()))
    }

    /// Serialises to a single-line JSON document.
    pub fn to_json(&self) -> Result<String, HarnessError> {
        serde_json::to_string(self).map_err(|err| HarnessError::Config(err.to_string()))
    }

    /// Backend selection for [`ion_client::Session::open`].
    pub fn backend(&self) -> Backend {
        match self.backend {
            BackendKind::Auto => Backend::Auto { device: self.device.clone() },
            BackendKind::Device => Backend::Device(self.device.clone()),
            BackendKind::Host => Backend::Host(HostConfig::default()),
        }
    }

    /// Heap selector.
    pub fn heap_mask(&self) -> HeapMask {
        HeapMask::from_bits_retain(self.heap_mask)
    }

    /// Allocation flags.
    pub fn alloc_flags(&self) -> AllocFlags {
        AllocFlags::from_bits_retain(self.alloc_flags)
    }

    /// Wait policy for channel operations.
    pub fn wait(&self) -> Wait {
        match self.timeout_ms {
            Some(ms) => Wait::Timeout(Duration::from_millis(ms)),
            None => Wait::Blocking,
        }
    }
}

impl fmt::Display for ScenarioConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "len {}, map_flags {}, prot {}, heap_mask {:#x}, alloc_flags {:#x}",
            self.len,
            format_sharing(self.map_flags),
            format_prot(self.prot),
            self.heap_mask,
            self.alloc_flags
        )
    }
}

/// Parses decimal or `0x`-prefixed hexadecimal.
pub fn parse_number(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.map_err(|err| format!("invalid number {text:?}: {err}"))
}

/// [`parse_number`] narrowed to `usize`.
pub fn parse_len(text: &str) -> Result<usize, String> {
    let value = parse_number(text)?;
    usize::try_from(value).map_err(|_| format!("{value} does not fit in usize"))
}

/// [`parse_number`] narrowed to `u32`.
pub fn parse_u32(text: &str) -> Result<u32, String> {
    let value = parse_number(text)?;
    u32::try_from(value).map_err(|_| format!("{value:#x} does not fit in 32 bits"))
}

fn names(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| c == '|' || c == ',' || c.is_whitespace()).filter(|name| !name.is_empty())
}

/// Parses `PROT_READ|PROT_WRITE`-style protection names; `PROT_NONE` is the empty set.
pub fn parse_prot(text: &str) -> Result<Prot, String> {
    let mut prot = Prot::empty();
    let mut any = false;
    for name in names(text) {
        any = true;
        prot |= match name.to_ascii_uppercase().trim_start_matches("PROT_") {
            "READ" => Prot::READ,
            "WRITE" => Prot::WRITE,
            "EXEC" => Prot::EXEC,
            "NONE" => Prot::empty(),
            _ => return Err(format!("unknown protection {name:?} (expected PROT_READ, PROT_WRITE, PROT_EXEC, PROT_NONE)")),
        };
    }
    if !any {
        return Err("empty protection; use PROT_NONE".into());
    }
    Ok(prot)
}

/// Parses `MAP_SHARED` or `MAP_PRIVATE`.
pub fn parse_sharing(text: &str) -> Result<Sharing, String> {
    let mut sharing = None;
    for name in names(text) {
        let next = match name.to_ascii_uppercase().trim_start_matches("MAP_") {
            "SHARED" => Sharing::Shared,
            "PRIVATE" => Sharing::Private,
            _ => return Err(format!("unknown mapping flag {name:?} (expected MAP_SHARED or MAP_PRIVATE)")),
        };
        if sharing.is_some_and(|prev| prev != next) {
            return Err("MAP_SHARED and MAP_PRIVATE are exclusive".into());
        }
        sharing = Some(next);
    }
    sharing.ok_or_else(|| "missing mapping flag".into())
}

/// Inverse of [`parse_prot`].
pub fn format_prot(prot: Prot) -> String {
    if prot.is_empty() {
        return "PROT_NONE".into();
    }
    let mut parts = Vec::new();
    for (flag, name) in [(Prot::READ, "PROT_READ"), (Prot::WRITE, "PROT_WRITE"), (Prot::EXEC, "PROT_EXEC")] {
        if prot.contains(flag) {
            parts.push(name);
        }
    }
    parts.join("|")
}

/// Inverse of [`parse_sharing`].
pub fn format_sharing(sharing: Sharing) -> &'static str {
    match sharing {
        Sharing::Shared => "MAP_SHARED",
        Sharing::Private => "MAP_PRIVATE",
    }
}

mod prot_names {
    use ion_client::Prot;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(prot: &Prot, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_prot(*prot))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Prot, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_prot(&text).map_err(de::Error::custom)
    }
}

mod sharing_names {
    use ion_client::Sharing;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sharing: &Sharing, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(super::format_sharing(*sharing))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Sharing, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_sharing(&text).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn numbers_accept_decimal_and_hex() {
        assert_eq!(parse_number("1048576"), Ok(1 << 20));
        assert_eq!(parse_number("0x100000"), Ok(1 << 20));
        assert_eq!(parse_number(" 0XfF "), Ok(255));
        assert!(parse_number("1MiB").is_err());
        assert!(parse_u32("0x1_0000_0000").is_err());
        assert!(parse_u32("4294967296").is_err());
        assert_eq!(parse_u32("0x11"), Ok(0x11));
    }

    #[test]
    fn prot_names_parse_and_format() {
        assert_eq!(parse_prot("PROT_READ|PROT_WRITE"), Ok(Prot::READ | Prot::WRITE));
        assert_eq!(parse_prot("read, exec"), Ok(Prot::READ | Prot::EXEC));
        assert_eq!(parse_prot("PROT_NONE"), Ok(Prot::empty()));
        assert!(parse_prot("MAP_SHARED").is_err());
        assert!(parse_prot("").is_err());
        assert_eq!(format_prot(Prot::READ | Prot::WRITE), "PROT_READ|PROT_WRITE");
        assert_eq!(format_prot(Prot::empty()), "PROT_NONE");
    }

    #[test]
    fn sharing_names_parse() {
        assert_eq!(parse_sharing("MAP_PRIVATE"), Ok(Sharing::Private));
        assert_eq!(parse_sharing("shared"), Ok(Sharing::Shared));
        assert!(parse_sharing("MAP_SHARED|MAP_PRIVATE").is_err());
        assert!(parse_sharing("PROT_READ").is_err());
    }

    #[test]
    fn json_keeps_defaults_and_rejects_unknown_keys() {
        let config = ScenarioConfig::from_json(r#"{"len": 4096, "prot": "PROT_READ", "backend": "host"}"#)
            .expect("parse");
        assert_eq!(config.len, 4096);
        assert_eq!(config.prot, Prot::READ);
        assert_eq!(config.backend, BackendKind::Host);
        assert_eq!(config.map_flags, Sharing::Shared);
        assert_eq!(config.heap_mask, 1);

        let err = ScenarioConfig::from_json(r#"{"length": 4096}"#).expect_err("unknown key");
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn json_roundtrip_for_peer_handoff() {
        let config = ScenarioConfig {
            len: 8192,
            map_flags: Sharing::Private,
            prot: Prot::READ,
            timeout_ms: Some(250),
            ..ScenarioConfig::default()
        };
        let back = ScenarioConfig::from_json(&config.to_json().expect("json")).expect("parse");
        assert_eq!(back, config);
        assert_eq!(back.wait(), Wait::Timeout(Duration::from_millis(250)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, r#"{{"heap_mask": 16, "alloc_flags": 1}}"#).expect("write");
        let config = ScenarioConfig::load(file.path()).expect("load");
        assert_eq!(config.heap_mask(), HeapMask::DMA);
        assert_eq!(config.alloc_flags(), AllocFlags::CACHED);

        let missing = ScenarioConfig::load(Path::new("/nonexistent/ion-test.json")).expect_err("missing");
        assert!(missing.to_string().contains("/nonexistent/ion-test.json"));
    }

    #[test]
    fn display_matches_operator_header() {
        let text = ScenarioConfig::default().to_string();
        assert_eq!(
            text,
            "len 1048576, map_flags MAP_SHARED, prot PROT_READ|PROT_WRITE, heap_mask 0x1, alloc_flags 0x0"
        );
    }
}
