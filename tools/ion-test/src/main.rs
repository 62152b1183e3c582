// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: `ion-test` command line entry point
//! INTENT: Exercise ION allocation, mapping and cross-process sharing from a shell
//! EXIT CODES: 0 passed, 1 scenario failed, 2 usage error

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, ArgGroup, Parser};
use ion_client::{Prot, Sharing, TransferChannel};
use ion_test::{
    alloc_test, map_suite, map_test, parse_len, parse_prot, parse_sharing, parse_u32,
    share_child, share_test, BackendKind, HarnessError, Scenario, ScenarioConfig,
};
use log::error;

#[derive(Debug, Parser)]
#[command(name = "ion-test", version, about = "Exercise the ION buffer allocator")]
#[command(group(ArgGroup::new("scenario").args(["alloc", "map", "share", "suite"])))]
struct Cli {
    /// Allocate and free one buffer.
    #[arg(long)]
    alloc: bool,
    /// Map a buffer and verify an `i mod 256` pattern.
    #[arg(long)]
    map: bool,
    /// Share a buffer with a child process.
    #[arg(long)]
    share: bool,
    /// Run the map suite on every heap.
    #[arg(long)]
    suite: bool,
    /// Buffer length in bytes (decimal or 0x hex).
    #[arg(long, value_parser = parse_len)]
    len: Option<usize>,
    /// Heap selector bits.
    #[arg(long, alias = "heap_mask", value_parser = parse_u32)]
    heap_mask: Option<u32>,
    /// Allocation flags (1 = cached, 2 = cached needs sync).
    #[arg(long, alias = "alloc_flags", value_parser = parse_u32)]
    alloc_flags: Option<u32>,
    /// Mapping protection, e.g. PROT_READ|PROT_WRITE.
    #[arg(long, value_parser = parse_prot)]
    prot: Option<Prot>,
    /// MAP_SHARED or MAP_PRIVATE.
    #[arg(long, alias = "map_flags", value_parser = parse_sharing)]
    map_flags: Option<Sharing>,
    /// Allocation backend.
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,
    /// ION device node.
    #[arg(long)]
    device: Option<PathBuf>,
    /// Give up on channel operations after this many milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// JSON file with scenario defaults; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Raise log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    #[arg(long, hide = true)]
    peer_fd: Option<i32>,
    #[arg(long, hide = true, requires = "peer_fd")]
    peer_config: Option<String>,
}

impl Cli {
    fn scenario(&self) -> Option<Scenario> {
        [
            (self.alloc, Scenario::Alloc),
            (self.map, Scenario::Map),
            (self.share, Scenario::Share),
            (self.suite, Scenario::Suite),
        ]
        .into_iter()
        .find_map(|(selected, scenario)| selected.then_some(scenario))
    }

    fn config(&self) -> Result<ScenarioConfig, HarnessError> {
        let mut config = match &self.config {
            Some(path) => ScenarioConfig::load(path)?,
            None => ScenarioConfig::default(),
        };
        if let Some(len) = self.len {
            config.len = len;
        }
        if let Some(heap_mask) = self.heap_mask {
            config.heap_mask = heap_mask;
        }
        if let Some(alloc_flags) = self.alloc_flags {
            config.alloc_flags = alloc_flags;
        }
        if let Some(prot) = self.prot {
            config.prot = prot;
        }
        if let Some(map_flags) = self.map_flags {
            config.map_flags = map_flags;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
        if self.timeout_ms.is_some() {
            config.timeout_ms = self.timeout_ms;
        }
        Ok(config)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run_child(fd: i32, config: Option<&str>) -> ExitCode {
    let config = match config.map(ScenarioConfig::from_json).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(err) => {
            error!("child: {err}");
            return ExitCode::FAILURE;
        }
    };
    let outcome = TransferChannel::from_inherited_fd(fd)
        .map_err(HarnessError::from)
        .and_then(|channel| share_child(&config, channel));
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("child: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(scenario: Scenario, config: &ScenarioConfig) -> Result<(), HarnessError> {
    match scenario {
        Scenario::Alloc => alloc_test(config),
        Scenario::Map => map_test(config),
        Scenario::Share => {
            let exe = std::env::current_exe()
                .map_err(|err| HarnessError::Peer(format!("cannot locate own executable: {err}")))?;
            share_test(config, &exe)
        }
        Scenario::Suite => {
            let report = map_suite(config)?;
            for case in &report.cases {
                match &case.result {
                    Ok(()) => println!("{} heap {} size {}: passed", case.case, case.heap, case.size),
                    Err(err) => {
                        println!("{} heap {} size {}: failed, {err}", case.case, case.heap, case.size)
                    }
                }
            }
            report.into_result()
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(fd) = cli.peer_fd {
        return run_child(fd, cli.peer_config.as_deref());
    }

    let config = match cli.config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("ion-test: {err}");
            return ExitCode::from(2);
        }
    };
    let Some(scenario) = cli.scenario() else {
        eprintln!("must specify a test (--alloc, --map, --share, --suite)");
        return ExitCode::from(2);
    };

    println!("test {}, {config}", scenario.name());
    match run(scenario, &config) {
        Ok(()) => {
            println!("ion {} test: passed", scenario.name());
            ExitCode::SUCCESS
        }
        Err(err) => {
            println!("ion {} test: failed, {err}", scenario.name());
            ExitCode::FAILURE
        }
    }
}
