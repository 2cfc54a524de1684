// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Multimedia interconnect QoS simulator.
//!
//! Builds a reference board on simulated hardware, applies the requested tunables and leaf
//! updates, and prints the resulting state.

#![deny(clippy::all, clippy::pedantic, clippy::unwrap_used)]

mod board;
mod cmdline;

use crate::board::Board;
use crate::cmdline::Cmdline;
use clap::Parser;
use icc::{Features, HrtKind, Tunable};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Log to stderr, filtered by `RUST_LOG` when set.
fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();
}

fn run(cmdline: &Cmdline) -> Result<(), String> {
    let board = Board::new(cmdline.offload).map_err(|e| e.to_string())?;
    let topology = &board.topology;

    if cmdline.offload {
        let features = topology.tunables().features() | Features::VCP_OFFLOAD;
        topology
            .set_tunable(
                &Tunable::Features.to_string(),
                &format!("{:#x}", features.bits()),
            )
            .map_err(|e| e.to_string())?;
    }
    for assignment in &cmdline.tunables {
        topology
            .set_tunable(&assignment.name, &assignment.value)
            .map_err(|e| e.to_string())?;
    }

    for update in &cmdline.updates {
        let Some(leaf) = board.leaf(&update.leaf) else {
            let known: Vec<_> = Board::leaf_names().collect();
            return Err(format!(
                "unknown leaf port '{}' (known: {})",
                update.leaf,
                known.join(", ")
            ));
        };
        topology.update_port(leaf, update.avg, update.peak);
    }
    if cmdline.qos_bound {
        topology.set_qos_bound(true);
    }

    print!("{topology}");
    for kind in [HrtKind::Display, HrtKind::Camera] {
        if let Some(bw) = board.hrt.last(kind) {
            println!("  hrt {kind}: {bw} MB/s");
        }
    }
    if let Some(peer) = &board.peer {
        println!("  co-processor: {} message(s)", peer.received().len());
    }
    if cmdline.writes {
        for (index, segment) in board.segments.iter().enumerate() {
            println!("  comm{index} requests:");
            println!("    clock   {:?}", segment.clock.history());
            println!("    voltage {:?}", segment.regulator.history());
            println!("    avg     {:?}", segment.avg_path.last());
            println!("    hrt     {:?}", segment.hrt_path.last());
            println!("    channel {:?}", segment.chn_path.last());
        }
        for (device, writes) in board.writes() {
            println!("  {device}:");
            for write in writes {
                println!("    {write:?}");
            }
        }
    }
    if cmdline.history {
        print!("{}", topology.dump_history());
        print!("{}", topology.dump_last_larb());
    }
    Ok(())
}

fn main() -> ExitCode {
    let cmdline = Cmdline::parse();
    init_logging(cmdline.verbose);
    info!(
        "simulating {} update(s), {} tunable(s)",
        cmdline.updates.len(),
        cmdline.tunables.len()
    );
    match run(&cmdline) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
