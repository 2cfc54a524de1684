// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Command line of the simulator

use clap::Parser;
use icc::Bandwidth;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgError {
    #[error("expected <name>=<value>, got '{0}'")]
    MissingEquals(String),
    #[error("expected <avg>,<peak>, got '{0}'")]
    MissingComma(String),
    #[error("'{0}' is not a bandwidth in MB/s")]
    BadBandwidth(String),
}

/// One leaf request: `<leaf>=<avg>,<peak>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub leaf: String,
    pub avg: Bandwidth,
    pub peak: Bandwidth,
}

/// One tunable assignment: `<name>=<value>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub name: String,
    pub value: String,
}

fn split_assignment(raw: &str) -> Result<(&str, &str), ArgError> {
    raw.split_once('=')
        .map(|(l, r)| (l.trim(), r.trim()))
        .ok_or_else(|| ArgError::MissingEquals(raw.to_string()))
}

/// Bandwidth in MB/s, or `max` for the maximum-bandwidth sentinel.
fn parse_bandwidth(raw: &str) -> Result<Bandwidth, ArgError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("max") {
        return Ok(Bandwidth::MAX);
    }
    raw.parse::<u32>()
        .map(Bandwidth::from_mbps)
        .map_err(|_| ArgError::BadBandwidth(raw.to_string()))
}

pub fn parse_update(raw: &str) -> Result<Update, ArgError> {
    let (leaf, values) = split_assignment(raw)?;
    let (avg, peak) = values
        .split_once(',')
        .ok_or_else(|| ArgError::MissingComma(values.to_string()))?;
    Ok(Update {
        leaf: leaf.to_string(),
        avg: parse_bandwidth(avg)?,
        peak: parse_bandwidth(peak)?,
    })
}

pub fn parse_assignment(raw: &str) -> Result<Assignment, ArgError> {
    let (name, value) = split_assignment(raw)?;
    Ok(Assignment {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Parser)]
#[command(about = "Multimedia interconnect QoS simulator", long_about = None)]
pub struct Cmdline {
    #[arg(
        long = "set",
        value_name = "NAME=VALUE",
        value_parser = parse_assignment,
        help = "Set a tunable before any update (features, log_mask, vcp_test_id, freq_mode)"
    )]
    pub tunables: Vec<Assignment>,

    #[arg(
        long = "update",
        value_name = "LEAF=AVG,PEAK",
        value_parser = parse_update,
        help = "Apply a leaf request, in MB/s; 'max' requests the maximum bandwidth"
    )]
    pub updates: Vec<Update>,

    #[arg(long, help = "Hand segment computations to the simulated co-processor")]
    pub offload: bool,

    #[arg(long, help = "Mark the system QoS-bound after the updates")]
    pub qos_bound: bool,

    #[arg(long, help = "Print the bandwidth history")]
    pub history: bool,

    #[arg(long, help = "Print the register writes seen by the simulated hardware")]
    pub writes: bool,

    #[arg(short, long, help = "Log every update")]
    pub verbose: bool,
}
