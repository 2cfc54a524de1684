// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::node::{NodeId, NodeKind};
use thiserror::Error;

/// Errors detected while building a topology.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("node {0} declared twice")]
    DuplicateNode(NodeId),
    #[error("{node}: parent {parent} is not declared")]
    UnknownParent { node: NodeId, parent: NodeId },
    #[error("{node}: parent {parent} is a {found}, expected a {expected}")]
    WrongParentKind {
        node: NodeId,
        parent: NodeId,
        found: NodeKind,
        expected: NodeKind,
    },
    #[error("{0}: bandwidth ratio must not be zero")]
    ZeroRatio(NodeId),
    #[error("bus segment {0} has no operating points")]
    NoOpps(u16),
    #[error("bus segment {0} has no memory channel")]
    NoChannels(u16),
    #[error("{port}: channel {chn} is beyond the {channels} channel(s) of its segment")]
    ChannelOutOfRange { port: NodeId, chn: u8, channels: u8 },
}
