// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Node identities and classification.

use crate::tunables::Features;

/// The four levels of the aggregation tree, leaf first.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::FromRepr,
)]
#[repr(u8)]
pub enum NodeKind {
    #[strum(serialize = "port")]
    LeafPort = 1,
    #[strum(serialize = "larb")]
    Larb = 2,
    #[strum(serialize = "comm_port")]
    CommonPort = 3,
    #[strum(serialize = "comm")]
    CommonBus = 4,
}

impl NodeKind {
    /// The kind a parent of this kind must have.
    #[must_use]
    pub fn parent(self) -> Option<NodeKind> {
        match self {
            NodeKind::LeafPort => Some(NodeKind::Larb),
            NodeKind::Larb => Some(NodeKind::CommonPort),
            NodeKind::CommonPort => Some(NodeKind::CommonBus),
            NodeKind::CommonBus => None,
        }
    }
}

/// Stable numeric node identity: node kind in the upper half, index in the lower half.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[must_use]
    pub const fn new(kind: NodeKind, index: u16) -> Self {
        Self(((kind as u32) << 16) | index as u32)
    }

    #[must_use]
    pub const fn leaf(index: u16) -> Self {
        Self::new(NodeKind::LeafPort, index)
    }

    #[must_use]
    pub const fn larb(index: u16) -> Self {
        Self::new(NodeKind::Larb, index)
    }

    #[must_use]
    pub const fn common_port(index: u16) -> Self {
        Self::new(NodeKind::CommonPort, index)
    }

    #[must_use]
    pub const fn common_bus(index: u16) -> Self {
        Self::new(NodeKind::CommonBus, index)
    }

    #[must_use]
    pub fn kind(self) -> Option<NodeKind> {
        u8::try_from(self.0 >> 16).ok().and_then(NodeKind::from_repr)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // masked
    pub const fn index(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{kind}{}", self.index()),
            None => write!(f, "{:#x}", self.0),
        }
    }
}

/// Hard-real-time traffic classes known to the HRT budget service.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumCount,
    strum::EnumIter,
)]
pub enum HrtKind {
    #[strum(serialize = "disp")]
    Display,
    #[strum(serialize = "cam")]
    Camera,
}

impl HrtKind {
    #[must_use]
    pub fn slot(self) -> usize {
        self as usize
    }
}

/// Traffic category of a common port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, strum::Display)]
#[cfg_attr(any(test, feature = "bolero"), derive(bolero::TypeGenerator))]
pub enum PortCategory {
    #[default]
    #[strum(serialize = "none")]
    None,
    #[strum(serialize = "disp")]
    Display,
    #[strum(serialize = "cam")]
    Camera,
    #[strum(serialize = "vdec-srt")]
    VdecSrt,
    #[strum(serialize = "venc-srt")]
    VencSrt,
    /// Display traffic routed through a larb that reports its bandwidth elsewhere.
    #[strum(serialize = "disp-by-larb")]
    DispByLarb,
    /// Port whose limiter is pinned to the maximum.
    #[strum(serialize = "max-bwl")]
    MaxBwl,
}

impl PortCategory {
    /// Display categories are accounted separately under dynamic power control.
    #[must_use]
    pub fn is_display(self) -> bool {
        matches!(self, PortCategory::Display | PortCategory::DispByLarb)
    }

    /// HRT class whose budget this category draws from.
    #[must_use]
    pub fn hrt_kind(self) -> Option<HrtKind> {
        match self {
            PortCategory::Display | PortCategory::DispByLarb => Some(HrtKind::Display),
            PortCategory::Camera => Some(HrtKind::Camera),
            PortCategory::None
            | PortCategory::VdecSrt
            | PortCategory::VencSrt
            | PortCategory::MaxBwl => None,
        }
    }

    /// Whether current policy exempts this category from maximum-bandwidth promotion.
    #[must_use]
    pub fn is_exempt(self, features: Features) -> bool {
        match self {
            PortCategory::DispByLarb => features.contains(Features::DISP_BY_LARB_EXEMPT),
            PortCategory::Camera => features.contains(Features::CAM_NO_MAX_EXEMPT),
            _ => false,
        }
    }
}

/// Physical memory channel: bus segment plus channel (sub-lane) within it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel {
    pub bus: u16,
    pub chn: u8,
}

impl Channel {
    #[must_use]
    pub const fn new(bus: u16, chn: u8) -> Self {
        Self { bus, chn }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "comm{}/chn{}", self.bus, self.chn)
    }
}

#[cfg(test)]
mod test {
    use super::{NodeId, NodeKind, PortCategory};
    use crate::tunables::Features;

    #[test]
    fn id_encodes_kind_and_index() {
        let id = NodeId::larb(17);
        assert_eq!(id.kind(), Some(NodeKind::Larb));
        assert_eq!(id.index(), 17);
        assert_eq!(id.to_string(), "larb17");
        assert_ne!(NodeId::larb(1), NodeId::leaf(1));
    }

    #[test]
    fn tree_levels_chain_to_the_bus() {
        let mut kind = NodeKind::LeafPort;
        let mut depth = 0;
        while let Some(parent) = kind.parent() {
            kind = parent;
            depth += 1;
        }
        assert_eq!(kind, NodeKind::CommonBus);
        assert_eq!(depth, 3);
    }

    #[test]
    fn exemption_follows_policy() {
        assert!(!PortCategory::DispByLarb.is_exempt(Features::empty()));
        assert!(PortCategory::DispByLarb.is_exempt(Features::DISP_BY_LARB_EXEMPT));
        assert!(PortCategory::Camera.is_exempt(Features::CAM_NO_MAX_EXEMPT));
        assert!(!PortCategory::Display.is_exempt(Features::all()));
    }
}
