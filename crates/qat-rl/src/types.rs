//! Core rate-limiting vocabulary: services, node types, ids and SLAs

use std::fmt;
use std::str::FromStr;

use qat_rl_hw::tree;

use crate::error::{Result, RlError};

/// Accelerator service a node or ring is rate-limited for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceType {
    /// Asymmetric crypto (public key)
    Asym = 0,
    /// Symmetric crypto (cipher/hash)
    Sym = 1,
    /// Compression / decompression
    Dc = 2,
}

impl ServiceType {
    /// Every service, in root allocation order
    pub const ALL: [Self; 3] = [Self::Asym, Self::Sym, Self::Dc];

    /// Number of services
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index for per-service tables
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Service with the given firmware encoding
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Asym),
            1 => Some(Self::Sym),
            2 => Some(Self::Dc),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asym => write!(f, "asym"),
            Self::Sym => write!(f, "sym"),
            Self::Dc => write!(f, "dc"),
        }
    }
}

impl FromStr for ServiceType {
    type Err = RlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "asym" | "pke" => Ok(Self::Asym),
            "sym" | "cy" => Ok(Self::Sym),
            "dc" | "comp" | "compression" => Ok(Self::Dc),
            other => Err(RlError::invalid_argument(format!(
                "unknown service '{other}'"
            ))),
        }
    }
}

/// Level of a node in the RL tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// One per service, created at init
    Root,
    /// Intermediate grouping under a root
    Cluster,
    /// Bound to the ring pairs of one function
    Leaf,
}

impl NodeType {
    /// Type tag used in tree ids and admin requests
    pub const fn tag(self) -> u32 {
        match self {
            Self::Root => tree::NODE_TYPE_ROOT,
            Self::Cluster => tree::NODE_TYPE_CLUSTER,
            Self::Leaf => tree::NODE_TYPE_LEAF,
        }
    }

    /// Node type of a type tag
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            tree::NODE_TYPE_ROOT => Some(Self::Root),
            tree::NODE_TYPE_CLUSTER => Some(Self::Cluster),
            tree::NODE_TYPE_LEAF => Some(Self::Leaf),
            _ => None,
        }
    }

    /// Number of ids available for this node type
    pub const fn capacity(self) -> u32 {
        tree::capacity(self.tag())
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Cluster => write!(f, "cluster"),
            Self::Leaf => write!(f, "leaf"),
        }
    }
}

impl FromStr for NodeType {
    type Err = RlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "root" => Ok(Self::Root),
            "cluster" => Ok(Self::Cluster),
            "leaf" => Ok(Self::Leaf),
            other => Err(RlError::invalid_argument(format!(
                "unknown node type '{other}'"
            ))),
        }
    }
}

/// Tree id: node type tag plus slot index
///
/// The node type is recoverable from the id alone, so an SLA id handed back
/// to a caller is enough to find the node again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(u32);

impl NodeId {
    /// Id of slot `index` in the id space of `node_type`
    pub const fn new(node_type: NodeType, index: u32) -> Self {
        Self(tree::to_tree_id(index, node_type.tag()))
    }

    /// Wrap a raw id as received from a caller
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw id value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Node type encoded in the id, `None` for an unknown tag
    pub const fn node_type(self) -> Option<NodeType> {
        NodeType::from_tag(tree::type_tag(self.0))
    }

    /// Slot index within the node type's id space
    pub const fn index(self) -> u32 {
        tree::to_index(self.0)
    }

    /// Whether the id falls inside the valid range for `node_type`
    pub const fn in_range(self, node_type: NodeType) -> bool {
        let first = tree::to_tree_id(0, node_type.tag());
        let last = tree::to_tree_id(node_type.capacity() - 1, node_type.tag());
        self.0 >= first && self.0 <= last
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#05x}", self.0)
    }
}

/// Recover the node type of a tree id
pub const fn type_of(id: NodeId) -> Option<NodeType> {
    id.node_type()
}

/// Root-relative numbering of a root or cluster id
pub const fn root_index_of(id: NodeId) -> u32 {
    id.index()
}

/// PCI device/function of the function that owns a leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PciAddress {
    /// Device number
    pub dev: u8,
    /// Function number
    pub func: u8,
}

impl PciAddress {
    /// Device/function pair
    pub const fn new(dev: u8, func: u8) -> Self {
        Self { dev, func }
    }

    /// Address of VF `vf` under its PF
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_vf(vf: u32) -> Self {
        let raw = vf + tree::VF_OFFSET;
        Self {
            dev: (raw >> tree::PCI_DEV_OFFSET) as u8,
            func: (raw & tree::PCI_FUNC_MAX as u32) as u8,
        }
    }

    /// VF number, `None` when the address names the PF
    pub const fn vf_number(self) -> Option<u32> {
        tree::vf_number(self.dev, self.func)
    }

    /// VF number of a VF address valid for a device with `total_vfs` VFs
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the device or function is out of range or
    /// the address does not name one of the device's VFs.
    pub fn checked_vf(self, total_vfs: u32) -> Result<u32> {
        if self.dev > tree::PCI_DEV_MAX || self.func > tree::PCI_FUNC_MAX {
            return Err(RlError::invalid_argument(format!(
                "PCI address {self} out of range"
            )));
        }
        match self.vf_number() {
            Some(vf) if vf < total_vfs => Ok(vf),
            _ => Err(RlError::invalid_argument(format!(
                "PCI address {self} is not a VF of this device"
            ))),
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}.{:x}", self.dev, self.func)
    }
}

/// Rate contract bound to one node
///
/// Used both as the request descriptor for create/update and as the record
/// stored on a configured node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sla {
    /// Equal to `node_id` once bound
    pub sla_id: NodeId,
    /// Node the SLA is bound to
    pub node_id: NodeId,
    /// Parent node; required for leaves, resolved for clusters, `None` for roots
    pub parent_node_id: Option<NodeId>,
    /// Level of the owning node
    pub node_type: NodeType,
    /// Service being rate limited
    pub service: ServiceType,
    /// Committed rate
    pub cir: u32,
    /// Peak rate
    pub pir: u32,
    /// Owning function, meaningful for leaves
    pub pci: PciAddress,
}

impl Sla {
    /// Root SLA request
    pub const fn root(node_id: NodeId, service: ServiceType, cir: u32, pir: u32) -> Self {
        Self {
            sla_id: node_id,
            node_id,
            parent_node_id: None,
            node_type: NodeType::Root,
            service,
            cir,
            pir,
            pci: PciAddress::new(0, 0),
        }
    }

    /// Cluster SLA request; the parent root is resolved from the service
    pub const fn cluster(node_id: NodeId, service: ServiceType, cir: u32, pir: u32) -> Self {
        Self {
            sla_id: node_id,
            node_id,
            parent_node_id: None,
            node_type: NodeType::Cluster,
            service,
            cir,
            pir,
            pci: PciAddress::new(0, 0),
        }
    }

    /// Leaf SLA request under `parent` for the function at `pci`
    pub const fn leaf(
        node_id: NodeId,
        parent: NodeId,
        service: ServiceType,
        pci: PciAddress,
        cir: u32,
        pir: u32,
    ) -> Self {
        Self {
            sla_id: node_id,
            node_id,
            parent_node_id: Some(parent),
            node_type: NodeType::Leaf,
            service,
            cir,
            pir,
            pci,
        }
    }

    /// Update request for an existing SLA; other fields are taken from the node
    pub const fn update(sla_id: NodeId, cir: u32, pir: u32) -> Self {
        Self {
            sla_id,
            node_id: sla_id,
            parent_node_id: None,
            node_type: NodeType::Root,
            service: ServiceType::Asym,
            cir,
            pir,
            pci: PciAddress::new(0, 0),
        }
    }

    /// Move the update request under a different parent
    #[must_use]
    pub const fn with_parent(mut self, parent: NodeId) -> Self {
        self.parent_node_id = Some(parent);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_recovers_type_and_index() {
        let id = NodeId::new(NodeType::Cluster, 3);
        assert_eq!(type_of(id), Some(NodeType::Cluster));
        assert_eq!(root_index_of(id), 3);
        assert!(id.in_range(NodeType::Cluster));
        assert!(!id.in_range(NodeType::Leaf));
    }

    #[test]
    fn unknown_tag_has_no_type() {
        assert_eq!(NodeId::from_raw(0x0700).node_type(), None);
    }

    #[test]
    fn out_of_range_index_rejected() {
        let id = NodeId::from_raw(tree::to_tree_id(tree::MAX_CLUSTER, tree::NODE_TYPE_CLUSTER));
        assert!(!id.in_range(NodeType::Cluster));
    }

    #[test]
    fn pci_vf_roundtrip() {
        for vf in 0..16 {
            assert_eq!(PciAddress::from_vf(vf).vf_number(), Some(vf));
        }
        assert_eq!(PciAddress::new(0, 1).checked_vf(16).unwrap(), 0);
    }

    #[test]
    fn pci_pf_and_out_of_range_rejected() {
        assert!(PciAddress::new(0, 0).checked_vf(16).is_err());
        assert!(PciAddress::new(0, 8).checked_vf(16).is_err());
        assert!(PciAddress::new(0x20, 0).checked_vf(16).is_err());
        assert!(PciAddress::new(2, 1).checked_vf(16).is_err());
    }

    #[test]
    fn service_parse() {
        assert_eq!("DC".parse::<ServiceType>().unwrap(), ServiceType::Dc);
        assert!("zip".parse::<ServiceType>().is_err());
    }
}
