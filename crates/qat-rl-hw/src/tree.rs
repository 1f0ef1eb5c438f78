//! RL tree id space.
//!
//! A tree id carries the node type in its upper bits and the slot index
//! inside that type's id space in the low [`TREE_ID_TYPE_SHIFT`] bits:
//!
//! ```text
//!  31            8 7            0
//! ┌───────────────┬──────────────┐
//! │   node type   │  slot index  │
//! └───────────────┴──────────────┘
//!  root    = 0x000 .. 0x003
//!  cluster = 0x100 .. 0x10F
//!  leaf    = 0x200 .. 0x23F
//! ```

/// Root node type tag.
pub const NODE_TYPE_ROOT: u32 = 0;

/// Cluster node type tag.
pub const NODE_TYPE_CLUSTER: u32 = 1;

/// Leaf node type tag.
pub const NODE_TYPE_LEAF: u32 = 2;

/// Bit position of the node type inside a tree id.
pub const TREE_ID_TYPE_SHIFT: u32 = 8;

/// Mask of the slot index inside a tree id.
pub const TREE_ID_INDEX_MASK: u32 = (1 << TREE_ID_TYPE_SHIFT) - 1;

/// Root nodes (one per service).
pub const MAX_ROOT: u32 = 4;

/// Cluster nodes.
pub const MAX_CLUSTER: u32 = 16;

/// Leaf nodes.
pub const MAX_LEAF: u32 = 64;

/// Ring pairs a single leaf can carry in one SLA command.
pub const RP_CNT_PER_LEAF_MAX: usize = 16;

/// PCI device number shift when deriving a VF number.
pub const PCI_DEV_OFFSET: u32 = 3;

/// First VF function number relative to the PF.
pub const VF_OFFSET: u32 = 1;

/// Highest PCI device number.
pub const PCI_DEV_MAX: u8 = 0x1F;

/// Highest PCI function number.
pub const PCI_FUNC_MAX: u8 = 0x7;

/// Combine a type tag and a slot index into a tree id.
#[must_use]
pub const fn to_tree_id(index: u32, node_type: u32) -> u32 {
    (node_type << TREE_ID_TYPE_SHIFT) | (index & TREE_ID_INDEX_MASK)
}

/// Slot index of a tree id.
#[must_use]
pub const fn to_index(tree_id: u32) -> u32 {
    tree_id & TREE_ID_INDEX_MASK
}

/// Type tag of a tree id.
#[must_use]
pub const fn type_tag(tree_id: u32) -> u32 {
    tree_id >> TREE_ID_TYPE_SHIFT
}

/// Capacity of the id space for a type tag, `0` for unknown tags.
#[must_use]
pub const fn capacity(node_type: u32) -> u32 {
    match node_type {
        NODE_TYPE_ROOT => MAX_ROOT,
        NODE_TYPE_CLUSTER => MAX_CLUSTER,
        NODE_TYPE_LEAF => MAX_LEAF,
        _ => 0,
    }
}

/// Absolute ring number of `bank` within VF `vf`.
#[must_use]
pub const fn ring_number(vf: u32, bank: u32, banks_per_vf: u32) -> u32 {
    vf * banks_per_vf + bank
}

/// VF number of a PCI device/function pair, `None` for the PF itself.
#[must_use]
pub const fn vf_number(dev: u8, func: u8) -> Option<u32> {
    ((dev as u32) << PCI_DEV_OFFSET).wrapping_add(func as u32).checked_sub(VF_OFFSET)
}
