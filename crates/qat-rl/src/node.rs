//! Node arena: per-type slot tables for roots, clusters and leaves
//!
//! Each node type owns its own id space. Allocation always takes the lowest
//! free slot, so a freed id is handed out again before any higher one.
//! Parent links are stored as [`NodeId`]s into the same store.

use tracing::warn;

use crate::error::{Result, RlError};
use crate::types::{NodeId, NodeType, ServiceType, Sla};

/// One node of the RL tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Tree id, type-tagged
    pub node_id: NodeId,
    /// Level in the tree
    pub node_type: NodeType,
    /// Service this node rate limits
    pub service: ServiceType,
    /// Whether an SLA is bound and linked in hardware
    pub sla_added: bool,
    /// Bound SLA, present exactly when `sla_added`
    pub sla: Option<Sla>,
    /// Committed rate not yet promised to children
    pub remaining_cir: u32,
    /// Peak ceiling from this node's own SLA
    pub max_pir: u32,
    /// Parent node, set while an SLA is bound
    pub parent: Option<NodeId>,
}

impl Node {
    fn new(node_id: NodeId, node_type: NodeType, service: ServiceType) -> Self {
        Self {
            node_id,
            node_type,
            service,
            sla_added: false,
            sla: None,
            remaining_cir: 0,
            max_pir: 0,
            parent: None,
        }
    }

    /// Committed rate of the bound SLA, `0` without one
    pub fn cir(&self) -> u32 {
        self.sla.map_or(0, |sla| sla.cir)
    }

    /// Committed rate already handed to children
    pub fn committed_to_children(&self) -> u32 {
        self.cir().saturating_sub(self.remaining_cir)
    }

    /// Bind `sla` and take its rates as this node's budget
    pub(crate) fn bind(&mut self, sla: Sla, parent: Option<NodeId>) {
        self.remaining_cir = sla.cir;
        self.max_pir = sla.pir;
        self.parent = parent;
        self.sla = Some(sla);
        self.sla_added = true;
    }

    /// Drop the bound SLA and its budget
    pub(crate) fn unbind(&mut self) {
        self.sla = None;
        self.sla_added = false;
        self.remaining_cir = 0;
        self.max_pir = 0;
        self.parent = None;
    }
}

#[derive(Debug)]
struct Slots {
    node_type: NodeType,
    slots: Vec<Option<Node>>,
}

impl Slots {
    fn new(node_type: NodeType) -> Self {
        let capacity = node_type.capacity() as usize;
        Self {
            node_type,
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
        }
    }

    fn slot(&self, id: NodeId) -> Option<&Option<Node>> {
        if id.node_type() != Some(self.node_type) {
            return None;
        }
        self.slots.get(id.index() as usize)
    }

    fn slot_mut(&mut self, id: NodeId) -> Option<&mut Option<Node>> {
        if id.node_type() != Some(self.node_type) {
            return None;
        }
        self.slots.get_mut(id.index() as usize)
    }
}

/// Arena owning every node of one device's RL tree
#[derive(Debug)]
pub struct NodeStore {
    roots: Slots,
    clusters: Slots,
    leaves: Slots,
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore {
    /// Empty store sized for every node type
    pub fn new() -> Self {
        Self {
            roots: Slots::new(NodeType::Root),
            clusters: Slots::new(NodeType::Cluster),
            leaves: Slots::new(NodeType::Leaf),
        }
    }

    fn table(&self, node_type: NodeType) -> &Slots {
        match node_type {
            NodeType::Root => &self.roots,
            NodeType::Cluster => &self.clusters,
            NodeType::Leaf => &self.leaves,
        }
    }

    fn table_mut(&mut self, node_type: NodeType) -> &mut Slots {
        match node_type {
            NodeType::Root => &mut self.roots,
            NodeType::Cluster => &mut self.clusters,
            NodeType::Leaf => &mut self.leaves,
        }
    }

    /// Allocate the lowest free id of `node_type`
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` when the id space is full.
    pub fn allocate(&mut self, node_type: NodeType, service: ServiceType) -> Result<NodeId> {
        let table = self.table_mut(node_type);
        let index = table
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(RlError::ResourceExhausted { node_type })?;

        // index < capacity, which fits the id index mask
        #[allow(clippy::cast_possible_truncation)]
        let id = NodeId::new(node_type, index as u32);
        table.slots[index] = Some(Node::new(id, node_type, service));
        Ok(id)
    }

    /// Node with `id`
    pub fn find(&self, id: NodeId) -> Option<&Node> {
        let node_type = id.node_type()?;
        self.table(node_type).slot(id)?.as_ref()
    }

    /// Mutable node with `id`
    pub fn find_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let node_type = id.node_type()?;
        self.table_mut(node_type).slot_mut(id)?.as_mut()
    }

    /// Node with `id`, or `NotFound`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn get(&self, id: NodeId) -> Result<&Node> {
        self.find(id)
            .ok_or_else(|| RlError::not_found(format!("node {id}")))
    }

    /// Mutable node with `id`, or `NotFound`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.find_mut(id)
            .ok_or_else(|| RlError::not_found(format!("node {id}")))
    }

    /// Free the slot of `id`
    ///
    /// The caller detaches any SLA first; removing a configured node is
    /// refused so its parent budget can never leak.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `PermissionDenied` if the node
    /// still carries an SLA.
    pub fn remove(&mut self, id: NodeId) -> Result<Node> {
        let node_type = id
            .node_type()
            .ok_or_else(|| RlError::not_found(format!("node {id}")))?;
        let slot = self
            .table_mut(node_type)
            .slot_mut(id)
            .filter(|slot| slot.is_some())
            .ok_or_else(|| RlError::not_found(format!("node {id}")))?;

        if slot.as_ref().is_some_and(|node| node.sla_added) {
            return Err(RlError::permission_denied(format!(
                "node {id} still has an SLA"
            )));
        }
        slot.take()
            .ok_or_else(|| RlError::not_found(format!("node {id}")))
    }

    /// Live nodes of `node_type`, in id order
    pub fn iter(&self, node_type: NodeType) -> impl Iterator<Item = &Node> {
        self.table(node_type).slots.iter().flatten()
    }

    /// Ids of live nodes of `node_type`, in id order
    pub fn ids(&self, node_type: NodeType) -> Vec<NodeId> {
        self.iter(node_type).map(|node| node.node_id).collect()
    }

    /// Visit every live node of `node_type`
    pub fn for_each(&self, node_type: NodeType, f: impl FnMut(&Node)) {
        self.iter(node_type).for_each(f);
    }

    /// Whether any node of `child_type` has an SLA parented on `parent`
    pub fn has_configured_child(&self, child_type: NodeType, parent: NodeId) -> bool {
        self.iter(child_type)
            .any(|node| node.sla_added && node.parent == Some(parent))
    }
}

/// Allocation and SLA counters, used for capability reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCount {
    /// Allocated roots
    pub root: u32,
    /// Allocated clusters
    pub cluster: u32,
    /// Allocated leaves
    pub leaf: u32,
    /// Roots with an SLA
    pub sla_root: u32,
    /// Clusters with an SLA
    pub sla_cluster: u32,
    /// Leaves with an SLA
    pub sla_leaf: u32,
}

fn decrement(counter: &mut u32, what: &str) {
    if *counter == 0 {
        warn!("Rate Limiting: {what} counter underflow, ignoring");
        return;
    }
    *counter -= 1;
}

impl NodeCount {
    fn nodes_mut(&mut self, node_type: NodeType) -> (&mut u32, &'static str) {
        match node_type {
            NodeType::Root => (&mut self.root, "root"),
            NodeType::Cluster => (&mut self.cluster, "cluster"),
            NodeType::Leaf => (&mut self.leaf, "leaf"),
        }
    }

    fn slas_mut(&mut self, node_type: NodeType) -> (&mut u32, &'static str) {
        match node_type {
            NodeType::Root => (&mut self.sla_root, "root SLA"),
            NodeType::Cluster => (&mut self.sla_cluster, "cluster SLA"),
            NodeType::Leaf => (&mut self.sla_leaf, "leaf SLA"),
        }
    }

    /// Count a newly allocated node
    pub fn node_added(&mut self, node_type: NodeType) {
        *self.nodes_mut(node_type).0 += 1;
    }

    /// Count a removed node; underflow is logged and ignored
    pub fn node_removed(&mut self, node_type: NodeType) {
        let (counter, what) = self.nodes_mut(node_type);
        decrement(counter, what);
    }

    /// Count a newly bound SLA
    pub fn sla_added(&mut self, node_type: NodeType) {
        *self.slas_mut(node_type).0 += 1;
    }

    /// Count a removed SLA; underflow is logged and ignored
    pub fn sla_removed(&mut self, node_type: NodeType) {
        let (counter, what) = self.slas_mut(node_type);
        decrement(counter, what);
    }

    /// Allocated nodes of `node_type`
    pub const fn nodes(&self, node_type: NodeType) -> u32 {
        match node_type {
            NodeType::Root => self.root,
            NodeType::Cluster => self.cluster,
            NodeType::Leaf => self.leaf,
        }
    }

    /// Bound SLAs on nodes of `node_type`
    pub const fn slas(&self, node_type: NodeType) -> u32 {
        match node_type {
            NodeType::Root => self.sla_root,
            NodeType::Cluster => self.sla_cluster,
            NodeType::Leaf => self.sla_leaf,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qat_rl_hw::tree;

    #[test]
    fn allocate_takes_lowest_free_slot() {
        let mut store = NodeStore::new();
        let a = store.allocate(NodeType::Leaf, ServiceType::Dc).unwrap();
        let b = store.allocate(NodeType::Leaf, ServiceType::Dc).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);

        store.remove(a).unwrap();
        let c = store.allocate(NodeType::Leaf, ServiceType::Sym).unwrap();
        assert_eq!(c, a);
        assert_eq!(store.find(c).unwrap().service, ServiceType::Sym);
    }

    #[test]
    fn ids_carry_their_type() {
        let mut store = NodeStore::new();
        let cluster = store.allocate(NodeType::Cluster, ServiceType::Dc).unwrap();
        let leaf = store.allocate(NodeType::Leaf, ServiceType::Dc).unwrap();
        assert_eq!(cluster.node_type(), Some(NodeType::Cluster));
        assert_eq!(leaf.node_type(), Some(NodeType::Leaf));
        assert_ne!(cluster, leaf);
    }

    #[test]
    fn exhaustion() {
        let mut store = NodeStore::new();
        for _ in 0..tree::MAX_CLUSTER {
            store.allocate(NodeType::Cluster, ServiceType::Dc).unwrap();
        }
        let err = store
            .allocate(NodeType::Cluster, ServiceType::Dc)
            .unwrap_err();
        assert!(matches!(
            err,
            RlError::ResourceExhausted {
                node_type: NodeType::Cluster
            }
        ));
        // other id spaces are independent
        store.allocate(NodeType::Leaf, ServiceType::Dc).unwrap();
    }

    #[test]
    fn remove_unknown_is_not_found() {
        let mut store = NodeStore::new();
        let id = NodeId::new(NodeType::Leaf, 4);
        assert!(matches!(store.remove(id), Err(RlError::NotFound { .. })));
        assert!(matches!(
            store.remove(NodeId::from_raw(0x0900)),
            Err(RlError::NotFound { .. })
        ));
    }

    #[test]
    fn remove_refuses_configured_node() {
        let mut store = NodeStore::new();
        let id = store.allocate(NodeType::Cluster, ServiceType::Dc).unwrap();
        let sla = Sla::cluster(id, ServiceType::Dc, 10, 10);
        store.get_mut(id).unwrap().bind(sla, None);
        assert!(matches!(
            store.remove(id),
            Err(RlError::PermissionDenied { .. })
        ));
        store.get_mut(id).unwrap().unbind();
        store.remove(id).unwrap();
    }

    #[test]
    fn for_each_visits_live_nodes_only() {
        let mut store = NodeStore::new();
        let ids: Vec<_> = (0..3)
            .map(|_| store.allocate(NodeType::Leaf, ServiceType::Dc).unwrap())
            .collect();
        store.remove(ids[1]).unwrap();
        let mut seen = Vec::new();
        store.for_each(NodeType::Leaf, |n| seen.push(n.node_id));
        assert_eq!(seen, vec![ids[0], ids[2]]);
    }

    #[test]
    fn counter_underflow_is_ignored() {
        let mut count = NodeCount::default();
        count.sla_removed(NodeType::Leaf);
        assert_eq!(count.slas(NodeType::Leaf), 0);
        count.node_added(NodeType::Cluster);
        count.node_removed(NodeType::Cluster);
        count.node_removed(NodeType::Cluster);
        assert_eq!(count.nodes(NodeType::Cluster), 0);
    }
}
