//! RL controller: the operation surface for one device
//!
//! [`RateLimiter`] owns the node tree, the budget ledger, the link tables and
//! the admin channel behind one lock. Every operation validates fully before
//! touching hardware, and unwinds linkage if the firmware refuses, so a
//! failed call leaves the tree as it found it.
//!
//! ```text
//! init ─▶ RL init ─▶ roots ─▶ granularity CSRs ─▶ per root: cluster + leaves
//!                                                  root SLA, cluster SLA
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use qat_rl_hw::regs;

use crate::admin::{AdminChannel, AdminCmd};
use crate::budget;
use crate::capabilities::SlaCapabilities;
use crate::config::{DeviceConfig, RlHwData};
use crate::csr::CsrAccess;
use crate::error::{Result, RlError};
use crate::linkage;
use crate::node::{Node, NodeCount, NodeStore};
use crate::pfvf::{RateKind, RateRequest, RateResponse};
use crate::root::RootRegistry;
use crate::translate::{translate, HwParams};
use crate::types::{NodeId, NodeType, PciAddress, ServiceType, Sla};

/// Rate limiter for one accelerator
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<RlState>,
}

#[derive(Debug)]
struct RlState {
    hw: RlHwData,
    config: DeviceConfig,
    csr: Arc<dyn CsrAccess>,
    admin: AdminChannel,
    nodes: NodeStore,
    roots: RootRegistry,
    count: NodeCount,
}

impl RateLimiter {
    /// Bring up rate limiting on a device
    ///
    /// Initialises the firmware, creates one root per enabled service,
    /// programs the token granularity and gives each service a default cluster
    /// with one leaf per VF. Root and default cluster SLAs take the full
    /// service ceiling.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an inconsistent `hw`/`config`, or the
    /// first admin or allocation failure. Anything built before the failure
    /// is torn down again.
    pub fn init(
        hw: RlHwData,
        config: DeviceConfig,
        csr: Arc<dyn CsrAccess>,
        mut admin: AdminChannel,
    ) -> Result<Self> {
        hw.validate()?;
        config.validate()?;
        admin.send_init()?;

        let mut nodes = NodeStore::new();
        let mut count = NodeCount::default();
        let roots = RootRegistry::build(&mut nodes, &mut count, &config.enabled_services)?;

        csr.write32(hw.pcie_in_bucket_offset, regs::RL_TOKEN_GRANULARITY_PCIEIN);
        csr.write32(hw.pcie_out_bucket_offset, regs::RL_TOKEN_GRANULARITY_PCIEOUT);

        let mut state = RlState {
            hw,
            config,
            csr,
            admin,
            nodes,
            roots,
            count,
        };
        if let Err(e) = state.bootstrap() {
            error!("Rate Limiting: default tree setup failed: {e}");
            state.exit();
            return Err(e);
        }

        info!(
            "Rate Limiting: up with {} roots, {} clusters, {} leaves",
            state.count.root, state.count.cluster, state.count.leaf
        );
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tear down every leaf, cluster and root SLA
    ///
    /// Best effort: failures are logged and the teardown carries on.
    pub fn exit(&self) {
        self.lock().exit();
    }

    /// Allocate a cluster or leaf for `service`
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a root, `NotFound` if the service has no
    /// root and `ResourceExhausted` when the id space is full.
    pub fn create_node(&self, node_type: NodeType, service: ServiceType) -> Result<NodeId> {
        self.lock().create_node(node_type, service)
    }

    /// Free a cluster or leaf, removing its SLA first
    ///
    /// Deleting a cluster also removes the SLAs of leaves attached to it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a root or out of range id, `NotFound` if
    /// the node does not exist, or the error of the SLA removal.
    pub fn delete_node(&self, node_id: NodeId) -> Result<()> {
        self.lock().delete_node(node_id)
    }

    /// Bind `sla` to its node and link it into the hardware tree
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: bad ids, rates above the service ceiling, a
    ///   service mismatch, or a leaf request from a non-VF function
    /// - `NotFound`: the node or its parent does not exist
    /// - `PermissionDenied`: the node already has an SLA, the parent has
    ///   none or lacks budget, or one of the VF's rings already feeds
    ///   another leaf
    /// - `SlaTooLow`: the rate cannot be represented in hardware tokens
    /// - admin errors when the firmware refuses; linkage is undone
    pub fn create_sla(&self, sla: Sla) -> Result<NodeId> {
        self.lock().create_sla(sla)
    }

    /// Change the rates of an existing SLA
    ///
    /// Only `sla_id`, `cir`, `pir` and, for a leaf, `parent_node_id` are read
    /// from the request. A leaf naming a different cluster migrates to it.
    ///
    /// # Errors
    ///
    /// As [`RateLimiter::create_sla`], plus `PermissionDenied` when the new
    /// committed rate no longer covers what the node promised its children,
    /// and `InvalidArgument` when a cluster names a different parent.
    pub fn update_sla(&self, sla: Sla) -> Result<()> {
        self.lock().update_sla(sla)
    }

    /// Unbind the SLA of `sla_id`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the node has no SLA, `PermissionDenied` while a
    /// child still has one, or an admin error; on admin failure nothing
    /// changes.
    pub fn delete_sla(&self, sla_id: NodeId) -> Result<()> {
        self.lock().delete_sla(sla_id)
    }

    /// Per-service ceilings, headroom and SLA slot usage
    pub fn capabilities(&self) -> SlaCapabilities {
        let state = self.lock();
        SlaCapabilities::collect(
            &state.hw,
            &state.config,
            &state.nodes,
            &state.roots,
            &state.count,
        )
    }

    /// Every leaf SLA, grouped by service in root order
    pub fn user_slas(&self) -> Vec<Sla> {
        self.lock().user_slas()
    }

    /// Fill in the fixed leaf and cluster ids for a VF's leaf SLA request
    ///
    /// The leaf is `root_index × total_vfs + vf` and its parent is the
    /// service's default cluster.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `sla.pci` is not a VF of this device and
    /// `NotFound` if the service has no root.
    pub fn set_node_id(&self, sla: &mut Sla) -> Result<()> {
        self.lock().set_node_id(sla)
    }

    /// Leaf SLA request for the VF at `pci`, ids filled in by
    /// [`RateLimiter::set_node_id`]
    ///
    /// # Errors
    ///
    /// As [`RateLimiter::set_node_id`].
    pub fn leaf_request(
        &self,
        pci: PciAddress,
        service: ServiceType,
        cir: u32,
        pir: u32,
    ) -> Result<Sla> {
        let unset = NodeId::new(NodeType::Leaf, 0);
        let mut sla = Sla::leaf(unset, NodeId::new(NodeType::Cluster, 0), service, pci, cir, pir);
        self.set_node_id(&mut sla)?;
        Ok(sla)
    }

    /// Answer a VF's CIR/PIR query
    ///
    /// A ring with no leaf SLA reports `0`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the VF or bank is out of range.
    pub fn handle_rate_request(&self, req: RateRequest) -> Result<RateResponse> {
        let state = self.lock();
        let banks = state.config.banks_per_vf;
        if req.vf >= state.config.total_vfs || req.bank >= banks {
            return Err(RlError::invalid_argument(format!(
                "rate query for VF {} bank {}",
                req.vf, req.bank
            )));
        }
        let ring = req.vf * banks + req.bank;
        let value = state.rate_for_ring(ring, req.kind);
        debug!("Rate Limiting: VF {} ring {ring} {:?} = {value}", req.vf, req.kind);
        Ok(RateResponse::new(req.kind, value, ring, banks))
    }

    /// Copy of a node, if allocated
    pub fn node(&self, node_id: NodeId) -> Option<Node> {
        self.lock().nodes.find(node_id).cloned()
    }

    /// Root node id of `service`
    pub fn root_id(&self, service: ServiceType) -> Option<NodeId> {
        self.lock().roots.root_id(service)
    }

    /// Allocation and SLA counters
    pub fn counts(&self) -> NodeCount {
        self.lock().count
    }

    /// Hardware constants in use
    pub fn hw_data(&self) -> RlHwData {
        self.lock().hw.clone()
    }
}

fn check_range(id: NodeId, node_type: NodeType) -> Result<()> {
    if id.in_range(node_type) {
        return Ok(());
    }
    error!("Rate Limiting: {node_type} id {id} out of range");
    Err(RlError::invalid_argument(format!(
        "{node_type} id {id} out of range"
    )))
}

fn node_type_of(id: NodeId) -> Result<NodeType> {
    id.node_type()
        .ok_or_else(|| RlError::invalid_argument(format!("node id {id} has no type")))
}

fn correct_pir(sla: &mut Sla) {
    if sla.pir < sla.cir {
        warn!(
            "Rate Limiting: PIR {} below CIR {} for {}, raising PIR",
            sla.pir, sla.cir, sla.node_id
        );
        sla.pir = sla.cir;
    }
}

impl RlState {
    fn bootstrap(&mut self) -> Result<()> {
        let roots: Vec<_> = self.roots.iter().collect();
        for (service, root) in roots {
            let cluster = self.create_node(NodeType::Cluster, service)?;
            for _ in 0..self.config.total_vfs {
                self.create_node(NodeType::Leaf, service)?;
            }
            let max = self.hw.service_max(service);
            self.create_sla(Sla::root(root, service, max, max))?;
            self.create_sla(Sla::cluster(cluster, service, max, max))?;
        }
        Ok(())
    }

    fn exit(&mut self) {
        for id in self.nodes.ids(NodeType::Leaf) {
            if let Err(e) = self.delete_node(id) {
                warn!("Rate Limiting: failed to remove leaf {id}: {e}");
            }
        }
        for id in self.nodes.ids(NodeType::Cluster) {
            if let Err(e) = self.delete_node(id) {
                warn!("Rate Limiting: failed to remove cluster {id}: {e}");
            }
        }
        let roots: Vec<_> = self.roots.iter().collect();
        for (service, root) in roots {
            let configured = self.nodes.find(root).is_some_and(|n| n.sla_added);
            if !configured {
                continue;
            }
            if let Err(e) = self.delete_sla(root) {
                warn!("Rate Limiting: failed to remove {service} root SLA: {e}");
            }
        }
        info!("Rate Limiting: torn down");
    }

    fn check_rates(&self, service: ServiceType, cir: u32, pir: u32) -> Result<()> {
        let max = self.hw.service_max(service);
        if cir > max || pir > max {
            error!("Rate Limiting: {service} rate {cir}/{pir} above ceiling {max}");
            return Err(RlError::invalid_argument(format!(
                "{service} rate {cir}/{pir} above ceiling {max}"
            )));
        }
        Ok(())
    }

    fn rings(&self, sla: &Sla) -> Result<Vec<u32>> {
        if sla.node_type == NodeType::Leaf {
            linkage::rings_for(&self.config, sla.pci, sla.service)
        } else {
            Ok(Vec::new())
        }
    }

    /// A ring feeds one leaf: refuse rings already linked to another leaf
    fn check_rings_free(&self, leaf: NodeId, rings: &[u32]) -> Result<()> {
        for other in self
            .nodes
            .iter(NodeType::Leaf)
            .filter(|n| n.sla_added && n.node_id != leaf)
        {
            let Some(sla) = other.sla else { continue };
            let owned = self.rings(&sla)?;
            if let Some(ring) = rings.iter().find(|r| owned.contains(r)) {
                error!(
                    "Rate Limiting: ring {ring} already linked to leaf {}",
                    other.node_id
                );
                return Err(RlError::permission_denied(format!(
                    "ring {ring} already linked to leaf {}",
                    other.node_id
                )));
            }
        }
        Ok(())
    }

    fn create_node(&mut self, node_type: NodeType, service: ServiceType) -> Result<NodeId> {
        if node_type == NodeType::Root {
            return Err(RlError::invalid_argument("roots are created at init only"));
        }
        if self.roots.root_id(service).is_none() {
            return Err(RlError::not_found(format!("root for {service}")));
        }
        let id = self.nodes.allocate(node_type, service)?;
        self.count.node_added(node_type);
        debug!("Rate Limiting: allocated {node_type} {id} for {service}");
        Ok(id)
    }

    fn delete_node(&mut self, node_id: NodeId) -> Result<()> {
        let node_type = node_type_of(node_id)?;
        if node_type == NodeType::Root {
            return Err(RlError::invalid_argument("roots are removed at exit only"));
        }
        check_range(node_id, node_type)?;
        self.nodes.get(node_id)?;

        if node_type == NodeType::Cluster {
            let leaves: Vec<NodeId> = self
                .nodes
                .iter(NodeType::Leaf)
                .filter(|n| n.sla_added && n.parent == Some(node_id))
                .map(|n| n.node_id)
                .collect();
            for leaf in leaves {
                self.delete_sla(leaf)?;
            }
        }
        if self.nodes.get(node_id)?.sla_added {
            self.delete_sla(node_id)?;
        }

        self.nodes.remove(node_id)?;
        self.count.node_removed(node_type);
        debug!("Rate Limiting: freed {node_type} {node_id}");
        Ok(())
    }

    fn resolve_parent(&self, sla: &Sla, root: NodeId) -> Result<Option<NodeId>> {
        match sla.node_type {
            NodeType::Root => Ok(None),
            NodeType::Cluster => Ok(Some(root)),
            NodeType::Leaf => {
                let parent = sla.parent_node_id.ok_or_else(|| {
                    RlError::invalid_argument(format!(
                        "leaf {} has no parent cluster",
                        sla.node_id
                    ))
                })?;
                check_range(parent, NodeType::Cluster)?;
                Ok(Some(parent))
            }
        }
    }

    /// Parent checks shared by create and migration
    fn check_new_parent(
        &self,
        parent_id: NodeId,
        service: ServiceType,
        cir: u32,
        pir: u32,
    ) -> Result<()> {
        let parent = self
            .nodes
            .find(parent_id)
            .ok_or_else(|| RlError::not_found(format!("parent {parent_id}")))?;
        if parent.service != service {
            return Err(RlError::invalid_argument(format!(
                "parent {parent_id} serves {}, not {service}",
                parent.service
            )));
        }
        if !parent.sla_added {
            error!("Rate Limiting: SLA for parent {parent_id} not added");
            return Err(RlError::permission_denied(format!(
                "parent {parent_id} has no SLA"
            )));
        }
        if !budget::can_afford(parent, cir, pir) {
            error!(
                "Rate Limiting: {parent_id} cannot cover {cir}/{pir} ({} remaining, peak {})",
                parent.remaining_cir, parent.max_pir
            );
            return Err(RlError::permission_denied(format!(
                "not enough budget under {parent_id}"
            )));
        }
        Ok(())
    }

    fn create_sla(&mut self, mut sla: Sla) -> Result<NodeId> {
        let node_type = sla.node_type;
        let service = sla.service;
        check_range(sla.node_id, node_type)?;
        let root = self
            .roots
            .root_id(service)
            .ok_or_else(|| RlError::not_found(format!("root for {service}")))?;
        if node_type == NodeType::Leaf {
            sla.pci.checked_vf(self.config.total_vfs)?;
        }

        let node = self.nodes.get(sla.node_id)?;
        if node.sla_added {
            return Err(RlError::permission_denied(format!(
                "{node_type} {} already has an SLA",
                sla.node_id
            )));
        }
        if node.service != service || node.node_type != node_type {
            return Err(RlError::invalid_argument(format!(
                "{} is a {} {} node",
                sla.node_id, node.service, node.node_type
            )));
        }

        let parent = self.resolve_parent(&sla, root)?;
        match parent {
            None => {
                if !budget::within_ceiling(&self.hw, service, sla.cir, sla.pir) {
                    error!(
                        "Rate Limiting: root SLA {}/{} over the {service} ceiling",
                        sla.cir, sla.pir
                    );
                    return Err(RlError::permission_denied(format!(
                        "root SLA over the {service} ceiling"
                    )));
                }
            }
            Some(parent_id) => {
                self.check_rates(service, sla.cir, sla.pir)?;
                self.check_new_parent(parent_id, service, sla.cir, sla.pir)?;
            }
        }
        correct_pir(&mut sla);

        let params = translate(&self.hw, service, sla.cir, sla.pir)?;
        let rings = self.rings(&sla)?;
        self.check_rings_free(sla.node_id, &rings)?;

        linkage::link_tree(self.csr.as_ref(), sla.node_id, parent, &rings)?;
        if let Err(e) =
            self.admin
                .send_sla_command(AdminCmd::Add, sla.node_id, service, &params, &rings)
        {
            linkage::unlink_tree(self.csr.as_ref(), sla.node_id, &rings);
            return Err(e);
        }

        sla.sla_id = sla.node_id;
        sla.parent_node_id = parent;
        self.nodes.get_mut(sla.node_id)?.bind(sla, parent);
        if let Some(parent_id) = parent {
            budget::debit(self.nodes.get_mut(parent_id)?, sla.cir);
        }
        self.count.sla_added(node_type);

        info!(
            "Rate Limiting: {service} {node_type} SLA {} added, cir {} pir {}",
            sla.sla_id, sla.cir, sla.pir
        );
        Ok(sla.sla_id)
    }

    fn update_sla(&mut self, req: Sla) -> Result<()> {
        let id = req.sla_id;
        let node_type = node_type_of(id)?;
        check_range(id, node_type)?;

        let node = self.nodes.get(id)?.clone();
        let current = match node.sla {
            Some(sla) if node.sla_added => sla,
            _ => return Err(RlError::not_found(format!("SLA {id}"))),
        };
        let service = node.service;
        let mut sla = Sla {
            cir: req.cir,
            pir: req.pir,
            ..current
        };

        if node_type == NodeType::Root {
            if !budget::within_ceiling(&self.hw, service, sla.cir, sla.pir) {
                return Err(RlError::permission_denied(format!(
                    "root SLA over the {service} ceiling"
                )));
            }
        } else {
            self.check_rates(service, sla.cir, sla.pir)?;
        }
        correct_pir(&mut sla);

        if !budget::covers_children(&node, sla.cir) {
            error!(
                "Rate Limiting: {id} promised {} to children, cannot drop to {}",
                node.committed_to_children(),
                sla.cir
            );
            return Err(RlError::permission_denied(format!(
                "{id} cir {} below what its children hold",
                sla.cir
            )));
        }

        let old_parent = node.parent;
        let new_parent = match (node_type, req.parent_node_id) {
            (NodeType::Root, _) | (_, None) => old_parent,
            (_, Some(p)) if Some(p) == old_parent => old_parent,
            (NodeType::Cluster, Some(p)) => {
                return Err(RlError::invalid_argument(format!(
                    "cluster {id} cannot move to {p}"
                )))
            }
            (NodeType::Leaf, Some(p)) => {
                check_range(p, NodeType::Cluster)?;
                self.check_new_parent(p, service, sla.cir, sla.pir)?;
                Some(p)
            }
        };
        let migrating = new_parent != old_parent;

        if !migrating {
            if let Some(parent_id) = old_parent {
                let parent = self.nodes.get(parent_id)?;
                if !budget::can_afford_update(parent, &node, sla.cir, sla.pir) {
                    error!(
                        "Rate Limiting: {parent_id} cannot cover {id} at {}/{}",
                        sla.cir, sla.pir
                    );
                    return Err(RlError::permission_denied(format!(
                        "not enough budget under {parent_id}"
                    )));
                }
            }
        }

        let params = translate(&self.hw, service, sla.cir, sla.pir)?;
        let rings = self.rings(&sla)?;

        match (migrating, old_parent, new_parent) {
            (true, Some(from), Some(to)) => {
                linkage::relink_leaf(self.csr.as_ref(), id, to);
                if let Err(e) =
                    self.admin
                        .send_sla_command(AdminCmd::Update, id, service, &params, &rings)
                {
                    linkage::relink_leaf(self.csr.as_ref(), id, from);
                    return Err(e);
                }
                info!("Rate Limiting: leaf {id} moved from {from} to {to}");
            }
            _ => self
                .admin
                .send_sla_command(AdminCmd::Update, id, service, &params, &rings)?,
        }

        match (old_parent, new_parent) {
            (Some(from), Some(to)) if from != to => {
                budget::credit(self.nodes.get_mut(from)?, current.cir);
                budget::debit(self.nodes.get_mut(to)?, sla.cir);
            }
            (Some(parent_id), _) => {
                budget::adjust(self.nodes.get_mut(parent_id)?, current.cir, sla.cir);
            }
            (None, _) => {}
        }
        sla.parent_node_id = new_parent;
        let node = self.nodes.get_mut(id)?;
        budget::rebase(node, current.cir, sla.cir, sla.pir);
        node.parent = new_parent;
        node.sla = Some(sla);

        info!(
            "Rate Limiting: {service} {node_type} SLA {id} updated, cir {} pir {}",
            sla.cir, sla.pir
        );
        Ok(())
    }

    fn delete_sla(&mut self, id: NodeId) -> Result<()> {
        let node_type = node_type_of(id)?;
        check_range(id, node_type)?;

        let node = self.nodes.get(id)?;
        let (sla, parent) = match node.sla {
            Some(sla) if node.sla_added => (sla, node.parent),
            _ => return Err(RlError::not_found(format!("SLA {id}"))),
        };

        let child_type = match node_type {
            NodeType::Root => Some(NodeType::Cluster),
            NodeType::Cluster => Some(NodeType::Leaf),
            NodeType::Leaf => None,
        };
        if let Some(child_type) = child_type {
            if self.nodes.has_configured_child(child_type, id) {
                error!("Rate Limiting: {id} still has {child_type} SLAs attached");
                return Err(RlError::permission_denied(format!(
                    "{id} still has {child_type} SLAs attached"
                )));
            }
        }

        let rings = self.rings(&sla)?;
        self.admin.send_sla_command(
            AdminCmd::Delete,
            id,
            sla.service,
            &HwParams::default(),
            &rings,
        )?;

        if let Some(parent_id) = parent {
            budget::credit(self.nodes.get_mut(parent_id)?, sla.cir);
        }
        linkage::unlink_tree(self.csr.as_ref(), id, &rings);
        self.nodes.get_mut(id)?.unbind();
        self.count.sla_removed(node_type);

        info!("Rate Limiting: {} {node_type} SLA {id} removed", sla.service);
        Ok(())
    }

    fn user_slas(&self) -> Vec<Sla> {
        let mut slas = Vec::new();
        for (service, root) in self.roots.iter() {
            if !self.nodes.find(root).is_some_and(|n| n.sla_added) {
                continue;
            }
            slas.extend(
                self.nodes
                    .iter(NodeType::Leaf)
                    .filter(|n| n.sla_added && n.service == service)
                    .filter_map(|n| n.sla),
            );
        }
        slas
    }

    fn set_node_id(&self, sla: &mut Sla) -> Result<()> {
        let vf = sla.pci.checked_vf(self.config.total_vfs)?;
        let root = self
            .roots
            .root_id(sla.service)
            .ok_or_else(|| RlError::not_found(format!("root for {}", sla.service)))?;

        let leaf = NodeId::new(NodeType::Leaf, root.index() * self.config.total_vfs + vf);
        let cluster = NodeId::new(NodeType::Cluster, root.index());
        sla.node_id = leaf;
        sla.sla_id = leaf;
        sla.node_type = NodeType::Leaf;
        sla.parent_node_id = Some(cluster);
        debug!(
            "Rate Limiting: {} {} -> leaf {leaf} under {cluster}",
            sla.pci, sla.service
        );
        Ok(())
    }

    fn rate_for_ring(&self, ring: u32, kind: RateKind) -> u32 {
        let banks = self.config.banks_per_vf;
        let (vf, bank) = (ring / banks, ring % banks);
        self.nodes
            .iter(NodeType::Leaf)
            .filter_map(|n| n.sla.filter(|_| n.sla_added))
            .find(|sla| {
                sla.pci.vf_number() == Some(vf)
                    && self.config.bank_service(bank).carries(sla.service)
            })
            .map_or(0, |sla| match kind {
                RateKind::Cir => sla.cir,
                RateKind::Pir => sla.pir,
            })
    }
}
