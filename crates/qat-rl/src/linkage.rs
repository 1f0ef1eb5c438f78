//! Ring linkage: wiring rings, leaves and clusters into the hardware tree
//!
//! ```text
//! ring ──RING2LEAF──▶ leaf ──LEAF2CLUSTER──▶ cluster ──CLUSTER2SERVICE──▶ root
//! ```
//!
//! Each hop is one link table entry. Linking writes the parent index,
//! unlinking writes [`regs::LINK_NONE`]; both are plain stores, so repeating
//! either is harmless.

use tracing::debug;

use qat_rl_hw::{regs, tree};

use crate::config::DeviceConfig;
use crate::csr::CsrAccess;
use crate::error::{Result, RlError};
use crate::types::{NodeId, NodeType, PciAddress, ServiceType};

/// Rings of the function at `pci` whose bank carries `service`
///
/// # Errors
///
/// Returns `InvalidArgument` if `pci` is not one of the device's VFs.
pub fn rings_for(config: &DeviceConfig, pci: PciAddress, service: ServiceType) -> Result<Vec<u32>> {
    let vf = pci.checked_vf(config.total_vfs)?;
    let rings: Vec<u32> = (0..config.banks_per_vf)
        .filter(|&bank| config.bank_service(bank).carries(service))
        .map(|bank| tree::ring_number(vf, bank, config.banks_per_vf))
        .take(tree::RP_CNT_PER_LEAF_MAX)
        .collect();
    Ok(rings)
}

fn write_link(csr: &dyn CsrAccess, base: usize, index: u32, value: u32) {
    let offset = regs::link_entry(base, index);
    debug!("RL link {offset:#x} <- {value:#x}");
    csr.write32(offset, value);
}

/// Link `node` into the hardware tree under `parent`
///
/// A leaf links each of `rings` to itself and then itself to its cluster; a
/// cluster links itself to its root. Roots need no linkage.
///
/// # Errors
///
/// Returns `InvalidArgument` if a non-root node has no parent.
pub fn link_tree(
    csr: &dyn CsrAccess,
    node: NodeId,
    parent: Option<NodeId>,
    rings: &[u32],
) -> Result<()> {
    let Some(node_type) = node.node_type() else {
        return Err(RlError::invalid_argument(format!("node id {node}")));
    };
    if node_type == NodeType::Root {
        return Ok(());
    }
    let parent = parent.ok_or_else(|| {
        RlError::invalid_argument(format!("{node_type} {node} has no parent to link to"))
    })?;

    match node_type {
        NodeType::Leaf => {
            for &ring in rings {
                write_link(csr, regs::RL_RING2LEAF, ring, regs::link_value(node.index()));
            }
            write_link(
                csr,
                regs::RL_LEAF2CLUSTER,
                node.index(),
                regs::link_value(parent.index()),
            );
        }
        NodeType::Cluster => write_link(
            csr,
            regs::RL_CLUSTER2SERVICE,
            node.index(),
            regs::link_value(parent.index()),
        ),
        NodeType::Root => {}
    }
    Ok(())
}

/// Detach `node` (and, for a leaf, `rings`) from the hardware tree
pub fn unlink_tree(csr: &dyn CsrAccess, node: NodeId, rings: &[u32]) {
    match node.node_type() {
        Some(NodeType::Leaf) => {
            for &ring in rings {
                write_link(csr, regs::RL_RING2LEAF, ring, regs::LINK_NONE);
            }
            write_link(csr, regs::RL_LEAF2CLUSTER, node.index(), regs::LINK_NONE);
        }
        Some(NodeType::Cluster) => {
            write_link(csr, regs::RL_CLUSTER2SERVICE, node.index(), regs::LINK_NONE);
        }
        Some(NodeType::Root) | None => {}
    }
}

/// Point an already linked leaf at a different cluster
pub fn relink_leaf(csr: &dyn CsrAccess, leaf: NodeId, cluster: NodeId) {
    write_link(
        csr,
        regs::RL_LEAF2CLUSTER,
        leaf.index(),
        regs::link_value(cluster.index()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::ShadowCsr;
    use qat_rl_hw::ring;

    #[test]
    fn default_map_gives_two_dc_rings() {
        let cfg = DeviceConfig::gen4();
        let rings = rings_for(&cfg, PciAddress::from_vf(2), ServiceType::Dc).unwrap();
        assert_eq!(rings, vec![10, 11]);
        let rings = rings_for(&cfg, PciAddress::from_vf(2), ServiceType::Asym).unwrap();
        assert_eq!(rings, vec![8]);
    }

    #[test]
    fn crypto_bank_serves_sym_and_asym() {
        let cfg = DeviceConfig {
            ring_to_svc_map: ring::pack([
                ring::CFG_CRYPTO,
                ring::CFG_COMP,
                ring::CFG_CRYPTO,
                ring::CFG_COMP,
            ]),
            ..DeviceConfig::gen4()
        };
        let pci = PciAddress::from_vf(0);
        assert_eq!(rings_for(&cfg, pci, ServiceType::Sym).unwrap(), vec![0, 2]);
        assert_eq!(rings_for(&cfg, pci, ServiceType::Asym).unwrap(), vec![0, 2]);
        assert_eq!(rings_for(&cfg, pci, ServiceType::Dc).unwrap(), vec![1, 3]);
    }

    #[test]
    fn pf_address_rejected() {
        let cfg = DeviceConfig::gen4();
        assert!(rings_for(&cfg, PciAddress::new(0, 0), ServiceType::Dc).is_err());
    }

    #[test]
    fn leaf_link_writes_rings_then_leaf() {
        let csr = ShadowCsr::new();
        let leaf = NodeId::new(NodeType::Leaf, 3);
        let cluster = NodeId::new(NodeType::Cluster, 1);
        link_tree(&csr, leaf, Some(cluster), &[10, 11]).unwrap();

        assert_eq!(
            csr.writes(),
            vec![
                (regs::link_entry(regs::RL_RING2LEAF, 10), regs::link_value(3)),
                (regs::link_entry(regs::RL_RING2LEAF, 11), regs::link_value(3)),
                (regs::link_entry(regs::RL_LEAF2CLUSTER, 3), regs::link_value(1)),
            ]
        );
    }

    #[test]
    fn unlink_is_idempotent() {
        let csr = ShadowCsr::new();
        let cluster = NodeId::new(NodeType::Cluster, 2);
        let root = NodeId::new(NodeType::Root, 0);
        link_tree(&csr, cluster, Some(root), &[]).unwrap();
        unlink_tree(&csr, cluster, &[]);
        unlink_tree(&csr, cluster, &[]);
        let entry = regs::link_entry(regs::RL_CLUSTER2SERVICE, 2);
        assert_eq!(csr.read32(entry), regs::LINK_NONE);
    }

    #[test]
    fn root_needs_no_linkage() {
        let csr = ShadowCsr::new();
        link_tree(&csr, NodeId::new(NodeType::Root, 0), None, &[]).unwrap();
        unlink_tree(&csr, NodeId::new(NodeType::Root, 0), &[]);
        assert_eq!(csr.write_count(), 0);
    }

    #[test]
    fn orphan_leaf_rejected() {
        let csr = ShadowCsr::new();
        assert!(link_tree(&csr, NodeId::new(NodeType::Leaf, 0), None, &[1]).is_err());
        assert_eq!(csr.write_count(), 0);
    }
}
