//! Tree-wide invariants checked after every step of longer op sequences

use qat_rl::prelude::*;
use qat_rl::Node;

fn all_nodes(rl: &RateLimiter) -> Vec<Node> {
    [NodeType::Root, NodeType::Cluster, NodeType::Leaf]
        .into_iter()
        .flat_map(|t| (0..t.capacity()).map(move |i| NodeId::new(t, i)))
        .filter_map(|id| rl.node(id))
        .collect()
}

/// remaining + Σ child cir == own cir, children never orphaned, pir ≥ cir
fn assert_tree_consistent(rl: &RateLimiter) {
    let nodes = all_nodes(rl);
    for node in nodes.iter().filter(|n| n.sla_added) {
        let sla = node.sla.expect("configured node carries its SLA");
        assert!(sla.pir >= sla.cir, "{}: pir below cir", node.node_id);

        let promised: u64 = nodes
            .iter()
            .filter(|c| c.sla_added && c.parent == Some(node.node_id))
            .map(|c| u64::from(c.cir()))
            .sum();
        assert_eq!(
            u64::from(node.remaining_cir) + promised,
            u64::from(sla.cir),
            "ledger of {}",
            node.node_id
        );

        if let Some(parent) = node.parent {
            let parent = nodes.iter().find(|p| p.node_id == parent).unwrap();
            assert!(parent.sla_added, "{} orphaned", node.node_id);
            assert_eq!(parent.service, node.service);
        }
    }

    let leaves = nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Leaf && n.sla_added)
        .count();
    assert_eq!(rl.counts().sla_leaf as usize, leaves);
}

#[test]
fn ledger_holds_through_mixed_operations() {
    let device = SimulatedDevice::new();
    let rl = device.gen4().unwrap();
    assert_tree_consistent(&rl);

    let dc_cluster = NodeId::new(NodeType::Cluster, 2);
    rl.update_sla(Sla::update(dc_cluster, 30_000, 40_000)).unwrap();
    assert_tree_consistent(&rl);

    let extra = rl.create_node(NodeType::Cluster, ServiceType::Dc).unwrap();
    rl.create_sla(Sla::cluster(extra, ServiceType::Dc, 15_000, 15_000))
        .unwrap();
    assert_tree_consistent(&rl);

    let mut leaves = Vec::new();
    for vf in 0..8 {
        let sla = rl
            .leaf_request(PciAddress::from_vf(vf), ServiceType::Dc, 500 * (vf + 1), 9000)
            .unwrap();
        leaves.push(rl.create_sla(sla).unwrap());
        assert_tree_consistent(&rl);
    }

    for (i, &leaf) in leaves.iter().enumerate().step_by(2) {
        let cir = 500 * (i as u32 + 1);
        rl.update_sla(Sla::update(leaf, cir, cir).with_parent(extra))
            .unwrap();
        assert_tree_consistent(&rl);
    }

    // leaf 7 wants more than anyone has left
    assert!(rl.update_sla(Sla::update(leaves[7], 44_000, 44_000)).is_err());
    assert_tree_consistent(&rl);

    for &leaf in leaves.iter().skip(1).step_by(3) {
        rl.delete_sla(leaf).unwrap();
        assert_tree_consistent(&rl);
    }

    rl.delete_node(extra).unwrap();
    assert_tree_consistent(&rl);

    rl.exit();
    assert_tree_consistent(&rl);
    assert_eq!(device.firmware.configured_count(), 0);
    assert_eq!(device.pool.outstanding(), 0);
}

#[test]
fn rejected_operations_leave_no_trace() {
    let device = SimulatedDevice::new();
    let rl = device.gen4().unwrap();
    let leaf = rl
        .create_sla(
            rl.leaf_request(PciAddress::from_vf(0), ServiceType::Sym, 5000, 5000)
                .unwrap(),
        )
        .unwrap();

    let before = all_nodes(&rl);
    let writes = device.csr.write_count();

    let attempts = [
        rl.update_sla(Sla::update(leaf, 200_000, 200_000)),
        rl.update_sla(Sla::update(NodeId::new(NodeType::Leaf, 60), 1, 1)),
        rl.delete_sla(NodeId::new(NodeType::Cluster, 1)),
        rl.delete_sla(NodeId::new(NodeType::Root, 1)),
    ];
    assert!(attempts.iter().all(|r| r.is_err()));

    device.firmware.reject_next(1);
    assert!(rl.update_sla(Sla::update(leaf, 6000, 6000)).is_err());

    assert_eq!(all_nodes(&rl), before);
    assert_eq!(device.csr.write_count(), writes);
    assert_tree_consistent(&rl);
}

#[test]
fn concurrent_vfs_share_one_cluster() {
    let device = SimulatedDevice::new();
    let rl = device.gen4().unwrap();

    std::thread::scope(|s| {
        for vf in 0..16 {
            let rl = &rl;
            s.spawn(move || {
                let sla = rl
                    .leaf_request(PciAddress::from_vf(vf), ServiceType::Dc, 2000, 2000)
                    .unwrap();
                rl.create_sla(sla).unwrap();
            });
        }
    });

    assert_eq!(rl.counts().sla_leaf, 16);
    let cluster = rl.node(NodeId::new(NodeType::Cluster, 2)).unwrap();
    assert_eq!(cluster.remaining_cir, 45_000 - 16 * 2000);
    assert_tree_consistent(&rl);
    assert_eq!(device.pool.outstanding(), 0);
}
