//! Budget ledger: committed/peak rate bookkeeping between parents and children
//!
//! A parent's `remaining_cir` is the part of its own committed rate not yet
//! promised to a child. Every child SLA is debited on create, refunded on
//! delete, and adjusted by the delta on update, so at all times
//!
//! ```text
//! parent.remaining_cir + Σ child.cir == parent.sla.cir
//! ```

use tracing::warn;

use crate::config::RlHwData;
use crate::node::Node;
use crate::types::ServiceType;

/// Whether `parent` can take a new child at `cir`/`pir`
pub const fn can_afford(parent: &Node, cir: u32, pir: u32) -> bool {
    parent.remaining_cir >= cir && parent.max_pir >= pir
}

/// Whether `parent` can carry `node` at new rates, counting the node's own
/// committed rate as already returned to the pool
pub fn can_afford_update(parent: &Node, node: &Node, cir: u32, pir: u32) -> bool {
    let pool = u64::from(parent.remaining_cir) + u64::from(node.cir());
    pool >= u64::from(cir) && parent.max_pir >= pir
}

/// Whether a node's new `cir` still covers what it promised its children
pub fn covers_children(node: &Node, cir: u32) -> bool {
    node.committed_to_children() <= cir
}

/// Whether a root rate fits the fixed ceiling of its service
pub const fn within_ceiling(hw: &RlHwData, service: ServiceType, cir: u32, pir: u32) -> bool {
    let max = hw.service_max(service);
    cir <= max && pir <= max
}

/// Take `cir` out of `parent`'s pool
pub fn debit(parent: &mut Node, cir: u32) {
    match parent.remaining_cir.checked_sub(cir) {
        Some(left) => parent.remaining_cir = left,
        None => {
            warn!(
                "Rate Limiting: debit of {cir} exceeds {} remaining on {}",
                parent.remaining_cir, parent.node_id
            );
            parent.remaining_cir = 0;
        }
    }
}

/// Return `cir` to `parent`'s pool
pub fn credit(parent: &mut Node, cir: u32) {
    let ceiling = parent.cir();
    let refunded = parent.remaining_cir.saturating_add(cir);
    if refunded > ceiling {
        warn!(
            "Rate Limiting: credit of {cir} overfills {} (cir {ceiling})",
            parent.node_id
        );
        parent.remaining_cir = ceiling;
        return;
    }
    parent.remaining_cir = refunded;
}

/// Move a child's commitment on `parent` from `old_cir` to `cir` in one step
///
/// The pool changes by exactly `old_cir - cir` whenever the result fits
/// `0..=parent.cir()`. Out of range results are clamped and logged.
pub fn adjust(parent: &mut Node, old_cir: u32, cir: u32) {
    let ceiling = parent.cir();
    let moved = i64::from(parent.remaining_cir) + i64::from(old_cir) - i64::from(cir);
    let clamped = moved.clamp(0, i64::from(ceiling));
    if clamped != moved {
        warn!(
            "Rate Limiting: moving a child of {} from {old_cir} to {cir} leaves {moved} of {ceiling}",
            parent.node_id
        );
    }
    parent.remaining_cir = u32::try_from(clamped).unwrap_or(ceiling);
}

/// Rebind `node`'s own budget after its SLA moved from `old_cir` to `cir`
///
/// The amount promised to children stays fixed; only the headroom moves.
pub fn rebase(node: &mut Node, old_cir: u32, cir: u32, pir: u32) {
    let promised = old_cir.saturating_sub(node.remaining_cir);
    node.remaining_cir = cir.saturating_sub(promised);
    node.max_pir = pir;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeStore;
    use crate::types::{NodeType, Sla};

    fn configured(cir: u32, pir: u32) -> Node {
        let mut store = NodeStore::new();
        let id = store.allocate(NodeType::Cluster, ServiceType::Dc).unwrap();
        let mut node = store.find(id).unwrap().clone();
        node.bind(Sla::cluster(id, ServiceType::Dc, cir, pir), None);
        node
    }

    #[test]
    fn afford_checks_both_rates() {
        let parent = configured(1000, 2000);
        assert!(can_afford(&parent, 1000, 2000));
        assert!(!can_afford(&parent, 1001, 2000));
        assert!(!can_afford(&parent, 10, 2001));
    }

    #[test]
    fn update_counts_own_commitment() {
        let mut parent = configured(1000, 1000);
        let child = configured(600, 600);
        debit(&mut parent, 600);
        assert!(!can_afford(&parent, 700, 700));
        assert!(can_afford_update(&parent, &child, 1000, 1000));
        assert!(!can_afford_update(&parent, &child, 1001, 1000));
    }

    #[test]
    fn debit_then_credit_restores() {
        let mut parent = configured(1000, 1000);
        debit(&mut parent, 300);
        assert_eq!(parent.remaining_cir, 700);
        credit(&mut parent, 300);
        assert_eq!(parent.remaining_cir, 1000);
    }

    #[test]
    fn adjust_applies_the_delta() {
        let mut parent = configured(1000, 1000);
        debit(&mut parent, 600);
        adjust(&mut parent, 600, 900);
        assert_eq!(parent.remaining_cir, 100);
        adjust(&mut parent, 900, 200);
        assert_eq!(parent.remaining_cir, 800);
        adjust(&mut parent, 200, 200);
        assert_eq!(parent.remaining_cir, 800);
    }

    #[test]
    fn adjust_clamps_to_the_pool() {
        let mut parent = configured(1000, 1000);
        debit(&mut parent, 900);
        adjust(&mut parent, 100, 400);
        assert_eq!(parent.remaining_cir, 0);

        let mut parent = configured(1000, 1000);
        debit(&mut parent, 50);
        adjust(&mut parent, 600, 100);
        assert_eq!(parent.remaining_cir, 1000);
    }

    #[test]
    fn credit_never_exceeds_own_cir() {
        let mut parent = configured(1000, 1000);
        credit(&mut parent, 5);
        assert_eq!(parent.remaining_cir, 1000);
    }

    #[test]
    fn children_guard() {
        let mut node = configured(1000, 1000);
        debit(&mut node, 400);
        assert!(covers_children(&node, 400));
        assert!(!covers_children(&node, 399));
    }

    #[test]
    fn rebase_keeps_promises() {
        let mut node = configured(1000, 1000);
        debit(&mut node, 400);
        rebase(&mut node, 1000, 1500, 2000);
        assert_eq!(node.remaining_cir, 1100);
        assert_eq!(node.max_pir, 2000);
    }

    #[test]
    fn root_ceiling() {
        let hw = RlHwData::gen4();
        assert!(within_ceiling(&hw, ServiceType::Asym, 1000, 1000));
        assert!(!within_ceiling(&hw, ServiceType::Asym, 1000, 1001));
    }
}
