//! PMISC BAR register map for the gen4 RL block.
//!
//! ```text
//! 0x00508000  RING2LEAF         one u32 per ring pair   → leaf index
//! 0x00508800  PCIEIN_BUCKET     PCIe-in token granularity
//! 0x00508804  PCIEOUT_BUCKET    PCIe-out token granularity
//! 0x00508818  CLUSTER2SERVICE   one u32 per cluster     → root index
//! 0x00509000  LEAF2CLUSTER      one u32 per leaf        → cluster index
//! ```
//!
//! Every link table entry is a 32-bit word. A linked entry carries
//! [`LINK_VALID`] plus the parent index; an unlinked entry reads `0`.

// ── RL link tables ───────────────────────────────────────────────────────────

/// Ring pair → leaf table base.
pub const RL_RING2LEAF: usize = 0x0050_8000;

/// Leaf → cluster table base.
pub const RL_LEAF2CLUSTER: usize = 0x0050_9000;

/// Cluster → root (service) table base.
pub const RL_CLUSTER2SERVICE: usize = 0x0050_8818;

/// Stride between consecutive link table entries.
pub const RL_LINK_STRIDE: usize = 4;

/// Set in a link entry that points at a parent.
pub const LINK_VALID: u32 = 1 << 31;

/// Value written to a link entry to detach it.
pub const LINK_NONE: u32 = 0;

// ── Token bucket granularity ─────────────────────────────────────────────────

/// PCIe-in token bucket granularity.
pub const RL_TOKEN_PCIEIN_BUCKET: usize = 0x0050_8800;

/// PCIe-out token bucket granularity.
pub const RL_TOKEN_PCIEOUT_BUCKET: usize = 0x0050_8804;

/// Granularity programmed into [`RL_TOKEN_PCIEIN_BUCKET`] at init.
pub const RL_TOKEN_GRANULARITY_PCIEIN: u32 = 0;

/// Granularity programmed into [`RL_TOKEN_PCIEOUT_BUCKET`] at init.
pub const RL_TOKEN_GRANULARITY_PCIEOUT: u32 = 0;

// ── Admin mailbox ────────────────────────────────────────────────────────────

/// Admin mailbox doorbell. Write 1 to post, firmware clears it on completion.
pub const ADMIN_MAILBOX: usize = 0x0060_0970;

/// Admin message area address, lower 32 bits.
pub const ADMIN_MSG_LR: usize = 0x0050_0574;

/// Admin message area address, upper 32 bits.
pub const ADMIN_MSG_UR: usize = 0x0050_0578;

/// Doorbell value that posts a request.
pub const ADMIN_MAILBOX_POST: u32 = 1;

/// Byte offset of the link entry for `index` in the table at `base`.
#[must_use]
pub const fn link_entry(base: usize, index: u32) -> usize {
    base + (index as usize) * RL_LINK_STRIDE
}

/// Encode a link entry pointing at `parent_index`.
#[must_use]
pub const fn link_value(parent_index: u32) -> u32 {
    LINK_VALID | parent_index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_entries_are_word_strided() {
        assert_eq!(link_entry(RL_RING2LEAF, 0), RL_RING2LEAF);
        assert_eq!(link_entry(RL_RING2LEAF, 3), RL_RING2LEAF + 12);
        assert_eq!(link_entry(RL_LEAF2CLUSTER, 63), 0x0050_90FC);
    }

    #[test]
    fn linked_entries_never_read_as_unlinked() {
        assert_ne!(link_value(0), LINK_NONE);
        assert_eq!(link_value(5) & !LINK_VALID, 5);
    }
}
