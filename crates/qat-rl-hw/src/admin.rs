//! Firmware admin message layout.
//!
//! Requests and responses are fixed [`MSG_LEN`]-byte little-endian records.
//! An RL request references an out-of-line SLA parameter block through
//! `init_cfg_ptr`, a device-visible (DMA) address.
//!
//! ```text
//! request                              response
//! 0x00 u16 init_cfg_sz                 0x00 u8  flags
//! 0x02 u8  reserved                    0x01 u8  cmd_id (echo)
//! 0x03 u8  cmd_id                      0x02 u8  status
//! 0x04 u32 reserved                    0x03 ..  reserved
//! 0x08 u64 init_cfg_ptr
//! 0x10 u8  node_type
//! 0x11 u8  svc_type
//! 0x12 u8  rp_count
//! 0x13 u8  reserved
//! 0x14 u32 node_id (slot index)
//! 0x18 ..  reserved
//! ```
//!
//! SLA parameter block ([`SLA_CONFIG_SIZE`] bytes):
//!
//! ```text
//! 0x00 u32 pcie_in_cir     0x10 u32 slice_util_cir
//! 0x04 u32 pcie_in_pir     0x14 u32 slice_util_pir
//! 0x08 u32 pcie_out_cir    0x18 u32 ae_util_cir
//! 0x0C u32 pcie_out_pir    0x1C u32 ae_util_pir
//! 0x20 u16 rp_ids[16]
//! ```

use crate::tree::RP_CNT_PER_LEAF_MAX;

/// Admin request/response length.
pub const MSG_LEN: usize = 32;

/// Offset of the response behind the request in the admin message area.
pub const RESPONSE_OFFSET: usize = MSG_LEN;

/// Size of the admin message area (request + response).
pub const MSG_AREA_LEN: usize = 2 * MSG_LEN;

/// Size of the SLA parameter block.
pub const SLA_CONFIG_SIZE: usize = 8 * 4 + RP_CNT_PER_LEAF_MAX * 2;

/// Offset of `rp_ids` inside the SLA parameter block.
pub const SLA_CONFIG_RP_IDS: usize = 8 * 4;

/// Request field offsets.
pub mod req {
    /// `init_cfg_sz`, u16.
    pub const INIT_CFG_SZ: usize = 0x00;
    /// `cmd_id`, u8.
    pub const CMD_ID: usize = 0x03;
    /// `init_cfg_ptr`, u64.
    pub const INIT_CFG_PTR: usize = 0x08;
    /// `node_type`, u8.
    pub const NODE_TYPE: usize = 0x10;
    /// `svc_type`, u8.
    pub const SVC_TYPE: usize = 0x11;
    /// `rp_count`, u8.
    pub const RP_COUNT: usize = 0x12;
    /// `node_id`, u32.
    pub const NODE_ID: usize = 0x14;
}

/// Response field offsets.
pub mod resp {
    /// `cmd_id` echo, u8.
    pub const CMD_ID: usize = 0x01;
    /// `status`, u8. Zero on success.
    pub const STATUS: usize = 0x02;
}

/// Admin command ids.
pub mod cmd {
    /// Initialise the RL block.
    pub const RL_INIT: u8 = 0x0F;
    /// Add an SLA.
    pub const RL_ADD: u8 = 0x10;
    /// Update an SLA.
    pub const RL_UPDATE: u8 = 0x11;
    /// Remove an SLA.
    pub const RL_REMOVE: u8 = 0x12;
}

/// Response status for a completed command.
pub const STATUS_OK: u8 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_fields_fit_the_message() {
        assert!(req::NODE_ID + 4 <= MSG_LEN);
        assert!(req::INIT_CFG_PTR + 8 <= MSG_LEN);
        assert!(resp::STATUS < MSG_LEN);
    }

    #[test]
    fn sla_block_holds_every_ring() {
        assert_eq!(SLA_CONFIG_SIZE, 64);
        assert_eq!(SLA_CONFIG_SIZE - SLA_CONFIG_RP_IDS, RP_CNT_PER_LEAF_MAX * 2);
    }
}
