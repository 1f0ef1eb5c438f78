//! Firmware admin channel client
//!
//! RL configuration reaches the firmware as fixed-size admin requests. SLA
//! commands carry their token values out of line in a DMA parameter block
//! taken from a [`DmaAllocator`](crate::dma::DmaAllocator):
//!
//! ```text
//! AdminChannel::send_sla_command
//!   ├─ alloc DmaBuffer (SLA_CONFIG_SIZE)
//!   ├─ fill params (Add/Update only)
//!   ├─ AdminTransport::send(request) ── blocks until completion
//!   └─ drop DmaBuffer                 ── on every path
//! ```
//!
//! The transport is a seam: [`MailboxTransport`] drives the CSR mailbox,
//! [`SoftwareFirmware`] models the firmware for tests and simulation.

mod mailbox;
mod software;

pub use mailbox::{MailboxTransport, PollConfig};
pub use software::{FirmwareRecord, SoftwareFirmware};

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, error};

use qat_rl_hw::{admin, tree};

use crate::dma::DmaAllocator;
use crate::error::{Result, RlError};
use crate::translate::HwParams;
use crate::types::{NodeId, NodeType, ServiceType};

/// Admin command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCmd {
    /// Initialise the RL block
    Init,
    /// Add an SLA
    Add,
    /// Update an SLA
    Update,
    /// Remove an SLA
    Delete,
}

impl AdminCmd {
    /// Firmware command id
    pub const fn id(self) -> u8 {
        match self {
            Self::Init => admin::cmd::RL_INIT,
            Self::Add => admin::cmd::RL_ADD,
            Self::Update => admin::cmd::RL_UPDATE,
            Self::Delete => admin::cmd::RL_REMOVE,
        }
    }

    /// Command with firmware id `id`
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            admin::cmd::RL_INIT => Some(Self::Init),
            admin::cmd::RL_ADD => Some(Self::Add),
            admin::cmd::RL_UPDATE => Some(Self::Update),
            admin::cmd::RL_REMOVE => Some(Self::Delete),
            _ => None,
        }
    }

    /// Name used in logs and errors
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "RL init",
            Self::Add => "add SLA",
            Self::Update => "update SLA",
            Self::Delete => "delete SLA",
        }
    }
}

/// Fixed-layout admin request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminRequest {
    /// Command
    pub cmd: AdminCmd,
    /// Size of the parameter block at `cfg_ptr`
    pub cfg_size: u16,
    /// IOVA of the parameter block, `0` when there is none
    pub cfg_ptr: u64,
    /// Node type tag
    pub node_type: u8,
    /// Service encoding
    pub service: u8,
    /// Rings listed in the parameter block
    pub rp_count: u8,
    /// Slot index of the node
    pub node_index: u32,
}

impl AdminRequest {
    /// Request without node or parameters
    pub const fn bare(cmd: AdminCmd) -> Self {
        Self {
            cmd,
            cfg_size: 0,
            cfg_ptr: 0,
            node_type: 0,
            service: 0,
            rp_count: 0,
            node_index: 0,
        }
    }

    /// Wire encoding, [`admin::MSG_LEN`] bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(admin::MSG_LEN);
        buf.put_u16_le(self.cfg_size);
        buf.put_u8(0);
        buf.put_u8(self.cmd.id());
        buf.put_u32_le(0);
        buf.put_u64_le(self.cfg_ptr);
        buf.put_u8(self.node_type);
        buf.put_u8(self.service);
        buf.put_u8(self.rp_count);
        buf.put_u8(0);
        buf.put_u32_le(self.node_index);
        buf.put_bytes(0, admin::MSG_LEN - buf.len());
        buf.freeze()
    }

    /// Decode a request
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a short message or unknown command id.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < admin::MSG_LEN {
            return Err(RlError::invalid_argument(format!(
                "admin request of {} bytes",
                raw.len()
            )));
        }
        let mut buf = &raw[..admin::MSG_LEN];
        let cfg_size = buf.get_u16_le();
        buf.advance(1);
        let id = buf.get_u8();
        let cmd = AdminCmd::from_id(id)
            .ok_or_else(|| RlError::invalid_argument(format!("admin command {id:#x}")))?;
        buf.advance(4);
        let cfg_ptr = buf.get_u64_le();
        let node_type = buf.get_u8();
        let service = buf.get_u8();
        let rp_count = buf.get_u8();
        buf.advance(1);
        let node_index = buf.get_u32_le();

        Ok(Self {
            cmd,
            cfg_size,
            cfg_ptr,
            node_type,
            service,
            rp_count,
            node_index,
        })
    }
}

/// Admin response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminResponse {
    /// Echoed command id
    pub cmd_id: u8,
    /// Firmware status, [`admin::STATUS_OK`] on success
    pub status: u8,
}

impl AdminResponse {
    /// Successful completion of `cmd`
    pub const fn ok(cmd: AdminCmd) -> Self {
        Self {
            cmd_id: cmd.id(),
            status: admin::STATUS_OK,
        }
    }

    /// Wire encoding, [`admin::MSG_LEN`] bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(admin::MSG_LEN);
        buf.put_u8(0);
        buf.put_u8(self.cmd_id);
        buf.put_u8(self.status);
        buf.put_bytes(0, admin::MSG_LEN - buf.len());
        buf.freeze()
    }

    /// Decode a response
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a short message.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < admin::MSG_LEN {
            return Err(RlError::invalid_argument(format!(
                "admin response of {} bytes",
                raw.len()
            )));
        }
        Ok(Self {
            cmd_id: raw[admin::resp::CMD_ID],
            status: raw[admin::resp::STATUS],
        })
    }
}

/// SLA parameter block contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaParams {
    /// Token values
    pub hw: HwParams,
    /// Ring pair ids
    pub rp_ids: Vec<u16>,
}

impl SlaParams {
    /// Wire encoding, [`admin::SLA_CONFIG_SIZE`] bytes
    pub fn encode(&self) -> Bytes {
        let hw = &self.hw;
        let mut buf = BytesMut::with_capacity(admin::SLA_CONFIG_SIZE);
        for word in [
            hw.pcie_in_cir,
            hw.pcie_in_pir,
            hw.pcie_out_cir,
            hw.pcie_out_pir,
            hw.slice_cir,
            hw.slice_pir,
            hw.ae_cir,
            hw.ae_pir,
        ] {
            buf.put_u32_le(word);
        }
        for &rp in self.rp_ids.iter().take(tree::RP_CNT_PER_LEAF_MAX) {
            buf.put_u16_le(rp);
        }
        buf.put_bytes(0, admin::SLA_CONFIG_SIZE - buf.len());
        buf.freeze()
    }

    /// Decode a parameter block listing `rp_count` rings
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a short block or too many rings.
    pub fn decode(raw: &[u8], rp_count: usize) -> Result<Self> {
        if raw.len() < admin::SLA_CONFIG_SIZE || rp_count > tree::RP_CNT_PER_LEAF_MAX {
            return Err(RlError::invalid_argument("malformed SLA parameter block"));
        }
        let mut buf = &raw[..admin::SLA_CONFIG_SIZE];
        let hw = HwParams {
            pcie_in_cir: buf.get_u32_le(),
            pcie_in_pir: buf.get_u32_le(),
            pcie_out_cir: buf.get_u32_le(),
            pcie_out_pir: buf.get_u32_le(),
            slice_cir: buf.get_u32_le(),
            slice_pir: buf.get_u32_le(),
            ae_cir: buf.get_u32_le(),
            ae_pir: buf.get_u32_le(),
        };
        let rp_ids = (0..rp_count).map(|_| buf.get_u16_le()).collect();
        Ok(Self { hw, rp_ids })
    }
}

/// Blocking request/response admin transport
pub trait AdminTransport: std::fmt::Debug + Send {
    /// Submit `req` and wait for its completion
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when no completion arrives in time, or a transport
    /// specific error.
    fn send(&mut self, req: &AdminRequest) -> Result<AdminResponse>;
}

/// Admin client used by the RL controller
#[derive(Debug)]
pub struct AdminChannel {
    transport: Box<dyn AdminTransport>,
    dma: Arc<dyn DmaAllocator>,
}

impl AdminChannel {
    /// Client over `transport`, allocating parameter blocks from `dma`
    pub fn new(transport: Box<dyn AdminTransport>, dma: impl DmaAllocator + 'static) -> Self {
        Self {
            transport,
            dma: Arc::new(dma),
        }
    }

    fn round_trip(&mut self, req: &AdminRequest) -> Result<()> {
        let cmd = req.cmd;
        let resp = self.transport.send(req).map_err(|e| match e {
            RlError::Timeout { .. } | RlError::AdminTransport { .. } => e,
            other => RlError::admin(cmd.name(), other.to_string()),
        })?;

        if resp.cmd_id != cmd.id() {
            return Err(RlError::admin(
                cmd.name(),
                format!("response for command {:#x}", resp.cmd_id),
            ));
        }
        if resp.status != admin::STATUS_OK {
            return Err(RlError::admin(
                cmd.name(),
                format!("firmware status {:#x}", resp.status),
            ));
        }
        Ok(())
    }

    /// Ask the firmware to initialise the RL block
    ///
    /// # Errors
    ///
    /// Returns an admin transport error if the firmware does not complete it.
    pub fn send_init(&mut self) -> Result<()> {
        debug!("Rate Limiting: admin {}", AdminCmd::Init.name());
        self.round_trip(&AdminRequest::bare(AdminCmd::Init))
            .inspect_err(|e| error!("Rate Limiting: {e}"))
    }

    /// Push an SLA command for `node`
    ///
    /// `params` is written to the parameter block for `Add` and `Update`.
    /// The block is released before returning, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for `Init` or unrepresentable ring ids, and
    /// an admin transport error if the round trip fails.
    pub fn send_sla_command(
        &mut self,
        cmd: AdminCmd,
        node: NodeId,
        service: ServiceType,
        params: &HwParams,
        rings: &[u32],
    ) -> Result<()> {
        if cmd == AdminCmd::Init {
            return Err(RlError::invalid_argument("init is not an SLA command"));
        }
        let node_type = node
            .node_type()
            .ok_or_else(|| RlError::invalid_argument(format!("node id {node}")))?;
        if rings.len() > tree::RP_CNT_PER_LEAF_MAX {
            return Err(RlError::invalid_argument(format!(
                "{} rings exceed the per-leaf limit",
                rings.len()
            )));
        }
        let rp_ids = rings
            .iter()
            .map(|&r| u16::try_from(r))
            .collect::<std::result::Result<Vec<u16>, _>>()
            .map_err(|_| RlError::invalid_argument("ring id does not fit the SLA block"))?;

        let mut block = self.dma.alloc(admin::SLA_CONFIG_SIZE)?;
        if matches!(cmd, AdminCmd::Add | AdminCmd::Update) {
            block.fill(
                &SlaParams {
                    hw: *params,
                    rp_ids: rp_ids.clone(),
                }
                .encode(),
            )?;
        }

        #[allow(clippy::cast_possible_truncation)]
        let req = AdminRequest {
            cmd,
            cfg_size: admin::SLA_CONFIG_SIZE as u16,
            cfg_ptr: block.iova(),
            node_type: node_type.tag() as u8,
            service: service as u8,
            rp_count: rp_ids.len() as u8,
            node_index: node.index(),
        };

        debug!(
            "Rate Limiting: admin {} for {node_type} {node} ({service}, {} rings)",
            cmd.name(),
            rp_ids.len()
        );
        let result = self.round_trip(&req);
        drop(block);

        result.inspect_err(|e| error!("Rate Limiting: {e}"))
    }
}

/// Node type carried by a decoded request
pub fn request_node_type(req: &AdminRequest) -> Option<NodeType> {
    NodeType::from_tag(u32::from(req.node_type))
}

/// Service carried by a decoded request
pub fn request_service(req: &AdminRequest) -> Option<ServiceType> {
    ServiceType::from_raw(req.service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaPool;

    #[test]
    fn request_layout() {
        let req = AdminRequest {
            cmd: AdminCmd::Add,
            cfg_size: 64,
            cfg_ptr: 0x1_0000_1000,
            node_type: 2,
            service: 2,
            rp_count: 2,
            node_index: 7,
        };
        let raw = req.encode();
        assert_eq!(raw.len(), admin::MSG_LEN);
        assert_eq!(raw[admin::req::CMD_ID], admin::cmd::RL_ADD);
        assert_eq!(raw[admin::req::NODE_TYPE], 2);
        assert_eq!(raw[admin::req::RP_COUNT], 2);
        assert_eq!(raw[admin::req::NODE_ID], 7);
        assert_eq!(raw[admin::req::INIT_CFG_PTR + 4], 1);
        assert_eq!(AdminRequest::decode(&raw).unwrap(), req);
    }

    #[test]
    fn unknown_command_rejected() {
        let mut raw = AdminRequest::bare(AdminCmd::Init).encode().to_vec();
        raw[admin::req::CMD_ID] = 0x42;
        assert!(AdminRequest::decode(&raw).is_err());
        assert!(AdminRequest::decode(&raw[..8]).is_err());
    }

    #[test]
    fn param_block_layout() {
        let params = SlaParams {
            hw: HwParams {
                pcie_in_cir: 1,
                ae_pir: 8,
                ..HwParams::default()
            },
            rp_ids: vec![10, 11],
        };
        let raw = params.encode();
        assert_eq!(raw.len(), admin::SLA_CONFIG_SIZE);
        assert_eq!(raw[0], 1);
        assert_eq!(raw[0x1C], 8);
        assert_eq!(raw[admin::SLA_CONFIG_RP_IDS], 10);
        assert_eq!(raw[admin::SLA_CONFIG_RP_IDS + 2], 11);
        assert_eq!(SlaParams::decode(&raw, 2).unwrap(), params);
    }

    #[test]
    fn response_status() {
        let raw = AdminResponse::ok(AdminCmd::Delete).encode();
        let resp = AdminResponse::decode(&raw).unwrap();
        assert_eq!(resp.cmd_id, admin::cmd::RL_REMOVE);
        assert_eq!(resp.status, admin::STATUS_OK);
    }

    #[test]
    fn block_freed_on_failure() {
        let pool = DmaPool::new();
        let fw = SoftwareFirmware::new(pool.clone());
        let mut chan = AdminChannel::new(Box::new(fw.clone()), pool.clone());
        chan.send_init().unwrap();
        fw.fail_next(1);

        let node = NodeId::new(NodeType::Leaf, 0);
        let err = chan
            .send_sla_command(AdminCmd::Add, node, ServiceType::Dc, &HwParams::default(), &[2])
            .unwrap_err();
        assert!(matches!(err, RlError::AdminTransport { .. }));
        assert_eq!(pool.outstanding(), 0);

        chan.send_sla_command(AdminCmd::Add, node, ServiceType::Dc, &HwParams::default(), &[2])
            .unwrap();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn firmware_sees_params_for_add_only() {
        let pool = DmaPool::new();
        let fw = SoftwareFirmware::new(pool.clone());
        let mut chan = AdminChannel::new(Box::new(fw.clone()), pool);
        chan.send_init().unwrap();
        let node = NodeId::new(NodeType::Leaf, 1);
        let hw = HwParams {
            slice_cir: 5,
            ..HwParams::default()
        };

        chan.send_sla_command(AdminCmd::Add, node, ServiceType::Sym, &hw, &[5])
            .unwrap();
        chan.send_sla_command(AdminCmd::Delete, node, ServiceType::Sym, &hw, &[5])
            .unwrap();

        let log = fw.records();
        assert!(log[0].params.is_none());
        assert_eq!(log[1].params.as_ref().unwrap().hw.slice_cir, 5);
        assert_eq!(log[1].params.as_ref().unwrap().rp_ids, vec![5]);
        assert_eq!(log[2].params.as_ref().unwrap().hw, HwParams::default());
        assert_eq!(fw.configured_count(), 0);
    }

    #[test]
    fn init_is_not_an_sla_command() {
        let pool = DmaPool::new();
        let fw = SoftwareFirmware::new(pool.clone());
        let mut chan = AdminChannel::new(Box::new(fw.clone()), pool);
        let node = NodeId::new(NodeType::Root, 0);
        assert!(chan
            .send_sla_command(AdminCmd::Init, node, ServiceType::Dc, &HwParams::default(), &[])
            .is_err());
        assert!(fw.records().is_empty());
        chan.send_init().unwrap();
        assert_eq!(fw.records()[0].request.cmd, AdminCmd::Init);
    }
}
