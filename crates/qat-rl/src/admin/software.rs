//! Software firmware: an in-process model of the RL admin handler
//!
//! Decodes every request, reads the SLA parameter block back out of the DMA
//! pool and keeps the firmware's view of which nodes are configured. This
//! lets the whole controller run without a device:
//!
//! 1. **CI without hardware**: every RL protocol path is exercised against
//!    the same request encoding the device consumes.
//! 2. **Fault injection**: [`SoftwareFirmware::fail_next`] and
//!    [`SoftwareFirmware::reject_next`] make the next round trips fail, so the
//!    unwinding paths can be tested.
//! 3. **Simulation**: the CLI drives a simulated device through it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use qat_rl_hw::admin;

use super::{AdminCmd, AdminRequest, AdminResponse, AdminTransport, SlaParams};
use crate::dma::DmaPool;
use crate::error::{Result, RlError};

/// Status returned for a request the firmware refuses
const STATUS_REJECTED: u8 = 1;

/// One request as the firmware saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRecord {
    /// Decoded request
    pub request: AdminRequest,
    /// Parameter block contents, when the request carried one
    pub params: Option<SlaParams>,
}

#[derive(Debug, Default)]
struct FirmwareState {
    initialised: bool,
    records: Vec<FirmwareRecord>,
    // (node type tag, slot index) → programmed parameters
    configured: BTreeMap<(u8, u32), SlaParams>,
    fail_next: u32,
    reject_next: u32,
}

/// Software firmware admin transport
///
/// Clones share state; keep one to inspect what the controller sent.
#[derive(Debug, Clone)]
pub struct SoftwareFirmware {
    pool: DmaPool,
    state: Arc<Mutex<FirmwareState>>,
}

impl SoftwareFirmware {
    /// Firmware reading parameter blocks from `pool`
    pub fn new(pool: DmaPool) -> Self {
        Self {
            pool,
            state: Arc::new(Mutex::new(FirmwareState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FirmwareState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` round trips at the transport level
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Complete the next `n` requests with a non-OK status
    pub fn reject_next(&self, n: u32) {
        self.lock().reject_next = n;
    }

    /// Every request received, oldest first
    pub fn records(&self) -> Vec<FirmwareRecord> {
        self.lock().records.clone()
    }

    /// Requests received for `cmd`
    pub fn count(&self, cmd: AdminCmd) -> usize {
        self.lock()
            .records
            .iter()
            .filter(|r| r.request.cmd == cmd)
            .count()
    }

    /// Whether an Init has completed
    pub fn is_initialised(&self) -> bool {
        self.lock().initialised
    }

    /// Parameters programmed for the node with type tag `node_type` and slot
    /// `index`
    pub fn configured(&self, node_type: u8, index: u32) -> Option<SlaParams> {
        self.lock().configured.get(&(node_type, index)).cloned()
    }

    /// Number of nodes the firmware holds an SLA for
    pub fn configured_count(&self) -> usize {
        self.lock().configured.len()
    }

    fn read_params(&self, req: &AdminRequest) -> Result<Option<SlaParams>> {
        if req.cfg_ptr == 0 {
            return Ok(None);
        }
        if usize::from(req.cfg_size) < admin::SLA_CONFIG_SIZE {
            return Err(RlError::invalid_argument(format!(
                "parameter block of {} bytes",
                req.cfg_size
            )));
        }
        let raw = self.pool.read(req.cfg_ptr).ok_or_else(|| {
            RlError::not_found(format!("parameter block at {:#x}", req.cfg_ptr))
        })?;
        SlaParams::decode(&raw, usize::from(req.rp_count)).map(Some)
    }

    /// Apply `req`, returning the completion status
    fn execute(state: &mut FirmwareState, req: &AdminRequest, params: Option<&SlaParams>) -> u8 {
        let key = (req.node_type, req.node_index);
        match req.cmd {
            AdminCmd::Init => {
                state.initialised = true;
                state.configured.clear();
                admin::STATUS_OK
            }
            _ if !state.initialised => STATUS_REJECTED,
            AdminCmd::Add => {
                if state.configured.contains_key(&key) {
                    return STATUS_REJECTED;
                }
                state
                    .configured
                    .insert(key, params.cloned().unwrap_or_default());
                admin::STATUS_OK
            }
            AdminCmd::Update => match state.configured.get_mut(&key) {
                Some(slot) => {
                    *slot = params.cloned().unwrap_or_default();
                    admin::STATUS_OK
                }
                None => STATUS_REJECTED,
            },
            AdminCmd::Delete => {
                if state.configured.remove(&key).is_some() {
                    admin::STATUS_OK
                } else {
                    STATUS_REJECTED
                }
            }
        }
    }
}

impl AdminTransport for SoftwareFirmware {
    fn send(&mut self, req: &AdminRequest) -> Result<AdminResponse> {
        // Round trip through the wire format, as the device would see it.
        let req = AdminRequest::decode(&req.encode())?;
        let params = self.read_params(&req)?;

        let mut state = self.lock();
        state.records.push(FirmwareRecord {
            request: req,
            params: params.clone(),
        });

        if state.fail_next > 0 {
            state.fail_next -= 1;
            warn!("software firmware: dropping {}", req.cmd.name());
            return Err(RlError::admin(req.cmd.name(), "injected transport failure"));
        }

        let status = if state.reject_next > 0 {
            state.reject_next -= 1;
            STATUS_REJECTED
        } else {
            Self::execute(&mut state, &req, params.as_ref())
        };
        debug!(
            "software firmware: {} node {}:{} -> status {status}",
            req.cmd.name(),
            req.node_type,
            req.node_index
        );

        Ok(AdminResponse {
            cmd_id: req.cmd.id(),
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(cmd: AdminCmd, index: u32) -> AdminRequest {
        AdminRequest {
            node_type: 2,
            node_index: index,
            ..AdminRequest::bare(cmd)
        }
    }

    #[test]
    fn commands_before_init_are_rejected() {
        let mut fw = SoftwareFirmware::new(DmaPool::new());
        let resp = fw.send(&request(AdminCmd::Add, 0)).unwrap();
        assert_eq!(resp.status, STATUS_REJECTED);
        fw.send(&AdminRequest::bare(AdminCmd::Init)).unwrap();
        assert!(fw.is_initialised());
        let resp = fw.send(&request(AdminCmd::Add, 0)).unwrap();
        assert_eq!(resp.status, admin::STATUS_OK);
    }

    #[test]
    fn tracks_configured_nodes() {
        let mut fw = SoftwareFirmware::new(DmaPool::new());
        fw.send(&AdminRequest::bare(AdminCmd::Init)).unwrap();

        assert_eq!(fw.send(&request(AdminCmd::Add, 3)).unwrap().status, 0);
        assert_eq!(
            fw.send(&request(AdminCmd::Add, 3)).unwrap().status,
            STATUS_REJECTED
        );
        assert_eq!(fw.configured_count(), 1);
        assert_eq!(fw.send(&request(AdminCmd::Update, 3)).unwrap().status, 0);
        assert_eq!(fw.send(&request(AdminCmd::Delete, 3)).unwrap().status, 0);
        assert_eq!(
            fw.send(&request(AdminCmd::Delete, 3)).unwrap().status,
            STATUS_REJECTED
        );
        assert_eq!(fw.count(AdminCmd::Delete), 2);
    }

    #[test]
    fn injected_faults_are_consumed() {
        let mut fw = SoftwareFirmware::new(DmaPool::new());
        fw.fail_next(1);
        fw.reject_next(1);
        assert!(fw.send(&AdminRequest::bare(AdminCmd::Init)).is_err());
        let resp = fw.send(&AdminRequest::bare(AdminCmd::Init)).unwrap();
        assert_eq!(resp.status, STATUS_REJECTED);
        assert!(!fw.is_initialised());
        fw.send(&AdminRequest::bare(AdminCmd::Init)).unwrap();
        assert!(fw.is_initialised());
    }

    #[test]
    fn dangling_parameter_pointer_is_an_error() {
        let mut fw = SoftwareFirmware::new(DmaPool::new());
        let req = AdminRequest {
            cfg_ptr: 0xdead_0000,
            cfg_size: 64,
            ..request(AdminCmd::Add, 0)
        };
        assert!(fw.send(&req).is_err());
    }
}
