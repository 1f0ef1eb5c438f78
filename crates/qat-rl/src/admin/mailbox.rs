//! CSR mailbox admin transport
//!
//! The request is copied into a DMA message area whose IOVA is published in
//! the `ADMIN_MSG_LR`/`ADMIN_MSG_UR` CSRs. Writing the doorbell posts it; the
//! firmware writes its response behind the request and clears the doorbell.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use qat_rl_hw::{admin, regs};

use super::{AdminRequest, AdminResponse, AdminTransport};
use crate::csr::CsrAccess;
use crate::dma::DmaAllocator;
use crate::error::{Result, RlError};

/// Bounds on waiting for a doorbell to clear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Maximum doorbell reads
    pub max_polls: u32,
    /// Yield the thread every this many reads
    pub yield_interval: u32,
    /// Wall-clock limit
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_polls: 100_000,
            yield_interval: 64,
            timeout: Duration::from_millis(100),
        }
    }
}

/// Admin transport over the PMISC mailbox
#[derive(Debug)]
pub struct MailboxTransport {
    csr: Arc<dyn CsrAccess>,
    dma: Arc<dyn DmaAllocator>,
    poll: PollConfig,
}

impl MailboxTransport {
    /// Mailbox on `csr`, staging messages in memory from `dma`
    ///
    /// On hardware `dma` must hand out device-visible memory, e.g.
    /// [`VfioDevice`](crate::vfio::VfioDevice).
    pub fn new(csr: Arc<dyn CsrAccess>, dma: impl DmaAllocator + 'static) -> Self {
        Self {
            csr,
            dma: Arc::new(dma),
            poll: PollConfig::default(),
        }
    }

    /// Override the completion wait bounds
    #[must_use]
    pub const fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Wait for the doorbell to clear, returning the number of reads
    fn wait_for_completion(&self) -> Result<u32> {
        let PollConfig {
            max_polls,
            yield_interval,
            timeout,
        } = self.poll;
        let start = Instant::now();

        for i in 0..max_polls {
            if self.csr.read32(regs::ADMIN_MAILBOX) == 0 {
                return Ok(i + 1);
            }
            if start.elapsed() > timeout {
                break;
            }
            if yield_interval != 0 && i % yield_interval == 0 {
                std::thread::yield_now();
            }
        }

        let waited = start.elapsed().max(timeout);
        warn!("Admin mailbox: no completion after {waited:?}");
        Err(RlError::Timeout {
            duration_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

impl AdminTransport for MailboxTransport {
    #[allow(clippy::cast_possible_truncation)]
    fn send(&mut self, req: &AdminRequest) -> Result<AdminResponse> {
        let mut area = self.dma.alloc(admin::MSG_AREA_LEN)?;
        area.fill(&req.encode())?;

        let iova = area.iova();
        self.csr.write32(regs::ADMIN_MSG_LR, iova as u32);
        self.csr.write32(regs::ADMIN_MSG_UR, (iova >> 32) as u32);
        self.csr
            .write32(regs::ADMIN_MAILBOX, regs::ADMIN_MAILBOX_POST);

        let polls = self.wait_for_completion()?;
        debug!("Admin mailbox: {} completed after {polls} polls", req.cmd.name());

        let contents = area.contents();
        let resp = contents
            .get(admin::RESPONSE_OFFSET..admin::MSG_AREA_LEN)
            .ok_or_else(|| RlError::admin(req.cmd.name(), "truncated message area"))?;
        AdminResponse::decode(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{AdminCmd, SoftwareFirmware};
    use crate::csr::ShadowCsr;
    use crate::dma::DmaPool;

    /// Device model: services the doorbell synchronously with the software
    /// firmware.
    #[derive(Debug)]
    struct MailboxDevice {
        regs: ShadowCsr,
        pool: DmaPool,
        firmware: SoftwareFirmware,
    }

    impl CsrAccess for MailboxDevice {
        fn read32(&self, offset: usize) -> u32 {
            self.regs.read32(offset)
        }

        fn write32(&self, offset: usize, value: u32) {
            self.regs.write32(offset, value);
            if offset != regs::ADMIN_MAILBOX || value != regs::ADMIN_MAILBOX_POST {
                return;
            }
            let iova = u64::from(self.regs.read32(regs::ADMIN_MSG_LR))
                | (u64::from(self.regs.read32(regs::ADMIN_MSG_UR)) << 32);
            let area = self.pool.read(iova).unwrap();
            let req = AdminRequest::decode(&area).unwrap();
            let resp = self.firmware.clone().send(&req).unwrap();
            self.pool
                .write(iova, admin::RESPONSE_OFFSET, &resp.encode())
                .unwrap();
            self.regs.poke(regs::ADMIN_MAILBOX, 0);
        }
    }

    #[test]
    fn round_trip_through_mailbox() {
        let pool = DmaPool::new();
        let firmware = SoftwareFirmware::new(pool.clone());
        let device = Arc::new(MailboxDevice {
            regs: ShadowCsr::new(),
            pool: pool.clone(),
            firmware: firmware.clone(),
        });
        let mut mailbox = MailboxTransport::new(device, pool.clone());

        let resp = mailbox.send(&AdminRequest::bare(AdminCmd::Init)).unwrap();
        assert_eq!(resp, AdminResponse::ok(AdminCmd::Init));
        assert!(firmware.is_initialised());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn stuck_doorbell_times_out() {
        let pool = DmaPool::new();
        let csr = ShadowCsr::new();
        let mut mailbox = MailboxTransport::new(Arc::new(csr.clone()), pool.clone())
            .with_poll(PollConfig {
                max_polls: 10,
                yield_interval: 1,
                timeout: Duration::from_millis(5),
            });

        let err = mailbox
            .send(&AdminRequest::bare(AdminCmd::Init))
            .unwrap_err();
        assert!(matches!(err, RlError::Timeout { .. }));
        assert_eq!(csr.read32(regs::ADMIN_MAILBOX), regs::ADMIN_MAILBOX_POST);
        assert_eq!(pool.outstanding(), 0);
    }
}
