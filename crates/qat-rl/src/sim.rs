//! Simulated device: shadow CSRs, a host DMA pool and software firmware
//!
//! Runs the full controller without an accelerator. Handles are shared, so
//! tests and the CLI can inspect link tables and firmware state after each
//! operation.

use std::sync::Arc;

use crate::admin::{AdminChannel, SoftwareFirmware};
use crate::config::{DeviceConfig, RlHwData};
use crate::controller::RateLimiter;
use crate::csr::ShadowCsr;
use crate::dma::DmaPool;
use crate::error::Result;

/// Shared handles of one simulated device
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    /// CSR space the controller writes link tables into
    pub csr: ShadowCsr,
    /// DMA pool backing parameter blocks
    pub pool: DmaPool,
    /// Firmware answering admin requests
    pub firmware: SoftwareFirmware,
}

impl SimulatedDevice {
    /// Fresh device with empty CSRs and an uninitialised firmware
    pub fn new() -> Self {
        let pool = DmaPool::new();
        Self {
            csr: ShadowCsr::new(),
            firmware: SoftwareFirmware::new(pool.clone()),
            pool,
        }
    }

    /// Admin channel talking to this device's firmware
    pub fn admin(&self) -> AdminChannel {
        AdminChannel::new(Box::new(self.firmware.clone()), self.pool.clone())
    }

    /// Bring up a [`RateLimiter`] on this device
    ///
    /// # Errors
    ///
    /// As [`RateLimiter::init`].
    pub fn limiter(&self, hw: RlHwData, config: DeviceConfig) -> Result<RateLimiter> {
        RateLimiter::init(hw, config, Arc::new(self.csr.clone()), self.admin())
    }

    /// gen4 limiter with every service enabled
    ///
    /// # Errors
    ///
    /// As [`RateLimiter::init`].
    pub fn gen4(&self) -> Result<RateLimiter> {
        self.limiter(RlHwData::gen4(), DeviceConfig::gen4())
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}
