//! Device constants and static configuration consumed by rate limiting
//!
//! Everything here is read-only once the controller is initialised. The
//! gen4 defaults come from the `qat-rl-hw` silicon model; device bring-up
//! code overrides them with what it discovered.

use qat_rl_hw::{gen4, regs, ring, tree};

use crate::error::{Result, RlError};
use crate::types::ServiceType;

/// Per-device rate-limiting constants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RlHwData {
    /// Maximum throughput per service, indexed by [`ServiceType::index`]
    pub max_throughput: [u32; ServiceType::COUNT],
    /// Capacity reference for asymmetric crypto
    pub slice_reference: u32,
    /// PCIe scale factor multiplier
    pub pcie_scale_multiplier: u32,
    /// PCIe scale factor divisor
    pub pcie_scale_divisor: u32,
    /// Token scans per second
    pub scan_interval: u32,
    /// Slice correction for decompression PCIe-out tokens
    pub dc_correction: u32,
    /// AE clock in Hz
    pub clock_frequency: u32,
    /// Slices allocated to each service
    pub slices_per_service: [u32; ServiceType::COUNT],
    /// AEs allocated to each service
    pub aes_per_service: [u32; ServiceType::COUNT],
    /// PCIe-in bucket granularity CSR
    pub pcie_in_bucket_offset: usize,
    /// PCIe-out bucket granularity CSR
    pub pcie_out_bucket_offset: usize,
}

impl RlHwData {
    /// gen4 default profile
    pub fn gen4() -> Self {
        Self {
            max_throughput: [
                gen4::MAX_THROUGHPUT_ASYM,
                gen4::MAX_THROUGHPUT_SYM,
                gen4::MAX_THROUGHPUT_DC,
            ],
            slice_reference: gen4::SLICE_REFERENCE,
            pcie_scale_multiplier: gen4::PCIE_SCALE_FACTOR_MUL,
            pcie_scale_divisor: gen4::PCIE_SCALE_FACTOR_DIV,
            scan_interval: gen4::SCANS_PER_SEC,
            dc_correction: gen4::DC_CORRECTION,
            clock_frequency: gen4::CLOCK_FREQUENCY_HZ,
            slices_per_service: [gen4::SLICES_PER_SERVICE; ServiceType::COUNT],
            aes_per_service: [gen4::AES_PER_SERVICE; ServiceType::COUNT],
            pcie_in_bucket_offset: regs::RL_TOKEN_PCIEIN_BUCKET,
            pcie_out_bucket_offset: regs::RL_TOKEN_PCIEOUT_BUCKET,
        }
    }

    /// Largest rate a node of `service` may request
    ///
    /// Asymmetric crypto is measured against the slice reference, every other
    /// service against its maximum throughput.
    pub const fn service_max(&self, service: ServiceType) -> u32 {
        match service {
            ServiceType::Asym => self.slice_reference,
            ServiceType::Sym | ServiceType::Dc => self.max_throughput[service.index()],
        }
    }

    /// Slices allocated to `service`
    pub const fn slices_for(&self, service: ServiceType) -> u32 {
        self.slices_per_service[service.index()]
    }

    /// AEs allocated to `service`
    pub const fn aes_for(&self, service: ServiceType) -> u32 {
        self.aes_per_service[service.index()]
    }

    /// Reject profiles the token translation cannot work with
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first unusable constant.
    pub fn validate(&self) -> Result<()> {
        let zero = |name: &str| RlError::invalid_argument(format!("RL hw data: {name} is zero"));

        if self.scan_interval == 0 {
            return Err(zero("scan_interval"));
        }
        if self.pcie_scale_divisor == 0 || self.pcie_scale_multiplier == 0 {
            return Err(zero("pcie scale factor"));
        }
        if self.slice_reference == 0 {
            return Err(zero("slice_reference"));
        }
        if self.clock_frequency == 0 {
            return Err(zero("clock_frequency"));
        }
        if let Some(svc) = ServiceType::ALL
            .iter()
            .find(|svc| self.max_throughput[svc.index()] == 0)
        {
            return Err(RlError::invalid_argument(format!(
                "RL hw data: max throughput for {svc} is zero"
            )));
        }
        if self.slices_for(ServiceType::Dc) < self.dc_correction {
            return Err(RlError::invalid_argument(
                "RL hw data: dc_correction exceeds compression slices",
            ));
        }
        Ok(())
    }
}

impl Default for RlHwData {
    fn default() -> Self {
        Self::gen4()
    }
}

/// Service statically assigned to a ring pair bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankService {
    /// Bank not configured
    Unused,
    /// Symmetric and asymmetric crypto
    Crypto,
    /// Compression
    Comp,
    /// Symmetric crypto only
    Sym,
    /// Asymmetric crypto only
    Asym,
}

impl BankService {
    /// Decode a ring-to-service map field
    pub const fn from_cfg(raw: u8) -> Self {
        match raw {
            ring::CFG_CRYPTO => Self::Crypto,
            ring::CFG_COMP => Self::Comp,
            ring::CFG_SYM => Self::Sym,
            ring::CFG_ASYM => Self::Asym,
            _ => Self::Unused,
        }
    }

    /// Whether rings on this bank carry `service`
    pub const fn carries(self, service: ServiceType) -> bool {
        matches!(
            (self, service),
            (Self::Crypto, ServiceType::Sym | ServiceType::Asym)
                | (Self::Sym, ServiceType::Sym)
                | (Self::Asym, ServiceType::Asym)
                | (Self::Comp, ServiceType::Dc)
        )
    }
}

/// Static device configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Services with a root node, in root allocation order
    pub enabled_services: Vec<ServiceType>,
    /// Packed per-bank service assignment, identical for every VF
    pub ring_to_svc_map: u16,
    /// Ring pair banks owned by each function
    pub banks_per_vf: u32,
    /// VFs the device supports
    pub total_vfs: u32,
    /// VFs currently enabled
    pub num_vfs: u32,
}

impl DeviceConfig {
    /// gen4 default: every service enabled, all VFs on
    pub fn gen4() -> Self {
        Self {
            enabled_services: ServiceType::ALL.to_vec(),
            ring_to_svc_map: ring::DEFAULT_MAP,
            banks_per_vf: gen4::BANKS_PER_VF,
            total_vfs: gen4::TOTAL_VFS,
            num_vfs: gen4::TOTAL_VFS,
        }
    }

    /// Service of `bank` in every VF
    pub const fn bank_service(&self, bank: u32) -> BankService {
        BankService::from_cfg(ring::service_of(self.ring_to_svc_map, bank))
    }

    /// Whether a root exists for `service`
    pub fn is_enabled(&self, service: ServiceType) -> bool {
        self.enabled_services.contains(&service)
    }

    /// Reject configurations the tree cannot represent
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if there are more services than roots,
    /// duplicate services, more banks than a leaf can carry, or a VF count the
    /// leaf id space cannot hold.
    pub fn validate(&self) -> Result<()> {
        let services = u32::try_from(self.enabled_services.len()).unwrap_or(u32::MAX);
        if services > tree::MAX_ROOT {
            return Err(RlError::invalid_argument(
                "not enough root nodes for all enabled services",
            ));
        }
        for (i, svc) in self.enabled_services.iter().enumerate() {
            if self.enabled_services[..i].contains(svc) {
                return Err(RlError::invalid_argument(format!(
                    "service {svc} enabled twice"
                )));
            }
        }
        if self.banks_per_vf == 0 || self.banks_per_vf > ring::MAP_BANKS {
            return Err(RlError::invalid_argument(format!(
                "banks per VF {} unsupported",
                self.banks_per_vf
            )));
        }
        if self.num_vfs > self.total_vfs {
            return Err(RlError::invalid_argument("more VFs enabled than supported"));
        }
        let leaves = self.total_vfs.saturating_mul(services);
        if leaves > tree::MAX_LEAF {
            return Err(RlError::invalid_argument(format!(
                "{leaves} bootstrap leaves exceed the leaf id space"
            )));
        }
        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::gen4()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen4_profile_is_valid() {
        RlHwData::gen4().validate().unwrap();
        DeviceConfig::gen4().validate().unwrap();
    }

    #[test]
    fn zero_scan_rate_rejected() {
        let hw = RlHwData {
            scan_interval: 0,
            ..RlHwData::gen4()
        };
        assert!(hw.validate().is_err());
    }

    #[test]
    fn asym_max_is_slice_reference() {
        let hw = RlHwData::gen4();
        assert_eq!(hw.service_max(ServiceType::Asym), gen4::SLICE_REFERENCE);
        assert_eq!(hw.service_max(ServiceType::Dc), gen4::MAX_THROUGHPUT_DC);
    }

    #[test]
    fn crypto_banks_carry_both_crypto_services() {
        assert!(BankService::Crypto.carries(ServiceType::Sym));
        assert!(BankService::Crypto.carries(ServiceType::Asym));
        assert!(!BankService::Crypto.carries(ServiceType::Dc));
        assert!(!BankService::Unused.carries(ServiceType::Dc));
    }

    #[test]
    fn duplicate_services_rejected() {
        let cfg = DeviceConfig {
            enabled_services: vec![ServiceType::Dc, ServiceType::Dc],
            ..DeviceConfig::gen4()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_banks() {
        let cfg = DeviceConfig::gen4();
        assert_eq!(cfg.bank_service(0), BankService::Asym);
        assert_eq!(cfg.bank_service(1), BankService::Sym);
        assert_eq!(cfg.bank_service(2), BankService::Comp);
        assert_eq!(cfg.bank_service(3), BankService::Comp);
    }
}
