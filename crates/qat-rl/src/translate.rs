//! Logical SLA → hardware token translation
//!
//! A `(service, cir, pir)` triple becomes eight token values across four
//! independent dimensions:
//!
//! ```text
//!                 ┌─ PCIe in   bytes/scan ÷ token size
//! rate ──────────┼─ PCIe out  as PCIe in, decompression scaled by slices
//!                 ├─ slice     slice cycles/scan × rate ÷ service max
//!                 └─ AE        AE cycles/scan × rate ÷ service max
//! ```
//!
//! All arithmetic is 64-bit integer with truncating division, in the same
//! order the firmware expects, so results are bit-exact for a given profile.

use tracing::error;

use crate::config::RlHwData;
use crate::error::{Result, RlError};
use crate::types::ServiceType;

use qat_rl_hw::gen4;

/// Token values programmed into the device for one SLA
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HwParams {
    /// PCIe-in committed tokens
    pub pcie_in_cir: u32,
    /// PCIe-in peak tokens
    pub pcie_in_pir: u32,
    /// PCIe-out committed tokens
    pub pcie_out_cir: u32,
    /// PCIe-out peak tokens
    pub pcie_out_pir: u32,
    /// Slice utilisation committed tokens
    pub slice_cir: u32,
    /// Slice utilisation peak tokens
    pub slice_pir: u32,
    /// AE cycle committed tokens
    pub ae_cir: u32,
    /// AE cycle peak tokens
    pub ae_pir: u32,
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// PCIe bandwidth tokens per scan for `ir`
pub fn pcie_tokens(hw: &RlHwData, service: ServiceType, ir: u32, bw_out: bool) -> u32 {
    if ir == 0 {
        return 0;
    }

    let mut bytes = u64::from(ir);
    match service {
        ServiceType::Asym => {
            bytes *= u64::from(hw.max_throughput[service.index()]);
            bytes /= u64::from(hw.slice_reference);
            bytes *= gen4::TOKEN_ASYM_SIZE;
        }
        ServiceType::Dc => {
            bytes *= gen4::CONVERT_TO_BYTES;
            // Decompression output outgrows its input, scale by usable slices.
            if bw_out {
                bytes *= u64::from(hw.slices_for(service).saturating_sub(hw.dc_correction));
            }
        }
        ServiceType::Sym => bytes *= gen4::CONVERT_TO_BYTES,
    }

    let scaled = bytes.saturating_mul(u64::from(hw.pcie_scale_multiplier))
        / u64::from(hw.pcie_scale_divisor);
    saturate(scaled / gen4::TOKEN_PCIE_SIZE / u64::from(hw.scan_interval))
}

/// Slice utilisation tokens per scan for `ir`
pub fn slice_tokens(hw: &RlHwData, service: ServiceType, ir: u32) -> u32 {
    if ir == 0 {
        return 0;
    }

    let avail = u64::from(hw.clock_frequency) * u64::from(hw.slices_for(service))
        / u64::from(hw.scan_interval);

    saturate(avail * u64::from(ir) / u64::from(hw.service_max(service)))
}

/// AE cycle tokens per scan for `ir`
pub fn ae_cycles(hw: &RlHwData, service: ServiceType, ir: u32) -> u32 {
    if ir == 0 {
        return 0;
    }

    let avail = u64::from(hw.clock_frequency) * u64::from(hw.aes_for(service))
        / u64::from(hw.scan_interval);
    let max_tp = u64::from(hw.max_throughput[service.index()]);

    let mut ir = u64::from(ir);
    if service == ServiceType::Asym {
        ir = ir * max_tp / u64::from(hw.slice_reference);
    }

    saturate(ir * avail / max_tp)
}

/// Translate an SLA into hardware token values
///
/// A zero rate yields zero tokens. A nonzero `cir` whose PCIe-in, slice or
/// AE committed value truncates to zero is rejected before anything touches
/// the hardware.
///
/// # Errors
///
/// Returns `SlaTooLow` when a nonzero committed rate cannot be represented.
pub fn translate(hw: &RlHwData, service: ServiceType, cir: u32, pir: u32) -> Result<HwParams> {
    let params = HwParams {
        pcie_in_cir: pcie_tokens(hw, service, cir, false),
        pcie_in_pir: pcie_tokens(hw, service, pir, false),
        pcie_out_cir: pcie_tokens(hw, service, cir, true),
        pcie_out_pir: pcie_tokens(hw, service, pir, true),
        slice_cir: slice_tokens(hw, service, cir),
        slice_pir: slice_tokens(hw, service, pir),
        ae_cir: ae_cycles(hw, service, cir),
        ae_pir: ae_cycles(hw, service, pir),
    };

    if cir != 0 && (params.pcie_in_cir == 0 || params.slice_cir == 0 || params.ae_cir == 0) {
        error!("Rate Limiting: SLA value too low ({service} cir={cir})");
        return Err(RlError::SlaTooLow { service });
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_is_all_zero() {
        let hw = RlHwData::gen4();
        for svc in ServiceType::ALL {
            assert_eq!(translate(&hw, svc, 0, 0).unwrap(), HwParams::default());
        }
    }

    #[test]
    fn dc_pcie_tokens_match_hand_computation() {
        let hw = RlHwData::gen4();
        // 1000 Mbit/s = 125e6 B/s, ×1.02 = 127.5e6, ÷64 = 1_992_187, ÷954 = 2088
        assert_eq!(pcie_tokens(&hw, ServiceType::Dc, 1000, false), 2088);
        // out direction additionally × (4 slices - 1)
        assert_eq!(pcie_tokens(&hw, ServiceType::Dc, 1000, true), 6264);
    }

    #[test]
    fn sym_out_is_not_slice_scaled() {
        let hw = RlHwData::gen4();
        assert_eq!(
            pcie_tokens(&hw, ServiceType::Sym, 5000, false),
            pcie_tokens(&hw, ServiceType::Sym, 5000, true)
        );
    }

    #[test]
    fn slice_tokens_scale_linearly() {
        let hw = RlHwData::gen4();
        // 1e9 × 4 ÷ 954 = 4_192_872 cycles per scan
        assert_eq!(slice_tokens(&hw, ServiceType::Dc, 45_000), 4_192_872);
        assert_eq!(slice_tokens(&hw, ServiceType::Dc, 1000), 93_174);
    }

    #[test]
    fn asym_uses_slice_reference() {
        let hw = RlHwData::gen4();
        // full slice reference consumes every slice cycle
        assert_eq!(slice_tokens(&hw, ServiceType::Asym, 1000), 4_192_872);
        // AE: 1000 × 173750 ÷ 1000 = 173750, × 4_192_872 ÷ 173750
        assert_eq!(ae_cycles(&hw, ServiceType::Asym, 1000), 4_192_872);
        // PCIe: 1000 × 173750 ÷ 1000 × 1024 × 1.02 ÷ 64 ÷ 954
        assert_eq!(pcie_tokens(&hw, ServiceType::Asym, 1000, false), 2972);
    }

    #[test]
    fn pir_fields_follow_pir() {
        let hw = RlHwData::gen4();
        let p = translate(&hw, ServiceType::Dc, 1000, 2000).unwrap();
        assert!(p.pcie_in_pir > p.pcie_in_cir);
        assert!(p.slice_pir > p.slice_cir);
        assert!(p.ae_pir > p.ae_cir);
    }

    #[test]
    fn underflow_rejected() {
        let hw = RlHwData {
            clock_frequency: 1_000_000,
            ..RlHwData::gen4()
        };
        // 1e6 × 4 ÷ 954 = 4192 cycles; × 1 ÷ 45000 → 0
        let err = translate(&hw, ServiceType::Dc, 1, 1).unwrap_err();
        assert!(matches!(err, RlError::SlaTooLow { service: ServiceType::Dc }));
    }

    #[test]
    fn smallest_asym_rate_is_representable() {
        let hw = RlHwData::gen4();
        assert!(translate(&hw, ServiceType::Asym, 0, 1000).is_ok());
        assert!(translate(&hw, ServiceType::Asym, 1, 1).is_ok());
    }
}
