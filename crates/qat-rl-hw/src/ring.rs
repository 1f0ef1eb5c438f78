//! Ring-to-service map encoding.
//!
//! The device configuration assigns one service to every bank of a VF. The
//! assignment is packed into a 16-bit word, [`SERVICE_BITS`] per bank:
//!
//! ```text
//!  bank:   3      2      1      0
//!        ┌──────┬──────┬──────┬──────┐
//!        │ svc  │ svc  │ svc  │ svc  │   3 bits each
//!        └──────┴──────┴──────┴──────┘
//! ```

/// Bank is not assigned.
pub const CFG_UNUSED: u8 = 0;
/// Bank carries both symmetric and asymmetric crypto.
pub const CFG_CRYPTO: u8 = 1;
/// Bank carries compression.
pub const CFG_COMP: u8 = 2;
/// Bank carries symmetric crypto.
pub const CFG_SYM: u8 = 3;
/// Bank carries asymmetric crypto.
pub const CFG_ASYM: u8 = 4;

/// Bits per bank in the map.
pub const SERVICE_BITS: u32 = 3;

/// Mask of one bank's service field.
pub const SERVICE_MASK: u16 = (1 << SERVICE_BITS) - 1;

/// Banks described by one map word.
pub const MAP_BANKS: u32 = 4;

/// Service field of `bank`, [`CFG_UNUSED`] past the end of the map.
#[must_use]
pub const fn service_of(map: u16, bank: u32) -> u8 {
    if bank >= MAP_BANKS {
        return CFG_UNUSED;
    }
    ((map >> (bank * SERVICE_BITS)) & SERVICE_MASK) as u8
}

/// Pack four bank assignments into a map word.
#[must_use]
pub const fn pack(banks: [u8; 4]) -> u16 {
    (banks[0] as u16 & SERVICE_MASK)
        | ((banks[1] as u16 & SERVICE_MASK) << SERVICE_BITS)
        | ((banks[2] as u16 & SERVICE_MASK) << (2 * SERVICE_BITS))
        | ((banks[3] as u16 & SERVICE_MASK) << (3 * SERVICE_BITS))
}

/// Default gen4 assignment: asym, sym, comp, comp.
pub const DEFAULT_MAP: u16 = pack([CFG_ASYM, CFG_SYM, CFG_COMP, CFG_COMP]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_then_read_each_bank() {
        let map = pack([CFG_SYM, CFG_UNUSED, CFG_ASYM, CFG_COMP]);
        assert_eq!(service_of(map, 0), CFG_SYM);
        assert_eq!(service_of(map, 1), CFG_UNUSED);
        assert_eq!(service_of(map, 2), CFG_ASYM);
        assert_eq!(service_of(map, 3), CFG_COMP);
        assert_eq!(service_of(map, 4), CFG_UNUSED);
    }

    #[test]
    fn default_map_layout() {
        assert_eq!(service_of(DEFAULT_MAP, 0), CFG_ASYM);
        assert_eq!(service_of(DEFAULT_MAP, 3), CFG_COMP);
    }
}
