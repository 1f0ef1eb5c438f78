//! gen4 rate-limiting constants.
//!
//! Rates for symmetric crypto and compression are expressed in Mbit/s.
//! Asymmetric crypto is expressed against [`SLICE_REFERENCE`], a unitless
//! slice-capacity reference, and only converted to bytes through
//! [`MAX_THROUGHPUT_ASYM`] when PCIe or AE tokens are computed.

/// PCIe bandwidth scale factor, divisor.
pub const PCIE_SCALE_FACTOR_DIV: u32 = 100;

/// PCIe bandwidth scale factor, multiplier (2% protocol overhead).
pub const PCIE_SCALE_FACTOR_MUL: u32 = 102;

/// Token scans per second, for a ~1.0485 ms scan period.
pub const SCANS_PER_SEC: u32 = 954;

/// AE clock in Hz.
pub const CLOCK_FREQUENCY_HZ: u32 = 1_000_000_000;

/// Slice-capacity reference for asymmetric crypto.
pub const SLICE_REFERENCE: u32 = 1000;

/// Maximum asymmetric crypto throughput.
pub const MAX_THROUGHPUT_ASYM: u32 = 173_750;

/// Maximum symmetric crypto throughput (Mbit/s).
pub const MAX_THROUGHPUT_SYM: u32 = 95_000;

/// Maximum compression throughput (Mbit/s).
pub const MAX_THROUGHPUT_DC: u32 = 45_000;

/// Slice count subtracted when scaling decompression PCIe-out tokens.
pub const DC_CORRECTION: u32 = 1;

/// Bytes carried by one PCIe token.
pub const TOKEN_PCIE_SIZE: u64 = 64;

/// Bytes per asymmetric request used for PCIe scaling.
pub const TOKEN_ASYM_SIZE: u64 = 1024;

/// Mbit/s → bytes/s.
pub const CONVERT_TO_BYTES: u64 = 125_000;

/// Ring pair banks per physical device.
pub const MAX_BANKS: u32 = 64;

/// SR-IOV virtual functions supported by the device.
pub const TOTAL_VFS: u32 = 16;

/// Ring pair banks owned by each VF.
pub const BANKS_PER_VF: u32 = MAX_BANKS / TOTAL_VFS;

/// Acceleration engines assigned to each service in the default profile.
pub const AES_PER_SERVICE: u32 = 4;

/// Slices assigned to each service in the default profile.
pub const SLICES_PER_SERVICE: u32 = 4;
