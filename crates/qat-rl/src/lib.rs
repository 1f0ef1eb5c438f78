//! Hierarchical rate limiting for QAT gen4 accelerators.
//!
//! Traffic is shaped by a three level token-bucket tree per device:
//!
//! ```text
//! Root (one per service)
//!   └─ Cluster (group budget)
//!        └─ Leaf (one VF's rings for one service)
//! ```
//!
//! Each node carries an SLA: a committed rate (CIR) it is guaranteed and a
//! peak rate (PIR) it may burst to. Children draw their CIR from the parent's
//! remaining budget. [`RateLimiter`] validates every request against that
//! budget, translates rates into hardware tokens, links rings into the tree
//! through the link-table CSRs and pushes the SLA to firmware over the admin
//! channel.
//!
//! # Backends
//!
//! ```text
//! Hardware:    VfioDevice (IOMMU-mapped DMA) + MappedBar (PMISC BAR) + MailboxTransport
//! Simulation:  ShadowCsr + DmaPool + SoftwareFirmware (CI, CLI)
//! ```
//!
//! # Quick start
//!
//! ```
//! use qat_rl::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let device = SimulatedDevice::new();
//! let rl = device.gen4()?;
//!
//! let sla = rl.leaf_request(PciAddress::from_vf(0), ServiceType::Dc, 1000, 2000)?;
//! let id = rl.create_sla(sla)?;
//! println!("{}", rl.capabilities());
//!
//! rl.delete_sla(id)?;
//! rl.exit();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod admin;
pub mod budget;
mod capabilities;
pub mod config;
mod controller;
pub mod csr;
pub mod dma;
mod error;
pub mod linkage;
pub mod mmio;
pub mod node;
pub mod pfvf;
pub mod root;
mod sim;
pub mod translate;
mod types;
pub mod vfio;

pub use admin::{AdminChannel, AdminCmd, AdminTransport, MailboxTransport, SoftwareFirmware};
pub use capabilities::{ServiceCapability, SlaCapabilities};
pub use config::{DeviceConfig, RlHwData};
pub use controller::RateLimiter;
pub use csr::{CsrAccess, ShadowCsr};
pub use dma::{DmaAllocator, DmaBuffer, DmaPool};
pub use error::{ErrorKind, Result, RlError};
pub use node::{Node, NodeCount};
pub use pfvf::{RateKind, RateRequest, RateResponse};
pub use sim::SimulatedDevice;
pub use translate::HwParams;
pub use types::{root_index_of, type_of, NodeId, NodeType, PciAddress, ServiceType, Sla};
pub use vfio::VfioDevice;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        DeviceConfig, NodeId, NodeType, PciAddress, RateLimiter, Result, RlError, RlHwData,
        ServiceType, SimulatedDevice, Sla, SlaCapabilities,
    };
}
