//! Capability report: per-service headroom and SLA slot usage

use std::fmt;

use crate::config::{DeviceConfig, RlHwData};
use crate::node::{NodeCount, NodeStore};
use crate::root::RootRegistry;
use crate::types::{NodeType, ServiceType};

/// Rates available to one service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceCapability {
    /// Service
    pub service: ServiceType,
    /// Per-service ceiling, `0` until the service has a cluster
    pub max_rate: u32,
    /// Committed rate still unassigned across the service's clusters
    pub available_rate: u32,
}

/// Snapshot returned by [`RateLimiter::capabilities`](crate::RateLimiter::capabilities)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaCapabilities {
    /// One entry per enabled service, in root order
    pub services: Vec<ServiceCapability>,
    /// User SLA slots: enabled services × VFs
    pub max_slas: u32,
    /// Leaf SLAs in place
    pub used_slas: u32,
    /// Slots left
    pub avail_slas: u32,
}

impl SlaCapabilities {
    pub(crate) fn collect(
        hw: &RlHwData,
        config: &DeviceConfig,
        nodes: &NodeStore,
        roots: &RootRegistry,
        count: &NodeCount,
    ) -> Self {
        let services = roots
            .iter()
            .map(|(service, _)| {
                let mut clusters = nodes
                    .iter(NodeType::Cluster)
                    .filter(|n| n.service == service)
                    .peekable();
                let max_rate = if clusters.peek().is_some() {
                    hw.service_max(service)
                } else {
                    0
                };
                let available_rate = clusters.fold(0u32, |acc, n| acc.saturating_add(n.remaining_cir));
                ServiceCapability {
                    service,
                    max_rate,
                    available_rate,
                }
            })
            .collect();

        #[allow(clippy::cast_possible_truncation)]
        let max_slas = (config.enabled_services.len() as u32).saturating_mul(config.num_vfs);
        let used_slas = count.slas(NodeType::Leaf);
        Self {
            services,
            max_slas,
            used_slas,
            avail_slas: max_slas.saturating_sub(used_slas),
        }
    }

    /// Entry for `service`, if enabled
    pub fn service(&self, service: ServiceType) -> Option<&ServiceCapability> {
        self.services.iter().find(|c| c.service == service)
    }
}

impl fmt::Display for SlaCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.services {
            writeln!(
                f,
                "{:<5} max {:>7}  available {:>7}",
                c.service, c.max_rate, c.available_rate
            )?;
        }
        write!(
            f,
            "SLAs  {} used / {} max ({} free)",
            self.used_slas, self.max_slas, self.avail_slas
        )
    }
}
