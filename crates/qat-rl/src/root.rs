//! Root registry: one root per enabled service, fixed after init

use tracing::debug;

use crate::error::{Result, RlError};
use crate::node::{Node, NodeCount, NodeStore};
use crate::types::{NodeId, NodeType, ServiceType};

/// Service → root lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootRegistry {
    roots: [Option<NodeId>; ServiceType::COUNT],
}

impl RootRegistry {
    /// Allocate one root per service in `services`, in order
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a service listed twice and
    /// `ResourceExhausted` if the root id space runs out.
    pub fn build(
        store: &mut NodeStore,
        count: &mut NodeCount,
        services: &[ServiceType],
    ) -> Result<Self> {
        let mut registry = Self::default();
        for &service in services {
            if registry.root_id(service).is_some() {
                return Err(RlError::invalid_argument(format!(
                    "duplicate root for {service}"
                )));
            }
            let id = store.allocate(NodeType::Root, service)?;
            count.node_added(NodeType::Root);
            registry.roots[service.index()] = Some(id);
            debug!("Rate Limiting: root {id} for {service}");
        }
        Ok(registry)
    }

    /// Id of the root for `service`
    pub const fn root_id(&self, service: ServiceType) -> Option<NodeId> {
        self.roots[service.index()]
    }

    /// Root node for `service`
    pub fn root_for<'a>(&self, store: &'a NodeStore, service: ServiceType) -> Option<&'a Node> {
        store.find(self.root_id(service)?)
    }

    /// `(service, root)` pairs in root id order
    pub fn iter(&self) -> impl Iterator<Item = (ServiceType, NodeId)> {
        let mut roots: Vec<_> = ServiceType::ALL
            .into_iter()
            .filter_map(|svc| self.root_id(svc).map(|id| (svc, id)))
            .collect();
        roots.sort_by_key(|&(_, id)| id);
        roots.into_iter()
    }

    /// Number of roots
    pub fn len(&self) -> usize {
        self.roots.iter().flatten().count()
    }

    /// Whether no service has a root
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
