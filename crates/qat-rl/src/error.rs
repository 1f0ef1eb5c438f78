//! Error types for rate-limiting operations

use thiserror::Error;

use crate::types::{NodeType, ServiceType};

/// Result type alias for rate-limiting operations
pub type Result<T> = std::result::Result<T, RlError>;

/// Errors that can occur during rate-limiting operations
#[derive(Debug, Error)]
pub enum RlError {
    /// Caller supplied an id, type, rate or PCI address that is not valid
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the input
        reason: String,
    },

    /// A requested node, root or parent does not exist
    #[error("Not found: {what}")]
    NotFound {
        /// Description of the missing object
        what: String,
    },

    /// Operation is refused by the tree state (budget, ordering, live children)
    #[error("Permission denied: {reason}")]
    PermissionDenied {
        /// Why the operation was refused
        reason: String,
    },

    /// The id space for a node type is full
    #[error("No free {node_type} ids")]
    ResourceExhausted {
        /// Node type whose id space is exhausted
        node_type: NodeType,
    },

    /// A nonzero rate translated to zero hardware tokens
    #[error("SLA value too low for {service}")]
    SlaTooLow {
        /// Service the SLA was requested for
        service: ServiceType,
    },

    /// Firmware admin round trip failed
    #[error("Admin {cmd} failed: {reason}")]
    AdminTransport {
        /// Command that failed
        cmd: &'static str,
        /// Transport or firmware reason
        reason: String,
    },

    /// Admin completion was not signalled in time
    #[error("Admin completion timeout after {duration_ms}ms")]
    Timeout {
        /// Wait duration in milliseconds
        duration_ms: u64,
    },

    /// Internal bookkeeping is inconsistent
    #[error("Internal error: {reason}")]
    Internal {
        /// Description of the inconsistency
        reason: String,
    },
}

/// Error class, following the rate-limiting error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input
    InvalidArgument,
    /// Unknown object
    NotFound,
    /// Refused by tree state
    PermissionDenied,
    /// Id space full
    ResourceExhausted,
    /// Firmware round trip failed or timed out
    AdminTransportFailure,
    /// Bookkeeping inconsistency
    Internal,
}

impl RlError {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a permission denied error
    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    /// Create an admin transport error
    pub fn admin(cmd: &'static str, reason: impl Into<String>) -> Self {
        Self::AdminTransport {
            cmd,
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Error class of this error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } | Self::SlaTooLow { .. } => ErrorKind::InvalidArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::AdminTransport { .. } | Self::Timeout { .. } => {
                ErrorKind::AdminTransportFailure
            }
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }
}
