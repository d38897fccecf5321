//! Error taxonomy of the capacity core.

use capsched_id::{DcId, NodeId, VmId};
use thiserror::Error;

/// Result type for capacity operations.
pub type CapacityResult<T> = Result<T, CapacityError>;

/// Errors raised by accounting, admin changes and placement.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapacityError {
    /// Structurally invalid request: non-compute node, negative totals, bad
    /// coefficient. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No node satisfies the request. An expected outcome, not a fault.
    #[error("no eligible node in {dc} for the requested resources")]
    NoNodeAvailable { dc: DcId },

    /// The cached columns promised more than the node has once re-read under
    /// the node lock.
    #[error("stale capacity data on {node}: {detail}")]
    StaleDataRace { node: NodeId, detail: String },

    /// An admin total does not fit what the node can give.
    #[error("insufficient capacity on {node}: {detail}")]
    InsufficientCapacity { node: NodeId, detail: String },

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("{node} is not attached to {dc}")]
    BindingNotFound { dc: DcId, node: NodeId },

    #[error("{node} is already attached to {dc}")]
    AlreadyAttached { dc: DcId, node: NodeId },

    /// Detach refused while the tenant still runs VMs on the node.
    #[error("{node} still has VMs in {dc}")]
    NodeInUse { dc: DcId, node: NodeId },

    #[error("vm not found: {0}")]
    VmNotFound(VmId),

    #[error("vm already exists: {0}")]
    VmExists(VmId),

    #[error("storage '{zpool}' not found on {node}")]
    StorageNotFound { node: NodeId, zpool: String },

    #[error("fleet lock poisoned")]
    LockPoisoned,
}

impl CapacityError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Only a stale read is worth re-running placement for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleDataRace { .. })
    }

    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, Self::NoNodeAvailable { .. })
    }
}
