//! Identifier types of the scheduling domain.

use crate::define_id;

define_id!(
    /// A datacenter, the scheduling tenant.
    DcId, DcKind, "dc"
);

define_id!(
    /// A physical compute node.
    NodeId, NodeKind, "node"
);

define_id!(VmId, VmKind, "vm");
