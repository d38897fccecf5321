//! Storage pools attached to nodes.

use std::collections::BTreeSet;

use capsched_id::DcId;
use serde::{Deserialize, Serialize};

use crate::coefficient::Coefficient;

/// One zpool on one node.
///
/// Sizes are MB. `size_free` of a non-local pool is owned by the storage
/// subsystem; for the node's local pool it mirrors the node's `disk_free`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStorage {
    pub zpool: String,
    pub size: i64,
    pub size_coef: Coefficient,
    size_free: i64,
    pub size_backups: i64,
    pub size_snapshots: i64,
    pub size_rep_snapshots: i64,
    /// Tenants allowed to place disks on this pool.
    dcs: BTreeSet<DcId>,
}

impl NodeStorage {
    pub fn new(zpool: impl Into<String>, size: i64, size_coef: Coefficient) -> Self {
        let size_coef_total = size_coef.apply(size);
        Self {
            zpool: zpool.into(),
            size,
            size_coef,
            size_free: size_coef_total,
            size_backups: 0,
            size_snapshots: 0,
            size_rep_snapshots: 0,
            dcs: BTreeSet::new(),
        }
    }

    /// Coefficient-adjusted pool size.
    pub fn size_total(&self) -> i64 {
        self.size_coef.apply(self.size)
    }

    /// What VM disks may use: backups and snapshots never compete with them.
    pub fn vm_capacity(&self) -> i64 {
        self.size_total() - self.size_backups - self.size_snapshots - self.size_rep_snapshots
    }

    pub fn size_free(&self) -> i64 {
        self.size_free
    }

    pub fn set_size_free(&mut self, size_free: i64) {
        self.size_free = size_free;
    }

    pub fn dcs(&self) -> &BTreeSet<DcId> {
        &self.dcs
    }

    pub fn is_attached(&self, dc: DcId) -> bool {
        self.dcs.contains(&dc)
    }

    pub fn attach(&mut self, dc: DcId) -> bool {
        self.dcs.insert(dc)
    }

    pub fn release(&mut self, dc: DcId) -> bool {
        self.dcs.remove(&dc)
    }
}
