//! Best-fit node selection.
//!
//! Selection only ever looks at cached columns. Whoever commits the chosen
//! placement must re-verify against live numbers under the node lock.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use capsched_id::NodeId;
use serde::{Deserialize, Serialize};

use crate::resources::Resources;
use crate::vm::Vm;

/// What a new workload needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    pub cpu: i64,
    /// Including hypervisor memory overhead.
    pub ram: i64,
    /// Required MB per zpool.
    #[serde(default)]
    pub disks: BTreeMap<String, i64>,
}

impl Requirements {
    pub fn new(cpu: i64, ram: i64) -> Self {
        Self {
            cpu,
            ram,
            disks: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_disk(mut self, zpool: impl Into<String>, size: i64) -> Self {
        *self.disks.entry(zpool.into()).or_insert(0) += size;
        self
    }

    pub fn for_vm(vm: &Vm) -> Self {
        let (cpu, ram) = vm.get_cpu_ram(true);
        Self {
            cpu,
            ram,
            disks: vm.get_disks(),
        }
    }

    /// Disk requested on `zpool`, zero when none.
    pub fn disk_on(&self, zpool: Option<&str>) -> i64 {
        zpool
            .and_then(|z| self.disks.get(z))
            .copied()
            .unwrap_or(0)
    }

    /// The request as a resource triple against a node whose local pool is
    /// `local_zpool`.
    pub fn local(&self, local_zpool: Option<&str>) -> Resources {
        Resources::new(self.cpu, self.ram, self.disk_on(local_zpool))
    }

    /// CPU and RAM against `free`, and disk only when the request names the
    /// local pool. Selection and commit both go through this.
    pub fn fits_binding(&self, free: &Resources, local_zpool: Option<&str>) -> bool {
        let disk_ok = match local_zpool.and_then(|z| self.disks.get(z)) {
            Some(need) => free.disk >= *need,
            None => true,
        };
        free.cpu >= self.cpu && free.ram >= self.ram && disk_ok
    }
}

/// One tenant binding as seen by the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub node: NodeId,
    pub online: bool,
    pub is_compute: bool,
    pub priority: i32,
    /// Cached binding free columns.
    pub free: Resources,
    pub local_zpool: Option<String>,
    /// `size_free` of the node's non-local pools the tenant is attached to.
    pub pools: BTreeMap<String, i64>,
}

impl Candidate {
    pub fn is_eligible(&self, req: &Requirements) -> bool {
        self.online
            && self.is_compute
            && req.fits_binding(&self.free, self.local_zpool.as_deref())
            && self.pools_feasible(req)
    }

    /// The local pool is checked against the binding's `disk_free`.
    ///
    /// For every other required pool it is enough that ONE attached pool among
    /// them covers its own requirement. A request spanning two non-local pools
    /// is therefore accepted when only one of them fits.
    pub fn disk_feasible(&self, req: &Requirements) -> bool {
        let local = self.local_zpool.as_deref();
        if let Some(need) = local.and_then(|z| req.disks.get(z)) {
            if self.free.disk < *need {
                return false;
            }
        }
        self.pools_feasible(req)
    }

    fn pools_feasible(&self, req: &Requirements) -> bool {
        let local = self.local_zpool.as_deref();
        let mut others = req
            .disks
            .iter()
            .filter(|(zpool, _)| Some(zpool.as_str()) != local)
            .peekable();
        if others.peek().is_none() {
            return true;
        }
        others.any(|(zpool, need)| self.pools.get(zpool).is_some_and(|free| free >= need))
    }

    /// Highest priority first, then the fullest node.
    fn sort_key(&self) -> (Reverse<i32>, i64, i64, i64, NodeId) {
        (
            Reverse(self.priority),
            self.free.cpu,
            self.free.ram,
            self.free.disk,
            self.node,
        )
    }
}

/// Best-fit pick among `candidates`, skipping `excluded` nodes.
pub fn select<I>(candidates: I, req: &Requirements, excluded: &BTreeSet<NodeId>) -> Option<Candidate>
where
    I: IntoIterator<Item = Candidate>,
{
    candidates
        .into_iter()
        .filter(|c| !excluded.contains(&c.node))
        .filter(|c| c.is_eligible(req))
        .min_by_key(Candidate::sort_key)
}
