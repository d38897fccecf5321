//! Physical compute nodes and their capacity.

use std::collections::BTreeMap;

use capsched_id::{DcId, NodeId};
use serde::{Deserialize, Serialize};

use crate::accountant::{self, Demand, DemandFilter};
use crate::coefficient::Coefficient;
use crate::error::{CapacityError, CapacityResult};
use crate::resources::{HasCachedResources, Resources};
use crate::storage::NodeStorage;
use crate::vm::VmDemand;

/// Node status as reported by the heartbeat process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Maintenance.
    #[default]
    Offline,
    Online,
    Unreachable,
    Unlicensed,
}

impl NodeStatus {
    pub fn code(&self) -> i16 {
        match self {
            Self::Offline => 1,
            Self::Online => 2,
            Self::Unreachable => 3,
            Self::Unlicensed => 9,
        }
    }

    pub fn from_code(code: i16) -> CapacityResult<Self> {
        match code {
            1 => Ok(Self::Offline),
            2 => Ok(Self::Online),
            3 => Ok(Self::Unreachable),
            9 => Ok(Self::Unlicensed),
            other => Err(CapacityError::configuration(format!(
                "unknown node status code {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "maintenance",
            Self::Online => "online",
            Self::Unreachable => "unreachable",
            Self::Unlicensed => "unlicensed",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hardware inventory reported for a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub cpu: i64,
    pub ram: i64,
    /// Pool sizes in MB.
    #[serde(default)]
    pub zpools: BTreeMap<String, i64>,
}

impl HardwareInfo {
    pub fn validate(&self) -> CapacityResult<()> {
        if self.cpu < 0 || self.ram < 0 || self.zpools.values().any(|size| *size < 0) {
            return Err(CapacityError::configuration(format!(
                "negative hardware reported: cpu={} ram={}",
                self.cpu, self.ram
            )));
        }
        Ok(())
    }
}

/// Anything with an operational status.
pub trait HasStatus {
    fn status(&self) -> NodeStatus;

    fn is_online(&self) -> bool {
        self.status() == NodeStatus::Online
    }
}

/// A physical host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub hostname: String,
    pub status: NodeStatus,
    pub is_compute: bool,
    /// Physical cores.
    pub cpu: i64,
    /// Physical RAM in MB.
    pub ram: i64,
    pub cpu_coef: Coefficient,
    pub ram_coef: Coefficient,
    /// Name of the default local pool, if the node has one.
    pub zpool: Option<String>,
    cpu_free: i64,
    ram_free: i64,
    disk_free: i64,
    ram_kvm_overhead: i64,
}

impl Node {
    pub fn new(id: NodeId, hostname: impl Into<String>, cpu: i64, ram: i64) -> Self {
        Self {
            id,
            hostname: hostname.into(),
            status: NodeStatus::default(),
            is_compute: true,
            cpu,
            ram,
            cpu_coef: Coefficient::ONE,
            ram_coef: Coefficient::ONE,
            zpool: None,
            cpu_free: 0,
            ram_free: 0,
            disk_free: 0,
            ram_kvm_overhead: 0,
        }
    }

    #[must_use]
    pub fn with_zpool(mut self, zpool: impl Into<String>) -> Self {
        self.zpool = Some(zpool.into());
        self
    }

    #[must_use]
    pub fn with_coefficients(mut self, cpu_coef: Coefficient, ram_coef: Coefficient) -> Self {
        self.cpu_coef = cpu_coef;
        self.ram_coef = ram_coef;
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn total_cpu(&self) -> i64 {
        self.cpu_coef.apply(self.cpu)
    }

    pub fn total_ram(&self) -> i64 {
        self.ram_coef.apply(self.ram)
    }

    /// Capacity-affecting operations are only defined on compute nodes.
    pub fn ensure_compute(&self) -> CapacityResult<()> {
        if self.is_compute {
            Ok(())
        } else {
            Err(CapacityError::configuration(format!(
                "{} ({}) is not a compute node",
                self.hostname, self.id
            )))
        }
    }

    pub fn validate(&self) -> CapacityResult<()> {
        if self.cpu < 0 || self.ram < 0 {
            return Err(CapacityError::configuration(format!(
                "{} reports negative hardware: cpu={} ram={}",
                self.hostname, self.cpu, self.ram
            )));
        }
        Ok(())
    }

    /// Rehydrates cached columns read back from storage.
    pub fn restore_cached(&mut self, free: Resources, ram_kvm_overhead: i64) {
        self.set_cached(free, ram_kvm_overhead);
    }

    pub(crate) fn set_cached(&mut self, free: Resources, ram_kvm_overhead: i64) {
        self.cpu_free = free.cpu;
        self.ram_free = free.ram;
        self.disk_free = free.disk;
        self.ram_kvm_overhead = ram_kvm_overhead;
    }
}

impl HasStatus for Node {
    fn status(&self) -> NodeStatus {
        self.status
    }
}

impl HasCachedResources for Node {
    fn cached_free(&self) -> Resources {
        Resources::new(self.cpu_free, self.ram_free, self.disk_free)
    }

    fn ram_kvm_overhead(&self) -> i64 {
        self.ram_kvm_overhead
    }
}

/// Read-only capacity view of one compute node and the VMs running on it.
///
/// Demands are evaluated once, against the node's local pool, when the view is
/// built; every query afterwards is a pure fold.
#[derive(Debug, Clone)]
pub struct NodeCapacity<'a> {
    node: &'a Node,
    local: Option<&'a NodeStorage>,
    demands: Vec<Demand>,
}

impl<'a> NodeCapacity<'a> {
    pub fn new<V, I>(node: &'a Node, local: Option<&'a NodeStorage>, vms: I) -> CapacityResult<Self>
    where
        V: VmDemand + 'a,
        I: IntoIterator<Item = &'a V>,
    {
        node.ensure_compute()?;
        let zpool = node.zpool.as_deref();
        let demands = vms
            .into_iter()
            .map(|vm| Demand {
                dc: vm.dc(),
                resources: vm.get_cpu_ram_disk(zpool, true),
                needs_ram_overhead: vm.needs_ram_overhead(),
            })
            .collect();

        Ok(Self {
            node,
            local,
            demands,
        })
    }

    pub fn node(&self) -> &Node {
        self.node
    }

    pub fn demands(&self) -> &[Demand] {
        &self.demands
    }

    pub fn total_cpu(&self) -> i64 {
        self.node.total_cpu()
    }

    pub fn total_ram(&self) -> i64 {
        self.node.total_ram()
    }

    /// Coefficient-adjusted totals; disk is what the local pool leaves for VMs.
    pub fn resources(&self) -> Resources {
        Resources::new(
            self.total_cpu(),
            self.total_ram(),
            self.local.map(NodeStorage::vm_capacity).unwrap_or(0),
        )
    }

    /// What tenant `dc` consumes on this node.
    pub fn get_used_resources(&self, dc: DcId) -> Resources {
        accountant::used(&self.demands, dc)
    }

    /// `totals` minus the demand of every VM matching `filter`.
    pub fn get_free_resources(&self, totals: Resources, filter: &DemandFilter) -> Resources {
        accountant::subtract(totals, &self.demands, filter)
    }

    /// Memory overhead of the hardware-virtualized guests, optionally of one
    /// tenant only.
    pub fn get_ram_kvm_overhead(&self, dc: Option<DcId>, per_vm_mb: i64) -> i64 {
        accountant::ram_kvm_overhead(&self.demands, dc, per_vm_mb)
    }

    /// Free resources of the whole node.
    pub fn node_free(&self) -> Resources {
        self.get_free_resources(self.resources(), &DemandFilter::all())
    }
}
