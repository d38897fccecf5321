//! The VM side of resource accounting.
//!
//! VM lifecycle lives elsewhere; this module only knows how much a VM
//! demands from the node it runs on.

use std::collections::BTreeMap;

use capsched_id::{DcId, VmId};
use serde::{Deserialize, Serialize};

use crate::resources::Resources;
use crate::settings::Settings;

/// The narrow contract accounting needs from a VM.
pub trait VmDemand {
    /// Tenant owning the VM.
    fn dc(&self) -> DcId;

    /// Whether the hypervisor reserves extra memory per guest.
    fn needs_ram_overhead(&self) -> bool;

    /// `(vCPUs, RAM MB, disk MB on zpool)` counted against a node. A `None`
    /// zpool counts disks on every pool.
    fn get_cpu_ram_disk(&self, zpool: Option<&str>, ram_overhead: bool) -> Resources;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hypervisor {
    Kvm,
    Bhyve,
    /// OS-level container sharing the host kernel.
    Zone,
}

impl Hypervisor {
    /// Hardware virtualization.
    pub fn is_hvm(&self) -> bool {
        matches!(self, Self::Kvm | Self::Bhyve)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kvm => "kvm",
            Self::Bhyve => "bhyve",
            Self::Zone => "zone",
        }
    }
}

impl std::str::FromStr for Hypervisor {
    type Err = crate::error::CapacityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kvm" => Ok(Self::Kvm),
            "bhyve" => Ok(Self::Bhyve),
            "zone" => Ok(Self::Zone),
            other => Err(crate::error::CapacityError::configuration(format!(
                "unknown hypervisor '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDisk {
    pub zpool: String,
    /// MB
    pub size: i64,
}

/// Sizing of a VM as configured (desired) or as running (active).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDefinition {
    pub vcpus: i64,
    /// Guest RAM in MB, without hypervisor overhead.
    pub ram: i64,
    /// First disk is the boot disk (root dataset for zones).
    #[serde(default)]
    pub disks: Vec<VmDisk>,
}

impl VmDefinition {
    pub fn new(vcpus: i64, ram: i64) -> Self {
        Self {
            vcpus,
            ram,
            disks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_disk(mut self, zpool: impl Into<String>, size: i64) -> Self {
        self.disks.push(VmDisk {
            zpool: zpool.into(),
            size,
        });
        self
    }

    /// Disk MB per zpool. Zones only count their root dataset.
    fn disks_by_zpool(&self, hypervisor: Hypervisor, zpool: Option<&str>) -> BTreeMap<String, i64> {
        let mut by_zpool = BTreeMap::new();
        let counted: &[VmDisk] = if hypervisor.is_hvm() {
            &self.disks
        } else {
            self.disks.get(..1).unwrap_or_default()
        };

        for disk in counted {
            if zpool.is_some_and(|z| z != disk.zpool) {
                continue;
            }
            *by_zpool.entry(disk.zpool.clone()).or_insert(0) += disk.size;
        }
        by_zpool
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    pub id: VmId,
    pub dc: DcId,
    pub hypervisor: Hypervisor,
    /// Exists (or is being created) on its node; `active` is then meaningful.
    pub deployed: bool,
    /// Replica VMs may run without holding CPU/RAM.
    pub reserve_resources: bool,
    pub definition: VmDefinition,
    pub active: Option<VmDefinition>,
    ram_overhead_mb: i64,
}

impl Vm {
    pub fn new(
        id: VmId,
        dc: DcId,
        hypervisor: Hypervisor,
        definition: VmDefinition,
        settings: &Settings,
    ) -> Self {
        let ram_overhead_mb = if hypervisor.is_hvm() {
            settings.kvm_memory_overhead_mb
        } else {
            0
        };
        Self {
            id,
            dc,
            hypervisor,
            deployed: false,
            reserve_resources: true,
            definition,
            active: None,
            ram_overhead_mb,
        }
    }

    /// Marks the VM as running with `active` sizing.
    #[must_use]
    pub fn deployed_as(mut self, active: VmDefinition) -> Self {
        self.deployed = true;
        self.active = Some(active);
        self
    }

    /// A replica that does not hold CPU/RAM on its node.
    #[must_use]
    pub fn without_reservation(mut self) -> Self {
        self.reserve_resources = false;
        self
    }

    pub fn ram_overhead_mb(&self) -> i64 {
        self.ram_overhead_mb
    }

    fn active_definition(&self) -> Option<&VmDefinition> {
        self.active.as_ref().filter(|_| self.deployed)
    }

    /// `(vCPUs, RAM MB)`: the larger of desired and active sizing.
    pub fn get_cpu_ram(&self, ram_overhead: bool) -> (i64, i64) {
        if !self.reserve_resources {
            return (0, 0);
        }

        let overhead = if ram_overhead { self.ram_overhead_mb } else { 0 };
        let mut cpu = self.definition.vcpus;
        let mut ram = self.definition.ram + overhead;

        if let Some(active) = self.active_definition() {
            cpu = cpu.max(active.vcpus);
            ram = ram.max(active.ram + overhead);
        }
        (cpu, ram)
    }

    /// Disk MB on `zpool` (all pools when `None`): the larger of desired and
    /// active sizing.
    pub fn get_disk_size(&self, zpool: Option<&str>) -> i64 {
        let desired: i64 = self
            .definition
            .disks_by_zpool(self.hypervisor, zpool)
            .values()
            .sum();
        let active: i64 = self
            .active_definition()
            .map(|a| a.disks_by_zpool(self.hypervisor, zpool).values().sum())
            .unwrap_or(0);
        desired.max(active)
    }

    /// Desired disk MB grouped per zpool, as a placement request needs it.
    pub fn get_disks(&self) -> BTreeMap<String, i64> {
        self.definition.disks_by_zpool(self.hypervisor, None)
    }
}

impl VmDemand for Vm {
    fn dc(&self) -> DcId {
        self.dc
    }

    fn needs_ram_overhead(&self) -> bool {
        self.hypervisor.is_hvm()
    }

    fn get_cpu_ram_disk(&self, zpool: Option<&str>, ram_overhead: bool) -> Resources {
        let (cpu, ram) = self.get_cpu_ram(ram_overhead);
        Resources::new(cpu, ram, self.get_disk_size(zpool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kvm(definition: VmDefinition) -> Vm {
        Vm::new(
            VmId::new(),
            DcId::new(),
            Hypervisor::Kvm,
            definition,
            &Settings::default(),
        )
    }

    #[test]
    fn test_hvm_ram_overhead_is_optional() {
        let vm = kvm(VmDefinition::new(2, 2048));
        assert_eq!(vm.get_cpu_ram(false), (2, 2048));
        assert_eq!(vm.get_cpu_ram(true), (2, 2304));
        assert!(vm.needs_ram_overhead());
    }

    #[test]
    fn test_zone_has_no_overhead() {
        let vm = Vm::new(
            VmId::new(),
            DcId::new(),
            Hypervisor::Zone,
            VmDefinition::new(1, 512),
            &Settings::default(),
        );
        assert_eq!(vm.get_cpu_ram(true), (1, 512));
        assert!(!vm.needs_ram_overhead());
    }

    #[test]
    fn test_deployed_vm_counts_larger_of_desired_and_active() {
        let vm = kvm(VmDefinition::new(2, 1024).with_disk("zones", 100))
            .deployed_as(VmDefinition::new(4, 512).with_disk("zones", 300));
        assert_eq!(
            vm.get_cpu_ram_disk(Some("zones"), false),
            Resources::new(4, 1024, 300)
        );
    }

    #[test]
    fn test_active_ignored_until_deployed() {
        let mut vm = kvm(VmDefinition::new(2, 1024));
        vm.active = Some(VmDefinition::new(8, 8192));
        assert_eq!(vm.get_cpu_ram(false), (2, 1024));
    }

    #[test]
    fn test_replica_without_reservation_holds_no_cpu_ram() {
        let vm = kvm(VmDefinition::new(2, 1024).with_disk("zones", 50)).without_reservation();
        assert_eq!(
            vm.get_cpu_ram_disk(Some("zones"), true),
            Resources::new(0, 0, 50)
        );
    }

    #[test]
    fn test_disk_filtered_by_zpool() {
        let vm = kvm(VmDefinition::new(1, 1)
            .with_disk("zones", 100)
            .with_disk("data", 400)
            .with_disk("zones", 20));
        assert_eq!(vm.get_disk_size(Some("zones")), 120);
        assert_eq!(vm.get_disk_size(Some("data")), 400);
        assert_eq!(vm.get_disk_size(None), 520);
        assert_eq!(
            vm.get_disks(),
            BTreeMap::from([("data".to_string(), 400), ("zones".to_string(), 120)])
        );
    }

    #[test]
    fn test_zone_counts_only_root_dataset() {
        let vm = Vm::new(
            VmId::new(),
            DcId::new(),
            Hypervisor::Zone,
            VmDefinition::new(1, 256)
                .with_disk("zones", 10_240)
                .with_disk("zones", 99_999),
            &Settings::default(),
        );
        assert_eq!(vm.get_disk_size(Some("zones")), 10_240);
    }
}
