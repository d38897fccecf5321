//! One node together with everything its accounting depends on.

use std::collections::BTreeMap;

use capsched_id::{DcId, NodeId, VmId};
use serde::Serialize;
use tracing::{debug, warn};

use crate::accountant::Reservation;
use crate::binding::{self, BindingSpec, BindingUpdate, DcNodeBinding};
use crate::error::{CapacityError, CapacityResult};
use crate::node::{HardwareInfo, HasStatus, Node, NodeCapacity, NodeStatus};
use crate::placement::{Candidate, Requirements};
use crate::resources::{HasCachedResources, Resources};
use crate::settings::Settings;
use crate::storage::NodeStorage;
use crate::strategy::Strategy;
use crate::vm::Vm;

/// When a VM mutation rewrites cached columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Recompute {
    #[default]
    Now,
    /// Bulk import; the caller runs one recompute once it is done. Until then
    /// the cached columns are stale.
    Deferred,
}

/// A node, its storage pools, its tenant bindings and the VMs it runs.
///
/// This is the unit of recomputation: every mutation touching any of these
/// rewrites the cached columns of the node and of all of its bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub node: Node,
    pub storages: BTreeMap<String, NodeStorage>,
    pub bindings: BTreeMap<DcId, DcNodeBinding>,
    pub vms: BTreeMap<VmId, Vm>,
}

impl NodeEntry {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            storages: BTreeMap::new(),
            bindings: BTreeMap::new(),
            vms: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn local_storage(&self) -> Option<&NodeStorage> {
        local_storage(&self.node, &self.storages)
    }

    pub fn capacity(&self) -> CapacityResult<NodeCapacity<'_>> {
        NodeCapacity::new(&self.node, self.local_storage(), self.vms.values())
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.bindings
            .values()
            .filter_map(DcNodeBinding::reservation)
            .collect()
    }

    pub fn has_vms_of(&self, dc: DcId) -> bool {
        self.vms.values().any(|vm| vm.dc == dc)
    }

    /// Recompute the node's cached columns, and with `save` every binding
    /// as well.
    pub fn update_resources(&mut self, settings: &Settings, save: bool) -> CapacityResult<()> {
        let (free, overhead) = {
            let capacity = self.capacity()?;
            (
                capacity.node_free(),
                capacity.get_ram_kvm_overhead(None, settings.kvm_memory_overhead_mb),
            )
        };
        self.node.set_cached(free, overhead);

        if let Some(zpool) = self.node.zpool.as_deref() {
            if let Some(local) = self.storages.get_mut(zpool) {
                local.set_size_free(free.disk);
            }
        }

        debug!(
            node = %self.node.id,
            cpu_free = free.cpu,
            ram_free = free.ram,
            disk_free = free.disk,
            ram_kvm_overhead = overhead,
            "node recomputed"
        );

        if save {
            self.update_all(settings)?;
        }
        Ok(())
    }

    /// Recompute every binding of this node.
    pub fn update_all(&mut self, settings: &Settings) -> CapacityResult<()> {
        let capacity = NodeCapacity::new(
            &self.node,
            local_storage(&self.node, &self.storages),
            self.vms.values(),
        )?;
        binding::update_all(&capacity, self.bindings.values_mut(), settings);
        Ok(())
    }

    /// Full recompute of a compute node; other nodes keep their values.
    pub fn recompute(&mut self, settings: &Settings) -> CapacityResult<()> {
        if self.node.is_compute {
            self.update_resources(settings, true)
        } else {
            Ok(())
        }
    }

    /// Apply an inventory report. New pools get the default size coefficient;
    /// a pool named like the local pool becomes the node's local pool.
    pub fn apply_hardware(&mut self, hw: HardwareInfo, settings: &Settings) -> CapacityResult<bool> {
        hw.validate()?;
        let mut changed = self.node.cpu != hw.cpu || self.node.ram != hw.ram;
        self.node.cpu = hw.cpu;
        self.node.ram = hw.ram;

        for (zpool, size) in hw.zpools {
            match self.storages.get_mut(&zpool) {
                Some(storage) if storage.size == size => {}
                Some(storage) => {
                    storage.size = size;
                    changed = true;
                }
                None => {
                    if zpool == settings.local_zpool {
                        self.node.zpool = Some(zpool.clone());
                    }
                    let storage = NodeStorage::new(zpool.clone(), size, settings.storage_size_coef);
                    self.storages.insert(zpool, storage);
                    changed = true;
                }
            }
        }

        if changed {
            self.recompute(settings)?;
        }
        Ok(changed)
    }

    pub fn attach(&mut self, dc: DcId, spec: BindingSpec, settings: &Settings) -> CapacityResult<()> {
        self.node.ensure_compute()?;
        if self.bindings.contains_key(&dc) {
            return Err(CapacityError::AlreadyAttached {
                dc,
                node: self.id(),
            });
        }

        let binding = DcNodeBinding::new(dc, self.id(), spec, settings)?;
        if settings.strict_reservations {
            binding.check_reservation(&self.capacity()?, &self.reservations())?;
        }
        self.bindings.insert(dc, binding);
        self.update_all(settings)
    }

    pub fn update_binding(
        &mut self,
        dc: DcId,
        update: BindingUpdate,
        settings: &Settings,
    ) -> CapacityResult<()> {
        self.node.ensure_compute()?;
        let node = self.id();
        let mut binding = self
            .bindings
            .get(&dc)
            .cloned()
            .ok_or(CapacityError::BindingNotFound { dc, node })?;
        binding.apply(update)?;

        if settings.strict_reservations {
            binding.check_reservation(&self.capacity()?, &self.reservations())?;
        }
        self.bindings.insert(dc, binding);
        self.recompute(settings)
    }

    /// Removes the binding and releases the tenant's storage pools. Refused
    /// while the tenant still runs VMs here.
    pub fn detach(&mut self, dc: DcId, settings: &Settings) -> CapacityResult<DcNodeBinding> {
        let node = self.id();
        if !self.bindings.contains_key(&dc) {
            return Err(CapacityError::BindingNotFound { dc, node });
        }
        if self.has_vms_of(dc) {
            return Err(CapacityError::NodeInUse { dc, node });
        }

        let binding = self
            .bindings
            .remove(&dc)
            .ok_or(CapacityError::BindingNotFound { dc, node })?;
        for storage in self.storages.values_mut() {
            storage.release(dc);
        }
        self.recompute(settings)?;
        Ok(binding)
    }

    pub fn add_vm(&mut self, vm: Vm, mode: Recompute, settings: &Settings) -> CapacityResult<()> {
        self.node.ensure_compute()?;
        if self.vms.contains_key(&vm.id) {
            return Err(CapacityError::VmExists(vm.id));
        }
        self.vms.insert(vm.id, vm);
        match mode {
            Recompute::Now => self.update_resources(settings, true),
            Recompute::Deferred => Ok(()),
        }
    }

    /// Replace a VM's sizing in place. The tenant of a VM never changes.
    pub fn update_vm(&mut self, vm: Vm, settings: &Settings) -> CapacityResult<()> {
        let current = self.vms.get(&vm.id).ok_or(CapacityError::VmNotFound(vm.id))?;
        if current.dc != vm.dc {
            return Err(CapacityError::configuration(format!(
                "{} belongs to {}, not {}",
                vm.id, current.dc, vm.dc
            )));
        }
        self.vms.insert(vm.id, vm);
        self.recompute(settings)
    }

    pub fn remove_vm(&mut self, id: VmId, settings: &Settings) -> CapacityResult<Vm> {
        let vm = self.vms.remove(&id).ok_or(CapacityError::VmNotFound(id))?;
        self.recompute(settings)?;
        Ok(vm)
    }

    /// Re-verify the node against live numbers and record `vm` on it.
    ///
    /// Returns what the VM takes from its tenant's binding. When the cached
    /// columns turn out stale they are rewritten before
    /// [`CapacityError::StaleDataRace`] is returned.
    pub fn commit_placement(&mut self, vm: Vm, settings: &Settings) -> CapacityResult<Resources> {
        self.node.ensure_compute()?;
        let node = self.id();
        if self.vms.contains_key(&vm.id) {
            return Err(CapacityError::VmExists(vm.id));
        }

        let local = self.node.zpool.as_deref();
        let req = Requirements::for_vm(&vm);
        let need = req.local(local);
        let live = {
            let binding = self
                .bindings
                .get(&vm.dc)
                .ok_or(CapacityError::BindingNotFound { dc: vm.dc, node })?;
            binding.compute(&self.capacity()?, &self.reservations()).free
        };

        if !req.fits_binding(&live, local) {
            warn!(%node, %live, %need, "cached capacity was stale");
            self.update_resources(settings, true)?;
            return Err(CapacityError::StaleDataRace {
                node,
                detail: format!("live {live} does not cover {need}"),
            });
        }

        self.vms.insert(vm.id, vm);
        self.update_resources(settings, true)?;
        Ok(need)
    }

    /// The tenant's binding on this node as the selector sees it.
    pub fn candidate(&self, dc: DcId) -> Option<Candidate> {
        let binding = self.bindings.get(&dc)?;
        let local = self.node.zpool.as_deref();
        let pools = self
            .storages
            .values()
            .filter(|s| Some(s.zpool.as_str()) != local && s.is_attached(dc))
            .map(|s| (s.zpool.clone(), s.size_free()))
            .collect();

        Some(Candidate {
            node: self.node.id,
            online: self.node.is_online(),
            is_compute: self.node.is_compute,
            priority: binding.priority(),
            free: binding.cached_free(),
            local_zpool: self.node.zpool.clone(),
            pools,
        })
    }

    pub fn summary(&self) -> NodeSummary {
        let capacity = self.capacity().ok();
        NodeSummary {
            node: self.node.id,
            hostname: self.node.hostname.clone(),
            status: self.node.status,
            is_compute: self.node.is_compute,
            total: capacity.map(|c| c.resources()).unwrap_or_default(),
            free: self.node.cached_free(),
            ram_kvm_overhead: self.node.ram_kvm_overhead(),
            vms: self.vms.len(),
            dcs: self.bindings.len(),
        }
    }

    pub fn binding_summaries(&self) -> Vec<BindingSummary> {
        self.bindings
            .values()
            .map(|b| BindingSummary {
                dc: b.dc,
                node: b.node,
                hostname: self.node.hostname.clone(),
                strategy: b.strategy(),
                priority: b.priority(),
                total: b.totals(),
                free: b.cached_free(),
                ram_kvm_overhead: b.ram_kvm_overhead(),
                vms: self.vms.values().filter(|vm| vm.dc == b.dc).count(),
            })
            .collect()
    }
}

fn local_storage<'a>(
    node: &Node,
    storages: &'a BTreeMap<String, NodeStorage>,
) -> Option<&'a NodeStorage> {
    node.zpool.as_deref().and_then(|zpool| storages.get(zpool))
}

/// Read model of a node for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub node: NodeId,
    pub hostname: String,
    pub status: NodeStatus,
    pub is_compute: bool,
    pub total: Resources,
    pub free: Resources,
    pub ram_kvm_overhead: i64,
    pub vms: usize,
    pub dcs: usize,
}

/// Read model of a binding for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingSummary {
    pub dc: DcId,
    pub node: NodeId,
    pub hostname: String,
    pub strategy: Strategy,
    pub priority: i32,
    pub total: Resources,
    pub free: Resources,
    pub ram_kvm_overhead: i64,
    pub vms: usize,
}
