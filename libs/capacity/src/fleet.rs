//! The in-memory fleet: every node entry plus a VM index.
//!
//! All mutations funnel through here and end with a from-scratch recompute of
//! the node they touched. Callers that share a fleet between threads wrap it in
//! [`crate::PlacementScheduler`], whose lock also serializes placements.

use std::collections::{BTreeMap, BTreeSet};

use capsched_id::{DcId, NodeId, VmId};
use tracing::{debug, info, instrument};

use crate::binding::{BindingSpec, BindingUpdate, DcNodeBinding};
use crate::coefficient::Coefficient;
use crate::entry::{BindingSummary, NodeEntry, NodeSummary, Recompute};
use crate::error::{CapacityError, CapacityResult};
use crate::node::{HardwareInfo, Node, NodeStatus};
use crate::placement::{self, Requirements};
use crate::settings::Settings;
use crate::storage::NodeStorage;
use crate::vm::Vm;

#[derive(Debug, Clone, Default)]
pub struct Fleet {
    settings: Settings,
    nodes: BTreeMap<NodeId, NodeEntry>,
    vm_index: BTreeMap<VmId, NodeId>,
}

impl Fleet {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            nodes: BTreeMap::new(),
            vm_index: BTreeMap::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn node(&self, id: NodeId) -> CapacityResult<&NodeEntry> {
        self.nodes.get(&id).ok_or(CapacityError::NodeNotFound(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    pub fn binding(&self, dc: DcId, node: NodeId) -> CapacityResult<&DcNodeBinding> {
        self.node(node)?
            .bindings
            .get(&dc)
            .ok_or(CapacityError::BindingNotFound { dc, node })
    }

    pub fn vm(&self, id: VmId) -> CapacityResult<&Vm> {
        let node = self.vm_node(id)?;
        self.node(node)?
            .vms
            .get(&id)
            .ok_or(CapacityError::VmNotFound(id))
    }

    pub fn vm_node(&self, id: VmId) -> CapacityResult<NodeId> {
        self.vm_index
            .get(&id)
            .copied()
            .ok_or(CapacityError::VmNotFound(id))
    }

    // Inventory

    #[instrument(skip(self, node), fields(node = %node.id, hostname = %node.hostname))]
    pub fn register_node(&mut self, mut node: Node) -> CapacityResult<()> {
        node.validate()?;
        if self.nodes.contains_key(&node.id) {
            return Err(CapacityError::configuration(format!(
                "{} is already registered",
                node.id
            )));
        }
        if node.zpool.is_none() {
            node.zpool = Some(self.settings.local_zpool.clone());
        }

        let mut entry = NodeEntry::new(node);
        entry.recompute(&self.settings)?;
        info!(is_compute = entry.node.is_compute, "node registered");
        self.nodes.insert(entry.id(), entry);
        Ok(())
    }

    /// Apply an inventory report. Returns whether anything changed.
    #[instrument(skip(self, hw), fields(cpu = hw.cpu, ram = hw.ram))]
    pub fn update_hardware(&mut self, node: NodeId, hw: HardwareInfo) -> CapacityResult<bool> {
        let changed = entry_mut(&mut self.nodes, node)?.apply_hardware(hw, &self.settings)?;
        if changed {
            info!("node hardware changed");
        }
        Ok(changed)
    }

    /// Heartbeat status. Placement reads status live, so nothing is
    /// recomputed.
    #[instrument(skip(self))]
    pub fn set_node_status(&mut self, node: NodeId, status: NodeStatus) -> CapacityResult<()> {
        let entry = entry_mut(&mut self.nodes, node)?;
        if entry.node.status != status {
            debug!(from = %entry.node.status, to = %status, "node status changed");
            entry.node.status = status;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn set_compute(&mut self, node: NodeId, is_compute: bool) -> CapacityResult<()> {
        let entry = entry_mut(&mut self.nodes, node)?;
        entry.node.is_compute = is_compute;
        entry.recompute(&self.settings)
    }

    #[instrument(skip(self, cpu_coef, ram_coef), fields(cpu_coef = %cpu_coef, ram_coef = %ram_coef))]
    pub fn set_coefficients(
        &mut self,
        node: NodeId,
        cpu_coef: Coefficient,
        ram_coef: Coefficient,
    ) -> CapacityResult<()> {
        let entry = entry_mut(&mut self.nodes, node)?;
        entry.node.cpu_coef = cpu_coef;
        entry.node.ram_coef = ram_coef;
        entry.recompute(&self.settings)
    }

    // Storage

    #[instrument(skip(self, storage), fields(zpool = %storage.zpool))]
    pub fn add_node_storage(&mut self, node: NodeId, storage: NodeStorage) -> CapacityResult<()> {
        let entry = entry_mut(&mut self.nodes, node)?;
        if entry.storages.contains_key(&storage.zpool) {
            return Err(CapacityError::configuration(format!(
                "storage '{}' already exists on {node}",
                storage.zpool
            )));
        }
        entry.storages.insert(storage.zpool.clone(), storage);
        entry.recompute(&self.settings)
    }

    /// Free space of a pool as reported by the storage subsystem. The local
    /// pool's value is overwritten by the next recompute.
    pub fn set_storage_free(&mut self, node: NodeId, zpool: &str, size_free: i64) -> CapacityResult<()> {
        storage_mut(&mut self.nodes, node, zpool)?.set_size_free(size_free);
        Ok(())
    }

    /// Backup and snapshot usage of a pool; for the local pool this shrinks
    /// `disk_total`.
    #[instrument(skip(self))]
    pub fn set_storage_usage(
        &mut self,
        node: NodeId,
        zpool: &str,
        backups: i64,
        snapshots: i64,
        rep_snapshots: i64,
    ) -> CapacityResult<()> {
        let storage = storage_mut(&mut self.nodes, node, zpool)?;
        storage.size_backups = backups;
        storage.size_snapshots = snapshots;
        storage.size_rep_snapshots = rep_snapshots;

        let entry = entry_mut(&mut self.nodes, node)?;
        if entry.node.zpool.as_deref() == Some(zpool) {
            entry.recompute(&self.settings)?;
        }
        Ok(())
    }

    /// Lets tenant `dc` place disks on `zpool` of `node`.
    #[instrument(skip(self))]
    pub fn attach_storage(&mut self, node: NodeId, zpool: &str, dc: DcId) -> CapacityResult<()> {
        if storage_mut(&mut self.nodes, node, zpool)?.attach(dc) {
            debug!("storage attached");
        }
        Ok(())
    }

    // Bindings

    #[instrument(skip(self))]
    pub fn attach(&mut self, dc: DcId, node: NodeId, spec: BindingSpec) -> CapacityResult<()> {
        let entry = entry_mut(&mut self.nodes, node)?;
        entry.attach(dc, spec, &self.settings)?;
        info!(
            strategy = %entry.bindings[&dc].strategy(),
            priority = entry.bindings[&dc].priority(),
            "node attached"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn update_binding(
        &mut self,
        dc: DcId,
        node: NodeId,
        update: BindingUpdate,
    ) -> CapacityResult<()> {
        entry_mut(&mut self.nodes, node)?.update_binding(dc, update, &self.settings)?;
        info!("binding updated");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn detach(&mut self, dc: DcId, node: NodeId) -> CapacityResult<DcNodeBinding> {
        let binding = entry_mut(&mut self.nodes, node)?.detach(dc, &self.settings)?;
        info!("node detached");
        Ok(binding)
    }

    // VMs

    #[instrument(skip(self, vm), fields(vm = %vm.id, dc = %vm.dc))]
    pub fn add_vm(&mut self, node: NodeId, vm: Vm, mode: Recompute) -> CapacityResult<()> {
        if self.vm_index.contains_key(&vm.id) {
            return Err(CapacityError::VmExists(vm.id));
        }
        let id = vm.id;
        entry_mut(&mut self.nodes, node)?.add_vm(vm, mode, &self.settings)?;
        self.vm_index.insert(id, node);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn remove_vm(&mut self, id: VmId) -> CapacityResult<Vm> {
        let node = self.vm_node(id)?;
        let vm = entry_mut(&mut self.nodes, node)?.remove_vm(id, &self.settings)?;
        self.vm_index.remove(&id);
        Ok(vm)
    }

    /// Replace a VM's definition in place (resize, deploy).
    #[instrument(skip(self, vm), fields(vm = %vm.id))]
    pub fn update_vm(&mut self, vm: Vm) -> CapacityResult<()> {
        let node = self.vm_node(vm.id)?;
        entry_mut(&mut self.nodes, node)?.update_vm(vm, &self.settings)
    }

    /// Move a VM; both the source and the target are recomputed.
    #[instrument(skip(self))]
    pub fn migrate_vm(&mut self, id: VmId, target: NodeId) -> CapacityResult<()> {
        let source = self.vm_node(id)?;
        if source == target {
            return Ok(());
        }
        entry_mut(&mut self.nodes, target)?.node.ensure_compute()?;

        let vm = entry_mut(&mut self.nodes, source)?.remove_vm(id, &self.settings)?;
        entry_mut(&mut self.nodes, target)?.add_vm(vm, Recompute::Now, &self.settings)?;
        self.vm_index.insert(id, target);

        info!(%source, "vm migrated");
        Ok(())
    }

    // Recompute

    /// Recompute the node and cascade to its bindings.
    pub fn update_resources(&mut self, node: NodeId) -> CapacityResult<()> {
        entry_mut(&mut self.nodes, node)?.update_resources(&self.settings, true)
    }

    /// Recompute the bindings of one node.
    pub fn update_all(&mut self, node: NodeId) -> CapacityResult<()> {
        entry_mut(&mut self.nodes, node)?.update_all(&self.settings)
    }

    /// Recompute every compute node; non-compute nodes are skipped.
    #[instrument(skip(self))]
    pub fn recompute_all(&mut self) -> CapacityResult<usize> {
        let mut count = 0;
        for entry in self.nodes.values_mut().filter(|e| e.node.is_compute) {
            entry.update_resources(&self.settings, true)?;
            count += 1;
        }
        debug!(count, "fleet recomputed");
        Ok(count)
    }

    // Placement

    pub fn choose_node(&self, dc: DcId, req: &Requirements) -> CapacityResult<NodeId> {
        self.choose_node_excluding(dc, req, &BTreeSet::new())
    }

    /// Best-fit node for `req` from cached columns.
    #[instrument(skip(self, req, excluded), fields(cpu = req.cpu, ram = req.ram))]
    pub fn choose_node_excluding(
        &self,
        dc: DcId,
        req: &Requirements,
        excluded: &BTreeSet<NodeId>,
    ) -> CapacityResult<NodeId> {
        let candidates = self.nodes.values().filter_map(|entry| entry.candidate(dc));
        match placement::select(candidates, req, excluded) {
            Some(candidate) => {
                debug!(
                    node = %candidate.node,
                    priority = candidate.priority,
                    cpu_free = candidate.free.cpu,
                    ram_free = candidate.free.ram,
                    "node chosen"
                );
                Ok(candidate.node)
            }
            None => Err(CapacityError::NoNodeAvailable { dc }),
        }
    }

    /// Re-verify `node` against live numbers and record `vm` on it.
    #[instrument(skip(self, vm), fields(vm = %vm.id, dc = %vm.dc))]
    pub fn commit_placement(&mut self, node: NodeId, vm: Vm) -> CapacityResult<()> {
        if self.vm_index.contains_key(&vm.id) {
            return Err(CapacityError::VmExists(vm.id));
        }
        let id = vm.id;
        let need = entry_mut(&mut self.nodes, node)?.commit_placement(vm, &self.settings)?;
        self.vm_index.insert(id, node);
        info!(%need, "vm placed");
        Ok(())
    }

    // Read models

    pub fn node_summaries(&self) -> Vec<NodeSummary> {
        self.nodes.values().map(NodeEntry::summary).collect()
    }

    pub fn binding_summaries(&self, node: NodeId) -> CapacityResult<Vec<BindingSummary>> {
        Ok(self.node(node)?.binding_summaries())
    }
}

fn entry_mut(
    nodes: &mut BTreeMap<NodeId, NodeEntry>,
    id: NodeId,
) -> CapacityResult<&mut NodeEntry> {
    nodes.get_mut(&id).ok_or(CapacityError::NodeNotFound(id))
}

fn storage_mut<'a>(
    nodes: &'a mut BTreeMap<NodeId, NodeEntry>,
    node: NodeId,
    zpool: &str,
) -> CapacityResult<&'a mut NodeStorage> {
    entry_mut(nodes, node)?
        .storages
        .get_mut(zpool)
        .ok_or_else(|| CapacityError::StorageNotFound {
            node,
            zpool: zpool.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::HasStatus;
    use crate::resources::{HasCachedResources, Resources};
    use crate::strategy::Strategy;
    use crate::vm::{Hypervisor, VmDefinition};

    fn online_node(fleet: &mut Fleet, cpu: i64, ram: i64, disk: i64) -> NodeId {
        let id = NodeId::new();
        fleet
            .register_node(Node::new(id, format!("cn-{id}"), cpu, ram).with_status(NodeStatus::Online))
            .unwrap();
        fleet
            .add_node_storage(id, NodeStorage::new("zones", disk, Coefficient::ONE))
            .unwrap();
        id
    }

    fn zone(dc: DcId, cpu: i64, ram: i64) -> Vm {
        Vm::new(
            VmId::new(),
            dc,
            Hypervisor::Zone,
            VmDefinition::new(cpu, ram).with_disk("zones", 10),
            &Settings::default(),
        )
    }

    #[test]
    fn test_register_defaults_local_zpool() {
        let mut fleet = Fleet::default();
        let node = online_node(&mut fleet, 4, 4096, 1000);
        let entry = fleet.node(node).unwrap();
        assert_eq!(entry.node.zpool.as_deref(), Some("zones"));
        assert_eq!(entry.node.cached_free(), Resources::new(4, 4096, 1000));
    }

    #[test]
    fn test_update_hardware_cascades() {
        let mut fleet = Fleet::default();
        let node = NodeId::new();
        fleet.register_node(Node::new(node, "cn01", 0, 0)).unwrap();
        let dc = DcId::new();
        fleet.attach(dc, node, BindingSpec::shared()).unwrap();

        let hw = HardwareInfo {
            cpu: 8,
            ram: 16_384,
            zpools: BTreeMap::from([("zones".to_string(), 100_000)]),
        };
        assert!(fleet.update_hardware(node, hw.clone()).unwrap());
        assert!(!fleet.update_hardware(node, hw).unwrap());

        // New pools get the default 0.6 size coefficient.
        assert_eq!(
            fleet.binding(dc, node).unwrap().cached_free(),
            Resources::new(8, 16_384, 60_000)
        );
    }

    #[test]
    fn test_status_change_does_not_recompute() {
        let mut fleet = Fleet::default();
        let node = online_node(&mut fleet, 4, 4096, 1000);
        let dc = DcId::new();
        fleet.attach(dc, node, BindingSpec::shared()).unwrap();
        let before = fleet.node(node).unwrap().clone();

        fleet.set_node_status(node, NodeStatus::Unreachable).unwrap();
        let after = fleet.node(node).unwrap();
        assert!(!after.node.is_online());
        assert_eq!(after.node.cached_free(), before.node.cached_free());
        assert_eq!(after.bindings, before.bindings);
    }

    #[test]
    fn test_non_compute_node_refuses_capacity_operations() {
        let mut fleet = Fleet::default();
        let node = online_node(&mut fleet, 4, 4096, 1000);
        fleet.set_compute(node, false).unwrap();
        let dc = DcId::new();

        assert!(matches!(
            fleet.attach(dc, node, BindingSpec::shared()),
            Err(CapacityError::Configuration(_))
        ));
        assert!(matches!(
            fleet.add_vm(node, zone(dc, 1, 1), Recompute::Now),
            Err(CapacityError::Configuration(_))
        ));
        assert!(matches!(
            fleet.update_resources(node),
            Err(CapacityError::Configuration(_))
        ));
        // Hardware is still recorded, just not accounted.
        let hw = HardwareInfo {
            cpu: 32,
            ram: 1,
            zpools: BTreeMap::new(),
        };
        assert!(fleet.update_hardware(node, hw).unwrap());
        assert_eq!(fleet.node(node).unwrap().node.cpu, 32);
    }

    #[test]
    fn test_non_compute_node_refuses_binding_update() {
        let mut fleet = Fleet::default();
        let node = online_node(&mut fleet, 16, 32_768, 10_000);
        let dc = DcId::new();
        fleet.attach(dc, node, BindingSpec::shared()).unwrap();
        fleet.set_compute(node, false).unwrap();
        let before = fleet.binding(dc, node).unwrap().clone();

        let update = BindingUpdate {
            strategy: Some(Strategy::Reserved),
            totals: Some(Resources::new(1, 1, 1)),
            ..BindingUpdate::default()
        };
        assert!(matches!(
            fleet.update_binding(dc, node, update),
            Err(CapacityError::Configuration(_))
        ));
        assert_eq!(fleet.binding(dc, node).unwrap(), &before);
        assert_eq!(before.strategy(), Strategy::Shared);
    }

    #[test]
    fn test_update_vm_keeps_tenant() {
        let mut fleet = Fleet::default();
        let node = online_node(&mut fleet, 8, 8192, 1000);
        let (dc, other) = (DcId::new(), DcId::new());
        fleet.attach(dc, node, BindingSpec::shared()).unwrap();
        fleet.attach(other, node, BindingSpec::shared()).unwrap();
        let vm = zone(dc, 1, 512);
        fleet.add_vm(node, vm.clone(), Recompute::Now).unwrap();

        let mut moved = vm.clone();
        moved.dc = other;
        assert!(matches!(
            fleet.update_vm(moved),
            Err(CapacityError::Configuration(_))
        ));
        assert_eq!(fleet.vm(vm.id).unwrap().dc, dc);

        let mut resized = vm.clone();
        resized.definition.vcpus = 4;
        fleet.update_vm(resized).unwrap();
        assert_eq!(fleet.binding(dc, node).unwrap().cached_free().cpu, 4);
    }

    #[test]
    fn test_diskless_vm_placed_despite_overdrawn_disk() {
        let mut fleet = Fleet::default();
        let node = online_node(&mut fleet, 16, 32_768, 10_000);
        let dc = DcId::new();
        fleet
            .attach(dc, node, BindingSpec::reserved(Resources::new(8, 8192, 100)))
            .unwrap();
        let kvm = |cpu: i64, ram: i64, disk: i64| {
            let mut definition = VmDefinition::new(cpu, ram);
            if disk > 0 {
                definition = definition.with_disk("zones", disk);
            }
            Vm::new(VmId::new(), dc, Hypervisor::Kvm, definition, &Settings::default())
        };
        fleet.add_vm(node, kvm(1, 512, 150), Recompute::Now).unwrap();
        assert_eq!(
            fleet.binding(dc, node).unwrap().cached_free(),
            Resources::new(7, 7424, -50)
        );

        let vm = kvm(2, 1024, 0);
        let req = Requirements::for_vm(&vm);
        assert_eq!(fleet.choose_node(dc, &req).unwrap(), node);
        fleet.commit_placement(node, vm).unwrap();
        assert_eq!(
            fleet.binding(dc, node).unwrap().cached_free(),
            Resources::new(5, 6144, -50)
        );

        // A request that does name the local pool still sees the overdraft.
        let with_disk = Requirements::for_vm(&kvm(1, 512, 1));
        assert!(fleet.choose_node(dc, &with_disk).unwrap_err().is_capacity_exhausted());
    }

    #[test]
    fn test_detach_refused_while_in_use_and_releases_storage() {
        let mut fleet = Fleet::default();
        let node = online_node(&mut fleet, 8, 8192, 1000);
        fleet
            .add_node_storage(node, NodeStorage::new("data", 500, Coefficient::ONE))
            .unwrap();
        let dc = DcId::new();
        fleet.attach(dc, node, BindingSpec::shared()).unwrap();
        fleet.attach_storage(node, "data", dc).unwrap();

        let vm = zone(dc, 1, 512);
        let vm_id = vm.id;
        fleet.add_vm(node, vm, Recompute::Now).unwrap();
        assert!(matches!(
            fleet.detach(dc, node),
            Err(CapacityError::NodeInUse { .. })
        ));

        fleet.remove_vm(vm_id).unwrap();
        fleet.detach(dc, node).unwrap();
        let entry = fleet.node(node).unwrap();
        assert!(entry.bindings.is_empty());
        assert!(!entry.storages["data"].is_attached(dc));
        assert!(matches!(
            fleet.detach(dc, node),
            Err(CapacityError::BindingNotFound { .. })
        ));
    }

    #[test]
    fn test_attach_twice() {
        let mut fleet = Fleet::default();
        let node = online_node(&mut fleet, 8, 8192, 1000);
        let dc = DcId::new();
        fleet.attach(dc, node, BindingSpec::shared()).unwrap();
        assert!(matches!(
            fleet.attach(dc, node, BindingSpec::shared()),
            Err(CapacityError::AlreadyAttached { .. })
        ));
    }

    #[test]
    fn test_migrate_recomputes_both_nodes() {
        let mut fleet = Fleet::default();
        let (a, b) = (
            online_node(&mut fleet, 8, 8192, 1000),
            online_node(&mut fleet, 8, 8192, 1000),
        );
        let dc = DcId::new();
        fleet.attach(dc, a, BindingSpec::shared()).unwrap();
        fleet.attach(dc, b, BindingSpec::shared()).unwrap();

        let vm = zone(dc, 2, 2048);
        let id = vm.id;
        fleet.add_vm(a, vm, Recompute::Now).unwrap();
        fleet.migrate_vm(id, b).unwrap();

        assert_eq!(fleet.vm_node(id).unwrap(), b);
        assert_eq!(
            fleet.binding(dc, a).unwrap().cached_free(),
            Resources::new(8, 8192, 1000)
        );
        assert_eq!(
            fleet.binding(dc, b).unwrap().cached_free(),
            Resources::new(6, 6144, 990)
        );
    }

    #[test]
    fn test_backups_shrink_local_disk() {
        let mut fleet = Fleet::default();
        let node = online_node(&mut fleet, 8, 8192, 1000);
        fleet.set_storage_usage(node, "zones", 100, 50, 25).unwrap();
        assert_eq!(fleet.node(node).unwrap().node.cached_free().disk, 825);
    }

    #[test]
    fn test_strict_reservations() {
        let mut fleet = Fleet::new(Settings {
            strict_reservations: true,
            ..Settings::default()
        });
        let node = online_node(&mut fleet, 8, 8192, 1000);
        let err = fleet
            .attach(
                DcId::new(),
                node,
                BindingSpec::reserved(Resources::new(9, 1024, 0)),
            )
            .unwrap_err();
        assert!(matches!(err, CapacityError::InsufficientCapacity { .. }));
    }

    #[test]
    fn test_commit_detects_stale_cache() {
        let mut fleet = Fleet::default();
        let node = online_node(&mut fleet, 4, 4096, 1000);
        let dc = DcId::new();
        fleet.attach(dc, node, BindingSpec::shared()).unwrap();
        fleet
            .add_vm(node, zone(dc, 3, 1024), Recompute::Deferred)
            .unwrap();

        // The cached columns still claim the whole node.
        assert!(fleet.binding(dc, node).unwrap().check_free_resources(Some(4), None, None));
        let err = fleet.commit_placement(node, zone(dc, 2, 1024)).unwrap_err();
        assert!(err.is_retryable());
        // ...and are rewritten by the failed commit.
        assert_eq!(fleet.binding(dc, node).unwrap().cached_free().cpu, 1);
    }
}
