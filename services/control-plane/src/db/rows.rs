//! Row types and their conversion into core types.

use capsched_capacity::{
    BindingSpec, CachedColumns, Candidate, Coefficient, DcNodeBinding, Node, NodeStatus,
    NodeStorage, Resources, Settings, Strategy, Vm, VmDefinition,
};
use capsched_id::{DcId, NodeId, VmId};
use sqlx::{postgres::PgRow, Row};

use super::DbError;

#[derive(Debug, Clone)]
pub struct NodeRow {
    pub node_id: String,
    pub hostname: String,
    pub status: i16,
    pub is_compute: bool,
    pub cpu: i64,
    pub ram: i64,
    pub cpu_coef: i32,
    pub ram_coef: i32,
    pub zpool: Option<String>,
    pub cpu_free: i64,
    pub ram_free: i64,
    pub disk_free: i64,
    pub ram_kvm_overhead: i64,
}

impl<'r> sqlx::FromRow<'r, PgRow> for NodeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            node_id: row.try_get("node_id")?,
            hostname: row.try_get("hostname")?,
            status: row.try_get("status")?,
            is_compute: row.try_get("is_compute")?,
            cpu: row.try_get("cpu")?,
            ram: row.try_get("ram")?,
            cpu_coef: row.try_get("cpu_coef")?,
            ram_coef: row.try_get("ram_coef")?,
            zpool: row.try_get("zpool")?,
            cpu_free: row.try_get("cpu_free")?,
            ram_free: row.try_get("ram_free")?,
            disk_free: row.try_get("disk_free")?,
            ram_kvm_overhead: row.try_get("ram_kvm_overhead")?,
        })
    }
}

impl NodeRow {
    pub fn into_node(self) -> Result<Node, DbError> {
        let mut node = Node::new(self.node_id.parse()?, self.hostname, self.cpu, self.ram)
            .with_status(NodeStatus::from_code(self.status)?)
            .with_coefficients(
                coefficient("cpu_coef", self.cpu_coef)?,
                coefficient("ram_coef", self.ram_coef)?,
            );
        node.is_compute = self.is_compute;
        node.zpool = self.zpool;
        node.restore_cached(
            Resources::new(self.cpu_free, self.ram_free, self.disk_free),
            self.ram_kvm_overhead,
        );
        Ok(node)
    }
}

#[derive(Debug, Clone)]
pub struct StorageRow {
    pub zpool: String,
    pub size: i64,
    pub size_coef: i32,
    pub size_free: i64,
    pub size_backups: i64,
    pub size_snapshots: i64,
    pub size_rep_snapshots: i64,
}

impl<'r> sqlx::FromRow<'r, PgRow> for StorageRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            zpool: row.try_get("zpool")?,
            size: row.try_get("size")?,
            size_coef: row.try_get("size_coef")?,
            size_free: row.try_get("size_free")?,
            size_backups: row.try_get("size_backups")?,
            size_snapshots: row.try_get("size_snapshots")?,
            size_rep_snapshots: row.try_get("size_rep_snapshots")?,
        })
    }
}

impl StorageRow {
    pub fn into_storage(self) -> Result<NodeStorage, DbError> {
        let mut storage = NodeStorage::new(
            self.zpool,
            self.size,
            coefficient("size_coef", self.size_coef)?,
        );
        storage.set_size_free(self.size_free);
        storage.size_backups = self.size_backups;
        storage.size_snapshots = self.size_snapshots;
        storage.size_rep_snapshots = self.size_rep_snapshots;
        Ok(storage)
    }
}

#[derive(Debug, Clone)]
pub struct BindingRow {
    pub dc_id: String,
    pub node_id: String,
    pub strategy: i16,
    pub priority: i32,
    pub admin: Resources,
    pub total: Resources,
    pub free: Resources,
    pub ram_kvm_overhead: i64,
    pub nonreserved: Option<Resources>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for BindingRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let nonreserved_cpu: Option<i64> = row.try_get("nonreserved_cpu")?;
        let nonreserved_ram: Option<i64> = row.try_get("nonreserved_ram")?;
        let nonreserved_disk: Option<i64> = row.try_get("nonreserved_disk")?;

        Ok(Self {
            dc_id: row.try_get("dc_id")?,
            node_id: row.try_get("node_id")?,
            strategy: row.try_get("strategy")?,
            priority: row.try_get("priority")?,
            admin: Resources::new(
                row.try_get("admin_cpu")?,
                row.try_get("admin_ram")?,
                row.try_get("admin_disk")?,
            ),
            total: Resources::new(row.try_get("cpu")?, row.try_get("ram")?, row.try_get("disk")?),
            free: Resources::new(
                row.try_get("cpu_free")?,
                row.try_get("ram_free")?,
                row.try_get("disk_free")?,
            ),
            ram_kvm_overhead: row.try_get("ram_kvm_overhead")?,
            nonreserved: match (nonreserved_cpu, nonreserved_ram, nonreserved_disk) {
                (Some(cpu), Some(ram), Some(disk)) => Some(Resources::new(cpu, ram, disk)),
                _ => None,
            },
        })
    }
}

impl BindingRow {
    pub fn into_binding(self, settings: &Settings) -> Result<DcNodeBinding, DbError> {
        let spec = BindingSpec {
            strategy: Strategy::from_code(self.strategy)?,
            priority: Some(self.priority),
            totals: self.admin,
        };
        let mut binding =
            DcNodeBinding::new(self.dc_id.parse()?, self.node_id.parse()?, spec, settings)?;
        binding.restore_cached(CachedColumns {
            total: self.total,
            free: self.free,
            ram_kvm_overhead: self.ram_kvm_overhead,
            nonreserved_total: self.nonreserved,
        });
        Ok(binding)
    }
}

#[derive(Debug, Clone)]
pub struct VmRow {
    pub vm_id: String,
    pub dc_id: String,
    pub hypervisor: String,
    pub deployed: bool,
    pub reserve_resources: bool,
    pub definition: serde_json::Value,
    pub active: Option<serde_json::Value>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for VmRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            vm_id: row.try_get("vm_id")?,
            dc_id: row.try_get("dc_id")?,
            hypervisor: row.try_get("hypervisor")?,
            deployed: row.try_get("deployed")?,
            reserve_resources: row.try_get("reserve_resources")?,
            definition: row.try_get("definition")?,
            active: row.try_get("active")?,
        })
    }
}

impl VmRow {
    pub fn into_vm(self, settings: &Settings) -> Result<Vm, DbError> {
        let vm_id: VmId = self.vm_id.parse()?;
        let dc_id: DcId = self.dc_id.parse()?;
        let definition: VmDefinition = serde_json::from_value(self.definition)?;

        let mut vm = Vm::new(vm_id, dc_id, self.hypervisor.parse()?, definition, settings);
        vm.deployed = self.deployed;
        vm.reserve_resources = self.reserve_resources;
        vm.active = self.active.map(serde_json::from_value).transpose()?;
        Ok(vm)
    }
}

/// A tenant binding that passed the SQL prefilter.
#[derive(Debug, Clone)]
pub struct CandidateRow {
    pub node_id: String,
    pub status: i16,
    pub is_compute: bool,
    pub priority: i32,
    pub cpu_free: i64,
    pub ram_free: i64,
    pub disk_free: i64,
    pub zpool: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for CandidateRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            node_id: row.try_get("node_id")?,
            status: row.try_get("status")?,
            is_compute: row.try_get("is_compute")?,
            priority: row.try_get("priority")?,
            cpu_free: row.try_get("cpu_free")?,
            ram_free: row.try_get("ram_free")?,
            disk_free: row.try_get("disk_free")?,
            zpool: row.try_get("zpool")?,
        })
    }
}

impl CandidateRow {
    /// Attached pools are filled in by the caller.
    pub fn into_candidate(self) -> Result<Candidate, DbError> {
        let node: NodeId = self.node_id.parse()?;
        Ok(Candidate {
            node,
            online: NodeStatus::from_code(self.status)? == NodeStatus::Online,
            is_compute: self.is_compute,
            priority: self.priority,
            free: Resources::new(self.cpu_free, self.ram_free, self.disk_free),
            local_zpool: self.zpool,
            pools: Default::default(),
        })
    }
}

fn coefficient(column: &'static str, hundredths: i32) -> Result<Coefficient, DbError> {
    u32::try_from(hundredths)
        .ok()
        .and_then(|h| Coefficient::from_hundredths(h).ok())
        .ok_or(DbError::InvalidValue {
            column,
            value: hundredths.to_string(),
        })
}

/// Coefficients are bounded by 99.99, so this never truncates.
pub fn hundredths(coefficient: Coefficient) -> i32 {
    i32::try_from(coefficient.hundredths()).unwrap_or(i32::MAX)
}
