//! Node-at-a-time persistence of the fleet.
//!
//! Every mutation follows the same shape: open a transaction, take the
//! node's advisory lock, load the whole [`NodeEntry`], mutate and recompute
//! it in memory, write it back, commit. Two writers on one node therefore
//! serialize, and cached columns are never written from a partial view.

use std::collections::BTreeMap;
use std::hash::Hasher;

use capsched_capacity::{
    BindingSpec, BindingSummary, BindingUpdate, Candidate, CapacityError, Coefficient,
    DcNodeBinding, HardwareInfo, HasCachedResources, Node, NodeEntry, NodeStatus, NodeStorage,
    NodeSummary, Recompute, Requirements, Resources, Settings, Vm,
};
use capsched_id::{DcId, NodeId, VmId};
use fnv::FnvHasher;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, instrument, warn};

use super::rows::{hundredths, BindingRow, CandidateRow, NodeRow, StorageRow, VmRow};
use super::DbError;

const LOCK_NAMESPACE: &str = "capsched:node:";

/// Advisory lock key of a node: 64-bit FNV-1a over a namespaced id.
pub fn node_lock_key(node: NodeId) -> i64 {
    let key = format!("{LOCK_NAMESPACE}{node}");
    i64::from_be_bytes(fnv1a(key.as_bytes()).to_be_bytes())
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

#[derive(Clone)]
pub struct FleetStore {
    pool: PgPool,
    settings: Settings,
}

impl FleetStore {
    pub fn new(pool: PgPool, settings: Settings) -> Self {
        Self { pool, settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run `f` on a locked, freshly loaded node and persist the result.
    /// Nothing is written when `f` fails.
    async fn with_node<T>(
        &self,
        node: NodeId,
        f: impl FnOnce(&mut NodeEntry, &Settings) -> Result<T, CapacityError>,
    ) -> Result<T, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        lock_node(&mut tx, node).await?;
        let mut entry = load_node(&mut tx, node, &self.settings).await?;

        let value = f(&mut entry, &self.settings)?;

        save_node_entry(&mut tx, &entry).await?;
        tx.commit().await.map_err(DbError::Query)?;
        Ok(value)
    }

    /// Read a node without locking it.
    pub async fn load(&self, node: NodeId) -> Result<NodeEntry, DbError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::Query)?;
        load_node(&mut conn, node, &self.settings).await
    }

    // Inventory

    #[instrument(skip(self, node), fields(node = %node.id, hostname = %node.hostname))]
    pub async fn register_node(&self, mut node: Node) -> Result<(), DbError> {
        node.validate()?;
        if node.zpool.is_none() {
            node.zpool = Some(self.settings.local_zpool.clone());
        }
        let id = node.id;
        let mut entry = NodeEntry::new(node);
        entry.recompute(&self.settings)?;

        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        sqlx::query("INSERT INTO nodes (node_id, hostname) VALUES ($1, $2)")
            .bind(id.to_string())
            .bind(&entry.node.hostname)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e {
                    if db_err.code().as_deref() == Some("23505") {
                        return DbError::Capacity(CapacityError::configuration(format!(
                            "{id} is already registered"
                        )));
                    }
                }
                DbError::Query(e)
            })?;
        save_node_entry(&mut tx, &entry).await?;
        tx.commit().await.map_err(DbError::Query)?;

        info!(is_compute = entry.node.is_compute, "node registered");
        Ok(())
    }

    #[instrument(skip(self, hw), fields(cpu = hw.cpu, ram = hw.ram))]
    pub async fn update_hardware(&self, node: NodeId, hw: HardwareInfo) -> Result<bool, DbError> {
        let changed = self
            .with_node(node, |entry, settings| entry.apply_hardware(hw, settings))
            .await?;
        if changed {
            info!("node hardware changed");
        }
        Ok(changed)
    }

    /// Heartbeat status. Placement reads status live, so nothing is
    /// recomputed and no lock is taken.
    #[instrument(skip(self))]
    pub async fn set_node_status(&self, node: NodeId, status: NodeStatus) -> Result<(), DbError> {
        let result =
            sqlx::query("UPDATE nodes SET status = $2, updated_at = now() WHERE node_id = $1")
                .bind(node.to_string())
                .bind(status.code())
                .execute(&self.pool)
                .await
                .map_err(DbError::Query)?;
        if result.rows_affected() == 0 {
            return Err(CapacityError::NodeNotFound(node).into());
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn set_compute(&self, node: NodeId, is_compute: bool) -> Result<(), DbError> {
        self.with_node(node, |entry, settings| {
            entry.node.is_compute = is_compute;
            entry.recompute(settings)
        })
        .await
    }

    #[instrument(skip(self, cpu_coef, ram_coef), fields(cpu_coef = %cpu_coef, ram_coef = %ram_coef))]
    pub async fn set_coefficients(
        &self,
        node: NodeId,
        cpu_coef: Coefficient,
        ram_coef: Coefficient,
    ) -> Result<(), DbError> {
        self.with_node(node, |entry, settings| {
            entry.node.cpu_coef = cpu_coef;
            entry.node.ram_coef = ram_coef;
            entry.recompute(settings)
        })
        .await
    }

    // Storage

    #[instrument(skip(self, storage), fields(zpool = %storage.zpool))]
    pub async fn add_storage(&self, node: NodeId, storage: NodeStorage) -> Result<(), DbError> {
        self.with_node(node, |entry, settings| {
            if entry.storages.contains_key(&storage.zpool) {
                return Err(CapacityError::configuration(format!(
                    "storage '{}' already exists on {node}",
                    storage.zpool
                )));
            }
            entry.storages.insert(storage.zpool.clone(), storage);
            entry.recompute(settings)
        })
        .await
    }

    /// Free space of a non-local pool as reported by the storage subsystem.
    pub async fn set_storage_free(
        &self,
        node: NodeId,
        zpool: &str,
        size_free: i64,
    ) -> Result<(), DbError> {
        self.with_node(node, |entry, _| {
            storage_mut(entry, zpool)?.set_size_free(size_free);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn set_storage_usage(
        &self,
        node: NodeId,
        zpool: &str,
        backups: i64,
        snapshots: i64,
        rep_snapshots: i64,
    ) -> Result<(), DbError> {
        self.with_node(node, |entry, settings| {
            let storage = storage_mut(entry, zpool)?;
            storage.size_backups = backups;
            storage.size_snapshots = snapshots;
            storage.size_rep_snapshots = rep_snapshots;
            if entry.node.zpool.as_deref() == Some(zpool) {
                entry.recompute(settings)?;
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn attach_storage(&self, node: NodeId, zpool: &str, dc: DcId) -> Result<(), DbError> {
        self.with_node(node, |entry, _| {
            if storage_mut(entry, zpool)?.attach(dc) {
                debug!("storage attached");
            }
            Ok(())
        })
        .await
    }

    // Bindings

    #[instrument(skip(self))]
    pub async fn attach(&self, dc: DcId, node: NodeId, spec: BindingSpec) -> Result<(), DbError> {
        self.with_node(node, |entry, settings| entry.attach(dc, spec, settings))
            .await?;
        info!("node attached");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn update_binding(
        &self,
        dc: DcId,
        node: NodeId,
        update: BindingUpdate,
    ) -> Result<(), DbError> {
        self.with_node(node, |entry, settings| entry.update_binding(dc, update, settings))
            .await?;
        info!("binding updated");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn detach(&self, dc: DcId, node: NodeId) -> Result<DcNodeBinding, DbError> {
        let binding = self
            .with_node(node, |entry, settings| entry.detach(dc, settings))
            .await?;
        info!("node detached");
        Ok(binding)
    }

    // VMs

    #[instrument(skip(self, vm), fields(vm = %vm.id, dc = %vm.dc))]
    pub async fn add_vm(&self, node: NodeId, vm: Vm, mode: Recompute) -> Result<(), DbError> {
        if self.vm_node(vm.id).await?.is_some() {
            return Err(CapacityError::VmExists(vm.id).into());
        }
        self.with_node(node, |entry, settings| entry.add_vm(vm, mode, settings))
            .await
    }

    #[instrument(skip(self))]
    pub async fn remove_vm(&self, id: VmId) -> Result<Vm, DbError> {
        let node = self
            .vm_node(id)
            .await?
            .ok_or(CapacityError::VmNotFound(id))?;
        self.with_node(node, |entry, settings| entry.remove_vm(id, settings))
            .await
    }

    /// Replace a VM's definition in place (resize, deploy).
    #[instrument(skip(self, vm), fields(vm = %vm.id))]
    pub async fn update_vm(&self, vm: Vm) -> Result<(), DbError> {
        let node = self
            .vm_node(vm.id)
            .await?
            .ok_or(CapacityError::VmNotFound(vm.id))?;
        self.with_node(node, |entry, settings| entry.update_vm(vm, settings))
            .await
    }

    /// Move a VM. Both nodes are locked in id order and written in one
    /// transaction.
    #[instrument(skip(self))]
    pub async fn migrate_vm(&self, id: VmId, target: NodeId) -> Result<(), DbError> {
        let source = self
            .vm_node(id)
            .await?
            .ok_or(CapacityError::VmNotFound(id))?;
        if source == target {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        let (first, second) = if source < target {
            (source, target)
        } else {
            (target, source)
        };
        lock_node(&mut tx, first).await?;
        lock_node(&mut tx, second).await?;

        let mut from = load_node(&mut tx, source, &self.settings).await?;
        let mut to = load_node(&mut tx, target, &self.settings).await?;
        to.node.ensure_compute()?;

        let vm = from.remove_vm(id, &self.settings)?;
        to.add_vm(vm, Recompute::Now, &self.settings)?;

        save_node_entry(&mut tx, &from).await?;
        save_node_entry(&mut tx, &to).await?;
        tx.commit().await.map_err(DbError::Query)?;

        info!(%source, "vm migrated");
        Ok(())
    }

    pub async fn vm_node(&self, id: VmId) -> Result<Option<NodeId>, DbError> {
        let node: Option<String> = sqlx::query_scalar("SELECT node_id FROM vms WHERE vm_id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(node.map(|n| n.parse()).transpose()?)
    }

    // Recompute

    pub async fn recompute_node(&self, node: NodeId) -> Result<(), DbError> {
        self.with_node(node, |entry, settings| entry.update_resources(settings, true))
            .await
    }

    /// Recompute every compute node, one transaction per node.
    #[instrument(skip(self))]
    pub async fn recompute_all(&self) -> Result<usize, DbError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT node_id FROM nodes WHERE is_compute ORDER BY node_id")
                .fetch_all(&self.pool)
                .await
                .map_err(DbError::Query)?;

        for id in &ids {
            self.recompute_node(id.parse()?).await?;
        }
        debug!(count = ids.len(), "fleet recomputed");
        Ok(ids.len())
    }

    // Placement

    /// Bindings of `dc` that pass the SQL prefilter, best first, each with
    /// its tenant's non-local pools.
    pub async fn candidates(&self, dc: DcId, req: &Requirements) -> Result<Vec<Candidate>, DbError> {
        let rows = sqlx::query_as::<_, CandidateRow>(
            r#"
            SELECT d.node_id, n.status, n.is_compute, d.priority,
                   d.cpu_free, d.ram_free, d.disk_free, n.zpool
            FROM dc_nodes d
            JOIN nodes n ON n.node_id = d.node_id
            WHERE d.dc_id = $1
              AND n.status = $2
              AND n.is_compute
              AND d.cpu_free >= $3
              AND d.ram_free >= $4
            ORDER BY d.priority DESC, d.cpu_free, d.ram_free, d.disk_free, d.node_id
            "#,
        )
        .bind(dc.to_string())
        .bind(NodeStatus::Online.code())
        .bind(req.cpu)
        .bind(req.ram)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let mut candidates = rows
            .into_iter()
            .map(CandidateRow::into_candidate)
            .collect::<Result<Vec<_>, _>>()?;
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let node_ids: Vec<String> = candidates.iter().map(|c| c.node.to_string()).collect();
        let pools: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT s.node_id, s.zpool, s.size_free
            FROM node_storages s
            JOIN node_storage_dcs a ON a.node_id = s.node_id AND a.zpool = s.zpool
            JOIN nodes n ON n.node_id = s.node_id
            WHERE a.dc_id = $1
              AND s.node_id = ANY($2)
              AND s.zpool IS DISTINCT FROM n.zpool
            "#,
        )
        .bind(dc.to_string())
        .bind(&node_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let mut by_node: BTreeMap<NodeId, BTreeMap<String, i64>> = BTreeMap::new();
        for (node, zpool, size_free) in pools {
            by_node.entry(node.parse()?).or_default().insert(zpool, size_free);
        }
        for candidate in &mut candidates {
            candidate.pools = by_node.remove(&candidate.node).unwrap_or_default();
        }
        Ok(candidates)
    }

    /// Re-verify `node` under its lock and record `vm` there.
    ///
    /// When the cached columns were stale the recomputed node is still
    /// committed, so the next candidate query no longer offers it.
    #[instrument(skip(self, vm), fields(vm = %vm.id, dc = %vm.dc))]
    pub async fn commit_placement(&self, node: NodeId, vm: Vm) -> Result<Resources, DbError> {
        let vm_id = vm.id;
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        lock_node(&mut tx, node).await?;
        let mut entry = load_node(&mut tx, node, &self.settings).await?;

        match entry.commit_placement(vm, &self.settings) {
            Ok(need) => {
                save_node_entry(&mut tx, &entry).await?;
                tx.commit().await.map_err(DbError::Query)?;
                info!(%need, "vm placed");
                Ok(need)
            }
            Err(e) if e.is_retryable() => {
                save_node_entry(&mut tx, &entry).await?;
                tx.commit().await.map_err(DbError::Query)?;
                warn!(%vm_id, error = %e, "stale node refreshed");
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    // Read models

    pub async fn node_summaries(&self) -> Result<Vec<NodeSummary>, DbError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT node_id FROM nodes ORDER BY hostname")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;

        let mut conn = self.pool.acquire().await.map_err(DbError::Query)?;
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = load_node(&mut conn, id.parse()?, &self.settings).await?;
            summaries.push(entry.summary());
        }
        Ok(summaries)
    }

    pub async fn binding_summaries(&self, node: NodeId) -> Result<Vec<BindingSummary>, DbError> {
        Ok(self.load(node).await?.binding_summaries())
    }
}

fn storage_mut<'a>(entry: &'a mut NodeEntry, zpool: &str) -> Result<&'a mut NodeStorage, CapacityError> {
    let node = entry.id();
    entry
        .storages
        .get_mut(zpool)
        .ok_or_else(|| CapacityError::StorageNotFound {
            node,
            zpool: zpool.to_string(),
        })
}

/// Blocks until this transaction owns `node`.
async fn lock_node(conn: &mut PgConnection, node: NodeId) -> Result<(), DbError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(node_lock_key(node))
        .execute(&mut *conn)
        .await
        .map_err(DbError::Query)?;
    Ok(())
}

async fn load_node(
    conn: &mut PgConnection,
    node: NodeId,
    settings: &Settings,
) -> Result<NodeEntry, DbError> {
    let id = node.to_string();

    let row = sqlx::query_as::<_, NodeRow>(
        r#"
        SELECT node_id, hostname, status, is_compute, cpu, ram, cpu_coef, ram_coef, zpool,
               cpu_free, ram_free, disk_free, ram_kvm_overhead
        FROM nodes
        WHERE node_id = $1
        "#,
    )
    .bind(&id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DbError::Query)?
    .ok_or(CapacityError::NodeNotFound(node))?;
    let mut entry = NodeEntry::new(row.into_node()?);

    let storages = sqlx::query_as::<_, StorageRow>(
        r#"
        SELECT zpool, size, size_coef, size_free, size_backups, size_snapshots, size_rep_snapshots
        FROM node_storages
        WHERE node_id = $1
        "#,
    )
    .bind(&id)
    .fetch_all(&mut *conn)
    .await
    .map_err(DbError::Query)?;
    for row in storages {
        let storage = row.into_storage()?;
        entry.storages.insert(storage.zpool.clone(), storage);
    }

    let attachments: Vec<(String, String)> =
        sqlx::query_as("SELECT zpool, dc_id FROM node_storage_dcs WHERE node_id = $1")
            .bind(&id)
            .fetch_all(&mut *conn)
            .await
            .map_err(DbError::Query)?;
    for (zpool, dc) in attachments {
        if let Some(storage) = entry.storages.get_mut(&zpool) {
            storage.attach(dc.parse()?);
        }
    }

    let bindings = sqlx::query_as::<_, BindingRow>(
        r#"
        SELECT dc_id, node_id, strategy, priority, admin_cpu, admin_ram, admin_disk,
               cpu, ram, disk, cpu_free, ram_free, disk_free, ram_kvm_overhead,
               nonreserved_cpu, nonreserved_ram, nonreserved_disk
        FROM dc_nodes
        WHERE node_id = $1
        "#,
    )
    .bind(&id)
    .fetch_all(&mut *conn)
    .await
    .map_err(DbError::Query)?;
    for row in bindings {
        let binding = row.into_binding(settings)?;
        entry.bindings.insert(binding.dc, binding);
    }

    let vms = sqlx::query_as::<_, VmRow>(
        r#"
        SELECT vm_id, dc_id, hypervisor, deployed, reserve_resources, definition, active
        FROM vms
        WHERE node_id = $1
        "#,
    )
    .bind(&id)
    .fetch_all(&mut *conn)
    .await
    .map_err(DbError::Query)?;
    for row in vms {
        let vm = row.into_vm(settings)?;
        entry.vms.insert(vm.id, vm);
    }

    Ok(entry)
}

/// Write every row of `entry` back. Bindings and VMs missing from the entry
/// are deleted; storage pools are never deleted here.
async fn save_node_entry(conn: &mut PgConnection, entry: &NodeEntry) -> Result<(), DbError> {
    let node = &entry.node;
    let id = node.id.to_string();
    let free = node.cached_free();

    sqlx::query(
        r#"
        UPDATE nodes
        SET hostname = $2, status = $3, is_compute = $4, cpu = $5, ram = $6,
            cpu_coef = $7, ram_coef = $8, zpool = $9,
            cpu_free = $10, ram_free = $11, disk_free = $12, ram_kvm_overhead = $13,
            updated_at = now()
        WHERE node_id = $1
        "#,
    )
    .bind(&id)
    .bind(&node.hostname)
    .bind(node.status.code())
    .bind(node.is_compute)
    .bind(node.cpu)
    .bind(node.ram)
    .bind(hundredths(node.cpu_coef))
    .bind(hundredths(node.ram_coef))
    .bind(&node.zpool)
    .bind(free.cpu)
    .bind(free.ram)
    .bind(free.disk)
    .bind(node.ram_kvm_overhead())
    .execute(&mut *conn)
    .await
    .map_err(DbError::Query)?;

    for storage in entry.storages.values() {
        sqlx::query(
            r#"
            INSERT INTO node_storages (
                node_id, zpool, size, size_coef, size_free,
                size_backups, size_snapshots, size_rep_snapshots
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (node_id, zpool) DO UPDATE
            SET size = EXCLUDED.size,
                size_coef = EXCLUDED.size_coef,
                size_free = EXCLUDED.size_free,
                size_backups = EXCLUDED.size_backups,
                size_snapshots = EXCLUDED.size_snapshots,
                size_rep_snapshots = EXCLUDED.size_rep_snapshots
            "#,
        )
        .bind(&id)
        .bind(&storage.zpool)
        .bind(storage.size)
        .bind(hundredths(storage.size_coef))
        .bind(storage.size_free())
        .bind(storage.size_backups)
        .bind(storage.size_snapshots)
        .bind(storage.size_rep_snapshots)
        .execute(&mut *conn)
        .await
        .map_err(DbError::Query)?;
    }

    sqlx::query("DELETE FROM node_storage_dcs WHERE node_id = $1")
        .bind(&id)
        .execute(&mut *conn)
        .await
        .map_err(DbError::Query)?;
    for storage in entry.storages.values() {
        for dc in storage.dcs() {
            sqlx::query("INSERT INTO node_storage_dcs (node_id, zpool, dc_id) VALUES ($1, $2, $3)")
                .bind(&id)
                .bind(&storage.zpool)
                .bind(dc.to_string())
                .execute(&mut *conn)
                .await
                .map_err(DbError::Query)?;
        }
    }

    for binding in entry.bindings.values() {
        save_binding(conn, binding).await?;
    }
    let dcs: Vec<String> = entry.bindings.keys().map(ToString::to_string).collect();
    sqlx::query("DELETE FROM dc_nodes WHERE node_id = $1 AND NOT (dc_id = ANY($2))")
        .bind(&id)
        .bind(&dcs)
        .execute(&mut *conn)
        .await
        .map_err(DbError::Query)?;

    for vm in entry.vms.values() {
        save_vm(conn, node.id, vm).await?;
    }
    let vms: Vec<String> = entry.vms.keys().map(ToString::to_string).collect();
    sqlx::query("DELETE FROM vms WHERE node_id = $1 AND NOT (vm_id = ANY($2))")
        .bind(&id)
        .bind(&vms)
        .execute(&mut *conn)
        .await
        .map_err(DbError::Query)?;

    Ok(())
}

async fn save_binding(conn: &mut PgConnection, binding: &DcNodeBinding) -> Result<(), DbError> {
    let admin = binding.admin_totals();
    let cached = binding.cached();
    let nonreserved = cached.nonreserved_total;

    sqlx::query(
        r#"
        INSERT INTO dc_nodes (
            dc_id, node_id, strategy, priority, admin_cpu, admin_ram, admin_disk,
            cpu, ram, disk, cpu_free, ram_free, disk_free, ram_kvm_overhead,
            nonreserved_cpu, nonreserved_ram, nonreserved_disk
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        ON CONFLICT (dc_id, node_id) DO UPDATE
        SET strategy = EXCLUDED.strategy,
            priority = EXCLUDED.priority,
            admin_cpu = EXCLUDED.admin_cpu,
            admin_ram = EXCLUDED.admin_ram,
            admin_disk = EXCLUDED.admin_disk,
            cpu = EXCLUDED.cpu,
            ram = EXCLUDED.ram,
            disk = EXCLUDED.disk,
            cpu_free = EXCLUDED.cpu_free,
            ram_free = EXCLUDED.ram_free,
            disk_free = EXCLUDED.disk_free,
            ram_kvm_overhead = EXCLUDED.ram_kvm_overhead,
            nonreserved_cpu = EXCLUDED.nonreserved_cpu,
            nonreserved_ram = EXCLUDED.nonreserved_ram,
            nonreserved_disk = EXCLUDED.nonreserved_disk,
            updated_at = now()
        "#,
    )
    .bind(binding.dc.to_string())
    .bind(binding.node.to_string())
    .bind(binding.strategy().code())
    .bind(binding.priority())
    .bind(admin.cpu)
    .bind(admin.ram)
    .bind(admin.disk)
    .bind(cached.total.cpu)
    .bind(cached.total.ram)
    .bind(cached.total.disk)
    .bind(cached.free.cpu)
    .bind(cached.free.ram)
    .bind(cached.free.disk)
    .bind(cached.ram_kvm_overhead)
    .bind(nonreserved.map(|r| r.cpu))
    .bind(nonreserved.map(|r| r.ram))
    .bind(nonreserved.map(|r| r.disk))
    .execute(&mut *conn)
    .await
    .map_err(DbError::Query)?;
    Ok(())
}

/// Insert or refresh a VM row owned by `node`. A row of the same id held by
/// another node is left alone and reported as [`CapacityError::VmExists`].
async fn save_vm(conn: &mut PgConnection, node: NodeId, vm: &Vm) -> Result<(), DbError> {
    let definition = serde_json::to_value(&vm.definition)?;
    let active = vm.active.as_ref().map(serde_json::to_value).transpose()?;

    let saved: Option<String> = sqlx::query_scalar(
        r#"
        INSERT INTO vms (vm_id, dc_id, node_id, hypervisor, deployed, reserve_resources, definition, active)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (vm_id) DO UPDATE
        SET hypervisor = EXCLUDED.hypervisor,
            deployed = EXCLUDED.deployed,
            reserve_resources = EXCLUDED.reserve_resources,
            definition = EXCLUDED.definition,
            active = EXCLUDED.active,
            updated_at = now()
        WHERE vms.node_id = EXCLUDED.node_id
        RETURNING vm_id
        "#,
    )
    .bind(vm.id.to_string())
    .bind(vm.dc.to_string())
    .bind(node.to_string())
    .bind(vm.hypervisor.as_str())
    .bind(vm.deployed)
    .bind(vm.reserve_resources)
    .bind(definition)
    .bind(active)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DbError::Query)?;

    match saved {
        Some(_) => Ok(()),
        None => Err(CapacityError::VmExists(vm.id).into()),
    }
}
