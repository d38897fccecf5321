//! Tenant-to-node bindings and their strategy-dependent free resources.

use capsched_id::{DcId, NodeId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::accountant::{self, Accounting, NonReserved, Reservation};
use crate::error::{CapacityError, CapacityResult};
use crate::node::NodeCapacity;
use crate::resources::{HasCachedResources, Resources};
use crate::settings::{Settings, MAX_PRIORITY};
use crate::strategy::Strategy;

/// What an admin supplies when attaching a node to a tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSpec {
    pub strategy: Strategy,
    /// Defaults to [`Settings::default_priority`].
    pub priority: Option<i32>,
    /// Ceiling for RESERVED and SHARED_LIMIT; ignored by SHARED.
    #[serde(default)]
    pub totals: Resources,
}

impl BindingSpec {
    pub fn shared() -> Self {
        Self::default()
    }

    pub fn shared_limit(totals: Resources) -> Self {
        Self {
            strategy: Strategy::SharedLimit,
            priority: None,
            totals,
        }
    }

    pub fn reserved(totals: Resources) -> Self {
        Self {
            strategy: Strategy::Reserved,
            priority: None,
            totals,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Partial admin change of an existing binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingUpdate {
    pub strategy: Option<Strategy>,
    pub priority: Option<i32>,
    pub totals: Option<Resources>,
}

/// Values a recompute writes; persisted alongside the admin inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedColumns {
    pub total: Resources,
    pub free: Resources,
    pub ram_kvm_overhead: i64,
    pub nonreserved_total: Option<Resources>,
}

/// One (tenant, node) pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DcNodeBinding {
    pub dc: DcId,
    pub node: NodeId,
    strategy: Strategy,
    priority: i32,
    /// Admin-set ceiling. Kept across strategy switches so switching back
    /// reproduces the same numbers.
    admin: Resources,
    cached: CachedColumns,
}

impl DcNodeBinding {
    pub fn new(dc: DcId, node: NodeId, spec: BindingSpec, settings: &Settings) -> CapacityResult<Self> {
        let priority = spec.priority.unwrap_or(settings.default_priority);
        validate_priority(priority)?;
        validate_totals(&spec.totals)?;

        Ok(Self {
            dc,
            node,
            strategy: spec.strategy,
            priority,
            admin: spec.totals,
            cached: CachedColumns::default(),
        })
    }

    /// Rehydrates cached columns read back from storage.
    pub fn restore_cached(&mut self, cached: CachedColumns) {
        self.cached = cached;
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Admin-set ceiling as entered.
    pub fn admin_totals(&self) -> Resources {
        self.admin
    }

    /// Totals visible to the tenant after the last recompute.
    pub fn totals(&self) -> Resources {
        self.cached.total
    }

    pub fn cached(&self) -> &CachedColumns {
        &self.cached
    }

    pub fn nonreserved_total(&self) -> Option<Resources> {
        self.cached.nonreserved_total
    }

    /// The slice this binding carves out of its node, if any.
    pub fn reservation(&self) -> Option<Reservation> {
        (self.strategy == Strategy::Reserved).then_some(Reservation {
            dc: self.dc,
            totals: self.admin,
        })
    }

    /// Apply an admin change. Cached columns are left for the caller's
    /// recompute.
    pub fn apply(&mut self, update: BindingUpdate) -> CapacityResult<()> {
        if let Some(priority) = update.priority {
            validate_priority(priority)?;
        }
        if let Some(totals) = &update.totals {
            validate_totals(totals)?;
        }

        if let Some(strategy) = update.strategy {
            self.strategy = strategy;
        }
        if let Some(priority) = update.priority {
            self.priority = priority;
        }
        if let Some(totals) = update.totals {
            self.admin = totals;
        }
        Ok(())
    }

    /// Pure evaluation of the strategy against the node as it is now.
    pub fn compute(&self, capacity: &NodeCapacity<'_>, reservations: &[Reservation]) -> Accounting {
        accountant::account(
            self.strategy,
            self.dc,
            self.admin,
            capacity.resources(),
            reservations,
            capacity.demands(),
        )
    }

    /// Recompute the cached columns from scratch.
    pub fn update_resources(
        &mut self,
        capacity: &NodeCapacity<'_>,
        reservations: &[Reservation],
        settings: &Settings,
    ) {
        let accounting = self.compute(capacity, reservations);
        self.cached = CachedColumns {
            total: accounting.total,
            free: accounting.free,
            ram_kvm_overhead: capacity
                .get_ram_kvm_overhead(Some(self.dc), settings.kvm_memory_overhead_mb),
            nonreserved_total: accounting.nonreserved_total,
        };
        debug!(
            dc = %self.dc,
            node = %self.node,
            strategy = %self.strategy,
            cpu_free = self.cached.free.cpu,
            ram_free = self.cached.free.ram,
            disk_free = self.cached.free.disk,
            "binding recomputed"
        );
    }

    /// Non-reserved node total and what the non-reserving tenants leave of it.
    ///
    /// With `exclude_this_dc` this tenant's own reservation and VMs are left
    /// out, answering how much the rest of the node could back.
    pub fn get_nonreserved_free_resources(
        &self,
        capacity: &NodeCapacity<'_>,
        reservations: &[Reservation],
        exclude_this_dc: bool,
    ) -> NonReserved {
        accountant::nonreserved(
            capacity.resources(),
            reservations,
            capacity.demands(),
            exclude_this_dc.then_some(self.dc),
        )
    }

    /// A RESERVED ceiling must fit into what the rest of the node leaves and
    /// must still hold what the tenant already runs there.
    pub fn check_reservation(
        &self,
        capacity: &NodeCapacity<'_>,
        reservations: &[Reservation],
    ) -> CapacityResult<()> {
        if self.strategy != Strategy::Reserved {
            return Ok(());
        }

        let available = self
            .get_nonreserved_free_resources(capacity, reservations, true)
            .free;
        if !available.covers(&self.admin) {
            return Err(CapacityError::InsufficientCapacity {
                node: self.node,
                detail: format!("reservation {} exceeds available {}", self.admin, available),
            });
        }

        let used = capacity.get_used_resources(self.dc);
        if !self.admin.covers(&used) {
            return Err(CapacityError::InsufficientCapacity {
                node: self.node,
                detail: format!("reservation {} is below current usage {}", self.admin, used),
            });
        }
        Ok(())
    }
}

impl HasCachedResources for DcNodeBinding {
    fn cached_free(&self) -> Resources {
        self.cached.free
    }

    fn ram_kvm_overhead(&self) -> i64 {
        self.cached.ram_kvm_overhead
    }
}

/// Recompute every binding of one node.
///
/// Reservations are collected before anything is rewritten, so the order the
/// bindings come in does not matter.
pub fn update_all<'a, I>(capacity: &NodeCapacity<'_>, bindings: I, settings: &Settings)
where
    I: IntoIterator<Item = &'a mut DcNodeBinding>,
{
    let mut bindings: Vec<&mut DcNodeBinding> = bindings.into_iter().collect();
    let reservations: Vec<Reservation> = bindings.iter().filter_map(|b| b.reservation()).collect();
    for binding in &mut bindings {
        binding.update_resources(capacity, &reservations, settings);
    }
}

fn validate_priority(priority: i32) -> CapacityResult<()> {
    if (0..=MAX_PRIORITY).contains(&priority) {
        Ok(())
    } else {
        Err(CapacityError::configuration(format!(
            "priority {priority} outside 0..={MAX_PRIORITY}"
        )))
    }
}

fn validate_totals(totals: &Resources) -> CapacityResult<()> {
    if totals.any_negative() {
        return Err(CapacityError::configuration(format!(
            "negative totals: {totals}"
        )));
    }
    Ok(())
}
