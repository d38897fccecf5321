//! Serialized placement over a shared in-memory fleet.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use capsched_id::{DcId, NodeId};
use tracing::{info, instrument, warn};

use crate::error::{CapacityError, CapacityResult};
use crate::fleet::Fleet;
use crate::placement::Requirements;
use crate::vm::Vm;

/// Owns the fleet behind one lock.
///
/// Choosing a node and committing the VM happen under the same guard, so two
/// placements can never both spend the last free resources of a node.
#[derive(Debug, Default)]
pub struct PlacementScheduler {
    fleet: Mutex<Fleet>,
}

impl PlacementScheduler {
    pub fn new(fleet: Fleet) -> Self {
        Self {
            fleet: Mutex::new(fleet),
        }
    }

    fn lock(&self) -> CapacityResult<MutexGuard<'_, Fleet>> {
        self.fleet.lock().map_err(|_| CapacityError::LockPoisoned)
    }

    /// Run `f` with exclusive access to the fleet.
    pub fn with_fleet<T>(&self, f: impl FnOnce(&mut Fleet) -> CapacityResult<T>) -> CapacityResult<T> {
        let mut fleet = self.lock()?;
        f(&mut fleet)
    }

    /// Best-fit node from cached columns, without committing anything.
    pub fn choose_node(&self, dc: DcId, req: &Requirements) -> CapacityResult<NodeId> {
        self.lock()?.choose_node(dc, req)
    }

    /// Choose a node for `vm` and record it there.
    ///
    /// A node whose cached columns turn out stale is skipped and the choice is
    /// repeated, up to `placement_max_attempts` times.
    #[instrument(skip(self, vm), fields(vm = %vm.id, dc = %vm.dc))]
    pub fn place(&self, vm: Vm) -> CapacityResult<NodeId> {
        let mut fleet = self.lock()?;
        let req = Requirements::for_vm(&vm);
        let max_attempts = fleet.settings().placement_max_attempts;
        let mut excluded = BTreeSet::new();
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let node = fleet.choose_node_excluding(vm.dc, &req, &excluded)?;
            match fleet.commit_placement(node, vm.clone()) {
                Ok(()) => {
                    info!(%node, attempt, "placement committed");
                    return Ok(node);
                }
                Err(e) if e.is_retryable() => {
                    warn!(%node, attempt, error = %e, "retrying placement");
                    excluded.insert(node);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(CapacityError::NoNodeAvailable { dc: vm.dc }))
    }

    pub fn into_inner(self) -> CapacityResult<Fleet> {
        self.fleet
            .into_inner()
            .map_err(|_| CapacityError::LockPoisoned)
    }
}
