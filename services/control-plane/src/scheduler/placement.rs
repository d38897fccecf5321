//! Choose-then-commit placement with retry on stale nodes.

use std::collections::BTreeSet;

use capsched_capacity::{placement, CapacityError, Requirements, Vm};
use capsched_id::{DcId, NodeId};
use tracing::{debug, info, instrument, warn};

use crate::db::{DbError, FleetStore};

pub struct PgPlacement {
    store: FleetStore,
}

impl PgPlacement {
    pub fn new(store: FleetStore) -> Self {
        Self { store }
    }

    /// Best node for `req` from cached columns, skipping `excluded`.
    #[instrument(skip(self, req, excluded), fields(cpu = req.cpu, ram = req.ram))]
    pub async fn choose_node(
        &self,
        dc: DcId,
        req: &Requirements,
        excluded: &BTreeSet<NodeId>,
    ) -> Result<NodeId, DbError> {
        let candidates = self.store.candidates(dc, req).await?;
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
            None => Err(CapacityError::NoNodeAvailable { dc }.into()),
        }
    }

    /// Choose a node for `vm` and record it there.
    ///
    /// The choice reads cached columns without a lock; the commit re-checks
    /// live numbers under the node lock. A stale node is recomputed, skipped,
    /// and the choice repeated up to `placement_max_attempts` times.
    #[instrument(skip(self, vm), fields(vm = %vm.id, dc = %vm.dc))]
    pub async fn place(&self, vm: Vm) -> Result<NodeId, DbError> {
        if self.store.vm_node(vm.id).await?.is_some() {
            return Err(CapacityError::VmExists(vm.id).into());
        }

        let req = Requirements::for_vm(&vm);
        let max_attempts = self.store.settings().placement_max_attempts;
        let mut excluded = BTreeSet::new();
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let node = self.choose_node(vm.dc, &req, &excluded).await?;
            match self.store.commit_placement(node, vm.clone()).await {
                Ok(_) => {
                    info!(%node, attempt, "placement committed");
                    return Ok(node);
                }
                Err(DbError::Capacity(e)) if e.is_retryable() => {
                    warn!(%node, attempt, error = %e, "retrying placement");
                    excluded.insert(node);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or(CapacityError::NoNodeAvailable { dc: vm.dc })
            .into())
    }
}
