//! Periodic full recompute.
//!
//! Placement only ever reads cached columns. Anything that changes a node
//! without going through the store (a deferred bulk import, a hand-edited
//! row) is picked up by the next pass.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::db::{DbError, FleetStore};

pub struct RecomputeWorker {
    store: FleetStore,
    interval: Duration,
}

impl RecomputeWorker {
    pub fn new(store: FleetStore, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting recompute worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; wait a full interval instead.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Recompute pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Recompute worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over every compute node.
    pub async fn run_once(&self) -> Result<usize, DbError> {
        let count = self.store.recompute_all().await?;
        info!(nodes = count, "Recompute pass complete");
        Ok(count)
    }
}
