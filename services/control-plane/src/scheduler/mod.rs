//! Placement and periodic recomputation against the Postgres fleet.
//!
//! Both sit on top of [`crate::db::FleetStore`]: placement reads candidates
//! from cached columns, then commits under the chosen node's advisory lock;
//! the worker rewrites every compute node's cached columns on an interval.

mod placement;
mod worker;

pub use placement::PgPlacement;
pub use worker::RecomputeWorker;
