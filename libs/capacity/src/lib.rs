//! Capacity accounting and best-fit placement for multi-tenant compute nodes.
//!
//! A tenant ("datacenter") sees a physical node through a [`DcNodeBinding`]
//! whose [`Strategy`] decides how much of the node is visible:
//!
//! - `Shared`: everything not reserved by another tenant, shared with every
//!   other non-reserving tenant.
//! - `SharedLimit`: the same, capped by an admin ceiling.
//! - `Reserved`: an admin-set slice carved out for the tenant alone.
//!
//! Free resources are derived and cached. Every mutation of a node (hardware,
//! coefficients, VMs, bindings) recomputes the node and all of its bindings
//! from scratch; [`Fleet::choose_node`] then reads only cached numbers.
//!
//! This crate is synchronous and holds no I/O. The control plane persists the
//! same structures in Postgres and serializes placements with per-node
//! advisory locks; in-process callers use [`PlacementScheduler`].

pub mod accountant;
pub mod binding;
pub mod coefficient;
pub mod entry;
pub mod error;
pub mod fleet;
pub mod node;
pub mod placement;
pub mod resources;
pub mod scheduler;
pub mod settings;
pub mod storage;
pub mod strategy;
pub mod vm;

pub use accountant::{Accounting, Demand, DemandFilter, NonReserved, Reservation};
pub use binding::{BindingSpec, BindingUpdate, CachedColumns, DcNodeBinding};
pub use coefficient::Coefficient;
pub use entry::{BindingSummary, NodeEntry, NodeSummary, Recompute};
pub use error::{CapacityError, CapacityResult};
pub use fleet::Fleet;
pub use node::{HardwareInfo, HasStatus, Node, NodeCapacity, NodeStatus};
pub use placement::{Candidate, Requirements};
pub use resources::{HasCachedResources, Resources};
pub use scheduler::PlacementScheduler;
pub use settings::Settings;
pub use storage::NodeStorage;
pub use strategy::Strategy;
pub use vm::{Hypervisor, Vm, VmDefinition, VmDemand, VmDisk};
