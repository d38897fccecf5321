//! # capsched-id
//!
//! Typed identifiers for the scheduling domain.
//!
//! Every identifier renders as `{prefix}_{ulid}`:
//! - `dc_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a datacenter (tenant)
//! - `node_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for a physical compute node
//! - `vm_01HV4Z4NYPLTRS0JTUA8XDME5F` for a virtual machine
//!
//! Distinct types keep a tenant id from ever being passed where a node id is
//! expected, and the string form is what gets persisted.

mod error;
mod id;
mod macros;
mod types;

pub use error::IdError;
pub use id::{Id, IdKind};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
