//! Resource sharing strategy of a tenant on a node.

use serde::{Deserialize, Serialize};

use crate::error::CapacityError;

/// Selects the formula that derives a binding's visible totals and free
/// resources. It has no transitions: switching strategy simply recomputes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Everything not reserved on the node, shared with all other
    /// non-reserving tenants.
    #[default]
    Shared,
    /// Like `Shared`, but never more than an admin-set per-tenant ceiling.
    SharedLimit,
    /// An admin-set slice carved out of the node for this tenant alone.
    Reserved,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::Shared, Strategy::SharedLimit, Strategy::Reserved];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::SharedLimit => "shared_limit",
            Self::Reserved => "reserved",
        }
    }

    /// Stable numeric code used in persisted rows.
    pub fn code(&self) -> i16 {
        match self {
            Self::Shared => 1,
            Self::SharedLimit => 2,
            Self::Reserved => 3,
        }
    }

    pub fn from_code(code: i16) -> Result<Self, CapacityError> {
        match code {
            1 => Ok(Self::Shared),
            2 => Ok(Self::SharedLimit),
            3 => Ok(Self::Reserved),
            other => Err(CapacityError::configuration(format!(
                "unknown strategy code {other}"
            ))),
        }
    }

    /// Whether the admin totals are meaningful input (as opposed to derived).
    pub fn uses_admin_totals(&self) -> bool {
        !matches!(self, Self::Shared)
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = CapacityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shared" => Ok(Self::Shared),
            "shared_limit" | "shared-limit" => Ok(Self::SharedLimit),
            "reserved" => Ok(Self::Reserved),
            other => Err(CapacityError::configuration(format!(
                "unknown strategy '{other}'"
            ))),
        }
    }
}
