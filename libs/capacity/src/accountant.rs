//! Pure resource arithmetic.
//!
//! Nothing in here looks at persistence or at VM internals. Callers flatten
//! the VMs of one node into [`Demand`] entries (one per VM, already evaluated
//! against the node's local pool) and the RESERVED bindings of that node into
//! [`Reservation`] entries; every strategy is then a fold over those slices.

use std::collections::BTreeSet;

use capsched_id::DcId;

use crate::resources::Resources;
use crate::strategy::Strategy;

/// Resources consumed by a single VM on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Demand {
    pub dc: DcId,
    pub resources: Resources,
    /// Hypervisor needs extra memory per guest.
    pub needs_ram_overhead: bool,
}

/// An admin-set RESERVED slice of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub dc: DcId,
    pub totals: Resources,
}

/// Which VMs a subtraction applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemandFilter {
    /// Only VMs of this tenant.
    pub dc: Option<DcId>,
    /// Never VMs of this tenant.
    pub dc_exclude: Option<DcId>,
    /// Never VMs of these tenants.
    pub dcs_exclude: BTreeSet<DcId>,
}

impl DemandFilter {
    /// Every VM on the node.
    pub fn all() -> Self {
        Self::default()
    }

    /// VMs of one tenant.
    pub fn only(dc: DcId) -> Self {
        Self {
            dc: Some(dc),
            ..Self::default()
        }
    }

    pub fn matches(&self, dc: &DcId) -> bool {
        if self.dc.is_some_and(|only| only != *dc) {
            return false;
        }
        if self.dc_exclude.is_some_and(|excluded| excluded == *dc) {
            return false;
        }
        !self.dcs_exclude.contains(dc)
    }
}

/// `totals` minus every matching demand. The single subtraction primitive.
pub fn subtract(totals: Resources, demands: &[Demand], filter: &DemandFilter) -> Resources {
    demands
        .iter()
        .filter(|d| filter.matches(&d.dc))
        .fold(totals, |acc, d| acc - d.resources)
}

/// Sum of one tenant's demands.
pub fn used(demands: &[Demand], dc: DcId) -> Resources {
    demands
        .iter()
        .filter(|d| d.dc == dc)
        .map(|d| d.resources)
        .sum()
}

/// Memory overhead of hardware-virtualized guests, optionally per tenant.
pub fn ram_kvm_overhead(demands: &[Demand], dc: Option<DcId>, per_vm_mb: i64) -> i64 {
    let count = demands
        .iter()
        .filter(|d| d.needs_ram_overhead)
        .filter(|d| dc.is_none_or(|dc| d.dc == dc))
        .count();
    i64::try_from(count).unwrap_or(i64::MAX).saturating_mul(per_vm_mb)
}

/// The part of a node not carved out by RESERVED bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonReserved {
    pub total: Resources,
    pub free: Resources,
}

/// Node totals minus all reservations, and what remains after every VM of a
/// non-reserving tenant.
///
/// With `exclude_dc`, that tenant's own reservation is not subtracted and its
/// own VMs are not counted, i.e. what the rest of the node leaves for it.
pub fn nonreserved(
    node_totals: Resources,
    reservations: &[Reservation],
    demands: &[Demand],
    exclude_dc: Option<DcId>,
) -> NonReserved {
    let reserved: Resources = reservations
        .iter()
        .filter(|r| exclude_dc.is_none_or(|dc| r.dc != dc))
        .map(|r| r.totals)
        .sum();
    let total = node_totals - reserved;

    let filter = DemandFilter {
        dc: None,
        dc_exclude: exclude_dc,
        dcs_exclude: reservations.iter().map(|r| r.dc).collect(),
    };

    NonReserved {
        total,
        free: subtract(total, demands, &filter),
    }
}

/// Totals and free resources a binding exposes to its tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accounting {
    pub total: Resources,
    pub free: Resources,
    /// Non-reserved node total, reported for shared strategies.
    pub nonreserved_total: Option<Resources>,
}

/// Evaluates `strategy` for tenant `dc` from scratch.
///
/// `admin` is the binding's admin-set ceiling; it is ignored for
/// [`Strategy::Shared`], whose totals are derived.
pub fn account(
    strategy: Strategy,
    dc: DcId,
    admin: Resources,
    node_totals: Resources,
    reservations: &[Reservation],
    demands: &[Demand],
) -> Accounting {
    match strategy {
        Strategy::Reserved => Accounting {
            total: admin,
            free: subtract(admin, demands, &DemandFilter::only(dc)),
            nonreserved_total: None,
        },
        Strategy::Shared => {
            let shared = nonreserved(node_totals, reservations, demands, None);
            Accounting {
                total: shared.total,
                free: shared.free,
                nonreserved_total: Some(shared.total),
            }
        }
        Strategy::SharedLimit => {
            let shared = nonreserved(node_totals, reservations, demands, None);
            let capped = subtract(admin, demands, &DemandFilter::only(dc));
            Accounting {
                total: admin,
                free: shared.free.min(capped),
                nonreserved_total: Some(shared.total),
            }
        }
    }
}
