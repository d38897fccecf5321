//! The (cpu, ram, disk) triple every formula works on.

use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// CPUs (vCPU count), RAM (MB) and local-pool disk (MB).
///
/// Values are signed: an over-committed admin ceiling legitimately yields a
/// negative free amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: i64,
    pub ram: i64,
    pub disk: i64,
}

impl Resources {
    pub const ZERO: Self = Self {
        cpu: 0,
        ram: 0,
        disk: 0,
    };

    pub const fn new(cpu: i64, ram: i64, disk: i64) -> Self {
        Self { cpu, ram, disk }
    }

    /// Per-axis minimum.
    pub fn min(self, other: Self) -> Self {
        Self {
            cpu: self.cpu.min(other.cpu),
            ram: self.ram.min(other.ram),
            disk: self.disk.min(other.disk),
        }
    }

    /// True when every axis of `request` fits into `self`.
    pub fn covers(&self, request: &Self) -> bool {
        self.cpu >= request.cpu && self.ram >= request.ram && self.disk >= request.disk
    }

    pub fn any_negative(&self) -> bool {
        self.cpu < 0 || self.ram < 0 || self.disk < 0
    }
}

impl Add for Resources {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            cpu: self.cpu + rhs.cpu,
            ram: self.ram + rhs.ram,
            disk: self.disk + rhs.disk,
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Resources {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            cpu: self.cpu - rhs.cpu,
            ram: self.ram - rhs.ram,
            disk: self.disk - rhs.disk,
        }
    }
}

impl SubAssign for Resources {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl std::iter::Sum for Resources {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu={} ram={}MB disk={}MB",
            self.cpu, self.ram, self.disk
        )
    }
}

/// Anything carrying derived free-resource columns.
///
/// Those columns are written only by a recompute; readers use this trait.
pub trait HasCachedResources {
    fn cached_free(&self) -> Resources;

    fn ram_kvm_overhead(&self) -> i64;

    /// Fast check against the cached columns. Each `None` axis is skipped.
    fn check_free_resources(&self, cpu: Option<i64>, ram: Option<i64>, disk: Option<i64>) -> bool {
        let free = self.cached_free();
        cpu.is_none_or(|cpu| cpu <= free.cpu)
            && ram.is_none_or(|ram| ram <= free.ram)
            && disk.is_none_or(|disk| disk <= free.disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let a = Resources::new(8, 4096, 1000);
        let b = Resources::new(2, 1024, 300);
        assert_eq!(a - b, Resources::new(6, 3072, 700));
        assert_eq!(a + b, Resources::new(10, 5120, 1300));
        assert_eq!([a, b].into_iter().sum::<Resources>(), a + b);
    }

    #[test]
    fn test_min_is_per_axis() {
        let a = Resources::new(1, 5000, 10);
        let b = Resources::new(4, 500, 20);
        assert_eq!(a.min(b), Resources::new(1, 500, 10));
    }

    #[test]
    fn test_covers() {
        let free = Resources::new(4, 2048, 100);
        assert!(free.covers(&Resources::new(4, 2048, 100)));
        assert!(!free.covers(&Resources::new(5, 0, 0)));
    }

    struct Cached(Resources);

    impl HasCachedResources for Cached {
        fn cached_free(&self) -> Resources {
            self.0
        }

        fn ram_kvm_overhead(&self) -> i64 {
            0
        }
    }

    #[test]
    fn test_check_free_resources_skips_unset_axes() {
        let cached = Cached(Resources::new(2, 1024, -5));
        assert!(cached.check_free_resources(Some(2), Some(1024), None));
        assert!(!cached.check_free_resources(Some(3), None, None));
        assert!(!cached.check_free_resources(None, None, Some(0)));
        assert!(cached.check_free_resources(None, None, None));
    }
}
