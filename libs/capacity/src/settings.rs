//! Tunables of the capacity core.

use crate::coefficient::Coefficient;
use crate::error::CapacityError;

/// Name of the default local storage pool on a compute node.
pub const LOCAL_ZPOOL: &str = "zones";

/// Memory (MB) a hardware-virtualized guest needs on top of its RAM.
pub const KVM_MEMORY_OVERHEAD_MB: i64 = 256;

/// Priority given to a new binding when the admin does not set one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Upper bound on binding priority.
pub const MAX_PRIORITY: i32 = 9_999;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub kvm_memory_overhead_mb: i64,
    pub default_priority: i32,
    pub local_zpool: String,
    /// Coefficient given to a newly registered storage pool.
    pub storage_size_coef: Coefficient,
    /// Placement attempts before a stale-data race is given back to the caller.
    pub placement_max_attempts: u32,
    /// Refuse RESERVED totals the rest of the node cannot back.
    pub strict_reservations: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kvm_memory_overhead_mb: KVM_MEMORY_OVERHEAD_MB,
            default_priority: DEFAULT_PRIORITY,
            local_zpool: LOCAL_ZPOOL.to_string(),
            storage_size_coef: Coefficient::from_hundredths(60).unwrap_or(Coefficient::ONE),
            placement_max_attempts: 3,
            strict_reservations: false,
        }
    }
}

impl Settings {
    /// Load settings from `CAPSCHED_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, CapacityError> {
        let defaults = Self::default();

        let kvm_memory_overhead_mb = parse_var(
            "CAPSCHED_KVM_MEMORY_OVERHEAD_MB",
            defaults.kvm_memory_overhead_mb,
        )?;
        let default_priority = parse_var("CAPSCHED_DEFAULT_PRIORITY", defaults.default_priority)?;
        let local_zpool =
            std::env::var("CAPSCHED_LOCAL_ZPOOL").unwrap_or_else(|_| defaults.local_zpool.clone());
        let storage_size_coef =
            parse_var("CAPSCHED_STORAGE_SIZE_COEF", defaults.storage_size_coef)?;
        let placement_max_attempts = parse_var(
            "CAPSCHED_PLACEMENT_MAX_ATTEMPTS",
            defaults.placement_max_attempts,
        )?;
        let strict_reservations = std::env::var("CAPSCHED_STRICT_RESERVATIONS")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(defaults.strict_reservations);

        let settings = Self {
            kvm_memory_overhead_mb,
            default_priority,
            local_zpool,
            storage_size_coef,
            placement_max_attempts,
            strict_reservations,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), CapacityError> {
        if self.kvm_memory_overhead_mb < 0 {
            return Err(CapacityError::configuration(
                "kvm memory overhead must not be negative",
            ));
        }
        if !(0..=MAX_PRIORITY).contains(&self.default_priority) {
            return Err(CapacityError::configuration(format!(
                "default priority must be within 0..={MAX_PRIORITY}"
            )));
        }
        if self.local_zpool.is_empty() {
            return Err(CapacityError::configuration("local zpool name is empty"));
        }
        if self.placement_max_attempts == 0 {
            return Err(CapacityError::configuration(
                "placement needs at least one attempt",
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T, CapacityError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| CapacityError::configuration(format!("{name}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.kvm_memory_overhead_mb, 256);
        assert_eq!(settings.default_priority, 100);
        assert_eq!(settings.local_zpool, "zones");
        assert_eq!(settings.storage_size_coef.to_string(), "0.60");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let settings = Settings {
            placement_max_attempts: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
