//! Oversubscription coefficients as fixed-point decimals.
//!
//! Coefficients have two decimal places and at most two integer digits
//! (`0.00..=99.99`). They are stored as hundredths so that applying one is an
//! exact integer multiply followed by a floor division.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CapacityError;

const SCALE: u32 = 100;
const MAX_HUNDREDTHS: u32 = 9_999;

/// A non-negative multiplier with two decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coefficient(u32);

impl Coefficient {
    pub const ONE: Self = Self(SCALE);

    pub fn from_hundredths(hundredths: u32) -> Result<Self, CapacityError> {
        if hundredths > MAX_HUNDREDTHS {
            return Err(CapacityError::configuration(format!(
                "coefficient {}.{:02} exceeds 99.99",
                hundredths / SCALE,
                hundredths % SCALE
            )));
        }
        Ok(Self(hundredths))
    }

    pub const fn hundredths(&self) -> u32 {
        self.0
    }

    /// `floor(raw * self)` for non-negative `raw`, truncation toward zero
    /// otherwise.
    pub fn apply(&self, raw: i64) -> i64 {
        raw * i64::from(self.0) / i64::from(SCALE)
    }
}

impl Default for Coefficient {
    fn default() -> Self {
        Self::ONE
    }
}

impl FromStr for Coefficient {
    type Err = CapacityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CapacityError::configuration(format!("invalid coefficient '{s}'"));
        let s = s.trim();
        let (int_part, frac_part) = s.split_once('.').unwrap_or((s, ""));

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if frac_part.len() > 2
            || !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }

        let int: u32 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        let frac: u32 = match frac_part.len() {
            0 => 0,
            1 => frac_part.parse::<u32>().map_err(|_| invalid())? * 10,
            _ => frac_part.parse().map_err(|_| invalid())?,
        };

        let hundredths = int
            .checked_mul(SCALE)
            .and_then(|v| v.checked_add(frac))
            .ok_or_else(invalid)?;
        Self::from_hundredths(hundredths)
    }
}

impl fmt::Display for Coefficient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / SCALE, self.0 % SCALE)
    }
}

impl Serialize for Coefficient {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Coefficient {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
