//! The generic identifier and its string form.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

use crate::IdError;

/// Marker for one kind of identifier. Implemented by [`define_id!`](crate::define_id).
pub trait IdKind: Copy + Ord + Hash + fmt::Debug + Send + Sync + 'static {
    /// Rendered before the ULID, without the `_`.
    const PREFIX: &'static str;
}

/// A ULID tagged with its kind.
///
/// Ordering follows the ULID, so ids sort by creation time first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id<K: IdKind> {
    ulid: Ulid,
    kind: PhantomData<K>,
}

impl<K: IdKind> Id<K> {
    pub const PREFIX: &'static str = K::PREFIX;

    #[must_use]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self::from_ulid(Ulid::new())
    }

    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            kind: PhantomData,
        }
    }

    #[must_use]
    pub const fn ulid(&self) -> Ulid {
        self.ulid
    }

    /// Parses `{prefix}_{ulid}`, rejecting ids of any other kind.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let (prefix, raw) = s
            .split_once('_')
            .ok_or_else(|| IdError::MissingSeparator(s.to_string()))?;
        if prefix != K::PREFIX {
            return Err(IdError::WrongKind {
                expected: K::PREFIX,
                actual: prefix.to_string(),
            });
        }
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|e| IdError::InvalidUlid(e.to_string()))
    }
}

impl<K: IdKind> fmt::Display for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", K::PREFIX, self.ulid)
    }
}

impl<K: IdKind> fmt::Debug for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl<K: IdKind> FromStr for Id<K> {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<K: IdKind> From<Id<K>> for String {
    fn from(id: Id<K>) -> Self {
        id.to_string()
    }
}

impl<K: IdKind> TryFrom<String> for Id<K> {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl<K: IdKind> Serialize for Id<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, K: IdKind> Deserialize<'de> for Id<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}
