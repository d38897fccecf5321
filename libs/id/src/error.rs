//! Error type for identifier parsing.

use thiserror::Error;

/// Reasons a string is not a valid typed identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,

    /// No `_` between prefix and ULID.
    #[error("identifier '{0}' has no '_' separator")]
    MissingSeparator(String),

    #[error("wrong identifier kind: expected '{expected}_', got '{actual}_'")]
    WrongKind {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// True when the string was a well-formed id of another kind.
    pub fn is_wrong_kind(&self) -> bool {
        matches!(self, IdError::WrongKind { .. })
    }
}
