//! Parse errors for prefixed ids.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("id cannot be empty")]
    Empty,

    #[error("id missing '_' separator")]
    MissingSeparator,

    #[error("wrong id prefix: expected '{expected}', got '{actual}'")]
    WrongPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid ulid: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// True when the input belonged to a different id family.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::WrongPrefix { .. })
    }
}
