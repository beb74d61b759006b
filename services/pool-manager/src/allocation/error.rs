//! Allocation error taxonomy.

use thiserror::Error;

use crate::lock::LockError;
use crate::model::InvalidGroup;
use crate::store::StoreError;

pub type AllocationResult<T> = Result<T, AllocationError>;

#[derive(Debug, Error)]
pub enum AllocationError {
    /// Malformed request; nothing was touched.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Matching found fewer candidates than requested.
    #[error("insufficient resources for group '{group_mark}': need {requested}, found {available}")]
    Insufficient {
        group_mark: String,
        requested: usize,
        available: usize,
    },

    /// Enough candidates matched, but the affinity rules could not be met.
    #[error("insufficient resources for group '{group_mark}': affinity allowed {picked} of {requested}")]
    Exhausted {
        group_mark: String,
        requested: usize,
        picked: usize,
    },

    /// Another request reserved some winners first.
    #[error("reservation race lost for group '{group_mark}': reserved {reserved} of {requested}")]
    RaceLost {
        group_mark: String,
        requested: usize,
        reserved: usize,
    },

    /// The scope stayed locked for the whole retry budget.
    #[error("timed out waiting for scope lock ({scope}) after {attempts} attempts")]
    LockTimeout { scope: String, attempts: u32 },

    /// Confirm's locked re-read did not match the submitted ids.
    #[error("confirm mismatch: requested {requested} hosts, {found} are held by this request")]
    ConfirmMismatch { requested: usize, found: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The reservation task died before reporting back.
    #[error("reservation task failed: {0}")]
    Internal(String),

    #[error(transparent)]
    Lock(LockError),
}

impl AllocationError {
    /// Whether re-submitting the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RaceLost { .. } | Self::LockTimeout { .. } | Self::Lock(_)
        )
    }

    /// Group the failure is attributed to, if any.
    pub fn group_mark(&self) -> Option<&str> {
        match self {
            Self::Insufficient { group_mark, .. }
            | Self::Exhausted { group_mark, .. }
            | Self::RaceLost { group_mark, .. } => Some(group_mark),
            _ => None,
        }
    }
}

impl From<InvalidGroup> for AllocationError {
    fn from(err: InvalidGroup) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}
