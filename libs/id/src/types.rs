//! Concrete id families.

use crate::{prefixed_id, IdError, Ulid};

prefixed_id!(
    /// Identifies one apply call; stamped on every row it reserves.
    RequestId,
    "req"
);

prefixed_id!(
    /// Ownership proof stored as the value of a scope lock key.
    LockToken,
    "lck"
);

#[doc(hidden)]
pub fn split_prefixed(s: &str, expected: &'static str) -> Result<Ulid, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    let Some((prefix, rest)) = s.split_once('_') else {
        return Err(IdError::MissingSeparator);
    };

    if prefix != expected {
        return Err(IdError::WrongPrefix {
            expected,
            actual: prefix.to_string(),
        });
    }

    rest.parse::<Ulid>()
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}
