//! # respool-id
//!
//! Identifiers handed out by the allocation service.
//!
//! Every id renders as `{prefix}_{ulid}`:
//!
//! - `req_01HV4Z2WQXKJNM8GPQY6VBKC3D` identifies one apply call and every
//!   reservation it made
//! - `lck_01HV4Z3MXNKPQR9HSTZ7WCLD4E` is the random value stored under a
//!   scope lock key, proving ownership on release
//!
//! Parsing is strict: the prefix must match the type and the suffix must be
//! a valid ULID. Callers that submit a `Confirm` or `Rollback` pass ids back
//! as strings, so a typo surfaces as a parse error rather than a silent miss.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;
