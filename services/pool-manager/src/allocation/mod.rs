//! The allocation engine.
//!
//! An apply call runs, per group, matcher → scorer → zone pools → picker,
//! then reserves the winners with a compare-and-set. The whole call is
//! serialized per scope by a [`crate::lock::ScopeLocker`] lease and is all
//! or nothing across groups.

pub mod city;
mod error;
pub mod matcher;
pub mod picker;
pub mod pools;
pub mod scorer;
mod service;
pub mod storage;

pub use city::{CityResolver, StaticCityResolver};
pub use error::{AllocationError, AllocationResult};
pub use matcher::Matcher;
pub use picker::{Exhausted, Picked, Picker};
pub use pools::{Candidate, ZonePools};
pub use scorer::Scorer;
pub use service::{AllocationService, ApplyOutcome};
