//! The persisted host pool.
//!
//! Every `status` mutation goes through [`ResourceStore::reserve`],
//! [`ResourceStore::confirm`] or one of the release methods. Each is a
//! compare-and-set on the current status, so a caller can tell from the
//! returned row count whether another process got there first.

mod error;
pub mod memory;
pub mod postgres;
pub mod predicate;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryResourceStore;
pub use postgres::PgResourceStore;
pub use predicate::{Field, Predicate, Value};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{AuditEntry, HostId, ResourceRecord};

/// Result of a confirm attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    /// All rows moved to `Used`.
    Confirmed(Vec<ResourceRecord>),
    /// The locked re-read did not match; nothing changed.
    Mismatch { requested: usize, found: usize },
}

/// A reservation reclaimed by [`ResourceStore::release_stale`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleReservation {
    pub request_id: String,
    pub host_id: HostId,
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Records matching `predicate`, ordered by host id.
    async fn find(&self, predicate: &Predicate) -> StoreResult<Vec<ResourceRecord>>;

    /// Insert or refresh inventory rows. Never changes the status of an existing row.
    async fn upsert(&self, records: &[ResourceRecord]) -> StoreResult<u64>;

    /// `Unused -> Preselected` for each id; returns the number of rows changed.
    async fn reserve(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<u64>;

    /// Row-locked `Preselected -> Used`, all or nothing.
    async fn confirm(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<ConfirmOutcome>;

    /// `Preselected -> Unused` for rows still held by `request_id`; returns
    /// the ids actually released, each once.
    async fn release(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<Vec<HostId>>;

    /// Release every reservation taken before `cutoff`.
    async fn release_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StaleReservation>>;

    /// Move `Used` rows to the archive; returns the number moved.
    async fn archive_used(&self, host_ids: &[HostId]) -> StoreResult<u64>;

    async fn append_audit(&self, entries: &[AuditEntry]) -> StoreResult<()>;

    async fn health_check(&self) -> StoreResult<()>;
}
