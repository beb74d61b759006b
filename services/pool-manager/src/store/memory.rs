//! In-memory store.
//!
//! Implements the same compare-and-set semantics as the Postgres store with a
//! single write lock standing in for row locks. Used by the test suites.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    ConfirmOutcome, Predicate, ResourceStore, StaleReservation, StoreError, StoreResult,
};
use crate::model::{AuditEntry, HostId, ResourceRecord, ResourceStatus};

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<HostId, ResourceRecord>,
    archive: Vec<ResourceRecord>,
    audit: Vec<AuditEntry>,
}

#[derive(Clone, Default)]
pub struct MemoryResourceStore {
    state: Arc<RwLock<MemoryState>>,
    failing_writes: Arc<AtomicU32>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `records`.
    pub async fn with_records(records: impl IntoIterator<Item = ResourceRecord>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.write().await;
            for record in records {
                state.records.insert(record.host_id, record);
            }
        }
        store
    }

    pub async fn get(&self, host_id: HostId) -> Option<ResourceRecord> {
        self.state.read().await.records.get(&host_id).cloned()
    }

    pub async fn status_of(&self, host_id: HostId) -> Option<ResourceStatus> {
        self.get(host_id).await.map(|r| r.status)
    }

    /// Host ids currently in `status`.
    pub async fn hosts_in(&self, status: ResourceStatus) -> Vec<HostId> {
        self.state
            .read()
            .await
            .records
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.host_id)
            .collect()
    }

    /// Out-of-band status change, as the inspection job does.
    pub async fn force_status(&self, host_id: HostId, status: ResourceStatus) -> bool {
        let mut state = self.state.write().await;
        match state.records.get_mut(&host_id) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }

    /// Backdate a reservation, for reclaim tests.
    pub async fn set_preselected_at(&self, host_id: HostId, at: DateTime<Utc>) {
        if let Some(record) = self.state.write().await.records.get_mut(&host_id) {
            record.preselected_at = Some(at);
        }
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.state.read().await.audit.clone()
    }

    pub async fn archived(&self) -> Vec<ResourceRecord> {
        self.state.read().await.archive.clone()
    }

    /// Make the next `n` audit/archive writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> StoreResult<()> {
        let hit = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

fn clear_reservation(record: &mut ResourceRecord) {
    record.status = ResourceStatus::Unused;
    record.request_id = None;
    record.preselected_at = None;
}

fn held_by(record: &ResourceRecord, request_id: &str) -> bool {
    record.status == ResourceStatus::Preselected && record.request_id.as_deref() == Some(request_id)
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn find(&self, predicate: &Predicate) -> StoreResult<Vec<ResourceRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| predicate.evaluate(r))
            .cloned()
            .collect())
    }

    async fn upsert(&self, records: &[ResourceRecord]) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        // Staged so a conflicting record leaves the pool untouched.
        let mut staged = state.records.clone();
        for incoming in records {
            let existing_key = staged
                .values()
                .find(|r| r.cloud_id == incoming.cloud_id && r.ip == incoming.ip)
                .map(|r| r.host_id);

            if existing_key != Some(incoming.host_id) && staged.contains_key(&incoming.host_id) {
                return Err(StoreError::Conflict(format!(
                    "host {} already belongs to another address than {}/{}",
                    incoming.host_id, incoming.cloud_id, incoming.ip
                )));
            }

            let mut record = incoming.clone();
            match existing_key.and_then(|key| staged.remove(&key)) {
                Some(previous) => {
                    record.status = previous.status;
                    record.request_id = previous.request_id;
                    record.preselected_at = previous.preselected_at;
                }
                None => clear_reservation(&mut record),
            }
            staged.insert(record.host_id, record);
        }
        state.records = staged;
        Ok(records.len() as u64)
    }

    async fn reserve(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut updated = 0;
        let unique: BTreeSet<_> = host_ids.iter().copied().collect();
        for host_id in unique {
            if let Some(record) = state.records.get_mut(&host_id) {
                if record.status == ResourceStatus::Unused {
                    record.status = ResourceStatus::Preselected;
                    record.request_id = Some(request_id.to_string());
                    record.preselected_at = Some(now);
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn confirm(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<ConfirmOutcome> {
        let mut state = self.state.write().await;
        let unique: BTreeSet<_> = host_ids.iter().copied().collect();
        let found = unique
            .iter()
            .filter(|id| state.records.get(*id).is_some_and(|r| held_by(r, request_id)))
            .count();

        if found != host_ids.len() {
            return Ok(ConfirmOutcome::Mismatch {
                requested: host_ids.len(),
                found,
            });
        }

        let mut confirmed = Vec::with_capacity(found);
        for host_id in unique {
            if let Some(record) = state.records.get_mut(&host_id) {
                record.status = ResourceStatus::Used;
                confirmed.push(record.clone());
            }
        }
        Ok(ConfirmOutcome::Confirmed(confirmed))
    }

    async fn release(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<Vec<HostId>> {
        let mut state = self.state.write().await;
        let unique: BTreeSet<_> = host_ids.iter().copied().collect();
        let mut released = Vec::new();
        for host_id in unique {
            if let Some(record) = state.records.get_mut(&host_id) {
                if held_by(record, request_id) {
                    clear_reservation(record);
                    released.push(host_id);
                }
            }
        }
        Ok(released)
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StaleReservation>> {
        let mut state = self.state.write().await;
        let mut released = Vec::new();
        for record in state.records.values_mut() {
            let stale = record.status == ResourceStatus::Preselected
                && record.preselected_at.is_some_and(|at| at < cutoff);
            if stale {
                released.push(StaleReservation {
                    request_id: record.request_id.clone().unwrap_or_default(),
                    host_id: record.host_id,
                });
                clear_reservation(record);
            }
        }
        Ok(released)
    }

    async fn archive_used(&self, host_ids: &[HostId]) -> StoreResult<u64> {
        self.injected_failure()?;
        let mut state = self.state.write().await;
        let mut moved = 0;
        for host_id in host_ids {
            let is_used = state
                .records
                .get(host_id)
                .is_some_and(|r| r.status == ResourceStatus::Used);
            if is_used {
                if let Some(record) = state.records.remove(host_id) {
                    state.archive.push(record);
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    async fn append_audit(&self, entries: &[AuditEntry]) -> StoreResult<()> {
        self.injected_failure()?;
        self.state.write().await.audit.extend_from_slice(entries);
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
