use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use respool_id::RequestId;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};

use super::city::CityResolver;
use super::error::{AllocationError, AllocationResult};
use super::matcher::Matcher;
use super::picker::{Picked, Picker};
use super::pools::{Candidate, ZonePools};
use super::scorer::Scorer;
use crate::lock::{LockError, ScopeLocker};
use crate::model::{
    AllocationGroup, ApplyRequest, AuditAction, AuditEntry, GroupAllocation, HostId,
    ResourceRecord, ResourceStatus, Scope,
};
use crate::pipeline::PipelineHandle;
use crate::store::{ConfirmOutcome, ResourceStore};

/// Result of an apply call, keyed by group mark.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub request_id: RequestId,
    pub dry_run: bool,
    pub groups: BTreeMap<String, GroupAllocation>,
}

/// Reserve, confirm and roll back hosts.
///
/// Holds explicit handles to the store, lock, city resolver and pipeline;
/// the process entry point owns their lifecycle.
#[derive(Clone)]
pub struct AllocationService {
    store: Arc<dyn ResourceStore>,
    locker: ScopeLocker,
    cities: Arc<dyn CityResolver>,
    pipeline: PipelineHandle,
}

impl AllocationService {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        locker: ScopeLocker,
        cities: Arc<dyn CityResolver>,
        pipeline: PipelineHandle,
    ) -> Self {
        Self {
            store,
            locker,
            cities,
            pipeline,
        }
    }

    /// Pick hosts for every group and, unless `dry_run`, reserve them.
    #[instrument(
        skip(self, request),
        fields(request_id = %request_id, scope = %request.scope, dry_run = request.dry_run)
    )]
    pub async fn apply(
        &self,
        request_id: RequestId,
        request: &ApplyRequest,
    ) -> AllocationResult<ApplyOutcome> {
        request.validate()?;

        if request.dry_run {
            let groups = self.plan_dry_run(request).await?;
            info!(groups = groups.len(), "Dry run feasible");
            return Ok(ApplyOutcome {
                request_id,
                dry_run: true,
                groups,
            });
        }

        // Detached: a dropped caller must not strand reserved groups or the lock.
        let service = self.clone();
        let owned = request.clone();
        let groups = tokio::spawn(
            async move { service.reserve_locked(request_id, &owned).await }
                .instrument(Span::current()),
        )
        .await
        .map_err(|e| AllocationError::Internal(e.to_string()))??;

        let hosts: usize = groups.values().map(|g| g.host_ids.len()).sum();
        info!(groups = groups.len(), hosts, "Reserved hosts");

        Ok(ApplyOutcome {
            request_id,
            dry_run: false,
            groups,
        })
    }

    /// Lock the scope, reserve every group and record one audit entry per
    /// group. The lock is released whatever the outcome.
    async fn reserve_locked(
        &self,
        request_id: RequestId,
        request: &ApplyRequest,
    ) -> AllocationResult<BTreeMap<String, GroupAllocation>> {
        let lease = self
            .locker
            .acquire(&request.scope)
            .await
            .map_err(|err| match err {
                LockError::Timeout { attempts, .. } => AllocationError::LockTimeout {
                    scope: request.scope.to_string(),
                    attempts,
                },
                other => AllocationError::Lock(other),
            })?;

        let result = self.reserve_all(&request_id, request).await;

        if let Err(e) = self.locker.release(lease).await {
            warn!(error = %e, "Failed to release scope lock; it will expire");
        }

        let mut groups = BTreeMap::new();
        for (group_mark, picked) in result? {
            let allocation = reserved_allocation(&picked, &request_id);
            self.pipeline
                .record(
                    AuditEntry::new(
                        request_id.to_string(),
                        AuditAction::Reserved,
                        allocation.host_ids.clone(),
                    )
                    .with_group(group_mark.clone())
                    .with_detail(json!({
                        "scope": request.scope,
                        "per_zone": picked.per_zone,
                    })),
                )
                .await;
            groups.insert(group_mark, allocation);
        }
        Ok(groups)
    }

    /// Move a request's reserved hosts to `Used`, all or nothing.
    #[instrument(skip(self, host_ids), fields(request_id = %request_id, hosts = host_ids.len()))]
    pub async fn confirm(
        &self,
        request_id: &RequestId,
        host_ids: &[HostId],
    ) -> AllocationResult<Vec<ResourceRecord>> {
        if host_ids.is_empty() {
            return Err(AllocationError::InvalidRequest(
                "host_ids cannot be empty".to_string(),
            ));
        }

        match self.store.confirm(&request_id.to_string(), host_ids).await? {
            ConfirmOutcome::Mismatch { requested, found } => {
                warn!(requested, found, "Confirm mismatch; nothing changed");
                Err(AllocationError::ConfirmMismatch { requested, found })
            }
            ConfirmOutcome::Confirmed(records) => {
                let confirmed: Vec<HostId> = records.iter().map(|r| r.host_id).collect();
                self.pipeline
                    .record(AuditEntry::new(
                        request_id.to_string(),
                        AuditAction::Confirmed,
                        confirmed.clone(),
                    ))
                    .await;
                self.pipeline.archive(confirmed).await;
                info!(hosts = records.len(), "Confirmed hosts");
                Ok(records)
            }
        }
    }

    /// Return a request's still-reserved hosts to the pool. Repeating the
    /// call is a no-op.
    #[instrument(skip(self, host_ids), fields(request_id = %request_id, hosts = host_ids.len()))]
    pub async fn rollback(&self, request_id: &RequestId, host_ids: &[HostId]) -> AllocationResult<u64> {
        let released = self.store.release(&request_id.to_string(), host_ids).await?;
        if !released.is_empty() {
            self.pipeline
                .record(AuditEntry::new(
                    request_id.to_string(),
                    AuditAction::RolledBack,
                    released.clone(),
                ))
                .await;
        }
        info!(released = released.len(), requested = host_ids.len(), "Rolled back reservation");
        Ok(released.len() as u64)
    }

    /// Insert or refresh inventory records.
    #[instrument(skip_all, fields(records = records.len()))]
    pub async fn import(&self, records: &[ResourceRecord]) -> AllocationResult<u64> {
        let mut seen = BTreeSet::new();
        for record in records {
            if record.ip.trim().is_empty() {
                return Err(AllocationError::InvalidRequest(format!(
                    "host {} has an empty ip",
                    record.host_id
                )));
            }
            if !seen.insert(record.host_id) {
                return Err(AllocationError::InvalidRequest(format!(
                    "duplicate host_id {}",
                    record.host_id
                )));
            }
        }

        let upserted = self.store.upsert(records).await?;
        info!(upserted, "Imported pool records");
        Ok(upserted)
    }

    pub async fn check_store(&self) -> AllocationResult<()> {
        Ok(self.store.health_check().await?)
    }

    pub async fn check_lock(&self) -> AllocationResult<()> {
        self.locker.ping().await.map_err(AllocationError::Lock)
    }

    async fn plan_dry_run(
        &self,
        request: &ApplyRequest,
    ) -> AllocationResult<BTreeMap<String, GroupAllocation>> {
        let mut taken = BTreeSet::new();
        let mut groups = BTreeMap::new();
        for group in &request.groups {
            let picked = self.plan_group(&request.scope, group, &taken).await?;
            taken.extend(picked.host_ids());
            groups.insert(group.group_mark.clone(), allocation(&picked));
        }
        Ok(groups)
    }

    /// Reserve every group, releasing earlier groups if a later one fails.
    async fn reserve_all(
        &self,
        request_id: &RequestId,
        request: &ApplyRequest,
    ) -> AllocationResult<Vec<(String, Picked)>> {
        let holder = request_id.to_string();
        self.precheck(request).await?;

        let mut reserved: Vec<HostId> = Vec::new();
        let mut picked_groups = Vec::with_capacity(request.groups.len());
        for group in &request.groups {
            match self.reserve_group(&holder, &request.scope, group).await {
                Ok(picked) => {
                    reserved.extend(picked.host_ids());
                    picked_groups.push((group.group_mark.clone(), picked));
                }
                Err(err) => {
                    self.release_quietly(&holder, &reserved).await;
                    return Err(err);
                }
            }
        }
        Ok(picked_groups)
    }

    /// Count matches for every group before anything is mutated.
    async fn precheck(&self, request: &ApplyRequest) -> AllocationResult<()> {
        let matcher = Matcher::new(self.store.as_ref());
        for group in &request.groups {
            let cities = self.resolve_cities(group);
            let available = matcher
                .candidates(&request.scope, group, &cities, &BTreeSet::new())
                .await?
                .len();
            if available < group.count {
                warn!(group_mark = %group.group_mark, requested = group.count, available, "Pre-check failed");
                return Err(AllocationError::Insufficient {
                    group_mark: group.group_mark.clone(),
                    requested: group.count,
                    available,
                });
            }
        }
        Ok(())
    }

    async fn reserve_group(
        &self,
        holder: &str,
        scope: &Scope,
        group: &AllocationGroup,
    ) -> AllocationResult<Picked> {
        let picked = self.plan_group(scope, group, &BTreeSet::new()).await?;
        let host_ids = picked.host_ids();

        let reserved = match self.store.reserve(holder, &host_ids).await {
            Ok(n) => n as usize,
            Err(e) => {
                self.release_quietly(holder, &host_ids).await;
                return Err(e.into());
            }
        };

        if reserved != host_ids.len() {
            warn!(
                group_mark = %group.group_mark,
                requested = host_ids.len(),
                reserved,
                "Reservation race lost"
            );
            self.release_quietly(holder, &host_ids).await;
            return Err(AllocationError::RaceLost {
                group_mark: group.group_mark.clone(),
                requested: host_ids.len(),
                reserved,
            });
        }

        debug!(group_mark = %group.group_mark, hosts = reserved, "Group reserved");
        Ok(picked)
    }

    /// Match, score, bucket and pick one group without mutating anything.
    async fn plan_group(
        &self,
        scope: &Scope,
        group: &AllocationGroup,
        exclude: &BTreeSet<HostId>,
    ) -> AllocationResult<Picked> {
        let cities = self.resolve_cities(group);
        let records = Matcher::new(self.store.as_ref())
            .candidates(scope, group, &cities, exclude)
            .await?;

        if records.len() < group.count {
            return Err(AllocationError::Insufficient {
                group_mark: group.group_mark.clone(),
                requested: group.count,
                available: records.len(),
            });
        }

        let scorer = Scorer::new(scope, group);
        let candidates: Vec<Candidate> = records
            .into_iter()
            .enumerate()
            .map(|(seq, record)| {
                let score = scorer.score(&record);
                Candidate::new(record, score, seq as u64)
            })
            .collect();

        let mut pools = ZonePools::build(candidates, group.affinity);
        Picker::for_group(group)
            .pick(&mut pools)
            .map_err(|exhausted| {
                warn!(
                    group_mark = %group.group_mark,
                    affinity = group.affinity.as_str(),
                    requested = exhausted.requested,
                    picked = exhausted.picked,
                    "Candidate pools exhausted"
                );
                AllocationError::Exhausted {
                    group_mark: group.group_mark.clone(),
                    requested: exhausted.requested,
                    picked: exhausted.picked,
                }
            })
    }

    fn resolve_cities(&self, group: &AllocationGroup) -> Vec<String> {
        if group.location_spec.city.is_empty() {
            return Vec::new();
        }
        self.cities.resolve(&group.location_spec.city)
    }

    async fn release_quietly(&self, holder: &str, host_ids: &[HostId]) {
        if host_ids.is_empty() {
            return;
        }
        match self.store.release(holder, host_ids).await {
            Ok(released) => debug!(released = released.len(), "Released partial reservation"),
            Err(e) => error!(
                error = %e,
                hosts = host_ids.len(),
                "Failed to release partial reservation; the reaper will reclaim it"
            ),
        }
    }
}

fn allocation(picked: &Picked) -> GroupAllocation {
    GroupAllocation {
        host_ids: picked.host_ids(),
        hosts: picked.candidates.iter().map(|c| c.record.clone()).collect(),
    }
}

fn reserved_allocation(picked: &Picked, request_id: &RequestId) -> GroupAllocation {
    let mut allocation = allocation(picked);
    for host in &mut allocation.hosts {
        host.status = ResourceStatus::Preselected;
        host.request_id = Some(request_id.to_string());
    }
    allocation
}
