//! End-to-end allocation behaviour on the in-memory store and lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use respool_id::RequestId;
use respool_pool_manager::{
    allocation::{AllocationError, AllocationService, StaticCityResolver},
    lock::{LockBackend, LockConfig, MemoryLockBackend, ScopeLocker},
    model::{
        AffinityMode, AllocationGroup, ApplyRequest, AuditAction, AuditEntry, HostId, IntRange,
        ResourceRecord, ResourceStatus, Scope,
    },
    pipeline::{Pipeline, PipelineConfig, PipelineHandle},
    store::{
        ConfirmOutcome, MemoryResourceStore, Predicate, ResourceStore, StaleReservation,
        StoreError, StoreResult,
    },
};
use respool_retry::RetryPolicy;
use rstest::rstest;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

const CITY: &str = "shenzhen";

fn scope() -> Scope {
    Scope {
        cloud_id: 0,
        resource_type: "mysql".to_string(),
        business_id: 100,
    }
}

fn host(id: HostId, subzone: &str) -> ResourceRecord {
    let mut record = ResourceRecord::new(id, 0, format!("10.1.{}.{}", id / 256, id % 256));
    record.cpu_cores = 8;
    record.mem_mb = 16_000;
    record.city = CITY.to_string();
    record.subzone = subzone.to_string();
    record.rack_id = format!("rack-{id}");
    record.network_device_ids = BTreeSet::from([format!("switch-{id}")]);
    record
}

fn classed(id: HostId, subzone: &str, device_class: &str) -> ResourceRecord {
    let mut record = host(id, subzone);
    record.device_class = device_class.to_string();
    record
}

fn located(mark: &str, count: usize, affinity: AffinityMode) -> AllocationGroup {
    let mut group = AllocationGroup::new(mark, count);
    group.affinity = affinity;
    group.location_spec.city = CITY.to_string();
    group
}

fn apply_request(groups: Vec<AllocationGroup>) -> ApplyRequest {
    ApplyRequest {
        scope: scope(),
        dry_run: false,
        groups,
    }
}

fn fast_lock(max_attempts: u32) -> LockConfig {
    LockConfig {
        ttl: Duration::from_secs(30),
        max_attempts,
        retry_delay: Duration::from_millis(2),
        retry_jitter: Duration::from_millis(1),
    }
}

struct Harness {
    store: MemoryResourceStore,
    locks: MemoryLockBackend,
    service: AllocationService,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Harness {
    async fn new(records: Vec<ResourceRecord>) -> Self {
        let store = MemoryResourceStore::with_records(records).await;
        Self::with_store(store.clone(), Arc::new(store), 500).await
    }

    async fn with_store(
        store: MemoryResourceStore,
        engine_store: Arc<dyn ResourceStore>,
        lock_attempts: u32,
    ) -> Self {
        let locks = MemoryLockBackend::new();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (pipeline, workers) = Pipeline::spawn(
            engine_store.clone(),
            PipelineConfig {
                capacity: 16,
                batch_size: 8,
                retry: RetryPolicy::fixed(3, Duration::from_millis(1), Duration::ZERO),
            },
            shutdown_rx,
        );
        let cities = StaticCityResolver::new(BTreeMap::from([(
            "south".to_string(),
            vec![CITY.to_string()],
        )]));
        let service = AllocationService::new(
            engine_store,
            ScopeLocker::new(Arc::new(locks.clone()), fast_lock(lock_attempts)),
            Arc::new(cities),
            pipeline,
        );

        Self {
            store,
            locks,
            service,
            shutdown,
            workers,
        }
    }

    /// Stop the pipeline and wait until everything queued is persisted.
    async fn drain(self) -> MemoryResourceStore {
        let Self {
            store,
            service,
            shutdown,
            workers,
            ..
        } = self;
        drop(service);
        shutdown.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap();
        }
        store
    }
}

fn sorted(mut ids: Vec<HostId>) -> Vec<HostId> {
    ids.sort();
    ids
}

fn actions(audit: &[AuditEntry]) -> Vec<AuditAction> {
    audit.iter().map(|e| e.action).collect()
}

#[tokio::test]
async fn device_class_same_subzone_takes_exactly_the_classed_hosts() {
    let mut records = vec![
        classed(1, "A", "D1"),
        classed(2, "A", "D1"),
        classed(3, "A", "D1"),
        classed(4, "A", "D2"),
        classed(5, "A", "D2"),
    ];
    records.extend((6..=9).map(|id| classed(id, "B", "D2")));
    let harness = Harness::new(records).await;

    let mut group = located("master", 3, AffinityMode::SameSubzone);
    group.location_spec.city = "south".to_string();
    group.device_classes = vec!["D1".to_string()];

    let outcome = harness
        .service
        .apply(RequestId::new(), &apply_request(vec![group]))
        .await
        .unwrap();

    let master = &outcome.groups["master"];
    assert_eq!(sorted(master.host_ids.clone()), vec![1, 2, 3]);
    assert!(master.hosts.iter().all(|h| h.subzone == "A"));
    assert_eq!(
        sorted(harness.store.hosts_in(ResourceStatus::Preselected).await),
        vec![1, 2, 3]
    );

    let store = harness.drain().await;
    assert_eq!(actions(&store.audit_log().await), vec![AuditAction::Reserved]);
}

#[tokio::test]
async fn precheck_shortage_fails_without_mutation() {
    let mut small = host(1, "A");
    small.cpu_cores = 8;
    small.mem_mb = 16_000;
    let mut too_big = host(2, "A");
    too_big.cpu_cores = 32;
    let mut too_little_mem = host(3, "A");
    too_little_mem.mem_mb = 4_000;
    let harness = Harness::new(vec![small, too_big, too_little_mem]).await;

    let mut group = AllocationGroup::new("g", 2);
    group.spec.cpu = IntRange::new(4, 8);
    group.spec.mem = IntRange::new(8_000, 16_000);

    let err = harness
        .service
        .apply(RequestId::new(), &apply_request(vec![group]))
        .await
        .unwrap_err();

    match err {
        AllocationError::Insufficient {
            group_mark,
            requested,
            available,
        } => {
            assert_eq!(group_mark, "g");
            assert_eq!((requested, available), (2, 1));
        }
        other => panic!("expected Insufficient, got {other:?}"),
    }
    assert_eq!(harness.store.hosts_in(ResourceStatus::Unused).await.len(), 3);

    let store = harness.drain().await;
    assert!(store.audit_log().await.is_empty());
}

#[tokio::test]
async fn later_group_failure_releases_earlier_groups() {
    let mut records: Vec<ResourceRecord> = (1..=4).map(|id| classed(id, "A", "D1")).collect();
    records.push(classed(5, "B", "D2"));
    records.push(classed(6, "B", "D2"));
    records.push(classed(7, "C", "D2"));
    let harness = Harness::new(records).await;

    let mut first = AllocationGroup::new("first", 2);
    first.device_classes = vec!["D1".to_string()];
    // Three D2 hosts exist, so the pre-check passes, but no subzone has three.
    let mut second = located("second", 3, AffinityMode::SameSubzone);
    second.device_classes = vec!["D2".to_string()];

    let request_id = RequestId::new();
    let err = harness
        .service
        .apply(request_id, &apply_request(vec![first, second]))
        .await
        .unwrap_err();

    assert!(
        matches!(err, AllocationError::Exhausted { ref group_mark, requested: 3, .. } if group_mark == "second"),
        "got {err:?}"
    );
    assert!(harness.store.hosts_in(ResourceStatus::Preselected).await.is_empty());
    for id in 1..=7 {
        let record = harness.store.get(id).await.unwrap();
        assert_ne!(record.request_id, Some(request_id.to_string()));
    }
}

#[tokio::test]
async fn rollback_is_idempotent() {
    let harness = Harness::new((1..=3).map(|id| host(id, "A")).collect()).await;
    let request_id = RequestId::new();

    let outcome = harness
        .service
        .apply(request_id, &apply_request(vec![AllocationGroup::new("g", 2)]))
        .await
        .unwrap();
    let ids = outcome.groups["g"].host_ids.clone();

    assert_eq!(harness.service.rollback(&request_id, &ids).await.unwrap(), 2);
    assert_eq!(harness.service.rollback(&request_id, &ids).await.unwrap(), 0);
    assert_eq!(harness.store.hosts_in(ResourceStatus::Unused).await.len(), 3);

    let store = harness.drain().await;
    assert_eq!(
        actions(&store.audit_log().await),
        vec![AuditAction::Reserved, AuditAction::RolledBack]
    );
}

#[tokio::test]
async fn rollback_never_touches_used_or_foreign_rows() {
    let harness = Harness::new((1..=4).map(|id| host(id, "A")).collect()).await;
    let ours = RequestId::new();
    let theirs = RequestId::new();

    let mine = harness
        .service
        .apply(ours, &apply_request(vec![AllocationGroup::new("g", 2)]))
        .await
        .unwrap();
    let other = harness
        .service
        .apply(theirs, &apply_request(vec![AllocationGroup::new("g", 2)]))
        .await
        .unwrap();
    let mine = mine.groups["g"].host_ids.clone();
    let other = other.groups["g"].host_ids.clone();

    harness.service.confirm(&ours, &mine[..1]).await.unwrap();

    let mut everything = mine.clone();
    everything.extend(&other);
    assert_eq!(harness.service.rollback(&ours, &everything).await.unwrap(), 1);

    // Confirmed rows are archived in the background.
    assert!(matches!(
        harness.store.status_of(mine[0]).await,
        Some(ResourceStatus::Used) | None
    ));
    assert_eq!(harness.store.status_of(mine[1]).await, Some(ResourceStatus::Unused));
    for id in &other {
        assert_eq!(harness.store.status_of(*id).await, Some(ResourceStatus::Preselected));
    }

    // The audit names only the host that actually went back to the pool.
    let store = harness.drain().await;
    let rolled_back: Vec<AuditEntry> = store
        .audit_log()
        .await
        .into_iter()
        .filter(|e| e.action == AuditAction::RolledBack)
        .collect();
    assert_eq!(rolled_back.len(), 1);
    assert_eq!(rolled_back[0].request_id, ours.to_string());
    assert_eq!(rolled_back[0].host_ids, vec![mine[1]]);
}

#[tokio::test]
async fn rollback_of_nothing_held_is_not_audited() {
    let harness = Harness::new((1..=2).map(|id| host(id, "A")).collect()).await;
    let holder = RequestId::new();
    let outcome = harness
        .service
        .apply(holder, &apply_request(vec![AllocationGroup::new("g", 2)]))
        .await
        .unwrap();
    let ids = outcome.groups["g"].host_ids.clone();

    assert_eq!(harness.service.rollback(&RequestId::new(), &ids).await.unwrap(), 0);

    let store = harness.drain().await;
    assert_eq!(actions(&store.audit_log().await), vec![AuditAction::Reserved]);
}

#[tokio::test]
async fn confirm_is_exact_and_archives() {
    let harness = Harness::new((1..=4).map(|id| host(id, "A")).collect()).await;
    let request_id = RequestId::new();

    let outcome = harness
        .service
        .apply(request_id, &apply_request(vec![AllocationGroup::new("g", 2)]))
        .await
        .unwrap();
    let ids = outcome.groups["g"].host_ids.clone();
    let stranger = (1..=4).find(|id| !ids.contains(id)).unwrap();

    let mut padded = ids.clone();
    padded.push(stranger);
    let err = harness.service.confirm(&request_id, &padded).await.unwrap_err();
    assert!(matches!(
        err,
        AllocationError::ConfirmMismatch {
            requested: 3,
            found: 2
        }
    ));
    for id in &ids {
        assert_eq!(harness.store.status_of(*id).await, Some(ResourceStatus::Preselected));
    }

    let wrong_request = RequestId::new();
    assert!(harness.service.confirm(&wrong_request, &ids).await.is_err());

    let confirmed = harness.service.confirm(&request_id, &ids).await.unwrap();
    assert_eq!(confirmed.len(), 2);
    assert!(confirmed.iter().all(|r| r.status == ResourceStatus::Used));

    let store = harness.drain().await;
    let archived: Vec<HostId> = store.archived().await.iter().map(|r| r.host_id).collect();
    assert_eq!(sorted(archived), sorted(ids));
    assert_eq!(
        actions(&store.audit_log().await),
        vec![AuditAction::Reserved, AuditAction::Confirmed]
    );
}

#[tokio::test]
async fn dry_run_reserves_nothing_and_keeps_groups_disjoint() {
    let harness = Harness::new((1..=4).map(|id| host(id, "A")).collect()).await;

    // A held scope lock must not matter for a dry run.
    harness
        .locks
        .try_acquire(&scope().lock_key(), "someone-else", Duration::from_secs(30))
        .await
        .unwrap();

    let mut request = apply_request(vec![AllocationGroup::new("a", 2), AllocationGroup::new("b", 2)]);
    request.dry_run = true;
    let outcome = harness.service.apply(RequestId::new(), &request).await.unwrap();

    assert!(outcome.dry_run);
    let a: BTreeSet<_> = outcome.groups["a"].host_ids.iter().copied().collect();
    let b: BTreeSet<_> = outcome.groups["b"].host_ids.iter().copied().collect();
    assert!(a.is_disjoint(&b));
    assert_eq!(harness.store.hosts_in(ResourceStatus::Unused).await.len(), 4);

    request.groups.push(AllocationGroup::new("c", 1));
    let err = harness.service.apply(RequestId::new(), &request).await.unwrap_err();
    assert!(matches!(err, AllocationError::Insufficient { available: 0, .. }));
}

#[tokio::test]
async fn held_scope_lock_times_out() {
    let store = MemoryResourceStore::with_records(vec![host(1, "A")]).await;
    let harness = Harness::with_store(store.clone(), Arc::new(store), 3).await;
    harness
        .locks
        .try_acquire(&scope().lock_key(), "someone-else", Duration::from_secs(30))
        .await
        .unwrap();

    let err = harness
        .service
        .apply(RequestId::new(), &apply_request(vec![AllocationGroup::new("g", 1)]))
        .await
        .unwrap_err();

    assert!(matches!(err, AllocationError::LockTimeout { attempts: 3, .. }));
    assert!(err.is_retryable());
    assert_eq!(harness.store.status_of(1).await, Some(ResourceStatus::Unused));
}

#[tokio::test]
async fn prepossessed_hosts_are_never_allocated() {
    let harness = Harness::new((1..=3).map(|id| host(id, "A")).collect()).await;
    harness.store.force_status(2, ResourceStatus::Prepossessed).await;

    let outcome = harness
        .service
        .apply(RequestId::new(), &apply_request(vec![AllocationGroup::new("g", 2)]))
        .await
        .unwrap();

    assert_eq!(sorted(outcome.groups["g"].host_ids.clone()), vec![1, 3]);
    assert_eq!(harness.store.status_of(2).await, Some(ResourceStatus::Prepossessed));
}

#[rstest]
#[case::cross_subzone(AffinityMode::CrossSubzone)]
#[case::same_subzone(AffinityMode::SameSubzone)]
#[case::cross_switch(AffinityMode::SameSubzoneCrossSwitch)]
#[tokio::test]
async fn affinity_modes_respect_layout(#[case] affinity: AffinityMode) {
    let mut records: Vec<ResourceRecord> = Vec::new();
    for (offset, zone) in ["A", "B", "C"].iter().enumerate() {
        for i in 0..4 {
            let id = (offset * 10 + i) as HostId;
            let mut record = host(id, zone);
            // Two hosts per zone share a rack.
            record.rack_id = format!("{zone}-rack-{}", i % 3);
            records.push(record);
        }
    }
    let harness = Harness::new(records).await;

    let outcome = harness
        .service
        .apply(RequestId::new(), &apply_request(vec![located("g", 3, affinity)]))
        .await
        .unwrap();
    let hosts = &outcome.groups["g"].hosts;
    assert_eq!(hosts.len(), 3);

    let zones: BTreeSet<&str> = hosts.iter().map(|h| h.subzone.as_str()).collect();
    let racks: BTreeSet<&str> = hosts.iter().map(|h| h.rack_id.as_str()).collect();
    match affinity {
        AffinityMode::CrossSubzone => assert_eq!(zones.len(), 3),
        AffinityMode::SameSubzone => assert_eq!(zones.len(), 1),
        AffinityMode::SameSubzoneCrossSwitch => {
            assert_eq!(zones.len(), 1);
            assert_eq!(racks.len(), 3);
        }
        AffinityMode::None => unreachable!(),
    }
}

#[rstest]
#[case(8, 3, 10)]
#[case(16, 2, 12)]
#[case(6, 4, 25)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_applies_never_double_allocate(
    #[case] callers: usize,
    #[case] count: usize,
    #[case] pool_size: i64,
) {
    let harness = Harness::new((1..=pool_size).map(|id| host(id, "A")).collect()).await;
    let service = harness.service.clone();

    let attempts = (0..callers).map(|_| {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .apply(RequestId::new(), &apply_request(vec![AllocationGroup::new("g", count)]))
                .await
        })
    });
    let results = join_all(attempts).await;

    let mut seen = BTreeSet::new();
    let mut successes = 0;
    for result in results {
        match result.unwrap() {
            Ok(outcome) => {
                successes += 1;
                for id in &outcome.groups["g"].host_ids {
                    assert!(seen.insert(*id), "host {id} allocated twice");
                }
            }
            Err(err) => assert!(
                matches!(err, AllocationError::Insufficient { .. }),
                "unexpected failure: {err:?}"
            ),
        }
    }

    assert!(successes * count <= pool_size as usize);
    assert_eq!(successes, (pool_size as usize / count).min(callers));
    assert_eq!(
        harness.store.hosts_in(ResourceStatus::Preselected).await.len(),
        successes * count
    );
}

/// Lets a competing request grab one host between picking and reserving.
struct RacingStore {
    inner: MemoryResourceStore,
    raced: AtomicBool,
}

#[async_trait]
impl ResourceStore for RacingStore {
    async fn find(&self, predicate: &Predicate) -> StoreResult<Vec<ResourceRecord>> {
        self.inner.find(predicate).await
    }

    async fn upsert(&self, records: &[ResourceRecord]) -> StoreResult<u64> {
        self.inner.upsert(records).await
    }

    async fn reserve(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<u64> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            self.inner.reserve("req_intruder", &host_ids[..1]).await?;
        }
        self.inner.reserve(request_id, host_ids).await
    }

    async fn confirm(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<ConfirmOutcome> {
        self.inner.confirm(request_id, host_ids).await
    }

    async fn release(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<Vec<HostId>> {
        self.inner.release(request_id, host_ids).await
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StaleReservation>> {
        self.inner.release_stale(cutoff).await
    }

    async fn archive_used(&self, host_ids: &[HostId]) -> StoreResult<u64> {
        self.inner.archive_used(host_ids).await
    }

    async fn append_audit(&self, entries: &[AuditEntry]) -> StoreResult<()> {
        self.inner.append_audit(entries).await
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.inner.health_check().await
    }
}

#[tokio::test]
async fn lost_reservation_race_is_detected_and_cleaned_up() {
    let store = MemoryResourceStore::with_records((1..=3).map(|id| host(id, "A"))).await;
    let racing = Arc::new(RacingStore {
        inner: store.clone(),
        raced: AtomicBool::new(false),
    });
    let harness = Harness::with_store(store.clone(), racing, 10).await;

    let err = harness
        .service
        .apply(RequestId::new(), &apply_request(vec![AllocationGroup::new("g", 2)]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AllocationError::RaceLost {
            requested: 2,
            reserved: 1,
            ..
        }
    ));
    assert!(err.is_retryable());

    let held = store.hosts_in(ResourceStatus::Preselected).await;
    assert_eq!(held.len(), 1, "only the intruder's host stays reserved");
    let intruder = store.get(held[0]).await.unwrap();
    assert_eq!(intruder.request_id.as_deref(), Some("req_intruder"));

    // The retry sees the reduced pool and succeeds.
    let outcome = harness
        .service
        .apply(RequestId::new(), &apply_request(vec![AllocationGroup::new("g", 2)]))
        .await
        .unwrap();
    assert!(!outcome.groups["g"].host_ids.contains(&held[0]));
}

/// Stalls the second reserve call until released, then fails it.
struct StallingStore {
    inner: MemoryResourceStore,
    reserves: AtomicU32,
    stalled: Notify,
    resume: Notify,
}

#[async_trait]
impl ResourceStore for StallingStore {
    async fn find(&self, predicate: &Predicate) -> StoreResult<Vec<ResourceRecord>> {
        self.inner.find(predicate).await
    }

    async fn upsert(&self, records: &[ResourceRecord]) -> StoreResult<u64> {
        self.inner.upsert(records).await
    }

    async fn reserve(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<u64> {
        if self.reserves.fetch_add(1, Ordering::SeqCst) == 1 {
            self.stalled.notify_one();
            self.resume.notified().await;
            return Err(StoreError::Unavailable("stalled reserve".to_string()));
        }
        self.inner.reserve(request_id, host_ids).await
    }

    async fn confirm(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<ConfirmOutcome> {
        self.inner.confirm(request_id, host_ids).await
    }

    async fn release(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<Vec<HostId>> {
        self.inner.release(request_id, host_ids).await
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StaleReservation>> {
        self.inner.release_stale(cutoff).await
    }

    async fn archive_used(&self, host_ids: &[HostId]) -> StoreResult<u64> {
        self.inner.archive_used(host_ids).await
    }

    async fn append_audit(&self, entries: &[AuditEntry]) -> StoreResult<()> {
        self.inner.append_audit(entries).await
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.inner.health_check().await
    }
}

#[tokio::test]
async fn abandoned_apply_still_releases_groups_and_lock() {
    let store = MemoryResourceStore::with_records((1..=2).map(|id| host(id, "A"))).await;
    let stalling = Arc::new(StallingStore {
        inner: store.clone(),
        reserves: AtomicU32::new(0),
        stalled: Notify::new(),
        resume: Notify::new(),
    });
    let harness = Harness::with_store(store.clone(), stalling.clone(), 10).await;

    let service = harness.service.clone();
    let caller = tokio::spawn(async move {
        service
            .apply(
                RequestId::new(),
                &apply_request(vec![
                    AllocationGroup::new("first", 1),
                    AllocationGroup::new("second", 1),
                ]),
            )
            .await
    });

    // First group reserved, second stuck; now the caller goes away.
    stalling.stalled.notified().await;
    assert_eq!(store.hosts_in(ResourceStatus::Preselected).await.len(), 1);
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());
    stalling.resume.notify_one();

    let lock_key = scope().lock_key();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let held = store.hosts_in(ResourceStatus::Preselected).await;
            if held.is_empty() && harness.locks.holder(&lock_key).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reservation was not unwound after the caller left");
    assert_eq!(store.hosts_in(ResourceStatus::Unused).await.len(), 2);
}

#[tokio::test]
async fn audit_failures_never_fail_the_request() {
    let harness = Harness::new((1..=2).map(|id| host(id, "A")).collect()).await;
    harness.store.fail_next_writes(100);

    let outcome = harness
        .service
        .apply(RequestId::new(), &apply_request(vec![AllocationGroup::new("g", 2)]))
        .await;
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn expired_reservations_are_reclaimed() {
    use respool_pool_manager::pipeline::{ReaperConfig, ReservationReaper};

    let harness = Harness::new((1..=2).map(|id| host(id, "A")).collect()).await;
    let request_id = RequestId::new();
    let outcome = harness
        .service
        .apply(request_id, &apply_request(vec![AllocationGroup::new("g", 2)]))
        .await
        .unwrap();
    let ids = outcome.groups["g"].host_ids.clone();
    for id in &ids {
        harness
            .store
            .set_preselected_at(*id, Utc::now() - chrono::Duration::hours(1))
            .await;
    }

    let (_tx, rx) = watch::channel(false);
    let (pipeline, _workers): (PipelineHandle, _) = Pipeline::spawn(
        Arc::new(harness.store.clone()),
        PipelineConfig::default(),
        rx,
    );
    let reaper = ReservationReaper::new(
        Arc::new(harness.store.clone()),
        pipeline,
        ReaperConfig {
            interval: Duration::from_secs(60),
            reservation_ttl: Duration::from_secs(60),
        },
    );

    assert_eq!(reaper.sweep().await.unwrap(), 2);
    assert_eq!(harness.store.hosts_in(ResourceStatus::Unused).await.len(), 2);

    // Confirming after expiry is a mismatch, never a partial confirm.
    let err = harness.service.confirm(&request_id, &ids).await.unwrap_err();
    assert!(matches!(err, AllocationError::ConfirmMismatch { found: 0, .. }));
}
