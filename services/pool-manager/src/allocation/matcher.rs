//! Constraint matching.
//!
//! A group's declarative constraints become one or two store predicates:
//! a shared base (status, health, visibility, labels, location, mount
//! points) combined with either the device-class pass or the raw-spec pass.
//! The passes run independently and their results are unioned. Disk size
//! and type windows are checked in memory afterwards.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{AllocationGroup, HostId, ResourceRecord, ResourceStatus, Scope, AGENT_HEALTHY};
use crate::store::{Field, Predicate, ResourceStore, StoreResult, Value};

use super::storage;

/// Predicate shared by every pass for `group`.
pub fn base_predicate(scope: &Scope, group: &AllocationGroup, cities: &[String]) -> Predicate {
    let mut parts = vec![
        Predicate::eq(Field::Status, ResourceStatus::Unused.as_str()),
        Predicate::eq(Field::CloudId, scope.cloud_id),
        Predicate::eq(Field::AgentHealthCode, AGENT_HEALTHY),
        Predicate::Or(vec![
            Predicate::IsEmpty(Field::DedicatedBusinessIds),
            Predicate::contains(Field::DedicatedBusinessIds, scope.business_id),
        ]),
        Predicate::Or(vec![
            Predicate::IsEmpty(Field::ResourceTypeTags),
            Predicate::contains(Field::ResourceTypeTags, scope.resource_type.as_str()),
        ]),
    ];

    if group.labels.is_empty() {
        parts.push(Predicate::IsEmpty(Field::Labels));
    } else {
        parts.push(Predicate::Equals(Field::Labels, Value::Map(group.labels.clone())));
    }

    let location = &group.location_spec;
    if !location.city.is_empty() {
        parts.push(Predicate::one_of(Field::City, cities.iter().cloned()));
    }
    if !location.subzones.is_empty() {
        let subzones = Predicate::one_of(Field::Subzone, location.subzones.iter().cloned());
        parts.push(if location.include_subzones {
            subzones
        } else {
            subzones.negate()
        });
    }

    let mount_points: Vec<String> = group
        .storage_specs
        .iter()
        .filter_map(|spec| spec.mount_point.clone())
        .collect();
    if !mount_points.is_empty() {
        parts.push(Predicate::KeysContain(Field::Storage, mount_points));
    }

    Predicate::And(parts)
}

/// The alternative hardware passes for `group`.
///
/// With a device-class list, the class pass always runs and the raw-spec
/// pass joins it only if the spec sets a bound. Without one, the raw-spec
/// pass runs alone.
pub fn pass_predicates(group: &AllocationGroup) -> Vec<Predicate> {
    let spec_pass = || {
        Predicate::And(vec![
            Predicate::range(Field::CpuCores, group.spec.cpu.min, group.spec.cpu.max),
            Predicate::range(Field::MemMb, group.spec.mem.min, group.spec.mem.max),
        ])
    };

    if group.device_classes.is_empty() {
        return vec![spec_pass()];
    }

    let mut passes = vec![Predicate::one_of(
        Field::DeviceClass,
        group.device_classes.iter().cloned(),
    )];
    if !group.spec.is_empty() {
        passes.push(spec_pass());
    }
    passes
}

/// Runs the passes for one group against a store.
pub struct Matcher<'a> {
    store: &'a dyn ResourceStore,
}

impl<'a> Matcher<'a> {
    pub fn new(store: &'a dyn ResourceStore) -> Self {
        Self { store }
    }

    /// Every record satisfying `group`, ordered by host id, minus `exclude`.
    pub async fn candidates(
        &self,
        scope: &Scope,
        group: &AllocationGroup,
        cities: &[String],
        exclude: &BTreeSet<HostId>,
    ) -> StoreResult<Vec<ResourceRecord>> {
        let base = base_predicate(scope, group, cities);
        let mut matched = BTreeMap::new();

        for pass in pass_predicates(group) {
            let predicate = Predicate::And(vec![base.clone(), pass]);
            for record in self.store.find(&predicate).await? {
                matched.entry(record.host_id).or_insert(record);
            }
        }

        Ok(matched
            .into_values()
            .filter(|record| !exclude.contains(&record.host_id))
            .filter(|record| storage::fits(&group.storage_specs, record))
            .collect())
    }
}
