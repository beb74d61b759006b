//! Desirability scoring.
//!
//! Signals are additive and sit an order of magnitude apart, so a lower
//! tier never outweighs a higher one. Scores only order candidates inside a
//! zone; they never decide eligibility.

use crate::model::{AllocationGroup, ResourceRecord, Scope, MEMORY_BOUND_RESOURCE_TYPE};

use super::storage;

pub const DISK_COUNT_WEIGHT: f64 = 10_000.0;
pub const DEVICE_CLASS_WEIGHT: f64 = 1_000.0;
pub const DEDICATED_BUSINESS_WEIGHT: f64 = 100.0;
pub const RESOURCE_TYPE_WEIGHT: f64 = 10.0;

pub struct Scorer<'a> {
    scope: &'a Scope,
    group: &'a AllocationGroup,
    memory_bound: bool,
}

impl<'a> Scorer<'a> {
    pub fn new(scope: &'a Scope, group: &'a AllocationGroup) -> Self {
        Self {
            scope,
            group,
            memory_bound: scope
                .resource_type
                .eq_ignore_ascii_case(MEMORY_BOUND_RESOURCE_TYPE),
        }
    }

    pub fn score(&self, record: &ResourceRecord) -> f64 {
        let mut score = 0.0;

        if storage::disk_count_matches(&self.group.storage_specs, record) {
            score += DISK_COUNT_WEIGHT;
        }
        if self.group.device_classes.iter().any(|c| *c == record.device_class) {
            score += DEVICE_CLASS_WEIGHT;
        }
        if record.dedicated_business_ids.contains(&self.scope.business_id) {
            score += DEDICATED_BUSINESS_WEIGHT;
        }
        if record.resource_type_tags.len() == 1
            && record.resource_type_tags.contains(&self.scope.resource_type)
        {
            score += RESOURCE_TYPE_WEIGHT;
        }
        if self.memory_bound {
            score += self.cpu_fit(record);
        }

        score
    }

    /// `requested / actual` CPU in `(0, 1]`; closer to 1 wastes fewer cores.
    fn cpu_fit(&self, record: &ResourceRecord) -> f64 {
        match self.group.spec.cpu.min {
            Some(min) if min > 0 && record.cpu_cores > 0 => {
                (min as f64 / f64::from(record.cpu_cores)).min(1.0)
            }
            _ => 0.0,
        }
    }
}
