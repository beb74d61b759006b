//! Affinity-aware picking from zone pools.
//!
//! The picker runs `Accumulating` until either the requested count is met
//! (`Satisfied`) or no zone can supply the remainder (`Exhausted`). Queues
//! are consumed destructively.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::debug;

use crate::model::{AffinityMode, AllocationGroup, HostId};

use super::pools::{Candidate, ZonePools};

/// No zone arrangement could satisfy the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exhausted candidate pools: requested {requested}, picked {picked}")]
pub struct Exhausted {
    pub requested: usize,
    pub picked: usize,
}

/// Winners of one group.
#[derive(Debug, Clone)]
pub struct Picked {
    pub candidates: Vec<Candidate>,
    pub per_zone: BTreeMap<String, usize>,
}

impl Picked {
    pub fn host_ids(&self) -> Vec<HostId> {
        self.candidates.iter().map(|c| c.host_id).collect()
    }
}

/// Mutable allocator state for one group.
#[derive(Debug, Default)]
struct PickerState {
    remaining: usize,
    satisfied: Vec<Candidate>,
    used_rack_ids: BTreeSet<String>,
    used_network_device_ids: BTreeSet<String>,
    per_zone_pick_counts: BTreeMap<String, usize>,
}

impl PickerState {
    fn new(count: usize) -> Self {
        Self {
            remaining: count,
            ..Default::default()
        }
    }

    fn conflicts(&self, candidate: &Candidate) -> bool {
        self.used_rack_ids.contains(&candidate.rack_id)
            || !self
                .used_network_device_ids
                .is_disjoint(&candidate.network_device_ids)
    }

    fn take(&mut self, zone: &str, candidate: Candidate) {
        self.remaining -= 1;
        self.used_rack_ids.insert(candidate.rack_id.clone());
        self.used_network_device_ids
            .extend(candidate.network_device_ids.iter().cloned());
        *self.per_zone_pick_counts.entry(zone.to_string()).or_default() += 1;
        self.satisfied.push(candidate);
    }

    fn picked(&self) -> usize {
        self.satisfied.len()
    }

    fn finish(self) -> Picked {
        Picked {
            candidates: self.satisfied,
            per_zone: self.per_zone_pick_counts,
        }
    }
}

pub struct Picker {
    count: usize,
    affinity: AffinityMode,
    strict_cross_subzone: bool,
}

impl Picker {
    pub fn new(count: usize, affinity: AffinityMode) -> Self {
        Self {
            count,
            affinity,
            strict_cross_subzone: false,
        }
    }

    pub fn for_group(group: &AllocationGroup) -> Self {
        Self {
            count: group.count,
            affinity: group.affinity,
            strict_cross_subzone: group.strict_cross_subzone,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_cross_subzone = strict;
        self
    }

    pub fn pick(&self, pools: &mut ZonePools) -> Result<Picked, Exhausted> {
        match self.affinity {
            AffinityMode::None => self.pick_any(pools),
            AffinityMode::SameSubzone => self.pick_one_zone(pools, false),
            AffinityMode::SameSubzoneCrossSwitch => self.pick_one_zone(pools, true),
            AffinityMode::CrossSubzone => self.pick_across_zones(pools),
        }
    }

    fn exhausted(&self, picked: usize) -> Exhausted {
        Exhausted {
            requested: self.count,
            picked,
        }
    }

    fn pick_any(&self, pools: &mut ZonePools) -> Result<Picked, Exhausted> {
        let mut state = PickerState::new(self.count);
        for zone in pools.ranked_zones() {
            while state.remaining > 0 {
                let Some(candidate) = pools.pop(&zone) else {
                    break;
                };
                state.take(&zone, candidate);
            }
        }

        if state.remaining > 0 {
            return Err(self.exhausted(state.picked()));
        }
        Ok(state.finish())
    }

    /// Take every host from a single zone, trying zones largest first.
    fn pick_one_zone(&self, pools: &mut ZonePools, cross_switch: bool) -> Result<Picked, Exhausted> {
        let mut best_partial = 0;

        for zone in pools.ranked_zones() {
            if pools.len(&zone) < self.count {
                // Ranked by size, so no later zone is large enough either.
                break;
            }

            let mut state = PickerState::new(self.count);
            while state.remaining > 0 {
                let Some(candidate) = pools.pop(&zone) else {
                    break;
                };
                if cross_switch && state.conflicts(&candidate) {
                    debug!(host_id = candidate.host_id, zone = %zone, "Skipping rack/switch conflict");
                    continue;
                }
                state.take(&zone, candidate);
            }

            if state.remaining == 0 {
                return Ok(state.finish());
            }
            best_partial = best_partial.max(state.picked());
        }

        Err(self.exhausted(best_partial))
    }

    /// One host per zone per round, zones ordered by remaining size.
    fn pick_across_zones(&self, pools: &mut ZonePools) -> Result<Picked, Exhausted> {
        let mut state = PickerState::new(self.count);
        if self.count > 1 && pools.ranked_zones().len() < 2 {
            return Err(self.exhausted(0));
        }

        let mut retired = BTreeSet::new();
        while state.remaining > 0 {
            let round: Vec<String> = pools
                .ranked_zones()
                .into_iter()
                .filter(|zone| !retired.contains(zone))
                .collect();
            if round.is_empty() {
                break;
            }

            for zone in round {
                if state.remaining == 0 {
                    break;
                }
                if let Some(candidate) = pools.pop(&zone) {
                    state.take(&zone, candidate);
                }
                if self.strict_cross_subzone || pools.len(&zone) == 0 {
                    retired.insert(zone);
                }
            }
        }

        if state.remaining > 0 {
            return Err(self.exhausted(state.picked()));
        }
        Ok(state.finish())
    }
}
