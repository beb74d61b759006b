//! Per-zone candidate queues.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use crate::model::{AffinityMode, HostId, ResourceRecord};

/// Zone name used when no location reasoning is needed.
pub const ANY_ZONE: &str = "*";

/// A scored, zone-bucketed view of one record.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub host_id: HostId,
    pub zone: String,
    pub rack_id: String,
    pub network_device_ids: BTreeSet<String>,
    pub score: f64,
    /// Insertion order; breaks score ties first-in-first-out.
    seq: u64,
    pub record: ResourceRecord,
}

impl Candidate {
    pub fn new(record: ResourceRecord, score: f64, seq: u64) -> Self {
        Self {
            host_id: record.host_id,
            zone: record.subzone.clone(),
            rack_id: record.rack_id.clone(),
            network_device_ids: record.network_device_ids.clone(),
            score,
            seq,
            record,
        }
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    /// Higher score first, then earlier insertion.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Max-priority queues of candidates keyed by zone.
#[derive(Debug, Default)]
pub struct ZonePools {
    zones: BTreeMap<String, BinaryHeap<Candidate>>,
}

impl ZonePools {
    /// Bucket `candidates` by subzone, or into [`ANY_ZONE`] for `NONE`.
    pub fn build(candidates: Vec<Candidate>, affinity: AffinityMode) -> Self {
        let mut zones: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        for mut candidate in candidates {
            if !affinity.needs_location() {
                candidate.zone = ANY_ZONE.to_string();
            }
            zones.entry(candidate.zone.clone()).or_default().push(candidate);
        }

        Self {
            zones: zones
                .into_iter()
                .map(|(zone, members)| (zone, BinaryHeap::from(members)))
                .collect(),
        }
    }

    /// Zone names by remaining size, largest first; ties by name.
    pub fn ranked_zones(&self) -> Vec<String> {
        let mut ranked: Vec<(&String, usize)> = self
            .zones
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(zone, queue)| (zone, queue.len()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.into_iter().map(|(zone, _)| zone.clone()).collect()
    }

    pub fn len(&self, zone: &str) -> usize {
        self.zones.get(zone).map_or(0, BinaryHeap::len)
    }

    pub fn total(&self) -> usize {
        self.zones.values().map(BinaryHeap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Best remaining candidate of `zone`.
    pub fn pop(&mut self, zone: &str) -> Option<Candidate> {
        self.zones.get_mut(zone).and_then(BinaryHeap::pop)
    }
}
