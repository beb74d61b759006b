//! Disk layout matching.
//!
//! Specs with a mount point must find a matching disk at exactly that mount
//! point. Specs without one are assigned to the remaining disks, one
//! distinct disk per spec, by bipartite matching.

use std::collections::BTreeSet;

use crate::model::{Disk, DiskSpec, ResourceRecord};

/// Whether `record`'s disks satisfy every spec.
pub fn fits(specs: &[DiskSpec], record: &ResourceRecord) -> bool {
    let mut claimed = BTreeSet::new();
    for spec in specs {
        let Some(mount_point) = spec.mount_point.as_deref() else {
            continue;
        };
        match record.storage.get(mount_point) {
            Some(disk) if spec.matches(disk) => {
                claimed.insert(mount_point);
            }
            _ => return false,
        }
    }

    let floating: Vec<&DiskSpec> = specs.iter().filter(|s| s.mount_point.is_none()).collect();
    if floating.is_empty() {
        return true;
    }

    let free: Vec<&Disk> = record
        .storage
        .iter()
        .filter(|(mount_point, _)| !claimed.contains(mount_point.as_str()))
        .map(|(_, disk)| disk)
        .collect();
    if free.len() < floating.len() {
        return false;
    }

    assign_distinct(&floating, &free) == floating.len()
}

/// The record carries exactly as many disks as the request describes.
pub fn disk_count_matches(specs: &[DiskSpec], record: &ResourceRecord) -> bool {
    !specs.is_empty() && record.storage.len() == specs.len()
}

/// Size of a maximum spec-to-disk matching.
fn assign_distinct(specs: &[&DiskSpec], disks: &[&Disk]) -> usize {
    let mut owner: Vec<Option<usize>> = vec![None; disks.len()];
    let mut matched = 0;
    for spec_idx in 0..specs.len() {
        let mut visited = vec![false; disks.len()];
        if augment(spec_idx, specs, disks, &mut owner, &mut visited) {
            matched += 1;
        }
    }
    matched
}

fn augment(
    spec_idx: usize,
    specs: &[&DiskSpec],
    disks: &[&Disk],
    owner: &mut [Option<usize>],
    visited: &mut [bool],
) -> bool {
    for disk_idx in 0..disks.len() {
        if visited[disk_idx] || !specs[spec_idx].matches(disks[disk_idx]) {
            continue;
        }
        visited[disk_idx] = true;
        let free = match owner[disk_idx] {
            None => true,
            Some(other) => augment(other, specs, disks, owner, visited),
        };
        if free {
            owner[disk_idx] = Some(spec_idx);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(size: i64, disk_type: &str) -> Disk {
        Disk {
            size,
            disk_type: disk_type.to_string(),
            disk_id: String::new(),
        }
    }

    fn spec(mount_point: Option<&str>, disk_type: &str, min_size: i64) -> DiskSpec {
        DiskSpec {
            mount_point: mount_point.map(str::to_string),
            disk_type: Some(disk_type.to_string()),
            min_size,
            max_size: None,
        }
    }

    fn record(disks: &[(&str, Disk)]) -> ResourceRecord {
        let mut record = ResourceRecord::new(1, 0, "10.0.0.1");
        for (mount_point, d) in disks {
            record.storage.insert(mount_point.to_string(), d.clone());
        }
        record
    }

    #[test]
    fn test_mount_point_must_exist_and_match() {
        let r = record(&[("/data", disk(500, "SSD"))]);

        assert!(fits(&[spec(Some("/data"), "ssd", 100)], &r));
        assert!(!fits(&[spec(Some("/data"), "SSD", 1000)], &r));
        assert!(!fits(&[spec(Some("/log"), "SSD", 1)], &r));
    }

    #[test]
    fn test_floating_specs_skip_claimed_disks() {
        let r = record(&[("/data", disk(500, "SSD")), ("/data1", disk(200, "HDD"))]);

        // "/data" is claimed, so the floating SSD spec has nothing left.
        let specs = [spec(Some("/data"), "SSD", 100), spec(None, "SSD", 100)];
        assert!(!fits(&specs, &r));

        let specs = [spec(Some("/data"), "SSD", 100), spec(None, "HDD", 100)];
        assert!(fits(&specs, &r));
    }

    #[test]
    fn test_floating_specs_need_distinct_disks() {
        let r = record(&[("/a", disk(100, "SSD")), ("/b", disk(900, "SSD"))]);

        // The first spec alone could take either disk; the second needs /b.
        let specs = [spec(None, "SSD", 50), spec(None, "SSD", 800)];
        assert!(fits(&specs, &r));

        let specs = [spec(None, "SSD", 800), spec(None, "SSD", 800)];
        assert!(!fits(&specs, &r));
    }

    #[test]
    fn test_disk_count_match() {
        let r = record(&[("/a", disk(100, "SSD"))]);
        assert!(disk_count_matches(&[spec(None, "SSD", 1)], &r));
        assert!(!disk_count_matches(&[], &r));
    }
}
