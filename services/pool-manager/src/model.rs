//! Pool records and allocation requests.
//!
//! A [`ResourceRecord`] is one machine in the shared pool. An
//! [`ApplyRequest`] asks for several named [`AllocationGroup`]s at once,
//! all drawn from the same [`Scope`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable external identity of a host (CMDB host id).
pub type HostId = i64;

/// Agent health code reported by a live agent.
pub const AGENT_HEALTHY: i32 = 0;

/// Resource type whose scoring prefers CPU counts close to the request.
pub const MEMORY_BOUND_RESOURCE_TYPE: &str = "redis";

// =============================================================================
// Resource records
// =============================================================================

/// Lifecycle status of a pool record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    Unused,
    Preselected,
    /// Claimed out-of-band (inspection job); never touched by allocation.
    Prepossessed,
    Used,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unused => "unused",
            Self::Preselected => "preselected",
            Self::Prepossessed => "prepossessed",
            Self::Used => "used",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unused" => Ok(Self::Unused),
            "preselected" => Ok(Self::Preselected),
            "prepossessed" => Ok(Self::Prepossessed),
            "used" => Ok(Self::Used),
            other => Err(format!("unknown resource status '{other}'")),
        }
    }
}

/// One disk, keyed by mount point in [`ResourceRecord::storage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Size in GB.
    pub size: i64,
    pub disk_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub disk_id: String,
}

/// One machine in the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub host_id: HostId,
    pub cloud_id: i64,
    pub ip: String,
    #[serde(default)]
    pub device_class: String,
    pub cpu_cores: i32,
    pub mem_mb: i64,
    #[serde(default)]
    pub storage: BTreeMap<String, Disk>,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub subzone: String,
    #[serde(default)]
    pub subzone_id: String,
    #[serde(default)]
    pub rack_id: String,
    #[serde(default)]
    pub network_device_ids: BTreeSet<String>,
    /// Empty means visible to every business.
    #[serde(default)]
    pub dedicated_business_ids: BTreeSet<i64>,
    /// Empty means usable by every resource type.
    #[serde(default)]
    pub resource_type_tags: BTreeSet<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub agent_health_code: i32,
    /// Request holding the reservation, while `Preselected`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preselected_at: Option<DateTime<Utc>>,
}

impl ResourceRecord {
    /// A healthy, untagged, unused record. Handy as a base for imports and tests.
    pub fn new(host_id: HostId, cloud_id: i64, ip: impl Into<String>) -> Self {
        Self {
            host_id,
            cloud_id,
            ip: ip.into(),
            device_class: String::new(),
            cpu_cores: 0,
            mem_mb: 0,
            storage: BTreeMap::new(),
            city: String::new(),
            subzone: String::new(),
            subzone_id: String::new(),
            rack_id: String::new(),
            network_device_ids: BTreeSet::new(),
            dedicated_business_ids: BTreeSet::new(),
            resource_type_tags: BTreeSet::new(),
            labels: BTreeMap::new(),
            status: ResourceStatus::Unused,
            agent_health_code: AGENT_HEALTHY,
            request_id: None,
            preselected_at: None,
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Allocation scope: the lock key and pool partition of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub cloud_id: i64,
    pub resource_type: String,
    pub business_id: i64,
}

impl Scope {
    pub fn lock_key(&self) -> String {
        format!(
            "respool:lock:{}:{}:{}",
            self.cloud_id, self.resource_type, self.business_id
        )
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cloud={} type={} business={}",
            self.cloud_id, self.resource_type, self.business_id
        )
    }
}

/// Inclusive integer window; a missing bound is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntRange {
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
}

impl IntRange {
    pub fn new(min: i64, max: i64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn at_least(min: i64) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }

    pub fn is_open(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    fn is_inverted(&self) -> bool {
        matches!((self.min, self.max), (Some(min), Some(max)) if min > max)
    }
}

/// Raw CPU/memory requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpu: IntRange,
    /// Memory in MB.
    #[serde(default)]
    pub mem: IntRange,
}

impl ResourceSpec {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_open() && self.mem.is_open()
    }
}

/// Disk requirement. Without a mount point it matches any disk the
/// mount-pointed specs of the same group did not claim.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskSpec {
    #[serde(default)]
    pub mount_point: Option<String>,
    /// `None` accepts any disk type.
    #[serde(default)]
    pub disk_type: Option<String>,
    #[serde(default)]
    pub min_size: i64,
    #[serde(default)]
    pub max_size: Option<i64>,
}

impl DiskSpec {
    pub fn matches(&self, disk: &Disk) -> bool {
        let type_ok = self
            .disk_type
            .as_deref()
            .is_none_or(|t| t.eq_ignore_ascii_case(&disk.disk_type));
        let size_ok = disk.size >= self.min_size && self.max_size.is_none_or(|max| disk.size <= max);
        type_ok && size_ok
    }
}

/// Where hosts may come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSpec {
    /// Logical city name; empty means anywhere.
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub subzones: Vec<String>,
    /// Whether `subzones` is an allow list (`true`) or a deny list.
    #[serde(default = "default_true")]
    pub include_subzones: bool,
}

impl Default for LocationSpec {
    fn default() -> Self {
        Self {
            city: String::new(),
            subzones: Vec::new(),
            include_subzones: true,
        }
    }
}

impl LocationSpec {
    pub fn is_empty(&self) -> bool {
        self.city.is_empty()
    }
}

fn default_true() -> bool {
    true
}

/// Co-location policy for the hosts of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AffinityMode {
    #[default]
    None,
    SameSubzone,
    SameSubzoneCrossSwitch,
    CrossSubzone,
}

impl AffinityMode {
    pub fn needs_location(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::SameSubzone => "SAME_SUBZONE",
            Self::SameSubzoneCrossSwitch => "SAME_SUBZONE_CROSS_SWITCH",
            Self::CrossSubzone => "CROSS_SUBZONE",
        }
    }
}

/// One named demand inside an apply call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationGroup {
    pub group_mark: String,
    pub count: usize,
    #[serde(default)]
    pub spec: ResourceSpec,
    #[serde(default)]
    pub device_classes: Vec<String>,
    #[serde(default)]
    pub storage_specs: Vec<DiskSpec>,
    #[serde(default)]
    pub location_spec: LocationSpec,
    #[serde(default)]
    pub affinity: AffinityMode,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// With `CROSS_SUBZONE`, take at most one host per subzone.
    #[serde(default)]
    pub strict_cross_subzone: bool,
}

impl AllocationGroup {
    pub fn new(group_mark: impl Into<String>, count: usize) -> Self {
        Self {
            group_mark: group_mark.into(),
            count,
            spec: ResourceSpec::default(),
            device_classes: Vec::new(),
            storage_specs: Vec::new(),
            location_spec: LocationSpec::default(),
            affinity: AffinityMode::None,
            labels: BTreeMap::new(),
            strict_cross_subzone: false,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidGroup> {
        let invalid = |reason: &str| InvalidGroup {
            group_mark: self.group_mark.clone(),
            reason: reason.to_string(),
        };

        if self.group_mark.trim().is_empty() {
            return Err(invalid("group_mark cannot be empty"));
        }
        if self.count == 0 {
            return Err(invalid("count must be greater than zero"));
        }
        if self.spec.cpu.is_inverted() || self.spec.mem.is_inverted() {
            return Err(invalid("spec range min exceeds max"));
        }
        if self.count > 1 && self.affinity.needs_location() && self.location_spec.is_empty() {
            return Err(invalid("affinity requires a location_spec with a city"));
        }
        if self.affinity == AffinityMode::CrossSubzone
            && self.location_spec.include_subzones
            && !self.location_spec.subzones.is_empty()
            && self.location_spec.subzones.len() < 2
        {
            return Err(invalid("CROSS_SUBZONE with an explicit subzone list needs at least two subzones"));
        }

        let mut mount_points = BTreeSet::new();
        for disk in &self.storage_specs {
            if disk.max_size.is_some_and(|max| max < disk.min_size) {
                return Err(invalid("disk spec min_size exceeds max_size"));
            }
            if let Some(mount_point) = &disk.mount_point {
                if !mount_points.insert(mount_point.as_str()) {
                    return Err(invalid("duplicate mount point in storage_specs"));
                }
            }
        }

        Ok(())
    }
}

/// A whole apply call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub scope: Scope,
    #[serde(default)]
    pub dry_run: bool,
    pub groups: Vec<AllocationGroup>,
}

impl ApplyRequest {
    pub fn validate(&self) -> Result<(), InvalidGroup> {
        if self.groups.is_empty() {
            return Err(InvalidGroup {
                group_mark: String::new(),
                reason: "at least one group is required".to_string(),
            });
        }

        let mut marks = BTreeSet::new();
        for group in &self.groups {
            group.validate()?;
            if !marks.insert(group.group_mark.as_str()) {
                return Err(InvalidGroup {
                    group_mark: group.group_mark.clone(),
                    reason: "duplicate group_mark".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Request validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("group '{group_mark}': {reason}")]
pub struct InvalidGroup {
    pub group_mark: String,
    pub reason: String,
}

// =============================================================================
// Results and audit
// =============================================================================

/// Hosts handed to one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupAllocation {
    pub host_ids: Vec<HostId>,
    pub hosts: Vec<ResourceRecord>,
}

/// Audit action recorded by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Reserved,
    Confirmed,
    RolledBack,
    Expired,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Confirmed => "confirmed",
            Self::RolledBack => "rolled_back",
            Self::Expired => "expired",
        }
    }
}

/// One append-only audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub request_id: String,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_mark: Option<String>,
    pub host_ids: Vec<HostId>,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(request_id: impl Into<String>, action: AuditAction, host_ids: Vec<HostId>) -> Self {
        Self {
            request_id: request_id.into(),
            action,
            group_mark: None,
            host_ids,
            detail: serde_json::Value::Null,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_group(mut self, group_mark: impl Into<String>) -> Self {
        self.group_mark = Some(group_mark.into());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}
