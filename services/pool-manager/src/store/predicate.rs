//! Typed filters over pool records.
//!
//! A [`Predicate`] is built once by the matcher and then either evaluated
//! directly against records ([`Predicate::evaluate`]) or compiled into a
//! Postgres `WHERE` clause ([`Predicate::push_sql`]). Both paths must agree;
//! the memory store relies on the first and the Postgres store on the second.

use std::collections::BTreeMap;

use sqlx::{Postgres, QueryBuilder};

use crate::model::ResourceRecord;

/// Filterable record attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    HostId,
    Status,
    CloudId,
    AgentHealthCode,
    DeviceClass,
    CpuCores,
    MemMb,
    City,
    Subzone,
    SubzoneId,
    RackId,
    Storage,
    NetworkDeviceIds,
    DedicatedBusinessIds,
    ResourceTypeTags,
    Labels,
}

impl Field {
    pub fn column(&self) -> &'static str {
        match self {
            Self::HostId => "host_id",
            Self::Status => "status",
            Self::CloudId => "cloud_id",
            Self::AgentHealthCode => "agent_health_code",
            Self::DeviceClass => "device_class",
            Self::CpuCores => "cpu_cores",
            Self::MemMb => "mem_mb",
            Self::City => "city",
            Self::Subzone => "subzone",
            Self::SubzoneId => "subzone_id",
            Self::RackId => "rack_id",
            Self::Storage => "storage",
            Self::NetworkDeviceIds => "network_device_ids",
            Self::DedicatedBusinessIds => "dedicated_business_ids",
            Self::ResourceTypeTags => "resource_type_tags",
            Self::Labels => "labels",
        }
    }

    fn is_json_array(&self) -> bool {
        matches!(
            self,
            Self::NetworkDeviceIds | Self::DedicatedBusinessIds | Self::ResourceTypeTags
        )
    }

    fn is_json_object(&self) -> bool {
        matches!(self, Self::Storage | Self::Labels)
    }

    fn read<'a>(&self, record: &'a ResourceRecord) -> FieldRef<'a> {
        match self {
            Self::HostId => FieldRef::Int(record.host_id),
            Self::Status => FieldRef::Text(record.status.as_str()),
            Self::CloudId => FieldRef::Int(record.cloud_id),
            Self::AgentHealthCode => FieldRef::Int(i64::from(record.agent_health_code)),
            Self::DeviceClass => FieldRef::Text(&record.device_class),
            Self::CpuCores => FieldRef::Int(i64::from(record.cpu_cores)),
            Self::MemMb => FieldRef::Int(record.mem_mb),
            Self::City => FieldRef::Text(&record.city),
            Self::Subzone => FieldRef::Text(&record.subzone),
            Self::SubzoneId => FieldRef::Text(&record.subzone_id),
            Self::RackId => FieldRef::Text(&record.rack_id),
            Self::Storage => FieldRef::Keys(record.storage.keys().map(String::as_str).collect()),
            Self::NetworkDeviceIds => {
                FieldRef::Texts(record.network_device_ids.iter().map(String::as_str).collect())
            }
            Self::DedicatedBusinessIds => {
                FieldRef::Ints(record.dedicated_business_ids.iter().copied().collect())
            }
            Self::ResourceTypeTags => {
                FieldRef::Texts(record.resource_type_tags.iter().map(String::as_str).collect())
            }
            Self::Labels => FieldRef::Map(&record.labels),
        }
    }
}

/// Borrowed view of one attribute, for evaluation.
enum FieldRef<'a> {
    Int(i64),
    Text(&'a str),
    Ints(Vec<i64>),
    Texts(Vec<&'a str>),
    Keys(Vec<&'a str>),
    Map(&'a BTreeMap<String, String>),
}

/// Literal compared against a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Text(String),
    Map(BTreeMap<String, String>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Scalar equality, or exact map equality for `Labels`.
    Equals(Field, Value),
    /// Scalar membership.
    In(Field, Vec<Value>),
    /// Inclusive range; `None` bounds are open.
    Range {
        field: Field,
        min: Option<i64>,
        max: Option<i64>,
    },
    /// JSON array field contains the value.
    Contains(Field, Value),
    /// JSON object field has every key.
    KeysContain(Field, Vec<String>),
    /// JSON array or object field is empty.
    IsEmpty(Field),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(field: Field, value: impl Into<Value>) -> Self {
        Self::Equals(field, value.into())
    }

    pub fn one_of<V: Into<Value>>(field: Field, values: impl IntoIterator<Item = V>) -> Self {
        Self::In(field, values.into_iter().map(Into::into).collect())
    }

    pub fn range(field: Field, min: Option<i64>, max: Option<i64>) -> Self {
        Self::Range { field, min, max }
    }

    pub fn contains(field: Field, value: impl Into<Value>) -> Self {
        Self::Contains(field, value.into())
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Evaluate against one record.
    pub fn evaluate(&self, record: &ResourceRecord) -> bool {
        match self {
            Self::Equals(field, value) => match (field.read(record), value) {
                (FieldRef::Int(a), Value::Int(b)) => a == *b,
                (FieldRef::Text(a), Value::Text(b)) => a == b,
                (FieldRef::Map(a), Value::Map(b)) => a == b,
                _ => false,
            },
            Self::In(field, values) => {
                let current = field.read(record);
                values.iter().any(|value| match (&current, value) {
                    (FieldRef::Int(a), Value::Int(b)) => a == b,
                    (FieldRef::Text(a), Value::Text(b)) => a == b,
                    _ => false,
                })
            }
            Self::Range { field, min, max } => match field.read(record) {
                FieldRef::Int(v) => {
                    min.is_none_or(|min| v >= min) && max.is_none_or(|max| v <= max)
                }
                _ => false,
            },
            Self::Contains(field, value) => match (field.read(record), value) {
                (FieldRef::Ints(items), Value::Int(v)) => items.contains(v),
                (FieldRef::Texts(items), Value::Text(v)) => items.contains(&v.as_str()),
                _ => false,
            },
            Self::KeysContain(field, keys) => match field.read(record) {
                FieldRef::Keys(present) => keys.iter().all(|k| present.contains(&k.as_str())),
                FieldRef::Map(map) => keys.iter().all(|k| map.contains_key(k)),
                _ => false,
            },
            Self::IsEmpty(field) => match field.read(record) {
                FieldRef::Ints(items) => items.is_empty(),
                FieldRef::Texts(items) | FieldRef::Keys(items) => items.is_empty(),
                FieldRef::Map(map) => map.is_empty(),
                FieldRef::Text(s) => s.is_empty(),
                FieldRef::Int(_) => false,
            },
            Self::And(parts) => parts.iter().all(|p| p.evaluate(record)),
            Self::Or(parts) => parts.iter().any(|p| p.evaluate(record)),
            Self::Not(inner) => !inner.evaluate(record),
        }
    }

    /// Append this predicate as a SQL boolean expression.
    pub fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Self::Equals(field, Value::Map(map)) => {
                qb.push(field.column()).push(" = ");
                push_json(qb, map_to_json(map));
            }
            Self::Equals(field, value) => {
                qb.push(field.column()).push(" = ");
                push_scalar(qb, value);
            }
            Self::In(field, values) => {
                if values.is_empty() {
                    qb.push("FALSE");
                    return;
                }
                let ints: Vec<i64> = values
                    .iter()
                    .filter_map(|v| match v {
                        Value::Int(i) => Some(*i),
                        _ => None,
                    })
                    .collect();
                qb.push(field.column()).push(" = ANY(");
                if ints.len() == values.len() {
                    qb.push_bind(ints);
                } else {
                    let texts: Vec<String> = values
                        .iter()
                        .filter_map(|v| match v {
                            Value::Text(s) => Some(s.clone()),
                            _ => None,
                        })
                        .collect();
                    qb.push_bind(texts);
                }
                qb.push(")");
            }
            Self::Range { field, min, max } => match (min, max) {
                (Some(min), Some(max)) => {
                    qb.push(field.column())
                        .push(" BETWEEN ")
                        .push_bind(*min)
                        .push(" AND ")
                        .push_bind(*max);
                }
                (Some(min), None) => {
                    qb.push(field.column()).push(" >= ").push_bind(*min);
                }
                (None, Some(max)) => {
                    qb.push(field.column()).push(" <= ").push_bind(*max);
                }
                (None, None) => {
                    qb.push("TRUE");
                }
            },
            Self::Contains(field, value) => {
                let element = match value {
                    Value::Int(i) => serde_json::json!([i]),
                    Value::Text(s) => serde_json::json!([s]),
                    Value::Map(map) => serde_json::json!([map_to_json(map)]),
                };
                qb.push(field.column()).push(" @> ");
                push_json(qb, element);
            }
            Self::KeysContain(field, keys) => {
                if keys.is_empty() {
                    qb.push("TRUE");
                    return;
                }
                qb.push(field.column())
                    .push(" ?& ")
                    .push_bind(keys.clone())
                    .push("::TEXT[]");
            }
            Self::IsEmpty(field) => {
                if field.is_json_array() {
                    qb.push("jsonb_array_length(")
                        .push(field.column())
                        .push(") = 0");
                } else if field.is_json_object() {
                    qb.push(field.column()).push(" = '{}'::JSONB");
                } else {
                    qb.push(field.column()).push(" = ''");
                }
            }
            Self::And(parts) => push_joined(qb, parts, " AND ", "TRUE"),
            Self::Or(parts) => push_joined(qb, parts, " OR ", "FALSE"),
            Self::Not(inner) => {
                qb.push("NOT (");
                inner.push_sql(qb);
                qb.push(")");
            }
        }
    }
}

fn push_scalar(qb: &mut QueryBuilder<'_, Postgres>, value: &Value) {
    match value {
        Value::Int(i) => {
            qb.push_bind(*i);
        }
        Value::Text(s) => {
            qb.push_bind(s.clone());
        }
        Value::Map(map) => push_json(qb, map_to_json(map)),
    }
}

fn push_json(qb: &mut QueryBuilder<'_, Postgres>, value: serde_json::Value) {
    qb.push_bind(value).push("::JSONB");
}

fn map_to_json(map: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}

fn push_joined(
    qb: &mut QueryBuilder<'_, Postgres>,
    parts: &[Predicate],
    separator: &str,
    identity: &str,
) {
    if parts.is_empty() {
        qb.push(identity);
        return;
    }
    qb.push("(");
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            qb.push(separator);
        }
        part.push_sql(qb);
    }
    qb.push(")");
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record() -> ResourceRecord {
        let mut r = ResourceRecord::new(7, 0, "10.0.0.7");
        r.cpu_cores = 8;
        r.mem_mb = 16000;
        r.city = "sz".to_string();
        r.subzone = "A".to_string();
        r.dedicated_business_ids.insert(42);
        r.resource_type_tags.insert("mysql".to_string());
        r.labels.insert("env".to_string(), "prod".to_string());
        r.storage.insert(
            "/data".to_string(),
            crate::model::Disk {
                size: 500,
                disk_type: "SSD".to_string(),
                disk_id: String::new(),
            },
        );
        r
    }

    fn sql(predicate: &Predicate) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("");
        predicate.push_sql(&mut qb);
        qb.sql().to_string()
    }

    #[test]
    fn test_scalar_predicates() {
        let r = record();
        assert!(Predicate::eq(Field::Status, "unused").evaluate(&r));
        assert!(Predicate::eq(Field::HostId, 7i64).evaluate(&r));
        assert!(!Predicate::eq(Field::City, "bj").evaluate(&r));
        assert!(Predicate::one_of(Field::Subzone, ["B", "A"]).evaluate(&r));
        assert!(!Predicate::one_of(Field::Subzone, Vec::<String>::new()).evaluate(&r));
        assert!(Predicate::range(Field::CpuCores, Some(4), Some(8)).evaluate(&r));
        assert!(!Predicate::range(Field::MemMb, Some(20000), None).evaluate(&r));
    }

    #[test]
    fn test_visibility_or_empty() {
        let mut r = record();
        let visible = |biz: i64| {
            Predicate::Or(vec![
                Predicate::IsEmpty(Field::DedicatedBusinessIds),
                Predicate::contains(Field::DedicatedBusinessIds, biz),
            ])
        };
        assert!(visible(42).evaluate(&r));
        assert!(!visible(43).evaluate(&r));

        r.dedicated_business_ids.clear();
        assert!(visible(43).evaluate(&r));
    }

    #[test]
    fn test_labels_are_exact_match() {
        let r = record();
        let mut wanted = BTreeMap::new();
        wanted.insert("env".to_string(), "prod".to_string());
        assert!(Predicate::eq(Field::Labels, Value::Map(wanted.clone())).evaluate(&r));

        wanted.insert("tier".to_string(), "gold".to_string());
        assert!(!Predicate::eq(Field::Labels, Value::Map(wanted)).evaluate(&r));
        assert!(!Predicate::IsEmpty(Field::Labels).evaluate(&r));
    }

    #[test]
    fn test_storage_keys() {
        let r = record();
        assert!(Predicate::KeysContain(Field::Storage, vec!["/data".to_string()]).evaluate(&r));
        assert!(!Predicate::KeysContain(
            Field::Storage,
            vec!["/data".to_string(), "/log".to_string()]
        )
        .evaluate(&r));
    }

    #[test]
    fn test_not_and_empty_combinators() {
        let r = record();
        assert!(Predicate::And(vec![]).evaluate(&r));
        assert!(!Predicate::Or(vec![]).evaluate(&r));
        assert!(Predicate::eq(Field::City, "bj").negate().evaluate(&r));
    }

    #[test]
    fn test_sql_shapes() {
        assert_eq!(sql(&Predicate::eq(Field::Status, "unused")), "status = $1");
        assert_eq!(
            sql(&Predicate::range(Field::CpuCores, Some(4), Some(8))),
            "cpu_cores BETWEEN $1 AND $2"
        );
        assert_eq!(
            sql(&Predicate::range(Field::CpuCores, Some(4), None)),
            "cpu_cores >= $1"
        );
        assert_eq!(
            sql(&Predicate::one_of(Field::City, ["a", "b"])),
            "city = ANY($1)"
        );
        assert_eq!(
            sql(&Predicate::contains(Field::DedicatedBusinessIds, 3i64)),
            "dedicated_business_ids @> $1::JSONB"
        );
        assert_eq!(
            sql(&Predicate::IsEmpty(Field::ResourceTypeTags)),
            "jsonb_array_length(resource_type_tags) = 0"
        );
        assert_eq!(sql(&Predicate::IsEmpty(Field::Labels)), "labels = '{}'::JSONB");
        assert_eq!(
            sql(&Predicate::KeysContain(Field::Storage, vec!["/data".into()])),
            "storage ?& $1::TEXT[]"
        );
    }

    #[test]
    fn test_sql_nesting() {
        let predicate = Predicate::And(vec![
            Predicate::eq(Field::Status, "unused"),
            Predicate::Or(vec![
                Predicate::IsEmpty(Field::DedicatedBusinessIds),
                Predicate::contains(Field::DedicatedBusinessIds, 1i64),
            ]),
            Predicate::one_of(Field::Subzone, ["A"]).negate(),
        ]);
        assert_eq!(
            sql(&predicate),
            "(status = $1 AND (jsonb_array_length(dedicated_business_ids) = 0 OR dedicated_business_ids @> $2::JSONB) AND NOT (subzone = ANY($3)))"
        );
    }

    proptest! {
        #[test]
        fn prop_range_matches_bounds(cpu in 0i32..256, min in proptest::option::of(0i64..256), max in proptest::option::of(0i64..256)) {
            let mut r = record();
            r.cpu_cores = cpu;
            let expected = min.is_none_or(|m| i64::from(cpu) >= m) && max.is_none_or(|m| i64::from(cpu) <= m);
            prop_assert_eq!(Predicate::range(Field::CpuCores, min, max).evaluate(&r), expected);
        }

        #[test]
        fn prop_not_inverts(subzone in "[A-D]") {
            let r = record();
            let p = Predicate::eq(Field::Subzone, subzone.as_str());
            prop_assert_eq!(p.clone().negate().evaluate(&r), !p.evaluate(&r));
        }
    }
}
