//! Postgres-backed store.
//!
//! JSON-shaped attributes live in JSONB columns and are filtered with the
//! containment/key operators emitted by [`Predicate::push_sql`]. Confirmation
//! takes row locks (`SELECT … FOR UPDATE`) inside a transaction; every other
//! status change is a single conditional `UPDATE` whose row count is the
//! compare-and-set result.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};

use super::{
    ConfirmOutcome, Predicate, ResourceStore, StaleReservation, StoreError, StoreResult,
};
use crate::model::{AuditEntry, Disk, HostId, ResourceRecord, ResourceStatus};

const RECORD_COLUMNS: &str = "host_id, cloud_id, ip, device_class, cpu_cores, mem_mb, storage, \
     city, subzone, subzone_id, rack_id, network_device_ids, dedicated_business_ids, \
     resource_type_tags, labels, status, agent_health_code, request_id, preselected_at";

#[derive(Clone)]
pub struct PgResourceStore {
    pool: PgPool,
}

impl PgResourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResourceStore for PgResourceStore {
    #[instrument(skip_all)]
    async fn find(&self, predicate: &Predicate) -> StoreResult<Vec<ResourceRecord>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
        qb.push(RECORD_COLUMNS)
            .push(" FROM pool_resources WHERE ");
        predicate.push_sql(&mut qb);
        qb.push(" ORDER BY host_id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        debug!(rows = rows.len(), "Matched pool rows");
        rows.iter().map(decode_record).collect()
    }

    async fn upsert(&self, records: &[ResourceRecord]) -> StoreResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO pool_resources (host_id, cloud_id, ip, device_class, cpu_cores, mem_mb, \
             storage, city, subzone, subzone_id, rack_id, network_device_ids, \
             dedicated_business_ids, resource_type_tags, labels, agent_health_code) ",
        );
        qb.push_values(records, |mut b, r| {
            b.push_bind(r.host_id)
                .push_bind(r.cloud_id)
                .push_bind(r.ip.clone())
                .push_bind(r.device_class.clone())
                .push_bind(r.cpu_cores)
                .push_bind(r.mem_mb)
                .push_bind(Json(r.storage.clone()))
                .push_bind(r.city.clone())
                .push_bind(r.subzone.clone())
                .push_bind(r.subzone_id.clone())
                .push_bind(r.rack_id.clone())
                .push_bind(Json(r.network_device_ids.clone()))
                .push_bind(Json(r.dedicated_business_ids.clone()))
                .push_bind(Json(r.resource_type_tags.clone()))
                .push_bind(Json(r.labels.clone()))
                .push_bind(r.agent_health_code);
        });
        qb.push(
            " ON CONFLICT (cloud_id, ip) DO UPDATE SET \
             host_id = EXCLUDED.host_id, \
             device_class = EXCLUDED.device_class, \
             cpu_cores = EXCLUDED.cpu_cores, \
             mem_mb = EXCLUDED.mem_mb, \
             storage = EXCLUDED.storage, \
             city = EXCLUDED.city, \
             subzone = EXCLUDED.subzone, \
             subzone_id = EXCLUDED.subzone_id, \
             rack_id = EXCLUDED.rack_id, \
             network_device_ids = EXCLUDED.network_device_ids, \
             dedicated_business_ids = EXCLUDED.dedicated_business_ids, \
             resource_type_tags = EXCLUDED.resource_type_tags, \
             labels = EXCLUDED.labels, \
             agent_health_code = EXCLUDED.agent_health_code, \
             updated_at = now()",
        );

        let result = qb.build().execute(&self.pool).await.map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            other => StoreError::Query(other),
        })?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, host_ids), fields(hosts = host_ids.len()))]
    async fn reserve(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE pool_resources
            SET status = 'preselected',
                request_id = $1,
                preselected_at = now(),
                updated_at = now()
            WHERE host_id = ANY($2) AND status = 'unused'
            "#,
        )
        .bind(request_id)
        .bind(host_ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, host_ids), fields(hosts = host_ids.len()))]
    async fn confirm(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<ConfirmOutcome> {
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM pool_resources \
             WHERE host_id = ANY($1) AND status = 'preselected' AND request_id = $2 \
             ORDER BY host_id FOR UPDATE"
        ))
        .bind(host_ids)
        .bind(request_id)
        .fetch_all(&mut *tx)
        .await?;

        if locked.len() != host_ids.len() {
            tx.rollback().await?;
            return Ok(ConfirmOutcome::Mismatch {
                requested: host_ids.len(),
                found: locked.len(),
            });
        }

        sqlx::query(
            r#"
            UPDATE pool_resources
            SET status = 'used', used_at = now(), updated_at = now()
            WHERE host_id = ANY($1) AND status = 'preselected' AND request_id = $2
            "#,
        )
        .bind(host_ids)
        .bind(request_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut confirmed = locked
            .iter()
            .map(decode_record)
            .collect::<StoreResult<Vec<_>>>()?;
        for record in &mut confirmed {
            record.status = ResourceStatus::Used;
        }
        Ok(ConfirmOutcome::Confirmed(confirmed))
    }

    async fn release(&self, request_id: &str, host_ids: &[HostId]) -> StoreResult<Vec<HostId>> {
        let released = sqlx::query_scalar::<_, HostId>(
            r#"
            UPDATE pool_resources
            SET status = 'unused',
                request_id = NULL,
                preselected_at = NULL,
                updated_at = now()
            WHERE host_id = ANY($1) AND status = 'preselected' AND request_id = $2
            RETURNING host_id
            "#,
        )
        .bind(host_ids)
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(released)
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StaleReservation>> {
        // The CTE captures the holder before the UPDATE clears it.
        let rows = sqlx::query(
            r#"
            WITH stale AS (
                SELECT host_id, request_id
                FROM pool_resources
                WHERE status = 'preselected' AND preselected_at < $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE pool_resources p
            SET status = 'unused',
                request_id = NULL,
                preselected_at = NULL,
                updated_at = now()
            FROM stale
            WHERE p.host_id = stale.host_id
            RETURNING stale.host_id, stale.request_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<StaleReservation> {
                Ok(StaleReservation {
                    host_id: row.try_get("host_id")?,
                    request_id: row
                        .try_get::<Option<String>, _>("request_id")?
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    #[instrument(skip(self, host_ids), fields(hosts = host_ids.len()))]
    async fn archive_used(&self, host_ids: &[HostId]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO pool_resources_archive ({RECORD_COLUMNS}, used_at, archived_at) \
             SELECT {RECORD_COLUMNS}, used_at, now() FROM pool_resources \
             WHERE host_id = ANY($1) AND status = 'used'"
        ))
        .bind(host_ids)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM pool_resources WHERE host_id = ANY($1) AND status = 'used'")
            .bind(host_ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected())
    }

    async fn append_audit(&self, entries: &[AuditEntry]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO allocation_audit (request_id, action, group_mark, host_ids, detail, occurred_at) ",
        );
        qb.push_values(entries, |mut b, e| {
            b.push_bind(e.request_id.clone())
                .push_bind(e.action.as_str())
                .push_bind(e.group_mark.clone())
                .push_bind(Json(e.host_ids.clone()))
                .push_bind(e.detail.clone())
                .push_bind(e.occurred_at);
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn decode_record(row: &PgRow) -> StoreResult<ResourceRecord> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<ResourceStatus>()
        .map_err(|message| StoreError::Decode {
            column: "status",
            message,
        })?;

    let storage: Json<BTreeMap<String, Disk>> = row.try_get("storage")?;
    let network_device_ids: Json<BTreeSet<String>> = row.try_get("network_device_ids")?;
    let dedicated_business_ids: Json<BTreeSet<i64>> = row.try_get("dedicated_business_ids")?;
    let resource_type_tags: Json<BTreeSet<String>> = row.try_get("resource_type_tags")?;
    let labels: Json<BTreeMap<String, String>> = row.try_get("labels")?;

    Ok(ResourceRecord {
        host_id: row.try_get("host_id")?,
        cloud_id: row.try_get("cloud_id")?,
        ip: row.try_get("ip")?,
        device_class: row.try_get("device_class")?,
        cpu_cores: row.try_get("cpu_cores")?,
        mem_mb: row.try_get("mem_mb")?,
        storage: storage.0,
        city: row.try_get("city")?,
        subzone: row.try_get("subzone")?,
        subzone_id: row.try_get("subzone_id")?,
        rack_id: row.try_get("rack_id")?,
        network_device_ids: network_device_ids.0,
        dedicated_business_ids: dedicated_business_ids.0,
        resource_type_tags: resource_type_tags.0,
        labels: labels.0,
        status,
        agent_health_code: row.try_get("agent_health_code")?,
        request_id: row.try_get("request_id")?,
        preselected_at: row.try_get("preselected_at")?,
    })
}
