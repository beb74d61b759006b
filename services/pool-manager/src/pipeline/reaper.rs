//! Reclaims reservations whose caller never confirmed or rolled back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use super::PipelineHandle;
use crate::model::{AuditAction, AuditEntry, HostId};
use crate::store::{ResourceStore, StoreResult};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to sweep.
    pub interval: Duration,
    /// Age after which a `Preselected` row is released.
    pub reservation_ttl: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            reservation_ttl: Duration::from_secs(1800),
        }
    }
}

pub struct ReservationReaper {
    store: Arc<dyn ResourceStore>,
    pipeline: PipelineHandle,
    config: ReaperConfig,
}

impl ReservationReaper {
    pub fn new(store: Arc<dyn ResourceStore>, pipeline: PipelineHandle, config: ReaperConfig) -> Self {
        Self {
            store,
            pipeline,
            config,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            reservation_ttl_secs = self.config.reservation_ttl.as_secs(),
            "Starting reservation reaper"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Reservation sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reservation reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Release every expired reservation; returns the number of hosts freed.
    pub async fn sweep(&self) -> StoreResult<usize> {
        let ttl = chrono::Duration::from_std(self.config.reservation_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let released = self.store.release_stale(cutoff).await?;
        if released.is_empty() {
            return Ok(0);
        }

        let mut by_request: BTreeMap<String, Vec<HostId>> = BTreeMap::new();
        for stale in &released {
            by_request
                .entry(stale.request_id.clone())
                .or_default()
                .push(stale.host_id);
        }

        for (request_id, host_ids) in by_request {
            warn!(request_id = %request_id, hosts = host_ids.len(), "Released expired reservation");
            self.pipeline
                .record(AuditEntry::new(request_id, AuditAction::Expired, host_ids))
                .await;
        }

        Ok(released.len())
    }
}
