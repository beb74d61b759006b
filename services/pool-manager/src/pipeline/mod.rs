//! Asynchronous audit and archival.
//!
//! Foreground code hands work to a [`PipelineHandle`]; two bounded channels
//! feed one consumer loop each. A full channel blocks the sender instead of
//! dropping the item. Failed writes are retried with a [`RetryPolicy`] and
//! then logged; they never reach the request that produced them.

pub mod reaper;

pub use reaper::{ReaperConfig, ReservationReaper};

use std::sync::Arc;

use respool_retry::RetryPolicy;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::model::{AuditEntry, HostId};
use crate::store::ResourceStore;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of each channel.
    pub capacity: usize,
    /// Maximum items per store write.
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            batch_size: 64,
            retry: RetryPolicy::default(),
        }
    }
}

/// Producer side of the pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    audit_tx: mpsc::Sender<AuditEntry>,
    archive_tx: mpsc::Sender<Vec<HostId>>,
}

impl PipelineHandle {
    /// Queue an audit entry, waiting for room if the channel is full.
    pub async fn record(&self, entry: AuditEntry) {
        if let Err(err) = self.audit_tx.send(entry).await {
            warn!(request_id = %err.0.request_id, "Audit pipeline closed; entry dropped");
        }
    }

    /// Queue confirmed hosts for archival.
    pub async fn archive(&self, host_ids: Vec<HostId>) {
        if host_ids.is_empty() {
            return;
        }
        if let Err(err) = self.archive_tx.send(host_ids).await {
            warn!(hosts = err.0.len(), "Archive pipeline closed; batch dropped");
        }
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Start the audit and archive workers.
    pub fn spawn(
        store: Arc<dyn ResourceStore>,
        config: PipelineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (PipelineHandle, Vec<JoinHandle<()>>) {
        let capacity = config.capacity.max(1);
        let (audit_tx, audit_rx) = mpsc::channel(capacity);
        let (archive_tx, archive_rx) = mpsc::channel(capacity);

        let audit = AuditWorker {
            store: store.clone(),
            rx: audit_rx,
            config: config.clone(),
        };
        let archive = ArchiveWorker {
            store,
            rx: archive_rx,
            config,
        };

        let handles = vec![
            tokio::spawn(audit.run(shutdown.clone())),
            tokio::spawn(archive.run(shutdown)),
        ];

        (PipelineHandle { audit_tx, archive_tx }, handles)
    }
}

/// Wait for the first item, then take whatever else is already buffered.
async fn next_batch<T>(rx: &mut mpsc::Receiver<T>, batch_size: usize) -> Option<Vec<T>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    while batch.len() < batch_size.max(1) {
        match rx.try_recv() {
            Ok(item) => batch.push(item),
            Err(_) => break,
        }
    }
    Some(batch)
}

struct AuditWorker {
    store: Arc<dyn ResourceStore>,
    rx: mpsc::Receiver<AuditEntry>,
    config: PipelineConfig,
}

impl AuditWorker {
    #[instrument(name = "audit_worker", skip_all)]
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(batch_size = self.config.batch_size, "Starting audit worker");

        loop {
            tokio::select! {
                batch = next_batch(&mut self.rx, self.config.batch_size) => match batch {
                    Some(batch) => self.flush(batch).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.rx.close();
        while let Some(batch) = next_batch(&mut self.rx, self.config.batch_size).await {
            self.flush(batch).await;
        }
        info!("Audit worker stopped");
    }

    async fn flush(&self, batch: Vec<AuditEntry>) {
        let result = self
            .config
            .retry
            .retry(|attempt| {
                if attempt > 1 {
                    warn!(attempt, entries = batch.len(), "Retrying audit write");
                }
                self.store.append_audit(&batch)
            })
            .await;

        if let Err(err) = result {
            error!(error = %err, entries = batch.len(), "Failed to persist audit entries");
        }
    }
}

struct ArchiveWorker {
    store: Arc<dyn ResourceStore>,
    rx: mpsc::Receiver<Vec<HostId>>,
    config: PipelineConfig,
}

impl ArchiveWorker {
    #[instrument(name = "archive_worker", skip_all)]
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(batch_size = self.config.batch_size, "Starting archive worker");

        loop {
            tokio::select! {
                batch = next_batch(&mut self.rx, self.config.batch_size) => match batch {
                    Some(batch) => self.flush(batch).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.rx.close();
        while let Some(batch) = next_batch(&mut self.rx, self.config.batch_size).await {
            self.flush(batch).await;
        }
        info!("Archive worker stopped");
    }

    async fn flush(&self, batches: Vec<Vec<HostId>>) {
        let host_ids: Vec<HostId> = batches.into_iter().flatten().collect();
        let result = self
            .config
            .retry
            .retry(|_attempt| self.store.archive_used(&host_ids))
            .await;

        match result {
            Ok(moved) => info!(requested = host_ids.len(), moved, "Archived confirmed hosts"),
            Err(err) => error!(error = %err, hosts = host_ids.len(), "Failed to archive hosts"),
        }
    }
}
