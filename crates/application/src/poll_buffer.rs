//! Bounded, deduplicating buffer for controller last-poll timestamps.
//!
//! [`PollBuffer`] handles are cheap to clone and never block the polling
//! path. Exactly one [`PollBufferFlusher`] drains the queue on a fixed period
//! and once more on shutdown.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetgate_core::{AppError, AppResult, TenantId};
use fleetgate_domain::ControllerId;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info};

use crate::deployment_ports::{DeferredEvents, DeploymentEvent, EventPublisher, TargetRepository};

/// How poll timestamps are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPersistenceMode {
    /// Every poll writes through immediately.
    Eager,
    /// Polls are queued and flushed in bulk.
    Buffered,
}

impl PollPersistenceMode {
    /// Parses `eager` or `buffered`.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "eager" => Ok(Self::Eager),
            "buffered" => Ok(Self::Buffered),
            _ => Err(AppError::Validation(format!(
                "unknown poll persistence mode '{value}'"
            ))),
        }
    }
}

/// Poll buffer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBufferConfig {
    /// Persistence mode.
    pub mode: PollPersistenceMode,
    /// Queue capacity.
    pub capacity: usize,
    /// Period between flushes.
    pub flush_interval: Duration,
    /// Maximum controllers per bulk statement.
    pub max_rows_per_statement: usize,
}

impl Default for PollBufferConfig {
    fn default() -> Self {
        Self {
            mode: PollPersistenceMode::Buffered,
            capacity: 5000,
            flush_interval: Duration::from_secs(2),
            max_rows_per_statement: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PollRecord {
    tenant_id: TenantId,
    controller_id: ControllerId,
}

/// Producer handle of the poll buffer.
#[derive(Clone)]
pub struct PollBuffer {
    sender: mpsc::Sender<PollRecord>,
    mode: PollPersistenceMode,
}

impl PollBuffer {
    /// Creates the producer handle and its single flusher.
    #[must_use]
    pub fn new(
        config: PollBufferConfig,
        repository: Arc<dyn TargetRepository>,
        publisher: Arc<dyn EventPublisher>,
    ) -> (Self, PollBufferFlusher) {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));

        (
            Self {
                sender,
                mode: config.mode,
            },
            PollBufferFlusher {
                receiver,
                repository,
                publisher,
                flush_interval: config.flush_interval,
                max_rows_per_statement: config.max_rows_per_statement.max(1),
                shutdown: Arc::new(Notify::new()),
            },
        )
    }

    /// Returns true when polls are queued rather than written through.
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        self.mode == PollPersistenceMode::Buffered
    }

    /// Queues one poll without blocking.
    ///
    /// Returns false in eager mode and when the queue is full or closed; the
    /// caller then writes through.
    pub fn try_record_poll(&self, tenant_id: TenantId, controller_id: ControllerId) -> bool {
        if !self.is_buffered() {
            return false;
        }

        self.sender
            .try_send(PollRecord {
                tenant_id,
                controller_id,
            })
            .is_ok()
    }
}

/// Counters of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records drained from the queue.
    pub drained: usize,
    /// Distinct (tenant, controller) pairs after deduplication.
    pub distinct: usize,
    /// Rows reported updated by the repository.
    pub updated: u64,
    /// Chunks that failed to persist.
    pub failed_chunks: usize,
}

/// Single consumer persisting buffered polls.
pub struct PollBufferFlusher {
    receiver: mpsc::Receiver<PollRecord>,
    repository: Arc<dyn TargetRepository>,
    publisher: Arc<dyn EventPublisher>,
    flush_interval: Duration,
    max_rows_per_statement: usize,
    shutdown: Arc<Notify>,
}

impl PollBufferFlusher {
    /// Returns a handle that stops [`PollBufferFlusher::run`] after a final flush.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Flushes on every interval until shutdown is signalled.
    pub async fn run(mut self) {
        info!(
            interval_ms = self.flush_interval.as_millis() as u64,
            "poll buffer flusher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    let report = self.flush().await;
                    info!(drained = report.drained, "poll buffer flusher stopped after final flush");
                    break;
                }
                _ = tokio::time::sleep(self.flush_interval) => {
                    self.flush().await;
                }
            }
        }
    }

    /// Drains, deduplicates and persists every queued poll.
    pub async fn flush(&mut self) -> FlushReport {
        let mut pending: BTreeMap<TenantId, BTreeSet<ControllerId>> = BTreeMap::new();
        let mut report = FlushReport::default();

        while let Ok(record) = self.receiver.try_recv() {
            report.drained += 1;
            pending
                .entry(record.tenant_id)
                .or_default()
                .insert(record.controller_id);
        }

        if report.drained == 0 {
            return report;
        }

        let polled_at = Utc::now();
        for (tenant_id, controller_ids) in pending {
            report.distinct += controller_ids.len();
            let controller_ids: Vec<ControllerId> = controller_ids.into_iter().collect();

            for chunk in controller_ids.chunks(self.max_rows_per_statement) {
                match self
                    .repository
                    .touch_last_poll(tenant_id, chunk, polled_at)
                    .await
                {
                    Ok(updated) => {
                        report.updated += updated;
                        let mut events = DeferredEvents::new();
                        for controller_id in chunk {
                            events.push(DeploymentEvent::PollObserved {
                                tenant_id,
                                controller_id: controller_id.clone(),
                                polled_at,
                            });
                        }
                        events.publish_all(self.publisher.as_ref()).await;
                    }
                    Err(error) => {
                        report.failed_chunks += 1;
                        error!(
                            tenant_id = %tenant_id,
                            rows = chunk.len(),
                            error = %error,
                            "failed to persist buffered polls"
                        );
                    }
                }
            }
        }

        debug!(
            drained = report.drained,
            distinct = report.distinct,
            updated = report.updated,
            failed_chunks = report.failed_chunks,
            "flushed poll buffer"
        );
        report
    }
}
