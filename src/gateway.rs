#[cfg(test)]
mod tests;

use crate::buffer::{BufferStatus, SensorBuffer};
use crate::error::GatewayError;
use crate::reading::{Batch, BatchSummary, Reading};
use crate::upload::{upload_with_timeout, UploadError, Uploader};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

/// Result of one batch formation attempt.
#[derive(Debug)]
pub enum BatchOutcome {
    Uploaded {
        size: usize,
        batch_timestamp: DateTime<Utc>,
    },
    /// Upload failed; the batch now sits in the offline queue and its
    /// readings are still in the ingest buffer.
    Queued {
        size: usize,
        batch_timestamp: DateTime<Utc>,
        reason: UploadError,
    },
}

impl BatchOutcome {
    pub fn uploaded(&self) -> bool {
        matches!(self, BatchOutcome::Uploaded { .. })
    }

    pub fn size(&self) -> usize {
        match self {
            BatchOutcome::Uploaded { size, .. } | BatchOutcome::Queued { size, .. } => *size,
        }
    }

    pub fn batch_timestamp(&self) -> DateTime<Utc> {
        match self {
            BatchOutcome::Uploaded {
                batch_timestamp, ..
            }
            | BatchOutcome::Queued {
                batch_timestamp, ..
            } => *batch_timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub uploaded: usize,
    pub failed: usize,
    pub remaining: usize,
}

/// Drives batch formation and offline retries against a shared buffer.
pub struct Gateway {
    gateway_id: String,
    buffer: Arc<SensorBuffer>,
    uploader: Arc<dyn Uploader>,
    upload_timeout: Duration,
    // Only one batch may be in flight, otherwise two successes would each
    // evict the same snapshot.
    batch_gate: Mutex<()>,
    retry_gate: Mutex<()>,
}

impl Gateway {
    pub fn new(
        gateway_id: impl Into<String>,
        buffer: Arc<SensorBuffer>,
        uploader: Arc<dyn Uploader>,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            buffer,
            uploader,
            upload_timeout,
            batch_gate: Mutex::new(()),
            retry_gate: Mutex::new(()),
        }
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    pub fn buffer(&self) -> &Arc<SensorBuffer> {
        &self.buffer
    }

    pub fn submit(&self, reading: Reading) {
        self.buffer.add_reading(reading);
    }

    pub fn status(&self) -> BufferStatus {
        self.buffer.status()
    }

    pub fn list_offline(&self) -> Vec<BatchSummary> {
        self.buffer
            .offline_batches()
            .iter()
            .map(|entry| entry.batch.summary())
            .collect()
    }

    /// Snapshots the whole ingest buffer into a batch and uploads it. On
    /// success exactly the snapshotted readings are evicted; on failure the
    /// batch is queued for retry and the buffer is left untouched.
    pub async fn force_batch(&self) -> Result<BatchOutcome, GatewayError> {
        let _in_flight = self.batch_gate.lock().await;

        let snapshot = self
            .buffer
            .snapshot_readings()
            .ok_or(GatewayError::EmptyBuffer)?;
        let batch = Batch::new(self.gateway_id.clone(), snapshot.readings);
        let size = batch.len();
        let batch_timestamp = batch.batch_timestamp;

        match upload_with_timeout(self.uploader.as_ref(), &batch, self.upload_timeout).await {
            Ok(()) => {
                let cleared = self.buffer.acknowledge(snapshot.through_seq);
                tracing::info!(size, cleared, "batch uploaded");
                Ok(BatchOutcome::Uploaded {
                    size,
                    batch_timestamp,
                })
            }
            Err(reason) => {
                tracing::warn!(error=%reason, size, "batch upload failed; queued for retry");
                self.buffer.queue_offline(batch);
                Ok(BatchOutcome::Queued {
                    size,
                    batch_timestamp,
                    reason,
                })
            }
        }
    }

    /// Re-uploads every queued batch once. Uploaded batches leave the queue;
    /// failed ones and anything queued meanwhile stay.
    pub async fn retry_offline(&self) -> RetryReport {
        let _pass = self.retry_gate.lock().await;

        let queued = self.buffer.offline_batches();
        if queued.is_empty() {
            return RetryReport::default();
        }

        let mut uploaded = Vec::with_capacity(queued.len());
        let mut failed = 0usize;
        for entry in &queued {
            match upload_with_timeout(self.uploader.as_ref(), &entry.batch, self.upload_timeout)
                .await
            {
                Ok(()) => uploaded.push(entry.id),
                Err(err) => {
                    failed += 1;
                    tracing::debug!(
                        error=%err,
                        size = entry.batch.len(),
                        batch_timestamp = %entry.batch.batch_timestamp,
                        "offline batch retry failed"
                    );
                }
            }
        }

        let remaining = self.buffer.resolve_offline(&uploaded);
        let report = RetryReport {
            uploaded: uploaded.len(),
            failed,
            remaining,
        };
        if failed > 0 {
            tracing::warn!(
                uploaded = report.uploaded,
                failed,
                remaining,
                "offline retry pass incomplete"
            );
        } else {
            tracing::info!(uploaded = report.uploaded, remaining, "offline retry pass complete");
        }
        report
    }
}

/// Forms a batch whenever the threshold is reached (checked every
/// `poll_interval`) and flushes whatever is buffered every `flush_interval`.
/// The threshold trigger is suspended while the offline queue holds batches;
/// during an outage only the flush interval forms new batches.
pub async fn run_batch_scheduler(
    gateway: Arc<Gateway>,
    poll_interval: Duration,
    flush_interval: Duration,
) {
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut flush = tokio::time::interval(flush_interval);
    flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
    flush.tick().await;

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let buffer = gateway.buffer();
                if !buffer.should_batch_upload() || buffer.offline_len() > 0 {
                    continue;
                }
                scheduled_batch(&gateway, "threshold").await;
            }
            _ = flush.tick() => {
                scheduled_batch(&gateway, "interval").await;
            }
        }
    }
}

async fn scheduled_batch(gateway: &Gateway, trigger: &'static str) {
    match gateway.force_batch().await {
        Ok(outcome) => {
            tracing::debug!(
                trigger,
                uploaded = outcome.uploaded(),
                size = outcome.size(),
                "scheduled batch"
            );
        }
        Err(GatewayError::EmptyBuffer) => {}
    }
}

/// Replays the offline queue every `interval` while it holds batches.
pub async fn run_retry_scheduler(gateway: Arc<Gateway>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if gateway.buffer().offline_len() == 0 {
            continue;
        }
        gateway.retry_offline().await;
    }
}
