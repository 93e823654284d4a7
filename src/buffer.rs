use crate::reading::{Batch, Reading};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct SequencedReading {
    seq: u64,
    reading: Reading,
}

/// A batch waiting in the offline queue, tagged so a retry pass can remove
/// exactly the entries it uploaded.
#[derive(Debug, Clone)]
pub struct QueuedBatch {
    pub id: u64,
    pub batch: Batch,
}

/// Copy of the ingest buffer taken for batch formation.
#[derive(Debug, Clone)]
pub struct ReadingsSnapshot {
    pub readings: Vec<Reading>,
    /// Sequence number of the newest reading in the snapshot.
    pub through_seq: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub ingest_count: usize,
    pub max_size: usize,
    pub batch_threshold: usize,
    pub offline_count: usize,
    pub should_upload: bool,
    pub dropped_readings: u64,
    pub dropped_batches: u64,
}

#[derive(Debug)]
struct BufferState {
    readings: VecDeque<SequencedReading>,
    next_seq: u64,
    offline: VecDeque<QueuedBatch>,
    next_batch_id: u64,
    dropped_readings: u64,
    dropped_batches: u64,
}

/// Bounded ring buffer of inbound readings plus the queue of batches whose
/// upload failed. All state sits behind one lock that is never held across
/// an upstream call.
#[derive(Debug)]
pub struct SensorBuffer {
    max_size: usize,
    batch_threshold: usize,
    offline_capacity: Option<usize>,
    state: Mutex<BufferState>,
}

impl SensorBuffer {
    pub fn new(max_size: usize, batch_threshold: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            batch_threshold,
            offline_capacity: None,
            state: Mutex::new(BufferState {
                readings: VecDeque::with_capacity(max_size),
                next_seq: 1,
                offline: VecDeque::new(),
                next_batch_id: 1,
                dropped_readings: 0,
                dropped_batches: 0,
            }),
        }
    }

    /// Caps the offline queue; once full the oldest batch is dropped. Zero
    /// leaves the queue unbounded.
    pub fn with_offline_capacity(mut self, capacity: usize) -> Self {
        self.offline_capacity = (capacity > 0).then_some(capacity);
        self
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn batch_threshold(&self) -> usize {
        self.batch_threshold
    }

    /// Appends a reading. When the buffer is full the oldest reading is
    /// dropped to make room; this never fails and never blocks on upstream.
    pub fn add_reading(&self, reading: Reading) {
        let mut state = self.state();
        if state.readings.len() >= self.max_size {
            state.readings.pop_front();
            state.dropped_readings = state.dropped_readings.saturating_add(1);
            tracing::trace!(
                max_size = self.max_size,
                dropped_readings = state.dropped_readings,
                "ingest buffer full; dropped oldest reading"
            );
        }
        let seq = state.next_seq;
        state.next_seq = seq.saturating_add(1);
        state.readings.push_back(SequencedReading { seq, reading });
    }

    /// Copies the buffered readings in FIFO order, optionally only the first
    /// `limit` of them.
    pub fn get_readings(&self, limit: Option<usize>) -> Vec<Reading> {
        let state = self.state();
        let take = limit.unwrap_or(usize::MAX);
        state
            .readings
            .iter()
            .take(take)
            .map(|entry| entry.reading.clone())
            .collect()
    }

    /// Removes up to `count` readings from the front. Returns how many were
    /// removed.
    pub fn clear_readings(&self, count: usize) -> usize {
        let mut state = self.state();
        clear_front(&mut state, count)
    }

    pub fn should_batch_upload(&self) -> bool {
        self.state().readings.len() >= self.batch_threshold
    }

    pub fn len(&self) -> usize {
        self.state().readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().readings.is_empty()
    }

    /// Snapshots the whole ingest buffer for batch formation, or `None` when
    /// there is nothing to send.
    pub fn snapshot_readings(&self) -> Option<ReadingsSnapshot> {
        let state = self.state();
        let through_seq = state.readings.back()?.seq;
        Some(ReadingsSnapshot {
            readings: state
                .readings
                .iter()
                .map(|entry| entry.reading.clone())
                .collect(),
            through_seq,
        })
    }

    /// Evicts the readings of an uploaded snapshot. Only entries at or below
    /// `through_seq` are counted, so readings that arrived after the snapshot
    /// stay even if overflow already pushed some snapshot entries out.
    pub fn acknowledge(&self, through_seq: u64) -> usize {
        let mut state = self.state();
        let count = state
            .readings
            .iter()
            .take_while(|entry| entry.seq <= through_seq)
            .count();
        clear_front(&mut state, count)
    }

    /// Parks a batch for a later retry. Returns the queue entry id.
    pub fn queue_offline(&self, batch: Batch) -> u64 {
        let mut state = self.state();
        if let Some(capacity) = self.offline_capacity {
            while state.offline.len() >= capacity {
                let Some(dropped) = state.offline.pop_front() else {
                    break;
                };
                state.dropped_batches = state.dropped_batches.saturating_add(1);
                tracing::warn!(
                    capacity,
                    readings = dropped.batch.len(),
                    batch_timestamp = %dropped.batch.batch_timestamp,
                    "offline queue full; dropped oldest batch"
                );
            }
        }
        let id = state.next_batch_id;
        state.next_batch_id = id.saturating_add(1);
        state.offline.push_back(QueuedBatch { id, batch });
        id
    }

    /// Copies the offline queue in queue order.
    pub fn offline_batches(&self) -> Vec<QueuedBatch> {
        self.state().offline.iter().cloned().collect()
    }

    pub fn offline_len(&self) -> usize {
        self.state().offline.len()
    }

    /// Removes the entries a retry pass uploaded. Everything else stays in
    /// place, including batches queued while the pass was running. Returns
    /// the remaining queue length.
    pub fn resolve_offline(&self, uploaded: &[u64]) -> usize {
        let mut state = self.state();
        if !uploaded.is_empty() {
            state.offline.retain(|entry| !uploaded.contains(&entry.id));
        }
        state.offline.len()
    }

    pub fn status(&self) -> BufferStatus {
        let state = self.state();
        BufferStatus {
            ingest_count: state.readings.len(),
            max_size: self.max_size,
            batch_threshold: self.batch_threshold,
            offline_count: state.offline.len(),
            should_upload: state.readings.len() >= self.batch_threshold,
            dropped_readings: state.dropped_readings,
            dropped_batches: state.dropped_batches,
        }
    }
}

fn clear_front(state: &mut BufferState, count: usize) -> usize {
    let count = count.min(state.readings.len());
    state.readings.drain(..count);
    count
}
