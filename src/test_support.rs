use crate::reading::Batch;
use crate::upload::{UploadError, Uploader};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{Notify, Semaphore};

/// Plays back a fixed list of outcomes, then keeps succeeding. Records every
/// batch it was handed.
pub struct ScriptedUploader {
    outcomes: Mutex<VecDeque<bool>>,
    seen: Mutex<Vec<Batch>>,
    attempts: AtomicUsize,
}

impl ScriptedUploader {
    pub fn new(outcomes: impl IntoIterator<Item = bool>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Vec::<bool>::new())
    }

    pub fn always_failing() -> Self {
        Self::new(std::iter::repeat(false).take(1024))
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Batch> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uploader for ScriptedUploader {
    async fn upload(&self, batch: &Batch) -> Result<(), UploadError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(batch.clone());
        let ok = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
        if ok {
            Ok(())
        } else {
            Err(UploadError::Transport("connection refused".to_string()))
        }
    }
}

/// Holds every upload until the test lets it through, so tests can mutate
/// the buffer while an upload is in flight.
pub struct StallingUploader {
    started: Notify,
    gate: Semaphore,
    succeed: bool,
}

impl StallingUploader {
    pub fn new() -> Self {
        Self::with_outcome(true)
    }

    pub fn with_outcome(succeed: bool) -> Self {
        Self {
            started: Notify::new(),
            gate: Semaphore::new(0),
            succeed,
        }
    }

    /// Resolves once an upload is waiting at the gate.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self, uploads: usize) {
        self.gate.add_permits(uploads);
    }
}

#[async_trait]
impl Uploader for StallingUploader {
    async fn upload(&self, _batch: &Batch) -> Result<(), UploadError> {
        self.started.notify_one();
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|err| UploadError::Transport(err.to_string()))?;
        permit.forget();
        if self.succeed {
            Ok(())
        } else {
            Err(UploadError::Transport("upstream unavailable".to_string()))
        }
    }
}
