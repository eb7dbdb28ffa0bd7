// Per-batch progress tracking
//
// Every batch gets its own record, so a second batch never disturbs the
// counters of one that is still running. The poller reads, the batch task writes.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::types::BatchId;

/// Lifecycle of a batch task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchState {
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

/// Why an item was resolved without being annotated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Download,
    RecordMissing,
    Annotation,
    Cancelled,
}

/// What the poll endpoint returns
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProgressStatus {
    Processing { batch_id: BatchId, remaining: usize, total: usize },
    Ready { batch_id: BatchId, timestamp: i64 },
    Failed { batch_id: BatchId, error: String },
    Cancelled { batch_id: BatchId, remaining: usize },
}

/// Counter snapshot of one batch
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub batch_id: BatchId,
    pub total: usize,
    pub remaining: usize,
    pub annotated: usize,
    pub download_failed: usize,
    pub record_missing: usize,
    pub annotation_failed: usize,
    pub cancelled: usize,
    pub started_at: DateTime<Utc>,
}

pub struct BatchProgress {
    batch_id: BatchId,
    total: usize,
    remaining: AtomicUsize,
    annotated: AtomicUsize,
    download_failed: AtomicUsize,
    record_missing: AtomicUsize,
    annotation_failed: AtomicUsize,
    cancelled: AtomicUsize,
    state: RwLock<BatchState>,
    finished_at: RwLock<Option<Instant>>,
    started_at: DateTime<Utc>,
}

impl BatchProgress {
    pub fn new(batch_id: BatchId, total: usize) -> Self {
        Self {
            batch_id,
            total,
            remaining: AtomicUsize::new(total),
            annotated: AtomicUsize::new(0),
            download_failed: AtomicUsize::new(0),
            record_missing: AtomicUsize::new(0),
            annotation_failed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            state: RwLock::new(BatchState::Running),
            finished_at: RwLock::new(None),
            started_at: Utc::now(),
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn annotated(&self) -> usize {
        self.annotated.load(Ordering::Acquire)
    }

    /// Decrement `remaining` by one, never below zero
    fn resolve_one(&self) {
        let _ = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// One image annotated and written back
    pub fn record_annotated(&self) {
        self.annotated.fetch_add(1, Ordering::AcqRel);
        self.resolve_one();
    }

    /// One item skipped. Skipped items still count as resolved so the batch
    /// always reaches zero remaining.
    pub fn record_failure(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::Download => &self.download_failed,
            FailureKind::RecordMissing => &self.record_missing,
            FailureKind::Annotation => &self.annotation_failed,
            FailureKind::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::AcqRel);
        self.resolve_one();
    }

    pub fn finish(&self, state: BatchState) {
        *self.state.write() = state;
        self.finished_at.write().get_or_insert_with(Instant::now);
    }

    /// Time since the batch left `Running`, `None` while it still runs
    pub fn finished_for(&self) -> Option<Duration> {
        self.finished_at.read().map(|at| at.elapsed())
    }

    pub fn state(&self) -> BatchState {
        self.state.read().clone()
    }

    pub fn status(&self) -> ProgressStatus {
        let remaining = self.remaining();
        match self.state() {
            BatchState::Running => ProgressStatus::Processing {
                batch_id: self.batch_id,
                remaining,
                total: self.total,
            },
            BatchState::Completed => ProgressStatus::Ready {
                batch_id: self.batch_id,
                timestamp: self.batch_id.timestamp,
            },
            BatchState::Failed(error) => ProgressStatus::Failed {
                batch_id: self.batch_id,
                error,
            },
            BatchState::Cancelled => ProgressStatus::Cancelled {
                batch_id: self.batch_id,
                remaining,
            },
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            batch_id: self.batch_id,
            total: self.total,
            remaining: self.remaining(),
            annotated: self.annotated(),
            download_failed: self.download_failed.load(Ordering::Acquire),
            record_missing: self.record_missing.load(Ordering::Acquire),
            annotation_failed: self.annotation_failed.load(Ordering::Acquire),
            cancelled: self.cancelled.load(Ordering::Acquire),
            started_at: self.started_at,
        }
    }
}

/// Concurrent map of batch progress records keyed by batch id
#[derive(Default)]
pub struct ProgressRegistry {
    batches: DashMap<BatchId, Arc<BatchProgress>>,
    latest: RwLock<Option<BatchId>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a batch of `total` items; it becomes the latest batch
    pub fn register(&self, batch_id: BatchId, total: usize) -> Arc<BatchProgress> {
        let progress = Arc::new(BatchProgress::new(batch_id, total));
        self.batches.insert(batch_id, Arc::clone(&progress));
        *self.latest.write() = Some(batch_id);
        progress
    }

    pub fn get(&self, batch_id: &BatchId) -> Option<Arc<BatchProgress>> {
        self.batches.get(batch_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn poll(&self, batch_id: &BatchId) -> Option<ProgressStatus> {
        self.get(batch_id).map(|progress| progress.status())
    }

    /// Status of the most recently registered batch still being tracked
    pub fn latest(&self) -> Option<ProgressStatus> {
        let latest = (*self.latest.read())?;
        self.poll(&latest)
    }

    pub fn remove(&self, batch_id: &BatchId) -> Option<Arc<BatchProgress>> {
        self.batches.remove(batch_id).map(|(_, progress)| progress)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
