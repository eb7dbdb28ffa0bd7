// Batch Orchestrator: starts, tracks and delivers annotation batches

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{
    AttachmentDescriptor, BatchId, BatchSummary, ItemOutcome, LayerHandle, ObjectIdRange, Record,
};
use crate::orchestration::progress::{BatchProgress, BatchState, ProgressRegistry, ProgressStatus};
use crate::phases::{filter_by_range, AnnotationPipeline, DownloadPipeline, FetchPipeline};
use crate::services::archive::ArchiveBuilder;
use crate::services::layer_service::LayerService;
use crate::services::rendering::LabelRenderer;
use crate::utils::Metrics;

/// What a client asks for when starting a batch
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub layer: LayerHandle,
    /// Attribute names rendered on each photo, in this order
    pub selected_fields: Vec<String>,
    pub range: ObjectIdRange,
}

/// Returned as soon as a batch is accepted
#[derive(Debug, Clone, Serialize)]
pub struct BatchTicket {
    pub batch_id: BatchId,
    pub timestamp: i64,
    pub total: usize,
}

/// A spawned batch and the handles needed to observe or stop it
struct ManagedBatch {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    summary: Arc<Mutex<Option<BatchSummary>>>,
}

/// Everything the background task owns
struct BatchJob {
    batch_id: BatchId,
    layer: LayerHandle,
    fields: Vec<String>,
    records: Vec<Record>,
    attachments: Vec<AttachmentDescriptor>,
    working_folder: PathBuf,
    progress: Arc<BatchProgress>,
    cancel: CancellationToken,
    download: Arc<DownloadPipeline>,
    annotate: Arc<AnnotationPipeline>,
    metrics: Metrics,
    summary: Arc<Mutex<Option<BatchSummary>>>,
}

impl BatchJob {
    async fn run(self) {
        let start = Instant::now();

        let downloads = self
            .download
            .execute(
                &self.layer,
                &self.attachments,
                &self.working_folder,
                &self.progress,
                &self.cancel,
            )
            .await;

        let annotated = self
            .annotate
            .execute(
                &downloads.saved,
                &self.records,
                &self.fields,
                &self.progress,
                &self.cancel,
            )
            .await;

        let mut outcomes: HashMap<(i64, i64), ItemOutcome> = downloads
            .skipped
            .into_iter()
            .chain(annotated)
            .map(|(oid, aid, outcome)| ((oid, aid), outcome))
            .collect();

        let mut summary = BatchSummary {
            total: self.attachments.len(),
            ..Default::default()
        };
        for att in &self.attachments {
            let outcome = outcomes
                .remove(&(att.object_id, att.attachment_id))
                .unwrap_or(ItemOutcome::Cancelled);
            summary.record(att.object_id, att.attachment_id, outcome);
        }
        summary.files = downloads.saved;
        summary.set_elapsed(start.elapsed());

        let state = if self.cancel.is_cancelled() {
            info!(
                "Batch {} cancelled ({} annotated before stopping)",
                self.batch_id, summary.annotated
            );
            self.metrics.record_batch_cancelled();
            BatchState::Cancelled
        } else {
            info!(
                "Batch {} complete: {}/{} annotated, {} failed, {:.2}ms",
                self.batch_id,
                summary.annotated,
                summary.total,
                summary.failed(),
                summary.processing_time_ms
            );
            self.metrics.record_batch_completed();
            BatchState::Completed
        };

        // Summary first, so a batch reported ready always has one
        *self.summary.lock() = Some(summary);
        self.progress.finish(state);
    }
}

/// Main batch orchestrator
pub struct BatchOrchestrator {
    service: Arc<dyn LayerService>,
    fetch: FetchPipeline,
    download: Arc<DownloadPipeline>,
    annotate: Arc<AnnotationPipeline>,
    archive: ArchiveBuilder,
    progress: ProgressRegistry,
    batches: DashMap<BatchId, ManagedBatch>,
    /// Batches whose files are being zipped or discarded right now
    claimed: DashSet<BatchId>,
    last_batch_id: Mutex<Option<BatchId>>,
    retention: Duration,
    metrics: Metrics,
}

/// Exclusive hold on a batch's files, released on drop
struct BatchClaim<'a> {
    claimed: &'a DashSet<BatchId>,
    batch_id: BatchId,
}

impl Drop for BatchClaim<'_> {
    fn drop(&mut self) {
        self.claimed.remove(&self.batch_id);
    }
}

impl BatchOrchestrator {
    #[instrument(skip_all)]
    pub fn new(config: Arc<Config>, service: Arc<dyn LayerService>, metrics: Metrics) -> Self {
        let renderer = Arc::new(LabelRenderer::new(&config.annotation));

        let fetch = FetchPipeline::new(Arc::clone(&service));
        let download = Arc::new(DownloadPipeline::new(
            Arc::clone(&service),
            metrics.clone(),
            config.download_concurrency(),
        ));
        let annotate = Arc::new(AnnotationPipeline::new(
            renderer,
            metrics.clone(),
            &config.annotation,
        ));

        info!(
            "✓ Ready (uploads: {}, download concurrency: {})",
            config.upload_folder().display(),
            config.download_concurrency()
        );

        Self {
            service,
            fetch,
            download,
            annotate,
            archive: ArchiveBuilder::new(config.upload_folder()),
            progress: ProgressRegistry::new(),
            batches: DashMap::new(),
            claimed: DashSet::new(),
            last_batch_id: Mutex::new(None),
            retention: config.batch_retention(),
            metrics,
        }
    }

    /// Fetch and filter, then hand the batch to a background task.
    /// Returns as soon as the task is spawned; query failures abort before that.
    #[instrument(skip(self, request), fields(layer = %request.layer.url, range = ?request.range))]
    pub async fn start_batch(&self, request: BatchRequest) -> PipelineResult<BatchTicket> {
        if let ObjectIdRange::Between { start, end } = request.range {
            if start > end {
                return Err(PipelineError::InvalidRange { start, end });
            }
        }

        let fetch_start = Instant::now();
        let contents = self.fetch.execute(&request.layer).await?;
        let total_records = match request.range {
            ObjectIdRange::All => self.service.count_records(&request.layer).await?,
            ObjectIdRange::Between { .. } => contents.records.len() as u64,
        };
        self.metrics.record_fetch_duration(fetch_start.elapsed());

        let selected = filter_by_range(&contents.attachments, request.range, total_records);

        let (batch_id, working_folder) = self.create_working_folder().await?;

        let total = selected.len();
        let progress = self.progress.register(batch_id, total);
        self.metrics.record_batch_started();

        let cancel = CancellationToken::new();
        let summary = Arc::new(Mutex::new(None));
        let job = BatchJob {
            batch_id,
            layer: request.layer,
            fields: request.selected_fields,
            records: contents.records,
            attachments: selected,
            working_folder,
            progress: Arc::clone(&progress),
            cancel: cancel.clone(),
            download: Arc::clone(&self.download),
            annotate: Arc::clone(&self.annotate),
            metrics: self.metrics.clone(),
            summary: Arc::clone(&summary),
        };

        let metrics = self.metrics.clone();
        let handle = tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(job.run()).catch_unwind().await {
                let message = panic_message(panic.as_ref());
                error!("Batch {} task panicked: {}", batch_id, message);
                progress.finish(BatchState::Failed(message));
                metrics.record_batch_failed();
            }
        });

        self.batches.insert(
            batch_id,
            ManagedBatch {
                cancel,
                handle,
                summary,
            },
        );

        info!("Batch {} started with {} attachments", batch_id, total);

        Ok(BatchTicket {
            batch_id,
            timestamp: batch_id.timestamp,
            total,
        })
    }

    /// Allocate a batch id whose working folder this call creates. Ids whose
    /// folder already exists on disk are passed over.
    async fn create_working_folder(&self) -> PipelineResult<(BatchId, PathBuf)> {
        let upload = self.archive.upload_folder();
        tokio::fs::create_dir_all(upload)
            .await
            .map_err(|source| PipelineError::WorkingFolder {
                path: upload.display().to_string(),
                source,
            })?;

        loop {
            let batch_id = self.next_batch_id();
            let folder = self.archive.working_folder(&batch_id);
            match tokio::fs::create_dir(&folder).await {
                Ok(()) => return Ok((batch_id, folder)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!("{} already exists, taking the next batch id", folder.display());
                }
                Err(source) => {
                    return Err(PipelineError::WorkingFolder {
                        path: folder.display().to_string(),
                        source,
                    })
                }
            }
        }
    }

    /// Ids are the start second plus a sequence that grows while batches
    /// keep starting within the same second.
    fn next_batch_id(&self) -> BatchId {
        let now = Utc::now().timestamp();
        let mut last = self.last_batch_id.lock();
        let id = match *last {
            Some(prev) if prev.timestamp >= now => BatchId::new(prev.timestamp, prev.sequence + 1),
            _ => BatchId::new(now, 0),
        };
        *last = Some(id);
        id
    }

    pub fn status(&self, batch_id: &BatchId) -> Option<ProgressStatus> {
        self.progress.poll(batch_id)
    }

    /// Status of the most recently started batch
    pub fn latest_status(&self) -> Option<ProgressStatus> {
        self.progress.latest()
    }

    pub fn is_finished(&self, batch_id: &BatchId) -> Option<bool> {
        self.batches.get(batch_id).map(|batch| batch.handle.is_finished())
    }

    /// Request cooperative cancellation; items not yet started are skipped
    pub fn cancel(&self, batch_id: &BatchId) -> PipelineResult<()> {
        let batch = self
            .batches
            .get(batch_id)
            .ok_or_else(|| PipelineError::UnknownBatch(batch_id.to_string()))?;
        batch.cancel.cancel();
        info!("Cancellation requested for batch {}", batch_id);
        Ok(())
    }

    /// Cancel every batch still running
    pub fn cancel_all(&self) {
        for batch in self.batches.iter() {
            if !batch.handle.is_finished() {
                batch.cancel.cancel();
            }
        }
    }

    /// Cancel running batches and wait up to `grace` for their tasks to stop.
    /// Their progress stays readable; their task handles are dropped.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel_all();

        let running: Vec<BatchId> = self
            .batches
            .iter()
            .filter(|batch| !batch.handle.is_finished())
            .map(|batch| *batch.key())
            .collect();
        let handles: Vec<JoinHandle<()>> = running
            .iter()
            .filter_map(|batch_id| self.batches.remove(batch_id))
            .map(|(_, batch)| batch.handle)
            .collect();
        if handles.is_empty() {
            return;
        }

        info!("Waiting for {} batch task(s) to stop", handles.len());
        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(_) => info!("All batch tasks stopped"),
            Err(_) => warn!("Batch tasks still running after {:?}, abandoning them", grace),
        }
    }

    fn claim(&self, batch_id: &BatchId) -> Option<BatchClaim<'_>> {
        self.claimed.insert(*batch_id).then(|| BatchClaim {
            claimed: &self.claimed,
            batch_id: *batch_id,
        })
    }

    /// Discard every finished batch that has waited longer than `retention`
    /// without being downloaded: its progress, summary and working folder.
    /// Returns how many batches were discarded.
    pub async fn evict_finished(&self, retention: Duration) -> usize {
        let expired: Vec<BatchId> = self
            .batches
            .iter()
            .filter(|batch| batch.handle.is_finished())
            .filter(|batch| {
                self.progress
                    .get(batch.key())
                    .and_then(|progress| progress.finished_for())
                    .is_some_and(|age| age >= retention)
            })
            .map(|batch| *batch.key())
            .collect();

        let mut evicted = 0;
        for batch_id in expired {
            let Some(_claim) = self.claim(&batch_id) else {
                continue;
            };
            self.batches.remove(&batch_id);
            self.progress.remove(&batch_id);
            self.archive.discard(&batch_id).await;
            evicted += 1;
        }

        if evicted > 0 {
            info!("Discarded {} batch(es) not downloaded within {:?}", evicted, retention);
            self.metrics.record_batches_evicted(evicted);
        }
        evicted
    }

    /// `evict_finished` with the configured retention
    pub async fn sweep_expired(&self) -> usize {
        self.evict_finished(self.retention).await
    }

    pub fn summary(&self, batch_id: &BatchId) -> PipelineResult<BatchSummary> {
        let batch = self
            .batches
            .get(batch_id)
            .ok_or_else(|| PipelineError::UnknownBatch(batch_id.to_string()))?;

        if let Some(summary) = batch.summary.lock().clone() {
            return Ok(summary);
        }

        match self.progress.get(batch_id).map(|p| p.state()) {
            Some(BatchState::Failed(message)) => Err(PipelineError::TaskFailed(message)),
            _ => Err(PipelineError::StillRunning(batch_id.to_string())),
        }
    }

    /// Zip the batch's working folder, then forget the batch and remove its files.
    /// A batch that is still running, or already being archived, is refused.
    /// Ids this process does not know are still zipped, which yields an empty
    /// archive when nothing is on disk. A failed build keeps the batch for a retry.
    #[instrument(skip(self))]
    pub async fn archive(&self, batch_id: &BatchId) -> PipelineResult<Vec<u8>> {
        if let Some(BatchState::Running) = self.progress.get(batch_id).map(|p| p.state()) {
            return Err(PipelineError::StillRunning(batch_id.to_string()));
        }

        let _claim = self
            .claim(batch_id)
            .ok_or_else(|| PipelineError::ArchiveInProgress(batch_id.to_string()))?;
        let bytes = self.archive.build(batch_id).await?;

        self.batches.remove(batch_id);
        if self.progress.remove(batch_id).is_none() {
            warn!("Archive served for untracked batch {}", batch_id);
        }
        self.metrics.record_archive_served();

        Ok(bytes)
    }

    pub fn active_batches(&self) -> usize {
        self.batches
            .iter()
            .filter(|batch| !batch.handle.is_finished())
            .count()
    }

    /// Batches whose progress is still held, running or awaiting download
    pub fn tracked_batches(&self) -> usize {
        self.progress.len()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
