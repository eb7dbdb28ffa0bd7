// Download phase: attachments into the batch working folder

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::errors::{DownloadError, DownloadResult};
use crate::core::types::{AttachmentDescriptor, ItemOutcome, LayerHandle, SavedAttachment};
use crate::orchestration::progress::{BatchProgress, FailureKind};
use crate::services::layer_service::LayerService;
use crate::utils::Metrics;

/// What the download phase produced for a batch
#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Files on disk, in attachment order
    pub saved: Vec<SavedAttachment>,
    /// Items that never reached the disk, with the reason
    pub skipped: Vec<(i64, i64, ItemOutcome)>,
}

/// Download pipeline: saves each selected attachment as
/// `<working>/object_id_<oid>/<name>`
pub struct DownloadPipeline {
    service: Arc<dyn LayerService>,
    metrics: Metrics,
    concurrency: usize,
}

impl DownloadPipeline {
    pub fn new(service: Arc<dyn LayerService>, metrics: Metrics, concurrency: usize) -> Self {
        Self {
            service,
            metrics,
            concurrency: concurrency.max(1),
        }
    }

    /// Download every attachment. A failed item is logged, counted as
    /// resolved in `progress`, and skipped; the rest carry on.
    #[instrument(skip_all, fields(items = attachments.len(), folder = %working_folder.display()))]
    pub async fn execute(
        &self,
        layer: &LayerHandle,
        attachments: &[AttachmentDescriptor],
        working_folder: &Path,
        progress: &BatchProgress,
        cancel: &CancellationToken,
    ) -> DownloadReport {
        let start = Instant::now();
        let names = planned_file_names(attachments);

        let results: Vec<DownloadResult<SavedAttachment>> =
            stream::iter(attachments.iter().cloned().zip(names))
                .map(|(att, name)| async move {
                    self.download_one(layer, &att, name, working_folder, cancel).await
                })
                .buffered(self.concurrency)
                .collect()
                .await;

        let mut report = DownloadReport::default();
        for (att, result) in attachments.iter().zip(results) {
            match result {
                Ok(saved) => {
                    self.metrics.record_download(true);
                    report.saved.push(saved);
                }
                Err(DownloadError::Cancelled) => {
                    progress.record_failure(FailureKind::Cancelled);
                    report
                        .skipped
                        .push((att.object_id, att.attachment_id, ItemOutcome::Cancelled));
                }
                Err(e) => {
                    warn!("Skipping attachment: {}", e);
                    self.metrics.record_download(false);
                    progress.record_failure(FailureKind::Download);
                    report.skipped.push((
                        att.object_id,
                        att.attachment_id,
                        ItemOutcome::DownloadFailed(e.to_string()),
                    ));
                }
            }
        }

        let elapsed = start.elapsed();
        self.metrics.record_download_duration(elapsed);
        info!(
            "Downloaded {}/{} attachments in {:.2}ms",
            report.saved.len(),
            attachments.len(),
            elapsed.as_secs_f64() * 1000.0
        );

        report
    }

    async fn download_one(
        &self,
        layer: &LayerHandle,
        att: &AttachmentDescriptor,
        file_name: String,
        working_folder: &Path,
        cancel: &CancellationToken,
    ) -> DownloadResult<SavedAttachment> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            result = self.service.download_attachment(layer, att.object_id, att.attachment_id) => result?,
        };

        let subfolder = format!("object_id_{}", att.object_id);
        let folder = working_folder.join(&subfolder);
        tokio::fs::create_dir_all(&folder)
            .await
            .map_err(|source| DownloadError::WriteFailed {
                path: folder.display().to_string(),
                source,
            })?;

        let path = folder.join(file_name);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| DownloadError::WriteFailed {
                path: path.display().to_string(),
                source,
            })?;

        debug!("Saved {} ({} bytes)", path.display(), bytes.len());

        Ok(SavedAttachment {
            object_id: att.object_id,
            attachment_id: att.attachment_id,
            subfolder,
            path,
        })
    }
}

/// File name for each attachment. A name already taken within the same object
/// is prefixed with the attachment id until it is unique.
fn planned_file_names(attachments: &[AttachmentDescriptor]) -> Vec<String> {
    let mut used: HashSet<(i64, String)> = HashSet::new();
    attachments
        .iter()
        .map(|att| {
            let mut name = sanitize_file_name(&att.name, att.attachment_id);
            while used.contains(&(att.object_id, name.clone())) {
                name = format!("{}_{}", att.attachment_id, name);
            }
            used.insert((att.object_id, name.clone()));
            name
        })
        .collect()
}

/// Attachment names come from the remote service; keep them to one safe path component
fn sanitize_file_name(name: &str, attachment_id: i64) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            ' ' => '_',
            _ => '-',
        })
        .collect();

    if cleaned.chars().all(|c| c == '.') {
        format!("attachment_{attachment_id}")
    } else {
        cleaned
    }
}
