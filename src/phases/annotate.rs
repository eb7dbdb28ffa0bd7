// Annotate phase: label each downloaded photo with its record's attributes

use futures::stream::{self, StreamExt};
use image::DynamicImage;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::config::AnnotationConfig;
use crate::core::errors::{AnnotationError, AnnotationResult};
use crate::core::types::{ItemOutcome, Record, SavedAttachment};
use crate::orchestration::progress::{BatchProgress, FailureKind};
use crate::services::rendering::LabelRenderer;
use crate::utils::{decode_photo_async, encode_in_format_async, Metrics, Rotation};

/// Images decoded and encoded at once
const ANNOTATE_CONCURRENCY: usize = 4;

/// Overlay label for a record: `field: value` pairs joined by `", "`, in
/// `fields` order. An empty field list gives an empty label.
pub fn build_overlay_text(record: &Record, fields: &[String]) -> String {
    fields
        .iter()
        .map(|field| format!("{}: {}", field, record.display_value(field)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Annotation pipeline: orientation fix, label overlay, in-place rewrite
pub struct AnnotationPipeline {
    renderer: Arc<LabelRenderer>,
    metrics: Metrics,
    offset_x: i32,
    offset_y: i32,
}

impl AnnotationPipeline {
    pub fn new(renderer: Arc<LabelRenderer>, metrics: Metrics, config: &AnnotationConfig) -> Self {
        Self {
            renderer,
            metrics,
            offset_x: config.text_offset_x,
            offset_y: config.text_offset_y,
        }
    }

    /// Annotate every saved file with the record matching its own object id.
    /// Each item resolves exactly once in `progress`; failures are logged and skipped.
    #[instrument(skip_all, fields(items = saved.len(), selected = ?fields))]
    pub async fn execute(
        &self,
        saved: &[SavedAttachment],
        records: &[Record],
        fields: &[String],
        progress: &BatchProgress,
        cancel: &CancellationToken,
    ) -> Vec<(i64, i64, ItemOutcome)> {
        let start = Instant::now();
        let index: HashMap<i64, &Record> = records.iter().map(|r| (r.object_id, r)).collect();

        let outcomes: Vec<(i64, i64, ItemOutcome)> = stream::iter(saved.iter().cloned())
            .map(|item| {
                let record = index.get(&item.object_id).copied();
                async move {
                    let outcome = self.annotate_one(&item, record, fields, progress, cancel).await;
                    (item.object_id, item.attachment_id, outcome)
                }
            })
            .buffered(ANNOTATE_CONCURRENCY)
            .collect()
            .await;

        let elapsed = start.elapsed();
        self.metrics.record_annotate_duration(elapsed);
        info!(
            "Annotated {}/{} images in {:.2}ms",
            outcomes
                .iter()
                .filter(|(_, _, o)| *o == ItemOutcome::Annotated)
                .count(),
            saved.len(),
            elapsed.as_secs_f64() * 1000.0
        );

        outcomes
    }

    async fn annotate_one(
        &self,
        item: &SavedAttachment,
        record: Option<&Record>,
        fields: &[String],
        progress: &BatchProgress,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        if cancel.is_cancelled() {
            progress.record_failure(FailureKind::Cancelled);
            return ItemOutcome::Cancelled;
        }

        let Some(record) = record else {
            warn!(
                "Skipping {}: {}",
                item.path.display(),
                AnnotationError::RecordMissing(item.object_id)
            );
            self.metrics.record_annotation(false);
            progress.record_failure(FailureKind::RecordMissing);
            return ItemOutcome::RecordMissing;
        };

        let text = build_overlay_text(record, fields);
        match self.annotate_file(&item.path, &text).await {
            Ok(()) => {
                self.metrics.record_annotation(true);
                progress.record_annotated();
                ItemOutcome::Annotated
            }
            Err(e) => {
                warn!("Skipping {}: {}", item.path.display(), e);
                self.metrics.record_annotation(false);
                progress.record_failure(FailureKind::Annotation);
                ItemOutcome::AnnotationFailed(e.to_string())
            }
        }
    }

    /// Rewrite the image at `path` in place: upright per its EXIF orientation,
    /// `text` drawn at the configured offset, same container format.
    pub async fn annotate_file(&self, path: &Path, text: &str) -> AnnotationResult<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| AnnotationError::ReadFailed {
                path: path.display().to_string(),
                source,
            })?;

        let photo = decode_photo_async(bytes)
            .await
            .map_err(|e| AnnotationError::DecodeFailed(format!("{e:#}")))?;

        let keep_alpha = photo.image.color().has_alpha();
        let rotation = Rotation::from_exif_orientation(photo.orientation);
        let mut canvas = rotation.apply(photo.image).to_rgba8();

        let bounds = self
            .renderer
            .draw_label(&mut canvas, text, self.offset_x, self.offset_y)
            .await
            .map_err(|e| AnnotationError::RenderFailed(format!("{e:#}")))?;

        // The encoder writes no EXIF, so the corrected image is not rotated twice
        let encoded = encode_in_format_async(DynamicImage::ImageRgba8(canvas), photo.format, keep_alpha)
            .await
            .map_err(|e| AnnotationError::EncodeFailed(format!("{e:#}")))?;

        tokio::fs::write(path, encoded)
            .await
            .map_err(|source| AnnotationError::WriteFailed {
                path: path.display().to_string(),
                source,
            })?;

        debug!(
            "Annotated {} (rotated {}°, label box {:?})",
            path.display(),
            rotation.degrees(),
            bounds
        );
        Ok(())
    }
}
