// Fetch phase: records and their attachment lists, plus range selection

use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

use crate::core::errors::QueryResult;
use crate::core::types::{AttachmentDescriptor, LayerContents, LayerHandle, ObjectIdRange};
use crate::services::layer_service::LayerService;

/// Attachment listings requested at once
const LIST_CONCURRENCY: usize = 8;

/// Fetch pipeline: joins every record of a layer with its attachments
pub struct FetchPipeline {
    service: Arc<dyn LayerService>,
}

impl FetchPipeline {
    pub fn new(service: Arc<dyn LayerService>) -> Self {
        Self { service }
    }

    /// Read all records, then each record's attachment list. Attachments come
    /// back grouped by record, in record order. Any query failure aborts.
    #[instrument(skip(self, layer), fields(layer = %layer.url))]
    pub async fn execute(&self, layer: &LayerHandle) -> QueryResult<LayerContents> {
        let start = Instant::now();

        let records = self.service.query_all_records(layer).await?;
        debug!("Fetched {} records", records.len());

        let service = &self.service;
        let object_ids: Vec<i64> = records.iter().map(|record| record.object_id).collect();
        let per_record: Vec<Vec<AttachmentDescriptor>> = stream::iter(object_ids)
            .map(|object_id| service.list_attachments(layer, object_id))
            .buffered(LIST_CONCURRENCY)
            .try_collect()
            .await?;

        let attachments: Vec<AttachmentDescriptor> = per_record
            .into_iter()
            .zip(records.iter())
            .flat_map(|(list, record)| {
                list.into_iter().map(move |mut att| {
                    att.object_id = record.object_id;
                    att
                })
            })
            .collect();

        info!(
            "Fetched {} records with {} attachments in {:.2}ms",
            records.len(),
            attachments.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(LayerContents {
            records,
            attachments,
        })
    }
}

/// Keep attachments whose owning object id lies in the inclusive range.
/// `ObjectIdRange::All` means `[1, total_records]`. Order is preserved.
pub fn filter_by_range(
    attachments: &[AttachmentDescriptor],
    range: ObjectIdRange,
    total_records: u64,
) -> Vec<AttachmentDescriptor> {
    let (start, end) = range.resolve(total_records);
    attachments
        .iter()
        .filter(|att| (start..=end).contains(&att.object_id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SessionHandle;
    use crate::services::fake::FakeLayerService;
    use serde_json::json;

    fn descriptor(object_id: i64, attachment_id: i64) -> AttachmentDescriptor {
        AttachmentDescriptor {
            object_id,
            attachment_id,
            name: format!("{attachment_id}.jpg"),
            content_type: None,
            size: None,
        }
    }

    fn sample() -> Vec<AttachmentDescriptor> {
        vec![
            descriptor(5, 1),
            descriptor(1, 2),
            descriptor(9, 3),
            descriptor(3, 4),
            descriptor(5, 5),
            descriptor(12, 6),
        ]
    }

    #[test]
    fn test_filter_keeps_only_ids_in_range_in_order() {
        let all = sample();
        let filtered = filter_by_range(&all, ObjectIdRange::Between { start: 3, end: 9 }, 12);

        let ids: Vec<(i64, i64)> = filtered.iter().map(|a| (a.object_id, a.attachment_id)).collect();
        assert_eq!(ids, vec![(5, 1), (9, 3), (3, 4), (5, 5)]);
        assert!(filtered.iter().all(|a| all.contains(a)));
    }

    #[test]
    fn test_filter_is_idempotent() {
        let range = ObjectIdRange::Between { start: 2, end: 5 };
        let once = filter_by_range(&sample(), range, 12);
        let twice = filter_by_range(&once, range, 12);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_process_all_matches_explicit_full_range() {
        let attachments: Vec<AttachmentDescriptor> =
            (1..=520).map(|oid| descriptor(oid, oid * 10)).collect();

        let all = filter_by_range(&attachments, ObjectIdRange::All, 500);
        let explicit = filter_by_range(&attachments, ObjectIdRange::Between { start: 1, end: 500 }, 500);

        assert_eq!(all, explicit);
        assert_eq!(all.len(), 500);
    }

    #[test]
    fn test_inverted_range_selects_nothing() {
        let filtered = filter_by_range(&sample(), ObjectIdRange::Between { start: 9, end: 3 }, 12);
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_joins_attachments_to_records() {
        let service = FakeLayerService::new(&["site"])
            .with_record(1, json!({"site": "A"}))
            .with_record(2, json!({"site": "B"}))
            .with_record(3, json!({"site": "C"}))
            .with_image(1, 10, 4, 4)
            .with_image(1, 11, 4, 4)
            .with_image(3, 30, 4, 4);

        let pipeline = FetchPipeline::new(Arc::new(service));
        let layer = LayerHandle::new("https://example.com/FeatureServer", SessionHandle::anonymous());
        let contents = pipeline.execute(&layer).await.unwrap();

        assert_eq!(contents.records.len(), 3);
        let owners: Vec<(i64, i64)> = contents
            .attachments
            .iter()
            .map(|a| (a.object_id, a.attachment_id))
            .collect();
        assert_eq!(owners, vec![(1, 10), (1, 11), (3, 30)]);
    }

    #[tokio::test]
    async fn test_fetch_propagates_query_errors() {
        let mut service = FakeLayerService::new(&["site"]).with_record(1, json!({"site": "A"}));
        service.fail_queries = true;

        let pipeline = FetchPipeline::new(Arc::new(service));
        let layer = LayerHandle::new("https://example.com/FeatureServer/0", SessionHandle::anonymous());
        assert!(pipeline.execute(&layer).await.is_err());
    }
}
