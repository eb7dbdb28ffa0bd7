// Shared domain types for the annotation pipeline

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// One feature (row) of the remote layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub object_id: i64,
    pub attributes: Map<String, Value>,
}

impl Record {
    /// Attribute value as rendered in an overlay label.
    /// Strings are unquoted; null and absent fields render as `None`.
    pub fn display_value(&self, field: &str) -> String {
        match self.attributes.get(field) {
            None | Some(Value::Null) => "None".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

/// Attachment metadata, stamped with the owning record's object id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub object_id: i64,
    pub attachment_id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Everything the fetch phase reads from a layer for one batch
#[derive(Debug, Clone, Default)]
pub struct LayerContents {
    pub records: Vec<Record>,
    pub attachments: Vec<AttachmentDescriptor>,
}

/// Layer description used to build the field picker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub name: String,
    pub object_id_field: String,
    pub fields: Vec<String>,
}

/// Authenticated session returned by sign-in.
/// `token == None` is an anonymous session for public layers.
#[derive(Clone, Default, PartialEq)]
pub struct SessionHandle {
    pub username: Option<String>,
    pub token: Option<String>,
    /// Token expiry in epoch milliseconds, as reported by the portal
    pub expires_at_ms: Option<i64>,
}

impl SessionHandle {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Whether the token has expired at `now_ms` (epoch milliseconds).
    /// Sessions without a reported expiry never expire.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|expires| expires <= now_ms)
    }
}

// Never print tokens
impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

/// A feature layer endpoint plus the session used to reach it
#[derive(Debug, Clone, PartialEq)]
pub struct LayerHandle {
    pub url: String,
    pub session: SessionHandle,
}

impl LayerHandle {
    /// Normalizes the layer URL: trailing slashes are dropped and `/0` is
    /// appended when the URL points at the feature service rather than a layer.
    pub fn new(url: &str, session: SessionHandle) -> Self {
        let mut url = url.trim().trim_end_matches('/').to_string();
        if !url.ends_with("/0") {
            url.push_str("/0");
        }
        Self { url, session }
    }

    pub fn token(&self) -> Option<&str> {
        self.session.token.as_deref()
    }
}

/// Inclusive object-id selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectIdRange {
    /// Equivalent to `[1, total record count]`
    All,
    Between { start: i64, end: i64 },
}

impl ObjectIdRange {
    pub fn resolve(self, total_records: u64) -> (i64, i64) {
        match self {
            ObjectIdRange::All => (1, total_records as i64),
            ObjectIdRange::Between { start, end } => (start, end),
        }
    }
}

/// Batch identifier: start time in epoch seconds plus a sequence number that
/// separates batches started within the same second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct BatchId {
    pub timestamp: i64,
    pub sequence: u32,
}

impl BatchId {
    pub fn new(timestamp: i64, sequence: u32) -> Self {
        Self { timestamp, sequence }
    }

    /// Name of the batch's working folder under the upload folder
    pub fn folder_name(&self) -> String {
        format!("processed_images_{}", self)
    }

    pub fn archive_name(&self) -> String {
        format!("processed_images_{}.zip", self)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sequence == 0 {
            write!(f, "{}", self.timestamp)
        } else {
            write!(f, "{}-{}", self.timestamp, self.sequence)
        }
    }
}

impl FromStr for BatchId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ts, seq) = match s.split_once('-') {
            Some((ts, seq)) => (ts, Some(seq)),
            None => (s, None),
        };
        let timestamp = ts
            .parse::<i64>()
            .map_err(|_| format!("invalid batch id: {s}"))?;
        let sequence = match seq {
            Some(seq) => seq
                .parse::<u32>()
                .map_err(|_| format!("invalid batch id: {s}"))?,
            None => 0,
        };
        Ok(Self { timestamp, sequence })
    }
}

impl From<BatchId> for String {
    fn from(id: BatchId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for BatchId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A downloaded attachment on disk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedAttachment {
    pub object_id: i64,
    pub attachment_id: i64,
    /// Subfolder inside the working folder, `object_id_<n>`
    pub subfolder: String,
    pub path: PathBuf,
}

/// Result of one attachment's trip through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ItemOutcome {
    Annotated,
    DownloadFailed(String),
    RecordMissing,
    AnnotationFailed(String),
    Cancelled,
}

/// Per-attachment line of a batch summary
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub object_id: i64,
    pub attachment_id: i64,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// Aggregate result of a finished batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub annotated: usize,
    pub download_failed: usize,
    pub record_missing: usize,
    pub annotation_failed: usize,
    pub cancelled: usize,
    pub processing_time_ms: f64,
    pub files: Vec<SavedAttachment>,
    pub items: Vec<ItemReport>,
}

impl BatchSummary {
    pub fn record(&mut self, object_id: i64, attachment_id: i64, outcome: ItemOutcome) {
        match &outcome {
            ItemOutcome::Annotated => self.annotated += 1,
            ItemOutcome::DownloadFailed(_) => self.download_failed += 1,
            ItemOutcome::RecordMissing => self.record_missing += 1,
            ItemOutcome::AnnotationFailed(_) => self.annotation_failed += 1,
            ItemOutcome::Cancelled => self.cancelled += 1,
        }
        self.items.push(ItemReport {
            object_id,
            attachment_id,
            outcome,
        });
    }

    pub fn failed(&self) -> usize {
        self.download_failed + self.record_missing + self.annotation_failed
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.processing_time_ms = elapsed.as_secs_f64() * 1000.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_expiry() {
        let session = SessionHandle {
            username: Some("surveyor".to_string()),
            token: Some("t".to_string()),
            expires_at_ms: Some(1_000),
        };
        assert!(!session.is_expired_at(999));
        assert!(session.is_expired_at(1_000));
        assert!(!SessionHandle::anonymous().is_expired_at(i64::MAX));
    }

    #[test]
    fn test_layer_url_normalization() {
        let session = SessionHandle::anonymous();
        let base = "https://services.arcgis.com/abc/arcgis/rest/services/survey/FeatureServer";

        assert_eq!(
            LayerHandle::new(base, session.clone()).url,
            format!("{base}/0")
        );
        assert_eq!(
            LayerHandle::new(&format!("{base}/0"), session.clone()).url,
            format!("{base}/0")
        );
        assert_eq!(
            LayerHandle::new(&format!("{base}/"), session).url,
            format!("{base}/0")
        );
    }

    #[test]
    fn test_batch_id_display_and_parse() {
        let plain = BatchId::new(1_700_000_000, 0);
        assert_eq!(plain.to_string(), "1700000000");
        assert_eq!(plain.folder_name(), "processed_images_1700000000");
        assert_eq!("1700000000".parse::<BatchId>().unwrap(), plain);

        let second = BatchId::new(1_700_000_000, 2);
        assert_eq!(second.to_string(), "1700000000-2");
        assert_eq!(second.archive_name(), "processed_images_1700000000-2.zip");
        assert_eq!("1700000000-2".parse::<BatchId>().unwrap(), second);

        assert!("abc".parse::<BatchId>().is_err());
        assert!("17-x".parse::<BatchId>().is_err());
    }

    #[test]
    fn test_batch_id_serializes_as_string() {
        let id = BatchId::new(42, 1);
        assert_eq!(serde_json::to_value(id).unwrap(), json!("42-1"));
    }

    #[test]
    fn test_record_display_value() {
        let record = Record {
            object_id: 1,
            attributes: json!({"site": "A", "transect": 12, "notes": null})
                .as_object()
                .cloned()
                .unwrap(),
        };
        assert_eq!(record.display_value("site"), "A");
        assert_eq!(record.display_value("transect"), "12");
        assert_eq!(record.display_value("notes"), "None");
        assert_eq!(record.display_value("missing"), "None");
    }

    #[test]
    fn test_process_all_resolves_to_full_range() {
        assert_eq!(ObjectIdRange::All.resolve(500), (1, 500));
        assert_eq!(
            ObjectIdRange::Between { start: 3, end: 9 }.resolve(500),
            (3, 9)
        );
    }

    #[test]
    fn test_session_debug_redacts_token() {
        let session = SessionHandle {
            username: Some("surveyor".to_string()),
            token: Some("secret-token".to_string()),
            expires_at_ms: None,
        };
        let printed = format!("{session:?}");
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_summary_counts_outcomes() {
        let mut summary = BatchSummary {
            total: 4,
            ..Default::default()
        };
        summary.record(1, 1, ItemOutcome::Annotated);
        summary.record(2, 2, ItemOutcome::DownloadFailed("timeout".into()));
        summary.record(3, 3, ItemOutcome::RecordMissing);
        summary.record(4, 4, ItemOutcome::Annotated);

        assert_eq!(summary.annotated, 2);
        assert_eq!(summary.failed(), 2);
        assert_eq!(summary.items.len(), 4);
    }
}
