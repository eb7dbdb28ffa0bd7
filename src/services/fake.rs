// In-memory feature layer used by pipeline and handler tests

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use crate::core::errors::{
    AuthError, AuthResult, DownloadError, DownloadResult, QueryError, QueryResult,
};
use crate::core::types::{AttachmentDescriptor, LayerHandle, LayerInfo, Record, SessionHandle};
use crate::services::layer_service::{AuthProvider, LayerService};

pub struct FakeLayerService {
    pub name: String,
    pub fields: Vec<String>,
    pub records: Vec<Record>,
    pub attachments: HashMap<i64, Vec<AttachmentDescriptor>>,
    pub files: HashMap<(i64, i64), Vec<u8>>,
    pub failing_downloads: HashSet<(i64, i64)>,
    pub fail_queries: bool,
    pub password: String,
    pub downloads: Mutex<Vec<(i64, i64)>>,
}

impl FakeLayerService {
    pub fn new(fields: &[&str]) -> Self {
        Self {
            name: "survey".to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            records: Vec::new(),
            attachments: HashMap::new(),
            files: HashMap::new(),
            failing_downloads: HashSet::new(),
            fail_queries: false,
            password: "hunter2".to_string(),
            downloads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_record(mut self, object_id: i64, attributes: Value) -> Self {
        let mut attributes: Map<String, Value> = attributes.as_object().cloned().unwrap_or_default();
        attributes.insert("objectid".to_string(), Value::from(object_id));
        self.records.push(Record {
            object_id,
            attributes,
        });
        self
    }

    /// Adds a PNG attachment of the given size to `object_id`
    pub fn with_image(mut self, object_id: i64, attachment_id: i64, width: u32, height: u32) -> Self {
        let name = format!("photo_{attachment_id}.png");
        self.attachments
            .entry(object_id)
            .or_default()
            .push(AttachmentDescriptor {
                object_id,
                attachment_id,
                name,
                content_type: Some("image/png".to_string()),
                size: None,
            });
        self.files
            .insert((object_id, attachment_id), png_bytes(width, height));
        self
    }

    /// Adds an attachment whose content is not a decodable image
    pub fn with_corrupt_file(mut self, object_id: i64, attachment_id: i64) -> Self {
        self.attachments
            .entry(object_id)
            .or_default()
            .push(AttachmentDescriptor {
                object_id,
                attachment_id,
                name: format!("broken_{attachment_id}.jpg"),
                content_type: Some("image/jpeg".to_string()),
                size: None,
            });
        self.files
            .insert((object_id, attachment_id), b"not an image".to_vec());
        self
    }

    pub fn failing_download(mut self, object_id: i64, attachment_id: i64) -> Self {
        self.failing_downloads.insert((object_id, attachment_id));
        self
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().len()
    }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        width,
        height,
        Rgba([40, 120, 60, 255]),
    ));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode test png");
    bytes
}

/// Baseline JPEG with an APP1 segment carrying only the EXIF orientation tag
pub fn jpeg_with_orientation(width: u32, height: u32, orientation: u16) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 30, 30])));
    let mut jpeg = Vec::new();
    img.write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
        .expect("encode test jpeg");

    // Big-endian TIFF header, then IFD0 with one SHORT entry: 0x0112 = orientation
    let mut tiff: Vec<u8> = vec![b'M', b'M', 0x00, 0x2A, 0x00, 0x00, 0x00, 0x08];
    tiff.extend_from_slice(&1u16.to_be_bytes());
    tiff.extend_from_slice(&0x0112u16.to_be_bytes());
    tiff.extend_from_slice(&3u16.to_be_bytes());
    tiff.extend_from_slice(&1u32.to_be_bytes());
    tiff.extend_from_slice(&orientation.to_be_bytes());
    tiff.extend_from_slice(&[0x00, 0x00]);
    tiff.extend_from_slice(&0u32.to_be_bytes());

    let mut payload = b"Exif\0\0".to_vec();
    payload.extend_from_slice(&tiff);
    let segment_len = (payload.len() + 2) as u16;

    // Right after SOI
    let mut out = jpeg[..2].to_vec();
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&segment_len.to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&jpeg[2..]);
    out
}

#[async_trait]
impl AuthProvider for FakeLayerService {
    async fn sign_in(&self, identity: &str, secret: &str) -> AuthResult<SessionHandle> {
        if secret != self.password {
            return Err(AuthError::InvalidCredentials(
                "Invalid username or password.".to_string(),
            ));
        }
        Ok(SessionHandle {
            username: Some(identity.to_string()),
            token: Some(format!("token-{identity}")),
            expires_at_ms: None,
        })
    }
}

#[async_trait]
impl LayerService for FakeLayerService {
    async fn describe_layer(&self, _layer: &LayerHandle) -> QueryResult<LayerInfo> {
        if self.fail_queries {
            return Err(QueryError::Service {
                code: 500,
                message: "layer unavailable".to_string(),
            });
        }
        Ok(LayerInfo {
            name: self.name.clone(),
            object_id_field: "objectid".to_string(),
            fields: self.fields.clone(),
        })
    }

    async fn query_all_records(&self, _layer: &LayerHandle) -> QueryResult<Vec<Record>> {
        if self.fail_queries {
            return Err(QueryError::Service {
                code: 500,
                message: "query failed".to_string(),
            });
        }
        Ok(self.records.clone())
    }

    async fn count_records(&self, _layer: &LayerHandle) -> QueryResult<u64> {
        Ok(self.records.len() as u64)
    }

    async fn list_attachments(
        &self,
        _layer: &LayerHandle,
        object_id: i64,
    ) -> QueryResult<Vec<AttachmentDescriptor>> {
        Ok(self.attachments.get(&object_id).cloned().unwrap_or_default())
    }

    async fn download_attachment(
        &self,
        _layer: &LayerHandle,
        object_id: i64,
        attachment_id: i64,
    ) -> DownloadResult<Vec<u8>> {
        self.downloads.lock().push((object_id, attachment_id));
        if self.failing_downloads.contains(&(object_id, attachment_id)) {
            return Err(DownloadError::Remote {
                object_id,
                attachment_id,
                reason: "HTTP 500 Internal Server Error".to_string(),
            });
        }
        self.files
            .get(&(object_id, attachment_id))
            .cloned()
            .ok_or_else(|| DownloadError::Remote {
                object_id,
                attachment_id,
                reason: "HTTP 404 Not Found".to_string(),
            })
    }
}
