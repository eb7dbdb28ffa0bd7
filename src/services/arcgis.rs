use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::core::config::Config;
use crate::core::errors::{
    AuthError, AuthResult, DownloadError, DownloadResult, QueryError, QueryResult,
};
use crate::core::types::{AttachmentDescriptor, LayerHandle, LayerInfo, Record, SessionHandle};
use crate::services::layer_service::{AuthProvider, LayerService};

/// Object id field assumed when the service does not name one
const DEFAULT_OBJECT_ID_FIELD: &str = "objectid";

/// Upper bound on query pages, guards against a server that never clears
/// `exceededTransferLimit`
const MAX_QUERY_PAGES: usize = 10_000;

/// ArcGIS REST client: token sign-in against a portal plus feature layer
/// queries and attachment downloads
pub struct ArcGisClient {
    http_client: reqwest::Client,
    portal_url: String,
    token_expiration_minutes: u32,
}

/// `{"error": {...}}` body the REST API returns with HTTP 200
#[derive(Debug, Deserialize)]
struct ServiceErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Error { error: ServiceErrorBody },
    Ok(T),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    expires: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FieldInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayerResponse {
    #[serde(default)]
    name: String,
    #[serde(default)]
    object_id_field: Option<String>,
    #[serde(default)]
    fields: Vec<FieldInfo>,
}

#[derive(Debug, Deserialize)]
struct FeatureJson {
    #[serde(default)]
    attributes: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    object_id_field_name: Option<String>,
    #[serde(default)]
    features: Vec<FeatureJson>,
    #[serde(default)]
    exceeded_transfer_limit: bool,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentInfo {
    id: i64,
    name: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentsResponse {
    #[serde(default)]
    attachment_infos: Vec<AttachmentInfo>,
}

impl ArcGisClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.portal.http_timeout_seconds))
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            http_client,
            portal_url: config.portal_url().to_string(),
            token_expiration_minutes: config.portal.token_expiration_minutes,
        })
    }

    fn token_url(&self) -> String {
        format!("{}/sharing/rest/generateToken", self.portal_url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        layer: &LayerHandle,
        params: &[(&str, String)],
    ) -> QueryResult<T> {
        let mut query: Vec<(&str, String)> = params.to_vec();
        query.push(("f", "json".to_string()));
        if let Some(token) = layer.token() {
            query.push(("token", token.to_string()));
        }

        let body = self
            .http_client
            .get(url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        parse_envelope(&body)
    }

    async fn query_page(
        &self,
        layer: &LayerHandle,
        offset: usize,
    ) -> QueryResult<QueryResponse> {
        let mut params = vec![
            ("where", "1=1".to_string()),
            ("outFields", "*".to_string()),
            ("returnGeometry", "false".to_string()),
        ];
        if offset > 0 {
            params.push(("resultOffset", offset.to_string()));
        }
        self.get_json(&format!("{}/query", layer.url), layer, &params)
            .await
    }
}

/// Decode a REST response, turning the in-band error envelope into a [`QueryError`]
fn parse_envelope<T: DeserializeOwned>(body: &str) -> QueryResult<T> {
    match serde_json::from_str::<Envelope<T>>(body) {
        Ok(Envelope::Ok(value)) => Ok(value),
        Ok(Envelope::Error { error }) => {
            let mut message = error.message;
            if !error.details.is_empty() {
                message = format!("{} ({})", message, error.details.join("; "));
            }
            Err(QueryError::Service {
                code: error.code,
                message,
            })
        }
        Err(e) => Err(QueryError::InvalidResponse(e.to_string())),
    }
}

/// Look up the object id in a feature's attributes. Field names are matched
/// case-insensitively since services disagree on `OBJECTID` vs `objectid`.
fn object_id_of(attributes: &Map<String, Value>, field: &str) -> Option<i64> {
    attributes
        .get(field)
        .or_else(|| {
            attributes
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(field))
                .map(|(_, v)| v)
        })
        .and_then(Value::as_i64)
}

fn records_from_page(page: QueryResponse, default_field: &str) -> QueryResult<Vec<Record>> {
    let field = page
        .object_id_field_name
        .unwrap_or_else(|| default_field.to_string());

    page.features
        .into_iter()
        .map(|feature| {
            let object_id = object_id_of(&feature.attributes, &field)
                .ok_or_else(|| QueryError::MissingObjectId {
                    field: field.clone(),
                })?;
            Ok(Record {
                object_id,
                attributes: feature.attributes,
            })
        })
        .collect()
}

#[async_trait]
impl AuthProvider for ArcGisClient {
    #[instrument(skip(self, secret))]
    async fn sign_in(&self, identity: &str, secret: &str) -> AuthResult<SessionHandle> {
        let form = [
            ("username", identity.to_string()),
            ("password", secret.to_string()),
            ("client", "referer".to_string()),
            ("referer", self.portal_url.clone()),
            ("expiration", self.token_expiration_minutes.to_string()),
            ("f", "json".to_string()),
        ];

        let body = self
            .http_client
            .post(self.token_url())
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let token: TokenResponse = parse_envelope(&body).map_err(|e| match e {
            QueryError::Service { message, .. } => AuthError::InvalidCredentials(message),
            other => AuthError::InvalidResponse(other.to_string()),
        })?;

        debug!("Signed in as {}", identity);

        Ok(SessionHandle {
            username: Some(identity.to_string()),
            token: Some(token.token),
            expires_at_ms: token.expires,
        })
    }
}

#[async_trait]
impl LayerService for ArcGisClient {
    #[instrument(skip(self, layer), fields(layer = %layer.url))]
    async fn describe_layer(&self, layer: &LayerHandle) -> QueryResult<LayerInfo> {
        let response: LayerResponse = self.get_json(&layer.url, layer, &[]).await?;
        Ok(LayerInfo {
            name: response.name,
            object_id_field: response
                .object_id_field
                .unwrap_or_else(|| DEFAULT_OBJECT_ID_FIELD.to_string()),
            fields: response.fields.into_iter().map(|f| f.name).collect(),
        })
    }

    #[instrument(skip(self, layer), fields(layer = %layer.url))]
    async fn query_all_records(&self, layer: &LayerHandle) -> QueryResult<Vec<Record>> {
        let mut records = Vec::new();

        for _ in 0..MAX_QUERY_PAGES {
            let page = self.query_page(layer, records.len()).await?;
            let more = page.exceeded_transfer_limit && !page.features.is_empty();
            records.extend(records_from_page(page, DEFAULT_OBJECT_ID_FIELD)?);
            if !more {
                break;
            }
            debug!("Transfer limit exceeded, fetched {} records so far", records.len());
        }

        Ok(records)
    }

    async fn count_records(&self, layer: &LayerHandle) -> QueryResult<u64> {
        let params = [
            ("where", "1=1".to_string()),
            ("returnCountOnly", "true".to_string()),
        ];
        let response: CountResponse = self
            .get_json(&format!("{}/query", layer.url), layer, &params)
            .await?;
        Ok(response.count)
    }

    async fn list_attachments(
        &self,
        layer: &LayerHandle,
        object_id: i64,
    ) -> QueryResult<Vec<AttachmentDescriptor>> {
        let response: AttachmentsResponse = self
            .get_json(&format!("{}/{}/attachments", layer.url, object_id), layer, &[])
            .await?;

        Ok(response
            .attachment_infos
            .into_iter()
            .map(|info| AttachmentDescriptor {
                object_id,
                attachment_id: info.id,
                name: info.name,
                content_type: info.content_type,
                size: info.size,
            })
            .collect())
    }

    async fn download_attachment(
        &self,
        layer: &LayerHandle,
        object_id: i64,
        attachment_id: i64,
    ) -> DownloadResult<Vec<u8>> {
        let remote = |reason: String| DownloadError::Remote {
            object_id,
            attachment_id,
            reason,
        };

        let url = format!("{}/{}/attachments/{}", layer.url, object_id, attachment_id);
        let mut request = self.http_client.get(&url);
        if let Some(token) = layer.token() {
            request = request.query(&[("token", token)]);
        }

        let response = request.send().await.map_err(|e| remote(e.to_string()))?;
        if !response.status().is_success() {
            return Err(remote(format!("HTTP {}", response.status())));
        }

        // Auth failures come back as a JSON error body instead of the file
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("json"));

        let bytes = response.bytes().await.map_err(|e| remote(e.to_string()))?;
        if is_json {
            let body = String::from_utf8_lossy(&bytes);
            if let Err(e) = parse_envelope::<Value>(&body) {
                return Err(remote(e.to_string()));
            }
        }

        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_envelope_maps_service_errors() {
        let body = r#"{"error":{"code":498,"message":"Invalid token.","details":["Token expired"]}}"#;
        let err = parse_envelope::<CountResponse>(body).unwrap_err();
        match err {
            QueryError::Service { code, message } => {
                assert_eq!(code, 498);
                assert_eq!(message, "Invalid token. (Token expired)");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let count: CountResponse = parse_envelope(r#"{"count": 500}"#).unwrap();
        assert_eq!(count.count, 500);

        assert!(matches!(
            parse_envelope::<CountResponse>("not json"),
            Err(QueryError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_layer_response_fields() {
        let body = json!({
            "name": "survey",
            "objectIdField": "objectid",
            "fields": [{"name": "objectid", "type": "esriFieldTypeOID"}, {"name": "site"}]
        })
        .to_string();
        let layer: LayerResponse = parse_envelope(&body).unwrap();
        assert_eq!(layer.name, "survey");
        assert_eq!(layer.object_id_field.as_deref(), Some("objectid"));
        assert_eq!(layer.fields.len(), 2);
    }

    #[test]
    fn test_records_from_page_uses_object_id_field() {
        let body = json!({
            "objectIdFieldName": "OBJECTID",
            "features": [
                {"attributes": {"OBJECTID": 4, "site": "A"}},
                {"attributes": {"objectid": 9, "site": "B"}}
            ],
            "exceededTransferLimit": false
        })
        .to_string();
        let page: QueryResponse = parse_envelope(&body).unwrap();
        let records = records_from_page(page, DEFAULT_OBJECT_ID_FIELD).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].object_id, 4);
        // Case-insensitive fallback
        assert_eq!(records[1].object_id, 9);
        assert_eq!(records[1].display_value("site"), "B");
    }

    #[test]
    fn test_records_without_object_id_are_rejected() {
        let page = QueryResponse {
            object_id_field_name: None,
            features: vec![FeatureJson {
                attributes: json!({"site": "A"}).as_object().cloned().unwrap(),
            }],
            exceeded_transfer_limit: false,
        };
        assert!(matches!(
            records_from_page(page, DEFAULT_OBJECT_ID_FIELD),
            Err(QueryError::MissingObjectId { .. })
        ));
    }

    #[test]
    fn test_attachment_infos_parse() {
        let body = json!({
            "attachmentInfos": [
                {"id": 1, "name": "photo.jpg", "contentType": "image/jpeg", "size": 2048},
                {"id": 2, "name": "sketch.png"}
            ]
        })
        .to_string();
        let response: AttachmentsResponse = parse_envelope(&body).unwrap();
        assert_eq!(response.attachment_infos.len(), 2);
        assert_eq!(response.attachment_infos[0].size, Some(2048));
        assert_eq!(response.attachment_infos[1].content_type, None);
    }

    #[test]
    fn test_token_url() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_upload_folder(dir.path());
        let client = ArcGisClient::new(&config).unwrap();
        assert_eq!(
            client.token_url(),
            "https://www.arcgis.com/sharing/rest/generateToken"
        );
    }
}
