// Capability interfaces the pipeline needs from the hosted feature service

use async_trait::async_trait;

use crate::core::errors::{AuthResult, DownloadResult, QueryResult};
use crate::core::types::{AttachmentDescriptor, LayerHandle, LayerInfo, Record, SessionHandle};

/// Identity provider that turns credentials into a session handle
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in(&self, identity: &str, secret: &str) -> AuthResult<SessionHandle>;
}

/// Read access to one feature layer and its attachments
#[async_trait]
pub trait LayerService: Send + Sync {
    async fn describe_layer(&self, layer: &LayerHandle) -> QueryResult<LayerInfo>;

    async fn list_fields(&self, layer: &LayerHandle) -> QueryResult<Vec<String>> {
        Ok(self.describe_layer(layer).await?.fields)
    }

    /// Every record of the layer; implementations page internally
    async fn query_all_records(&self, layer: &LayerHandle) -> QueryResult<Vec<Record>>;

    async fn count_records(&self, layer: &LayerHandle) -> QueryResult<u64>;

    /// Attachments of one record. `object_id` on the returned descriptors is
    /// already set to the owning record.
    async fn list_attachments(
        &self,
        layer: &LayerHandle,
        object_id: i64,
    ) -> QueryResult<Vec<AttachmentDescriptor>>;

    async fn download_attachment(
        &self,
        layer: &LayerHandle,
        object_id: i64,
        attachment_id: i64,
    ) -> DownloadResult<Vec<u8>>;
}
