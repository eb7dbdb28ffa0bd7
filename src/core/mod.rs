pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    AnnotationError, ArchiveError, AuthError, ConfigError, DownloadError, PipelineError,
    QueryError,
};
pub use types::{
    AttachmentDescriptor, BatchId, BatchSummary, ItemOutcome, LayerContents, LayerHandle,
    LayerInfo, ObjectIdRange, Record, SavedAttachment, SessionHandle,
};
