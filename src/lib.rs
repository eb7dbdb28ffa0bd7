// Library exports for the survey photo annotation service

pub mod api;
pub mod core;
pub mod orchestration;
pub mod phases;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use self::core::{
    config::Config,
    errors::{
        AnnotationError, ArchiveError, AuthError, ConfigError, DownloadError, PipelineError,
        QueryError,
    },
    types::{
        AttachmentDescriptor, BatchId, BatchSummary, ItemOutcome, LayerHandle, ObjectIdRange,
        Record, SavedAttachment, SessionHandle,
    },
};

pub use orchestration::{BatchOrchestrator, BatchRequest, BatchTicket, ProgressStatus};

pub use services::{ArcGisClient, ArchiveBuilder, AuthProvider, LabelRenderer, LayerService};

pub use utils::Metrics;
