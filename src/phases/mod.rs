// Batch pipeline stages, run in order by the orchestrator
pub mod annotate;
pub mod download;
pub mod fetch;

pub use annotate::{build_overlay_text, AnnotationPipeline};
pub use download::{DownloadPipeline, DownloadReport};
pub use fetch::{filter_by_range, FetchPipeline};
