pub mod arcgis;
pub mod archive;
pub mod layer_service;
pub mod rendering;

#[cfg(test)]
pub mod fake;

// Re-export commonly used services
pub use arcgis::ArcGisClient;
pub use archive::ArchiveBuilder;
pub use layer_service::{AuthProvider, LayerService};
pub use rendering::LabelRenderer;
