//! Annotate one local image with a literal label, in place.
//! Run with: cargo run --release --bin annotate_file -- <image_path> <label>

use anyhow::{bail, Result};
use std::path::Path;
use std::sync::Arc;
use survey_annotator::{
    core::Config, phases::AnnotationPipeline, services::LabelRenderer, utils::Metrics,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("survey_annotator=debug")
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        bail!("usage: {} <image_path> <label>", args[0]);
    }
    let image_path = Path::new(&args[1]);
    let label = &args[2];

    if !image_path.exists() {
        bail!("Image not found: {}", image_path.display());
    }

    let config = Config::with_upload_folder(std::env::temp_dir());
    let renderer = Arc::new(LabelRenderer::new(&config.annotation));
    let pipeline = AnnotationPipeline::new(renderer, Metrics::new(), &config.annotation);

    info!("Annotating {} with '{}'", image_path.display(), label);
    pipeline.annotate_file(image_path, label).await?;

    println!("Annotated {}", image_path.display());
    Ok(())
}
