use anyhow::Result;
use cosmic_text::{
    fontdb, Attrs, Buffer, Color as CosmicColor, Family, FontSystem, Metrics, Shaping,
    SwashCache, Wrap,
};
use image::{Rgba, RgbaImage};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::config::AnnotationConfig;

/// Pixel rectangle `(min_x, min_y, max_x, max_y)`, max exclusive
pub type TextBounds = (i32, i32, i32, i32);

/// Label renderer using cosmic-text.
/// Draws a single line of text over an opaque background box.
pub struct LabelRenderer {
    font_system: Arc<Mutex<FontSystem>>,
    swash_cache: Arc<Mutex<SwashCache>>,
    family: String,
    font_size: f32,
}

impl LabelRenderer {
    pub fn new(config: &AnnotationConfig) -> Self {
        let font_system = Self::create_font_system(config.font_path.as_deref());

        info!(
            "Label renderer ready (family: {}, size: {:.0}px)",
            config.font_family, config.font_size
        );

        Self {
            font_system: Arc::new(Mutex::new(font_system)),
            swash_cache: Arc::new(Mutex::new(SwashCache::new())),
            family: config.font_family.clone(),
            font_size: config.font_size,
        }
    }

    /// A configured font file is loaded on its own; otherwise the system fonts are scanned
    fn create_font_system(font_path: Option<&Path>) -> FontSystem {
        let mut db = fontdb::Database::new();

        match font_path {
            Some(path) => match db.load_font_file(path) {
                Ok(()) => debug!("Font loaded from {}", path.display()),
                Err(e) => {
                    warn!("Font {} could not be loaded ({}), using system fonts", path.display(), e);
                    db.load_system_fonts();
                }
            },
            None => db.load_system_fonts(),
        }

        if db.is_empty() {
            warn!("No fonts available, labels will render as background boxes only");
        }

        FontSystem::new_with_locale_and_db("en-US".to_string(), db)
    }

    fn family(&self) -> Family<'_> {
        match self.family.to_lowercase().as_str() {
            "serif" => Family::Serif,
            "sans-serif" | "sans" => Family::SansSerif,
            "monospace" | "mono" => Family::Monospace,
            _ => Family::Name(&self.family),
        }
    }

    fn line_height(font_size: f32) -> f32 {
        (font_size * 1.2).ceil()
    }

    fn shape(&self, font_system: &mut FontSystem, text: &str, font_size: f32) -> Buffer {
        let metrics = Metrics::new(font_size, Self::line_height(font_size));
        let mut buffer = Buffer::new(font_system, metrics);

        // Labels stay on one line regardless of image width
        buffer.set_wrap(font_system, Wrap::None);

        let attrs = Attrs::new().family(self.family());
        buffer.set_text(font_system, text, &attrs, Shaping::Advanced);
        buffer.shape_until_scroll(font_system, false);
        buffer
    }

    /// Measure text as `(width, height)` in pixels using glyph bounds
    pub async fn measure_text(&self, text: &str, font_size: f32) -> (f32, f32) {
        if text.trim().is_empty() {
            return (0.0, 0.0);
        }

        let mut font_system = self.font_system.lock().await;
        let buffer = self.shape(&mut font_system, text, font_size);

        let mut max_x = 0.0f32;
        let mut lines = 0;
        for run in buffer.layout_runs() {
            lines += 1;
            let run_max = run
                .glyphs
                .iter()
                .map(|g| g.x + g.w)
                .fold(run.line_w, f32::max);
            max_x = max_x.max(run_max);
        }

        (max_x.ceil(), lines.max(1) as f32 * Self::line_height(font_size))
    }

    /// Bounding box of `text` drawn with its top-left corner at `(x, y)`
    pub async fn text_bounds(&self, text: &str, x: i32, y: i32) -> TextBounds {
        let (w, h) = self.measure_text(text, self.font_size).await;
        (x, y, x + w as i32, y + h as i32)
    }

    /// Draw `text` at `(x, y)` in white over an opaque black box sized to the
    /// text's bounding box. Returns the box; empty text draws nothing.
    pub async fn draw_label(&self, img: &mut RgbaImage, text: &str, x: i32, y: i32) -> Result<TextBounds> {
        if text.is_empty() {
            return Ok((x, y, x, y));
        }

        let bounds = self.text_bounds(text, x, y).await;
        fill_rect(img, bounds, Rgba([0, 0, 0, 255]));
        self.render_text(img, text, self.font_size, Rgba([255, 255, 255, 255]), x, y)
            .await?;

        debug!("Label drawn in box {:?}", bounds);
        Ok(bounds)
    }

    /// Alpha-blend shaped text onto `img`, clipped to the canvas
    pub async fn render_text(
        &self,
        img: &mut RgbaImage,
        text: &str,
        font_size: f32,
        color: Rgba<u8>,
        x: i32,
        y: i32,
    ) -> Result<()> {
        let buffer = {
            let mut font_system = self.font_system.lock().await;
            self.shape(&mut font_system, text, font_size)
        };

        let cosmic_color = CosmicColor::rgba(color[0], color[1], color[2], color[3]);

        let mut font_system = self.font_system.lock().await;
        let mut swash_cache = self.swash_cache.lock().await;

        buffer.draw(&mut font_system, &mut swash_cache, cosmic_color, |px_x, px_y, w, h, pixel_color| {
            for dy in 0..h as i32 {
                for dx in 0..w as i32 {
                    let img_x = x + px_x + dx;
                    let img_y = y + px_y + dy;
                    if img_x < 0 || img_y < 0 || img_x >= img.width() as i32 || img_y >= img.height() as i32 {
                        continue;
                    }

                    let existing = img.get_pixel(img_x as u32, img_y as u32);
                    let alpha = pixel_color.a() as f32 / 255.0;
                    let inv_alpha = 1.0 - alpha;

                    let blended = Rgba([
                        ((pixel_color.r() as f32 * alpha) + (existing[0] as f32 * inv_alpha)) as u8,
                        ((pixel_color.g() as f32 * alpha) + (existing[1] as f32 * inv_alpha)) as u8,
                        ((pixel_color.b() as f32 * alpha) + (existing[2] as f32 * inv_alpha)) as u8,
                        existing[3].max(pixel_color.a()),
                    ]);
                    img.put_pixel(img_x as u32, img_y as u32, blended);
                }
            }
        });

        Ok(())
    }
}

/// Fill `bounds` with `color`, clipped to the canvas
pub fn fill_rect(img: &mut RgbaImage, bounds: TextBounds, color: Rgba<u8>) {
    let (width, height) = img.dimensions();
    let (min_x, min_y, max_x, max_y) = bounds;

    let x1 = min_x.clamp(0, width as i32) as u32;
    let y1 = min_y.clamp(0, height as i32) as u32;
    let x2 = max_x.clamp(0, width as i32) as u32;
    let y2 = max_y.clamp(0, height as i32) as u32;

    for y in y1..y2 {
        for x in x1..x2 {
            img.put_pixel(x, y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;

    fn renderer() -> LabelRenderer {
        let dir = tempfile::tempdir().unwrap();
        LabelRenderer::new(&Config::with_upload_folder(dir.path()).annotation)
    }

    #[test]
    fn test_fill_rect_clips_to_canvas() {
        let mut img = RgbaImage::from_pixel(20, 10, Rgba([255, 255, 255, 255]));
        fill_rect(&mut img, (15, 5, 40, 40), Rgba([0, 0, 0, 255]));

        assert_eq!(*img.get_pixel(19, 9), Rgba([0, 0, 0, 255]));
        assert_eq!(*img.get_pixel(14, 9), Rgba([255, 255, 255, 255]));
        assert_eq!(*img.get_pixel(19, 4), Rgba([255, 255, 255, 255]));
    }

    #[tokio::test]
    async fn test_empty_label_draws_nothing() {
        let renderer = renderer();
        let mut img = RgbaImage::from_pixel(50, 50, Rgba([255, 255, 255, 255]));

        let bounds = renderer.draw_label(&mut img, "", 10, 10).await.unwrap();
        assert_eq!(bounds, (10, 10, 10, 10));
        assert!(img.pixels().all(|p| *p == Rgba([255, 255, 255, 255])));
    }

    #[tokio::test]
    async fn test_label_box_starts_at_offset() {
        let renderer = renderer();
        let mut img = RgbaImage::from_pixel(400, 100, Rgba([255, 255, 255, 255]));

        let bounds = renderer
            .draw_label(&mut img, "site: A, transect: 12", 10, 10)
            .await
            .unwrap();

        assert_eq!((bounds.0, bounds.1), (10, 10));
        // Line height is known even without glyphs
        assert_eq!(bounds.3 - bounds.1, LabelRenderer::line_height(30.0) as i32);
        // Nothing is drawn above or left of the offset
        assert_eq!(*img.get_pixel(5, 5), Rgba([255, 255, 255, 255]));
    }
}
