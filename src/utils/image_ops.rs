use anyhow::{Context, Result};
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use std::io::Cursor;

/// Counter-clockwise rotation applied to correct a photo's orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    Ccw90,
    Ccw180,
    Ccw270,
}

impl Rotation {
    /// Rotation policy for the EXIF orientation value: 3 → 180°, 6 → 270°,
    /// 8 → 90°. Mirrored orientations and missing tags are left alone.
    pub fn from_exif_orientation(tag: Option<u16>) -> Self {
        match tag {
            Some(3) => Rotation::Ccw180,
            Some(6) => Rotation::Ccw270,
            Some(8) => Rotation::Ccw90,
            _ => Rotation::None,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Rotation::None => 0,
            Rotation::Ccw90 => 90,
            Rotation::Ccw180 => 180,
            Rotation::Ccw270 => 270,
        }
    }

    /// Rotation that undoes this one
    pub fn inverse(self) -> Self {
        match self {
            Rotation::None => Rotation::None,
            Rotation::Ccw90 => Rotation::Ccw270,
            Rotation::Ccw180 => Rotation::Ccw180,
            Rotation::Ccw270 => Rotation::Ccw90,
        }
    }

    /// `image`'s rotate helpers turn clockwise, so 90° counter-clockwise is `rotate270`
    pub fn apply(self, img: DynamicImage) -> DynamicImage {
        match self {
            Rotation::None => img,
            Rotation::Ccw90 => img.rotate270(),
            Rotation::Ccw180 => img.rotate180(),
            Rotation::Ccw270 => img.rotate90(),
        }
    }
}

/// Raw EXIF orientation value for a decoded orientation
fn orientation_tag(orientation: Orientation) -> u16 {
    match orientation {
        Orientation::NoTransforms => 1,
        Orientation::FlipHorizontal => 2,
        Orientation::Rotate180 => 3,
        Orientation::FlipVertical => 4,
        Orientation::Rotate90FlipH => 5,
        Orientation::Rotate90 => 6,
        Orientation::Rotate270FlipH => 7,
        Orientation::Rotate270 => 8,
        #[allow(unreachable_patterns)]
        _ => 1,
    }
}

/// A decoded photo together with what is needed to write it back
pub struct DecodedPhoto {
    pub image: DynamicImage,
    pub format: ImageFormat,
    pub orientation: Option<u16>,
}

/// Decode bytes, keeping the container format and the EXIF orientation value
pub fn decode_photo(bytes: &[u8]) -> Result<DecodedPhoto> {
    let format = image::guess_format(bytes).context("Unrecognized image format")?;

    let mut decoder = ImageReader::with_format(Cursor::new(bytes), format)
        .into_decoder()
        .context("Failed to create image decoder")?;

    // Unreadable EXIF is treated as "no orientation"
    let orientation = decoder
        .exif_metadata()
        .ok()
        .flatten()
        .and_then(|exif| Orientation::from_exif_chunk(&exif))
        .map(orientation_tag);

    let image = DynamicImage::from_decoder(decoder).context("Failed to decode image")?;

    Ok(DecodedPhoto {
        image,
        format,
        orientation,
    })
}

/// Asynchronously decode a photo using spawn_blocking.
///
/// Image decoding is CPU-intensive, especially for full-resolution camera photos.
pub async fn decode_photo_async(bytes: Vec<u8>) -> Result<DecodedPhoto> {
    tokio::task::spawn_blocking(move || decode_photo(&bytes))
        .await
        .context("Failed to spawn blocking task for image decoding")?
}

/// Encode `img` in `format`. JPEG has no alpha channel, and images that had
/// none originally are written back without one.
pub fn encode_in_format(img: DynamicImage, format: ImageFormat, keep_alpha: bool) -> Result<Vec<u8>> {
    let img = if format == ImageFormat::Jpeg || !keep_alpha {
        DynamicImage::ImageRgb8(img.to_rgb8())
    } else {
        img
    };

    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), format)
        .with_context(|| format!("Failed to encode image as {:?}", format))?;
    Ok(bytes)
}

/// Asynchronously encode an image using spawn_blocking.
pub async fn encode_in_format_async(
    img: DynamicImage,
    format: ImageFormat,
    keep_alpha: bool,
) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || encode_in_format(img, format, keep_alpha))
        .await
        .context("Failed to spawn blocking task for image encoding")?
}
