pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{
    decode_photo,
    decode_photo_async,
    encode_in_format,
    encode_in_format_async,
    DecodedPhoto,
    Rotation,
};
pub use metrics::Metrics;
