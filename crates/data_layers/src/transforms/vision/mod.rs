//! src/transforms/vision/mod.rs
//!
//! Image decode-side steps used by the image-backed record sources.
//!
//! ```text
//! transforms/vision/
//! ├── io.rs           → LoadImage (colour or gray decode)
//! ├── geometric.rs    → ResizeExact, crop_clipped, WindowWarp
//! ├── conversion.rs   → ImageToTensor (raw 0..=255, channel-first)
//! └── photometric.rs  → SubtractMean (mean image or values, scale)
//! ```
//!
//! A typical image-list decode pipeline:
//!
//! ```ignore
//! let decode = LoadImage::color()
//!     .then(ResizeExact::optional(256, 256, FilterType::Triangle)?)
//!     .then(ImageToTensor);
//! ```

pub mod conversion;
pub mod geometric;
pub mod io;
pub mod photometric;

pub use conversion::ImageToTensor;
pub use geometric::{crop_clipped, BoundingBox, ResizeExact, WindowWarp};
pub use io::LoadImage;
pub use photometric::SubtractMean;

use crate::transforms::{Chain, Transform};
use anyhow::Result;
use image::{imageops::FilterType, DynamicImage};

/// Path to `[C, H, W]` float tensor: decode, optional resize, convert.
pub type ImageDecoder =
    Chain<Chain<LoadImage, Option<ResizeExact>, DynamicImage>, ImageToTensor, DynamicImage>;

/// Builds the decode pipeline of an image-backed source. A `0 x 0` target
/// disables resizing.
pub fn image_decoder(color: bool, height: u32, width: u32, filter: FilterType) -> Result<ImageDecoder> {
    Ok(LoadImage::new(color)
        .then(ResizeExact::optional(height, width, filter)?)
        .then(ImageToTensor))
}
