use crate::transforms::Transform;
use anyhow::{ensure, Result};
use image::{DynamicImage, GenericImageView};
use tch::{Kind, Tensor};

// ============================================================================
// ImageToTensor
// ============================================================================

/// Converts an image to a channel-first `Float` tensor holding the raw
/// 0..=255 pixel values. Mean subtraction and scaling are left to the
/// record transformer.
///
/// | Input      | Output      |
/// |------------|-------------|
/// | Luma8      | `[1, H, W]` |
/// | Rgb8       | `[3, H, W]` |
/// | other      | `[3, H, W]` (converted to RGB) |
#[derive(Debug, Clone, Copy)]
pub struct ImageToTensor;

impl Transform<DynamicImage, Tensor> for ImageToTensor {
    fn apply(&self, img: DynamicImage) -> Result<Tensor> {
        let (width, height) = img.dimensions();
        ensure!(
            width > 0 && height > 0,
            "Image dimensions must be positive (got {}x{})",
            width,
            height
        );
        let (h, w) = (height as i64, width as i64);

        // image buffers are interleaved HWC
        let tensor = match img {
            DynamicImage::ImageLuma8(gray) => Tensor::from_slice(gray.as_raw()).view([1, h, w]),
            DynamicImage::ImageRgb8(rgb) => Tensor::from_slice(rgb.as_raw())
                .view([h, w, 3])
                .permute(&[2, 0, 1]),
            other => Tensor::from_slice(other.to_rgb8().as_raw())
                .view([h, w, 3])
                .permute(&[2, 0, 1]),
        };
        Ok(tensor.to_kind(Kind::Float).contiguous())
    }
}
