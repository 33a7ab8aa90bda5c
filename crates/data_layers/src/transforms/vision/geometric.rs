use crate::config::CropMode;
use crate::transforms::Transform;
use anyhow::{ensure, Result};
use image::{imageops, imageops::FilterType, DynamicImage, GenericImageView, GrayImage, RgbImage};

// ============================================================================
// BoundingBox
// ============================================================================

/// Inclusive pixel box `(x1, y1)..=(x2, y2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl BoundingBox {
    pub fn new(x1: i64, y1: i64, x2: i64, y2: i64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i64 {
        self.x2 - self.x1 + 1
    }

    pub fn height(&self) -> i64 {
        self.y2 - self.y1 + 1
    }

    /// True if the box overlaps a `width x height` image.
    pub fn intersects(&self, width: u32, height: u32) -> bool {
        self.x1 <= self.x2
            && self.y1 <= self.y2
            && self.x2 >= 0
            && self.y2 >= 0
            && self.x1 < width as i64
            && self.y1 < height as i64
    }

    /// Intersects the box with a `width x height` image.
    pub fn clip(&self, width: u32, height: u32) -> Self {
        let max_x = width as i64 - 1;
        let max_y = height as i64 - 1;
        Self {
            x1: self.x1.clamp(0, max_x),
            y1: self.y1.clamp(0, max_y),
            x2: self.x2.clamp(0, max_x),
            y2: self.y2.clamp(0, max_y),
        }
    }

    pub fn as_array(&self) -> [f32; 4] {
        [self.x1 as f32, self.y1 as f32, self.x2 as f32, self.y2 as f32]
    }
}

// ============================================================================
// ResizeExact
// ============================================================================

/// Resizes to exactly `width x height`, ignoring the aspect ratio.
///
/// Use `FilterType::Triangle` for images and `FilterType::Nearest` for label
/// maps so that class ids are never blended.
#[derive(Debug, Clone, Copy)]
pub struct ResizeExact {
    width: u32,
    height: u32,
    filter: FilterType,
}

impl ResizeExact {
    pub fn new(width: u32, height: u32, filter: FilterType) -> Result<Self> {
        ensure!(
            width > 0 && height > 0,
            "Resize target must be positive (got {}x{})",
            width,
            height
        );
        Ok(Self {
            width,
            height,
            filter,
        })
    }

    /// `None` when no resize is configured (`0 x 0`).
    pub fn optional(height: u32, width: u32, filter: FilterType) -> Result<Option<Self>> {
        if height == 0 && width == 0 {
            return Ok(None);
        }
        Self::new(width, height, filter).map(Some)
    }
}

impl Transform<DynamicImage, DynamicImage> for ResizeExact {
    fn apply(&self, img: DynamicImage) -> Result<DynamicImage> {
        if img.dimensions() == (self.width, self.height) {
            return Ok(img);
        }
        Ok(img.resize_exact(self.width, self.height, self.filter))
    }
}

// ============================================================================
// CropBox
// ============================================================================

/// Crops an image to a box, clipped to the image bounds.
pub fn crop_clipped(img: &DynamicImage, bbox: BoundingBox) -> Result<DynamicImage> {
    let (width, height) = img.dimensions();
    ensure!(
        bbox.intersects(width, height),
        "Box {:?} does not intersect the {}x{} image",
        bbox,
        width,
        height
    );
    let clipped = bbox.clip(width, height);
    Ok(img.crop_imm(
        clipped.x1 as u32,
        clipped.y1 as u32,
        clipped.width() as u32,
        clipped.height() as u32,
    ))
}

// ============================================================================
// WindowWarp
// ============================================================================

/// Warps a window of an image to a `crop_size x crop_size` square.
///
/// With `context_pad > 0` the window is grown so that, after warping, the
/// original window is surrounded by `context_pad` pixels of context. Parts
/// of the grown window that fall outside the image stay zero on the output
/// canvas. `CropMode::Square` first grows the window to a square around its
/// centre.
#[derive(Debug, Clone, Copy)]
pub struct WindowWarp {
    crop_size: u32,
    context_pad: u32,
    mode: CropMode,
}

impl WindowWarp {
    pub fn new(crop_size: u32, context_pad: u32, mode: CropMode) -> Result<Self> {
        ensure!(crop_size > 0, "Window warp needs crop_size > 0");
        ensure!(
            2 * context_pad < crop_size,
            "context_pad {} leaves no room inside crop_size {}",
            context_pad,
            crop_size
        );
        Ok(Self {
            crop_size,
            context_pad,
            mode,
        })
    }

    pub fn warp(&self, img: &DynamicImage, window: BoundingBox) -> Result<DynamicImage> {
        let (img_w, img_h) = img.dimensions();
        let crop = self.crop_size as f64;

        let (mut x1, mut y1, mut x2, mut y2) = (
            window.x1 as f64,
            window.y1 as f64,
            window.x2 as f64,
            window.y2 as f64,
        );
        if self.context_pad > 0 || self.mode == CropMode::Square {
            let context_scale = crop / (crop - 2.0 * self.context_pad as f64);
            let mut half_h = (y2 - y1 + 1.0) / 2.0;
            let mut half_w = (x2 - x1 + 1.0) / 2.0;
            let center_x = x1 + half_w;
            let center_y = y1 + half_h;
            if self.mode == CropMode::Square {
                half_h = half_h.max(half_w);
                half_w = half_h;
            }
            x1 = (center_x - half_w * context_scale).round();
            x2 = (center_x + half_w * context_scale).round();
            y1 = (center_y - half_h * context_scale).round();
            y2 = (center_y + half_h * context_scale).round();
        }

        let grown = BoundingBox::new(x1 as i64, y1 as i64, x2 as i64, y2 as i64);
        ensure!(
            grown.intersects(img_w, img_h),
            "Window {:?} lies outside the {}x{} image",
            window,
            img_w,
            img_h
        );
        let clipped = grown.clip(img_w, img_h);

        // Out-of-image margins, measured in warped pixels.
        let scale_x = crop / grown.width() as f64;
        let scale_y = crop / grown.height() as f64;
        let pad_left = ((clipped.x1 - grown.x1) as f64 * scale_x).round() as u32;
        let pad_top = ((clipped.y1 - grown.y1) as f64 * scale_y).round() as u32;
        let crop_w = ((clipped.width() as f64 * scale_x).round() as u32)
            .clamp(1, self.crop_size - pad_left.min(self.crop_size - 1));
        let crop_h = ((clipped.height() as f64 * scale_y).round() as u32)
            .clamp(1, self.crop_size - pad_top.min(self.crop_size - 1));

        let region = img
            .crop_imm(
                clipped.x1 as u32,
                clipped.y1 as u32,
                clipped.width() as u32,
                clipped.height() as u32,
            )
            .resize_exact(crop_w, crop_h, FilterType::Triangle);

        let side = self.crop_size;
        let (left, top) = (pad_left as i64, pad_top as i64);
        Ok(match region {
            DynamicImage::ImageLuma8(region) => {
                let mut canvas = GrayImage::new(side, side);
                imageops::replace(&mut canvas, &region, left, top);
                DynamicImage::ImageLuma8(canvas)
            }
            other => {
                let mut canvas = RgbImage::new(side, side);
                imageops::replace(&mut canvas, &other.to_rgb8(), left, top);
                DynamicImage::ImageRgb8(canvas)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use image::{Luma, Rgb};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                img.put_pixel(x, y, Rgb([(x * 10) as u8, (y * 10) as u8, 200]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_resize_exact() -> Result<()> {
        let resized = ResizeExact::new(7, 3, FilterType::Nearest)?.apply(gradient(20, 10))?;
        assert_eq!(resized.dimensions(), (7, 3));

        assert!(ResizeExact::optional(0, 0, FilterType::Nearest)?.is_none());
        assert!(ResizeExact::optional(4, 0, FilterType::Nearest).is_err());
        Ok(())
    }

    #[test]
    fn test_crop_clipped() -> Result<()> {
        let img = gradient(10, 10);
        let crop = crop_clipped(&img, BoundingBox::new(8, -3, 15, 4))?;
        assert_eq!(crop.dimensions(), (2, 5));
        assert_eq!(crop.to_rgb8().get_pixel(0, 0), &Rgb([80, 0, 200]));

        assert!(crop_clipped(&img, BoundingBox::new(20, 20, 30, 30)).is_err());
        Ok(())
    }

    #[test]
    fn test_window_warp_plain() -> Result<()> {
        let warp = WindowWarp::new(8, 0, CropMode::Warp)?;
        let out = warp.warp(&gradient(20, 20), BoundingBox::new(2, 2, 9, 9))?;
        assert_eq!(out.dimensions(), (8, 8));
        // 8x8 window warped to 8x8 is an exact copy.
        assert_eq!(out.to_rgb8().get_pixel(0, 0), &Rgb([20, 20, 200]));
        Ok(())
    }

    #[test]
    fn test_window_warp_pads_outside_image() -> Result<()> {
        let mut img = GrayImage::new(10, 10);
        for pixel in img.pixels_mut() {
            *pixel = Luma([255]);
        }
        let warp = WindowWarp::new(10, 2, CropMode::Warp)?;
        // Window touching the top-left corner: grown box leaves the image.
        let out = warp.warp(&DynamicImage::ImageLuma8(img), BoundingBox::new(0, 0, 5, 5))?;
        let out = out.as_luma8().context("expected Luma8")?;

        assert_eq!(out.dimensions(), (10, 10));
        assert_eq!(out.get_pixel(0, 0), &Luma([0]), "Padding stays zero");
        assert_eq!(out.get_pixel(9, 9), &Luma([255]));
        Ok(())
    }

    #[test]
    fn test_window_warp_rejects_oversized_pad() {
        assert!(WindowWarp::new(8, 4, CropMode::Square).is_err());
        assert!(WindowWarp::new(0, 0, CropMode::Warp).is_err());
    }
}
