use crate::transforms::Transform;
use anyhow::{Context, Result};
use image::{DynamicImage, ImageReader};
use std::path::PathBuf;
use tracing::warn;

// ============================================================================
// LoadImage
// ============================================================================

/// Decodes an image file into either 3-channel RGB or 1-channel gray.
///
/// The format is sniffed from the file's magic bytes first. If that decode
/// fails, the loader retries with the format implied by the file extension
/// before giving up.
///
/// # Example
/// ```ignore
/// let image = LoadImage::color().apply(PathBuf::from("cat.jpg"))?;
/// let seg = LoadImage::gray().apply(PathBuf::from("cat_seg.png"))?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LoadImage {
    color: bool,
}

impl LoadImage {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    pub fn color() -> Self {
        Self::new(true)
    }

    /// Loader for label maps and grayscale inputs.
    pub fn gray() -> Self {
        Self::new(false)
    }

    pub fn channels(&self) -> i64 {
        if self.color {
            3
        } else {
            1
        }
    }

    fn decode(path: &PathBuf) -> Result<DynamicImage> {
        let sniffed = ImageReader::open(path)
            .with_context(|| format!("Failed to open image: {}", path.display()))?
            .with_guessed_format()
            .with_context(|| format!("Failed to read image header: {}", path.display()))?
            .decode();

        match sniffed {
            Ok(image) => Ok(image),
            Err(sniff_error) => {
                warn!(
                    path = %path.display(),
                    error = %sniff_error,
                    "content-sniffed decode failed, retrying by extension"
                );
                image::open(path).with_context(|| format!("Failed to decode image: {}", path.display()))
            }
        }
    }
}

impl Transform<PathBuf, DynamicImage> for LoadImage {
    fn apply(&self, path: PathBuf) -> Result<DynamicImage> {
        let image = Self::decode(&path)?;
        Ok(match (self.color, image) {
            (true, image @ DynamicImage::ImageRgb8(_)) => image,
            (false, image @ DynamicImage::ImageLuma8(_)) => image,
            (true, image) => DynamicImage::ImageRgb8(image.to_rgb8()),
            (false, image) => DynamicImage::ImageLuma8(image.to_luma8()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Luma, Rgb, RgbImage};
    use tempfile::NamedTempFile;

    fn create_test_image() -> Result<NamedTempFile> {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(3, 1, Rgb([0, 0, 255]));

        let file = NamedTempFile::with_suffix(".png")?;
        img.save(file.path())?;
        Ok(file)
    }

    #[test]
    fn test_load_color() -> Result<()> {
        let file = create_test_image()?;
        let image = LoadImage::color().apply(file.path().to_path_buf())?;

        assert_eq!(image.dimensions(), (4, 2));
        let rgb = image.as_rgb8().context("expected RGB8")?;
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 0, 0]));
        assert_eq!(rgb.get_pixel(3, 1), &Rgb([0, 0, 255]));
        Ok(())
    }

    #[test]
    fn test_load_gray() -> Result<()> {
        let file = create_test_image()?;
        let loader = LoadImage::gray();
        let image = loader.apply(file.path().to_path_buf())?;

        assert_eq!(loader.channels(), 1);
        let gray = image.as_luma8().context("expected Luma8")?;
        assert_eq!(gray.get_pixel(1, 0), &Luma([0]));
        Ok(())
    }

    #[test]
    fn test_missing_and_corrupt_files() -> Result<()> {
        let loader = LoadImage::color();
        assert!(loader.apply(PathBuf::from("does/not/exist.png")).is_err());

        let corrupt = NamedTempFile::with_suffix(".png")?;
        std::fs::write(corrupt.path(), b"definitely not a png")?;
        assert!(loader.apply(corrupt.path().to_path_buf()).is_err());
        Ok(())
    }
}
