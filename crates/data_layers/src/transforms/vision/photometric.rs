use crate::transforms::Transform;
use anyhow::{bail, ensure, Context, Result};
use safetensors::{tensor::Dtype, SafeTensors};
use std::{fs, path::Path};
use tch::Tensor;

// ============================================================================
// SubtractMean
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Mean {
    None,
    /// One value for every channel, or one value per channel.
    Values(Vec<f32>),
    /// A full `[C, H, W]` mean image.
    Image { values: Vec<f32>, shape: [i64; 3] },
}

/// Computes `(input - mean) * scale`.
///
/// A mean image larger than the input is centre-cropped to the input's
/// size, so one mean file serves every crop size.
///
/// # Example
/// ```ignore
/// let norm = SubtractMean::from_values(&[104.0, 117.0, 123.0], 1.0)?;
/// let centred = norm.apply(image_tensor)?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SubtractMean {
    mean: Mean,
    scale: f32,
}

impl SubtractMean {
    pub fn scale_only(scale: f32) -> Self {
        Self {
            mean: Mean::None,
            scale,
        }
    }

    pub fn from_values(values: &[f32], scale: f32) -> Result<Self> {
        ensure!(!values.is_empty(), "mean_value cannot be empty");
        Ok(Self {
            mean: Mean::Values(values.to_vec()),
            scale,
        })
    }

    /// Reads the `mean` tensor (`F32`, `[C, H, W]`) of a safetensors file.
    pub fn from_file(path: &Path, scale: f32) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read mean file: {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&bytes)
            .with_context(|| format!("Invalid safetensors file: {}", path.display()))?;
        let view = tensors
            .tensor("mean")
            .with_context(|| format!("No 'mean' tensor in {}", path.display()))?;

        ensure!(
            view.dtype() == Dtype::F32,
            "Mean tensor must be F32 (got {:?})",
            view.dtype()
        );
        let shape = match view.shape() {
            &[c, h, w] => [c as i64, h as i64, w as i64],
            other => bail!("Mean tensor must be [C, H, W] (got {:?})", other),
        };

        Ok(Self {
            mean: Mean::Image {
                values: bytemuck::pod_collect_to_vec(view.data()),
                shape,
            },
            scale,
        })
    }

    /// Checks that the mean can be applied to payloads of `shape`. Spatial
    /// extents may vary per record, so only the rank and channel count are
    /// checked here.
    pub fn check_input(&self, shape: &[i64]) -> Result<()> {
        let expected = match &self.mean {
            Mean::None => return Ok(()),
            Mean::Values(values) if values.len() == 1 => return Ok(()),
            Mean::Values(values) => values.len() as i64,
            Mean::Image { shape: mean_shape, .. } => mean_shape[0],
        };
        match shape {
            &[channels, _, _] => ensure!(
                channels == expected,
                "Input has {} channels but the mean has {}",
                channels,
                expected
            ),
            other => bail!("Mean needs a [C, H, W] input (got {:?})", other),
        }
        Ok(())
    }

    pub fn is_identity(&self) -> bool {
        self.mean == Mean::None && self.scale == 1.0
    }

    fn mean_tensor(&self, input: &Tensor) -> Result<Option<Tensor>> {
        match &self.mean {
            Mean::None => Ok(None),
            Mean::Values(values) if values.len() == 1 => Ok(Some(Tensor::from(values[0]))),
            Mean::Values(values) => {
                let (channels, _, _) = input
                    .size3()
                    .context("Per-channel mean needs a [C, H, W] input")?;
                ensure!(
                    channels as usize == values.len(),
                    "Input has {} channels but {} mean values were given",
                    channels,
                    values.len()
                );
                Ok(Some(Tensor::from_slice(values).view([channels, 1, 1])))
            }
            Mean::Image { values, shape } => {
                let (channels, height, width) =
                    input.size3().context("Mean image needs a [C, H, W] input")?;
                let [mc, mh, mw] = *shape;
                ensure!(
                    mc == channels && mh >= height && mw >= width,
                    "Mean image {:?} does not cover a {:?} input",
                    shape,
                    [channels, height, width]
                );
                let full = Tensor::from_slice(values).view([mc, mh, mw]);
                Ok(Some(
                    full.narrow(1, (mh - height) / 2, height)
                        .narrow(2, (mw - width) / 2, width),
                ))
            }
        }
    }
}

impl Transform<Tensor, Tensor> for SubtractMean {
    fn apply(&self, tensor: Tensor) -> Result<Tensor> {
        let centred = match self.mean_tensor(&tensor)? {
            Some(mean) => tensor - mean,
            None => tensor,
        };
        if self.scale == 1.0 {
            Ok(centred)
        } else {
            Ok(centred * self.scale as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::tensor::TensorView;
    use tch::{Device, Kind};
    use tempfile::NamedTempFile;

    fn filled(shape: &[i64], value: f64) -> Tensor {
        Tensor::full(shape, value, (Kind::Float, Device::Cpu))
    }

    #[test]
    fn test_single_and_per_channel_mean() -> Result<()> {
        let single = SubtractMean::from_values(&[10.0], 0.5)?;
        let out = single.apply(filled(&[2, 2, 2], 30.0))?;
        assert_eq!(out.double_value(&[1, 1, 1]), 10.0);

        let per_channel = SubtractMean::from_values(&[1.0, 2.0, 3.0], 1.0)?;
        let out = per_channel.apply(filled(&[3, 2, 2], 5.0))?;
        assert_eq!(out.double_value(&[0, 0, 0]), 4.0);
        assert_eq!(out.double_value(&[2, 1, 1]), 2.0);

        assert!(per_channel.apply(filled(&[1, 2, 2], 5.0)).is_err());
        Ok(())
    }

    #[test]
    fn test_check_input_compares_channels() -> Result<()> {
        let per_channel = SubtractMean::from_values(&[1.0, 2.0, 3.0], 1.0)?;
        per_channel.check_input(&[3, 8, 8])?;
        assert!(per_channel.check_input(&[1, 8, 8]).is_err());
        assert!(per_channel.check_input(&[3]).is_err());

        SubtractMean::from_values(&[1.0], 1.0)?.check_input(&[5])?;
        SubtractMean::scale_only(0.5).check_input(&[])?;
        Ok(())
    }

    #[test]
    fn test_mean_file_is_centre_cropped() -> Result<()> {
        // 1 x 4 x 4 mean image with value = row index
        let values: Vec<f32> = (0..16).map(|i| (i / 4) as f32).collect();
        let bytes: &[u8] = bytemuck::cast_slice(&values);
        let view = TensorView::new(Dtype::F32, vec![1, 4, 4], bytes)?;
        let file = NamedTempFile::with_suffix(".safetensors")?;
        safetensors::serialize_to_file([("mean", view)], &None, file.path())?;

        let norm = SubtractMean::from_file(file.path(), 1.0)?;
        let out = norm.apply(filled(&[1, 2, 2], 10.0))?;
        assert_eq!(out.size(), vec![1, 2, 2]);
        assert_eq!(out.double_value(&[0, 0, 0]), 9.0);
        assert_eq!(out.double_value(&[0, 1, 0]), 8.0);

        assert!(norm.apply(filled(&[1, 6, 6], 10.0)).is_err());
        Ok(())
    }

    #[test]
    fn test_scale_only() -> Result<()> {
        assert!(SubtractMean::scale_only(1.0).is_identity());
        let out = SubtractMean::scale_only(0.25).apply(filled(&[4], 8.0))?;
        assert_eq!(out.double_value(&[3]), 2.0);
        Ok(())
    }
}
