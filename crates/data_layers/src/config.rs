//! src/config.rs
//!
//! Configuration for data layer behaviour.
//!
//! The `DataLayerConfig` struct stores the parameters that control which
//! record source is opened and how its records are turned into batches.
//!
//! Example:
//! ```ignore
//! let config = DataLayerConfig::builder()
//!     .variant(SourceKind::ImageList)
//!     .source("train.txt")
//!     .root_folder("/data/images")
//!     .batch_size(32)
//!     .shuffle(true)
//!     .seed(42)
//!     .crop_size(227)
//!     .mirror(true)
//!     .build();
//! ```
//!
//! All structs implement `serde::Deserialize` with defaults for every field so
//! an application can keep its layer definitions in JSON.

use crate::error::DataLayerError;
use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

/// Which record source a layer reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// JSON-lines datum container, read sequentially.
    #[default]
    Container,
    /// `path label` list of image files.
    ImageList,
    /// Window file with foreground/background balanced sampling.
    Window,
    /// List of `.safetensors` files holding `data` and `label` tensors.
    ArrayFile,
    /// Filler-generated tensors.
    Dummy,
    /// `img seg` pairs.
    ImageSeg,
    /// `img seg x1 y1 x2 y2`.
    WindowSeg,
    /// `img seg x1 y1 x2 y2` with the mask binarized.
    WindowSegBinary,
    /// `img seg x1 y1 x2 y2 tx1 ty1 tx2 ty2 inst cls` with a control vector.
    SegBinaryCtrl,
    /// `img seg x1 y1 x2 y2 c1 [c2 ...]`, one class selected per draw.
    SelectSegBinary,
    /// `img seg x1 y1 x2 y2` producing a multi-hot class vector.
    WindowCls,
    /// `img seg inst x1 y1 x2 y2 inst_label`.
    WindowInstSeg,
}

impl SourceKind {
    /// True for the list-of-segmentation variants.
    pub fn is_segmentation(self) -> bool {
        matches!(
            self,
            Self::ImageSeg
                | Self::WindowSeg
                | Self::WindowSegBinary
                | Self::SegBinaryCtrl
                | Self::SelectSegBinary
                | Self::WindowCls
                | Self::WindowInstSeg
        )
    }
}

/// Train phase enables random crop offsets and random mirroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Train,
    Test,
}

/// Parameters forwarded to the record transformer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Square crop side (0 = no crop)
    pub crop_size: u32,
    /// Randomly mirror horizontally (train phase only)
    pub mirror: bool,
    /// Safetensors file with a `mean` tensor shaped like one payload
    pub mean_file: Option<PathBuf>,
    /// One mean for all channels, or one per channel
    pub mean_value: Vec<f32>,
    /// Multiplier applied after mean subtraction
    pub scale: f32,
    pub phase: Phase,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            crop_size: 0,
            mirror: false,
            mean_file: None,
            mean_value: Vec::new(),
            scale: 1.0,
            phase: Phase::Train,
        }
    }
}

/// How a window is turned into a square crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CropMode {
    /// Stretch the (padded) window to `crop_size x crop_size`.
    #[default]
    Warp,
    /// Grow the window to a square around its centre before warping.
    Square,
}

/// Foreground/background sampling for window sources.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Windows with `overlap >= fg_threshold` are foreground
    pub fg_threshold: f32,
    /// Windows with `overlap < bg_threshold` are background (label 0)
    pub bg_threshold: f32,
    /// Probability of drawing a foreground window
    pub fg_fraction: f32,
    /// Pixels of context added around each window, measured in the warped crop
    pub context_pad: u32,
    pub crop_mode: CropMode,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            fg_threshold: 0.5,
            bg_threshold: 0.5,
            fg_fraction: 0.25,
            context_pad: 0,
            crop_mode: CropMode::Warp,
        }
    }
}

/// Distribution used to generate dummy tensors.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filler {
    Constant { value: f32 },
    Uniform { min: f32, max: f32 },
    Gaussian { mean: f32, std: f32 },
}

impl Default for Filler {
    fn default() -> Self {
        Filler::Constant { value: 0.0 }
    }
}

/// One output of a dummy source.
#[derive(Debug, Clone, Deserialize)]
pub struct DummyOutput {
    pub name: String,
    /// Per-record shape (without the batch dimension)
    pub shape: Vec<i64>,
    #[serde(default)]
    pub filler: Filler,
    /// Regenerate for every record. Defaults to true for random fillers and
    /// false for constants.
    #[serde(default)]
    pub refill: Option<bool>,
}

/// Configuration for a data layer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataLayerConfig {
    pub variant: SourceKind,
    /// Number of records per batch (must be > 0)
    pub batch_size: usize,
    /// Reshuffle record order at every epoch wrap
    pub shuffle: bool,
    /// Seed for every RNG owned by the layer. Entropy-seeded when `None`.
    pub seed: Option<u64>,
    /// List file, window file, container file or array-file list
    pub source: PathBuf,
    /// Prefix joined onto every image path read from `source`
    pub root_folder: PathBuf,
    /// Resize-on-decode target (0 = keep). Both or neither must be set.
    pub new_height: u32,
    pub new_width: u32,
    /// Decode images as 3-channel colour (true) or 1-channel gray (false)
    pub is_color: bool,
    /// Keep decoded images in memory after the first read
    pub cache_images: bool,
    /// Skip a random number of records in `[0, rand_skip)` when opening
    pub rand_skip: usize,
    /// Width of class-vector and control-vector outputs
    pub label_dim: usize,
    /// Label value preserved by binarization and used for padding
    pub ignore_label: u8,
    /// Number of outputs the caller consumes. `None` means all of them.
    pub top_count: Option<usize>,
    pub transform: TransformConfig,
    pub window: WindowConfig,
    /// Outputs generated by the dummy source
    pub dummy: Vec<DummyOutput>,
}

impl Default for DataLayerConfig {
    fn default() -> Self {
        Self {
            variant: SourceKind::default(),
            batch_size: 1,
            shuffle: false,
            seed: None,
            source: PathBuf::new(),
            root_folder: PathBuf::new(),
            new_height: 0,
            new_width: 0,
            is_color: true,
            cache_images: false,
            rand_skip: 0,
            label_dim: 0,
            ignore_label: 255,
            top_count: None,
            transform: TransformConfig::default(),
            window: WindowConfig::default(),
            dummy: Vec::new(),
        }
    }
}

impl DataLayerConfig {
    pub fn builder() -> DataLayerConfigBuilder {
        DataLayerConfigBuilder::default()
    }

    /// Checks option combinations that are invalid for every variant.
    /// Variant-specific checks happen when the source is opened.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| -> Result<()> { Err(DataLayerError::config(message).into()) };

        if self.batch_size == 0 {
            return fail("batch_size must be greater than 0".into());
        }
        if (self.new_height == 0) != (self.new_width == 0) {
            return fail(format!(
                "new_height and new_width must be set together (got {}x{})",
                self.new_height, self.new_width
            ));
        }
        if self.transform.mean_file.is_some() && !self.transform.mean_value.is_empty() {
            return fail("specify either mean_file or mean_value, not both".into());
        }
        if !self.transform.scale.is_finite() {
            return fail(format!("scale must be finite (got {})", self.transform.scale));
        }
        if !(0.0..=1.0).contains(&self.window.fg_fraction) {
            return fail(format!(
                "fg_fraction must be in [0, 1] (got {})",
                self.window.fg_fraction
            ));
        }
        if self.variant == SourceKind::Window && self.transform.crop_size == 0 {
            return fail("window sources need crop_size > 0".into());
        }
        if matches!(
            self.variant,
            SourceKind::SegBinaryCtrl | SourceKind::SelectSegBinary | SourceKind::WindowCls
        ) && self.label_dim == 0
        {
            return fail(format!("{:?} sources need label_dim > 0", self.variant));
        }
        if self.top_count == Some(0) {
            return fail("top_count must be at least 1".into());
        }
        Ok(())
    }

    /// Base seed for the layer's RNGs.
    pub fn effective_seed(&self) -> u64 {
        use rand::Rng as _;
        self.seed.unwrap_or_else(|| rand::rng().random())
    }
}

/// Builder for DataLayerConfig with method chaining
#[derive(Default)]
pub struct DataLayerConfigBuilder {
    config: DataLayerConfig,
}

impl DataLayerConfigBuilder {
    pub fn variant(mut self, variant: SourceKind) -> Self {
        self.config.variant = variant;
        self
    }

    /// Set the batch size (must be > 0)
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set whether to reshuffle at every epoch wrap
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.config.shuffle = shuffle;
        self
    }

    /// Set the random seed for reproducible shuffling, sampling and transforms.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn source(mut self, source: impl Into<PathBuf>) -> Self {
        self.config.source = source.into();
        self
    }

    pub fn root_folder(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.root_folder = root.into();
        self
    }

    /// Resize every decoded image to `height x width`.
    pub fn resize(mut self, height: u32, width: u32) -> Self {
        self.config.new_height = height;
        self.config.new_width = width;
        self
    }

    pub fn is_color(mut self, is_color: bool) -> Self {
        self.config.is_color = is_color;
        self
    }

    pub fn cache_images(mut self, cache: bool) -> Self {
        self.config.cache_images = cache;
        self
    }

    pub fn rand_skip(mut self, skip: usize) -> Self {
        self.config.rand_skip = skip;
        self
    }

    pub fn label_dim(mut self, dim: usize) -> Self {
        self.config.label_dim = dim;
        self
    }

    pub fn ignore_label(mut self, label: u8) -> Self {
        self.config.ignore_label = label;
        self
    }

    /// Limit the number of outputs produced per batch.
    pub fn top_count(mut self, count: usize) -> Self {
        self.config.top_count = Some(count);
        self
    }

    pub fn crop_size(mut self, size: u32) -> Self {
        self.config.transform.crop_size = size;
        self
    }

    pub fn mirror(mut self, mirror: bool) -> Self {
        self.config.transform.mirror = mirror;
        self
    }

    pub fn mean_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.transform.mean_file = Some(path.into());
        self
    }

    pub fn mean_value(mut self, values: &[f32]) -> Self {
        self.config.transform.mean_value = values.to_vec();
        self
    }

    pub fn scale(mut self, scale: f32) -> Self {
        self.config.transform.scale = scale;
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.config.transform.phase = phase;
        self
    }

    pub fn window(mut self, window: WindowConfig) -> Self {
        self.config.window = window;
        self
    }

    pub fn dummy_output(mut self, output: DummyOutput) -> Self {
        self.config.dummy.push(output);
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> DataLayerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_fields() {
        let config = DataLayerConfig::builder()
            .variant(SourceKind::Window)
            .batch_size(8)
            .shuffle(true)
            .seed(7)
            .crop_size(32)
            .mean_value(&[104.0, 117.0, 123.0])
            .build();

        assert_eq!(config.variant, SourceKind::Window);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.effective_seed(), 7);
        assert_eq!(config.transform.crop_size, 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_options() {
        let zero_batch = DataLayerConfig::builder().batch_size(0).build();
        let err = zero_batch.validate().unwrap_err();
        assert!(DataLayerError::is_config(&err));

        let half_resize = DataLayerConfig {
            new_height: 10,
            ..Default::default()
        };
        assert!(half_resize.validate().is_err());

        let both_means = DataLayerConfig::builder()
            .mean_file("mean.safetensors")
            .mean_value(&[1.0])
            .build();
        assert!(both_means.validate().is_err());

        let window_without_crop = DataLayerConfig::builder()
            .variant(SourceKind::Window)
            .build();
        assert!(window_without_crop.validate().is_err());

        let cls_without_dim = DataLayerConfig::builder()
            .variant(SourceKind::WindowCls)
            .build();
        assert!(cls_without_dim.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() -> anyhow::Result<()> {
        let config: DataLayerConfig = serde_json::from_str(
            r#"{
                "variant": "select_seg_binary",
                "batch_size": 4,
                "label_dim": 21,
                "transform": { "crop_size": 321, "phase": "test" },
                "window": { "fg_fraction": 0.5 }
            }"#,
        )?;

        assert_eq!(config.variant, SourceKind::SelectSegBinary);
        assert!(config.variant.is_segmentation());
        assert_eq!(config.transform.crop_size, 321);
        assert_eq!(config.transform.phase, Phase::Test);
        assert_eq!(config.transform.scale, 1.0);
        assert_eq!(config.window.fg_fraction, 0.5);
        assert_eq!(config.window.fg_threshold, 0.5);
        assert_eq!(config.ignore_label, 255);
        assert!(config.is_color);
        Ok(())
    }

    #[test]
    fn test_deserialize_dummy_fillers() -> anyhow::Result<()> {
        let config: DataLayerConfig = serde_json::from_str(
            r#"{
                "variant": "dummy",
                "dummy": [
                    { "name": "data", "shape": [3, 4, 4], "filler": { "type": "gaussian", "mean": 0.0, "std": 1.0 } },
                    { "name": "label", "shape": [], "filler": { "type": "constant", "value": 1.0 } }
                ]
            }"#,
        )?;
        assert_eq!(config.dummy.len(), 2);
        assert_eq!(
            config.dummy[0].filler,
            Filler::Gaussian {
                mean: 0.0,
                std: 1.0
            }
        );
        assert_eq!(config.dummy[1].refill, None);
        Ok(())
    }
}
