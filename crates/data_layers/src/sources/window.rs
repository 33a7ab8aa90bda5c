//! Window-file source with foreground/background balanced sampling.
//!
//! File format, repeated once per image:
//!
//! ```text
//! # <image_index>
//! <image_path>
//! <channels>
//! <height>
//! <width>
//! <num_windows>
//! <class_index> <overlap> <x1> <y1> <x2> <y2>    (num_windows lines)
//! ```
//!
//! Windows with `overlap >= fg_threshold` are foreground and keep their class.
//! Windows with `overlap < bg_threshold` are background and get class 0.
//! Windows in between are dropped.

use crate::config::{DataLayerConfig, WindowConfig};
use crate::error::DataLayerError;
use crate::record::Record;
use crate::sources::list::{parse_field, read_list, resolve, DecodeCache, ListLine};
use crate::sources::{derive_seed, Arity, EpochOrder, OutputLayout, OutputSpec, RecordSource};
use crate::transforms::vision::{BoundingBox, ImageToTensor, LoadImage, WindowWarp};
use crate::transforms::Transform;
use anyhow::{Context, Result};
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tch::Tensor;
use tracing::info;

/// An image referenced by the window file.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowImage {
    pub path: PathBuf,
    pub channels: u32,
    pub height: u32,
    pub width: u32,
}

/// One region of an image, already classified as foreground or background.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowRecord {
    pub image: usize,
    pub label: i64,
    pub overlap: f32,
    pub bbox: BoundingBox,
}

/// Parsed window file.
#[derive(Debug, Default)]
pub struct WindowFile {
    pub images: Vec<WindowImage>,
    pub foreground: Vec<WindowRecord>,
    pub background: Vec<WindowRecord>,
}

impl WindowFile {
    pub fn parse(path: &Path, root: &Path, params: &WindowConfig) -> Result<Self> {
        let lines = read_list(path)?;
        let mut lines = lines.iter();
        let mut file = WindowFile::default();

        while let Some(header) = lines.next() {
            let index = header
                .text
                .strip_prefix('#')
                .ok_or_else(|| header.error(path, "expected `# <image_index>`"))?;
            let _: usize = parse_field(header, path, index.trim(), "image index")?;

            let image_path = next_line(&mut lines, path)?;
            let channels = parse_line(next_line(&mut lines, path)?, path, "channels")?;
            let height = parse_line(next_line(&mut lines, path)?, path, "height")?;
            let width = parse_line(next_line(&mut lines, path)?, path, "width")?;
            let num_windows: usize = parse_line(next_line(&mut lines, path)?, path, "window count")?;

            let image = file.images.len();
            file.images.push(WindowImage {
                path: resolve(root, &image_path.text),
                channels,
                height,
                width,
            });

            for _ in 0..num_windows {
                let line = next_line(&mut lines, path)?;
                let fields = line.fields();
                let &[label, overlap, x1, y1, x2, y2] = fields.as_slice() else {
                    return Err(line.error(path, "expected `class overlap x1 y1 x2 y2`"));
                };
                let mut window = WindowRecord {
                    image,
                    label: parse_field(line, path, label, "class")?,
                    overlap: parse_field(line, path, overlap, "overlap")?,
                    bbox: BoundingBox::new(
                        parse_field(line, path, x1, "x1")?,
                        parse_field(line, path, y1, "y1")?,
                        parse_field(line, path, x2, "x2")?,
                        parse_field(line, path, y2, "y2")?,
                    ),
                };

                if window.overlap >= params.fg_threshold {
                    file.foreground.push(window);
                } else if window.overlap < params.bg_threshold {
                    window.label = 0;
                    file.background.push(window);
                }
            }
        }
        Ok(file)
    }
}

fn next_line<'a>(lines: &mut impl Iterator<Item = &'a ListLine>, path: &Path) -> Result<&'a ListLine> {
    lines.next().ok_or_else(|| {
        DataLayerError::config(format!("{}: unexpected end of window file", path.display())).into()
    })
}

fn parse_line<T: std::str::FromStr>(line: &ListLine, path: &Path, what: &str) -> Result<T> {
    parse_field(line, path, line.text.as_str(), what)
}

/// Windows drawn without replacement within a pass, reshuffled every pass.
#[derive(Debug)]
struct WindowPool {
    windows: Vec<WindowRecord>,
    order: Option<EpochOrder>,
}

impl WindowPool {
    fn new(windows: Vec<WindowRecord>, seed: u64) -> Result<Self> {
        let order = if windows.is_empty() {
            None
        } else {
            Some(EpochOrder::new(windows.len(), true, seed)?)
        };
        Ok(Self { windows, order })
    }

    fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn draw(&mut self) -> Option<&WindowRecord> {
        let index = self.order.as_mut()?.next_index();
        self.windows.get(index)
    }

    fn reset_epoch(&mut self) {
        if let Some(order) = &mut self.order {
            order.reset_epoch();
        }
    }

    fn epoch(&self) -> usize {
        self.order.as_ref().map_or(0, EpochOrder::epoch)
    }
}

/// Samples windows, warps them to `crop_size x crop_size` and yields
/// `data [C, S, S]`, `label []`, `window [4]` (x1, y1, x2, y2) and
/// `overlap []`.
///
/// Each draw picks the foreground pool with probability `fg_fraction`. An
/// empty foreground pool means every draw comes from the background pool,
/// and the other way round.
pub struct WindowSource {
    images: Vec<WindowImage>,
    foreground: WindowPool,
    background: WindowPool,
    fg_fraction: f32,
    rng: StdRng,
    loader: LoadImage,
    warp: WindowWarp,
    cache: DecodeCache<Arc<DynamicImage>>,
    layout: OutputLayout,
}

impl WindowSource {
    pub fn open(config: &DataLayerConfig, base_seed: u64) -> Result<Self> {
        let file = WindowFile::parse(&config.source, &config.root_folder, &config.window)?;
        Self::from_windows(file, config, base_seed)
    }

    pub fn from_windows(file: WindowFile, config: &DataLayerConfig, base_seed: u64) -> Result<Self> {
        if file.foreground.is_empty() && file.background.is_empty() {
            return Err(DataLayerError::config(format!(
                "{}: no window passes the foreground or background threshold",
                config.source.display()
            ))
            .into());
        }
        let warp = WindowWarp::new(
            config.transform.crop_size,
            config.window.context_pad,
            config.window.crop_mode,
        )
        .context(DataLayerError::config("invalid window crop settings"))?;

        info!(
            source = %config.source.display(),
            images = file.images.len(),
            foreground = file.foreground.len(),
            background = file.background.len(),
            fg_fraction = config.window.fg_fraction,
            "opened window file"
        );

        let loader = LoadImage::new(config.is_color);
        let crop = config.transform.crop_size as i64;
        Ok(Self {
            images: file.images,
            foreground: WindowPool::new(file.foreground, derive_seed(base_seed, 2))?,
            background: WindowPool::new(file.background, derive_seed(base_seed, 3))?,
            fg_fraction: config.window.fg_fraction,
            rng: StdRng::seed_from_u64(derive_seed(base_seed, 4)),
            loader,
            warp,
            cache: DecodeCache::new(config.cache_images),
            layout: OutputLayout::new(
                vec![
                    OutputSpec::payload(vec![loader.channels(), crop, crop]),
                    OutputSpec::label(),
                    OutputSpec::plain("window", vec![4]),
                    OutputSpec::plain("overlap", Vec::new()),
                ],
                Arity::between(2, 4),
            ),
        })
    }

    /// Draws the next window without decoding its image.
    pub fn sample_window(&mut self) -> Result<WindowRecord> {
        let want_fg = self.rng.random::<f32>() < self.fg_fraction;
        let pool = if (want_fg && !self.foreground.is_empty()) || self.background.is_empty() {
            &mut self.foreground
        } else {
            &mut self.background
        };
        pool.draw()
            .cloned()
            .ok_or_else(|| DataLayerError::record("window pools are empty").into())
    }

    fn load_image(&mut self, index: usize) -> Result<Arc<DynamicImage>> {
        let path = &self.images[index].path;
        let loader = &self.loader;
        self.cache
            .fetch(index, || loader.apply(path.clone()).map(Arc::new))
    }
}

impl RecordSource for WindowSource {
    fn next(&mut self) -> Result<Record> {
        let window = self.sample_window()?;
        let payload = self.load_image(window.image).and_then(|image| {
            let warped = self.warp.warp(&image, window.bbox)?;
            ImageToTensor.apply(warped)
        });
        let payload = payload.with_context(|| {
            DataLayerError::record(format!(
                "window {:?} of {}",
                window.bbox,
                self.images[window.image].path.display()
            ))
        })?;

        Ok(Record::new(payload)
            .with_field("label", Tensor::from(window.label as f32))
            .with_field("window", Tensor::from_slice(&window.bbox.as_array()))
            .with_field("overlap", Tensor::from(window.overlap)))
    }

    fn reset_epoch(&mut self) {
        self.foreground.reset_epoch();
        self.background.reset_epoch();
    }

    fn describe_outputs(&self) -> &OutputLayout {
        &self.layout
    }

    fn len(&self) -> Option<usize> {
        Some(self.foreground.windows.len() + self.background.windows.len())
    }

    /// Passes over the foreground pool (the background pool when there is no
    /// foreground).
    fn epoch(&self) -> usize {
        if self.foreground.is_empty() {
            self.background.epoch()
        } else {
            self.foreground.epoch()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn window_file(body: &str) -> Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        write!(file, "{}", body)?;
        Ok(file)
    }

    fn config(file: &NamedTempFile) -> DataLayerConfig {
        DataLayerConfig::builder()
            .source(file.path())
            .crop_size(8)
            .seed(1)
            .build()
    }

    const TWO_IMAGES: &str = "\
# 0
a.png
3
20
30
3
5 0.9 0 0 9 9
7 0.2 5 5 14 14
2 0.6 1 1 4 4
# 1
b.png
3
20
20
1
3 0.1 2 2 6 6
";

    #[test]
    fn test_parse_partitions_by_overlap() -> Result<()> {
        let file = window_file(TWO_IMAGES)?;
        let params = WindowConfig {
            fg_threshold: 0.5,
            bg_threshold: 0.3,
            ..Default::default()
        };
        let parsed = WindowFile::parse(file.path(), Path::new("/data"), &params)?;

        assert_eq!(parsed.images.len(), 2);
        assert_eq!(parsed.images[1].path, PathBuf::from("/data/b.png"));
        assert_eq!(parsed.images[0].width, 30);

        let fg_labels: Vec<_> = parsed.foreground.iter().map(|w| w.label).collect();
        assert_eq!(fg_labels, vec![5, 2]);
        let bg: Vec<_> = parsed.background.iter().map(|w| (w.image, w.label)).collect();
        assert_eq!(bg, vec![(0, 0), (1, 0)], "Background labels are forced to 0");
        Ok(())
    }

    #[test]
    fn test_parse_errors_are_config_errors() -> Result<()> {
        for body in [
            "0\na.png\n3\n4\n4\n0\n",
            "# 0\na.png\n3\n4\n4\n2\n1 0.9 0 0 3 3\n",
            "# 0\na.png\n3\n4\n4\n1\n1 0.9 0 0 3\n",
        ] {
            let file = window_file(body)?;
            let err = WindowFile::parse(file.path(), Path::new(""), &WindowConfig::default())
                .err()
                .context("expected parse error")?;
            assert!(DataLayerError::is_config(&err), "{:#}", err);
        }
        Ok(())
    }

    #[test]
    fn test_no_usable_windows_fails_open() -> Result<()> {
        let file = window_file("# 0\na.png\n3\n4\n4\n1\n1 0.4 0 0 3 3\n")?;
        let mut cfg = config(&file);
        cfg.window.bg_threshold = 0.3;
        let err = WindowSource::open(&cfg, 0).err().context("expected error")?;
        assert!(DataLayerError::is_config(&err));
        Ok(())
    }

    #[test]
    fn test_pool_draws_each_window_once_per_pass() -> Result<()> {
        let windows: Vec<_> = (0..5)
            .map(|i| WindowRecord {
                image: 0,
                label: i,
                overlap: 1.0,
                bbox: BoundingBox::new(0, 0, 1, 1),
            })
            .collect();
        let mut pool = WindowPool::new(windows, 8)?;
        for _ in 0..3 {
            let mut pass: Vec<i64> = (0..5)
                .map(|_| pool.draw().map(|w| w.label).context("draw"))
                .collect::<Result<_>>()?;
            pass.sort();
            assert_eq!(pass, vec![0, 1, 2, 3, 4]);
        }
        assert_eq!(pool.epoch(), 3);
        Ok(())
    }

    #[test]
    fn test_next_warps_window() -> Result<()> {
        let dir = TempDir::new()?;
        RgbImage::from_pixel(20, 20, Rgb([40, 80, 120])).save(dir.path().join("a.png"))?;
        let file = window_file("# 0\na.png\n3\n20\n20\n1\n4 1.0 2 2 11 11\n")?;
        let mut cfg = config(&file);
        cfg.root_folder = dir.path().to_path_buf();
        cfg.cache_images = true;

        let mut source = WindowSource::open(&cfg, 0)?;
        assert_eq!(
            source.describe_outputs().names(),
            vec!["data", "label", "window", "overlap"]
        );

        let record = source.next()?;
        assert_eq!(record.payload.size(), vec![3, 8, 8]);
        assert_eq!(record.payload.double_value(&[2, 4, 4]), 120.0);
        assert_eq!(record.label().map(|l| l.double_value(&[])), Some(4.0));
        assert_eq!(record.get("window")?.double_value(&[2]), 11.0);

        // Cached: still served after the file is gone
        std::fs::remove_file(dir.path().join("a.png"))?;
        assert!(source.next().is_ok());
        Ok(())
    }

    #[test]
    fn test_missing_image_is_record_error() -> Result<()> {
        let file = window_file("# 0\nmissing.png\n3\n20\n20\n1\n4 1.0 2 2 11 11\n")?;
        let mut source = WindowSource::open(&config(&file), 0)?;
        let err = source.next().err().context("expected error")?;
        assert!(DataLayerError::is_record(&err));
        Ok(())
    }
}
