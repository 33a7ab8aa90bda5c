//! Segmentation list sources.
//!
//! Every variant reads an image plus an 8-bit label map (and, for instance
//! segmentation, an instance map) per list line, optionally cropped to a
//! window, and derives its auxiliary outputs from the label map:
//!
//! | variant             | line                                              | outputs              |
//! |---------------------|---------------------------------------------------|----------------------|
//! | `ImageSeg`          | `img seg`                                         | data, label, dim     |
//! | `WindowSeg`         | `img seg x1 y1 x2 y2`                             | data, label, dim     |
//! | `WindowSegBinary`   | `img seg x1 y1 x2 y2`                             | data, label, dim     |
//! | `SegBinaryCtrl`     | `img seg x1 y1 x2 y2 tx1 ty1 tx2 ty2 inst cls`    | data, label, ctrl    |
//! | `SelectSegBinary`   | `img seg x1 y1 x2 y2 c1 [c2 ...]`                 | data, label, cls     |
//! | `WindowCls`         | `img seg x1 y1 x2 y2`                             | data, cls, dim       |
//! | `WindowInstSeg`     | `img seg inst x1 y1 x2 y2 inst_label`             | data, label, dim     |

use crate::config::{DataLayerConfig, SourceKind};
use crate::error::DataLayerError;
use crate::record::Record;
use crate::sources::list::{parse_field, read_list, resolve, DecodeCache, ListLine};
use crate::sources::{derive_seed, Arity, EpochOrder, OutputLayout, OutputSpec, RecordSource};
use crate::transforms::vision::{crop_clipped, BoundingBox, ImageToTensor, LoadImage, ResizeExact};
use crate::transforms::Transform;
use anyhow::{bail, ensure, Context, Result};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tch::{Kind, Tensor};
use tracing::info;

/// One parsed list line.
#[derive(Debug, Clone, PartialEq)]
pub struct SegEntry {
    pub image: PathBuf,
    pub seg: PathBuf,
    pub inst: Option<PathBuf>,
    pub window: Option<BoundingBox>,
    /// `SegBinaryCtrl`: the target class. `SelectSegBinary`: the candidates.
    /// `WindowInstSeg`: the instance label.
    pub classes: Vec<i64>,
}

impl SegEntry {
    pub fn parse(kind: SourceKind, line: &ListLine, list: &Path, root: &Path, label_dim: usize) -> Result<Self> {
        let fields = line.fields();
        let window_at = |start: usize| -> Result<BoundingBox> {
            Ok(BoundingBox::new(
                parse_field(line, list, fields[start], "x1")?,
                parse_field(line, list, fields[start + 1], "y1")?,
                parse_field(line, list, fields[start + 2], "x2")?,
                parse_field(line, list, fields[start + 3], "y2")?,
            ))
        };
        let class_at = |index: usize| -> Result<i64> {
            let class: i64 = parse_field(line, list, fields[index], "class")?;
            if class < 0 || class as usize >= label_dim {
                return Err(line.error(list, format!("class {} outside 0..{}", class, label_dim)));
            }
            Ok(class)
        };
        let want_fields = |count: usize, format: &str| -> Result<()> {
            if fields.len() == count {
                Ok(())
            } else {
                Err(line.error(list, format!("expected `{}`", format)))
            }
        };

        let mut entry = Self {
            image: PathBuf::new(),
            seg: PathBuf::new(),
            inst: None,
            window: None,
            classes: Vec::new(),
        };
        match kind {
            SourceKind::ImageSeg => want_fields(2, "img seg")?,
            SourceKind::WindowSeg | SourceKind::WindowSegBinary | SourceKind::WindowCls => {
                want_fields(6, "img seg x1 y1 x2 y2")?;
                entry.window = Some(window_at(2)?);
            }
            SourceKind::SegBinaryCtrl => {
                want_fields(12, "img seg x1 y1 x2 y2 tx1 ty1 tx2 ty2 inst cls")?;
                entry.window = Some(window_at(2)?);
                window_at(6)?;
                let _: i64 = parse_field(line, list, fields[10], "instance")?;
                entry.classes.push(class_at(11)?);
            }
            SourceKind::SelectSegBinary => {
                if fields.len() < 7 {
                    return Err(line.error(list, "expected `img seg x1 y1 x2 y2 c1 [c2 ...]`"));
                }
                entry.window = Some(window_at(2)?);
                entry.classes = (6..fields.len()).map(class_at).collect::<Result<_>>()?;
            }
            SourceKind::WindowInstSeg => {
                want_fields(8, "img seg inst x1 y1 x2 y2 inst_label")?;
                entry.inst = Some(resolve(root, fields[2]));
                entry.window = Some(window_at(3)?);
                entry.classes.push(parse_field(line, list, fields[7], "instance label")?);
            }
            other => bail!("{:?} is not a segmentation list variant", other),
        }
        entry.image = resolve(root, fields[0]);
        entry.seg = resolve(root, fields[1]);
        Ok(entry)
    }
}

/// Decoded maps of one entry, shared through the decode cache.
#[derive(Debug)]
struct SegImages {
    image: DynamicImage,
    seg: DynamicImage,
    inst: Option<DynamicImage>,
}

/// Reads one of the segmentation list variants.
///
/// Label maps are emitted as spatial fields, so the record transformer crops,
/// pads (with `ignore_label`) and mirrors them together with the image.
pub struct SegmentationSource {
    kind: SourceKind,
    entries: Vec<SegEntry>,
    order: EpochOrder,
    image_loader: LoadImage,
    image_resize: Option<ResizeExact>,
    map_resize: Option<ResizeExact>,
    cache: DecodeCache<Arc<SegImages>>,
    label_dim: usize,
    ignore_label: u8,
    layout: OutputLayout,
}

impl SegmentationSource {
    pub fn open(config: &DataLayerConfig, base_seed: u64) -> Result<Self> {
        let kind = config.variant;
        let entries = read_list(&config.source)?
            .iter()
            .map(|line| SegEntry::parse(kind, line, &config.source, &config.root_folder, config.label_dim))
            .collect::<Result<Vec<_>>>()?;
        let mut order = EpochOrder::new(entries.len(), config.shuffle, derive_seed(base_seed, 0))
            .with_context(|| format!("{} lists no images", config.source.display()))?;
        let skipped = order.random_skip(config.rand_skip);

        let image_resize = ResizeExact::optional(config.new_height, config.new_width, FilterType::Triangle)
            .context(DataLayerError::config("invalid resize target"))?;
        let map_resize = ResizeExact::optional(config.new_height, config.new_width, FilterType::Nearest)
            .context(DataLayerError::config("invalid resize target"))?;

        let mut source = Self {
            kind,
            entries,
            order,
            image_loader: LoadImage::new(config.is_color),
            image_resize,
            map_resize,
            cache: DecodeCache::new(config.cache_images),
            label_dim: config.label_dim,
            ignore_label: config.ignore_label,
            layout: OutputLayout::new(Vec::new(), Arity::exact(3).with_auto()),
        };

        // The first entry fixes the output shapes.
        let first = source
            .build(0)
            .context(DataLayerError::config("cannot read the first entry of the list"))?;
        source.layout.outputs = source
            .output_names()
            .iter()
            .map(|&name| {
                let shape = first.get(name)?.size();
                Ok(match name {
                    "data" => OutputSpec::payload(shape),
                    "label" => OutputSpec::spatial(name, shape),
                    _ => OutputSpec::plain(name, shape),
                })
            })
            .collect::<Result<_>>()?;

        info!(
            source = %config.source.display(),
            variant = ?kind,
            entries = source.entries.len(),
            skipped,
            "opened segmentation list"
        );
        Ok(source)
    }

    fn output_names(&self) -> [&'static str; 3] {
        match self.kind {
            SourceKind::SegBinaryCtrl => ["data", "label", "ctrl"],
            SourceKind::SelectSegBinary => ["data", "label", "cls"],
            SourceKind::WindowCls => ["data", "cls", "dim"],
            _ => ["data", "label", "dim"],
        }
    }

    fn decode(&mut self, index: usize) -> Result<Arc<SegImages>> {
        let entry = &self.entries[index];
        let image_loader = self.image_loader;
        self.cache.fetch(index, || {
            let gray = LoadImage::gray();
            Ok(Arc::new(SegImages {
                image: image_loader.apply(entry.image.clone())?,
                seg: gray.apply(entry.seg.clone())?,
                inst: entry.inst.clone().map(|path| gray.apply(path)).transpose()?,
            }))
        })
    }

    fn prepare(&self, image: &DynamicImage, window: Option<BoundingBox>, map: bool) -> Result<DynamicImage> {
        let cropped = match window {
            Some(bbox) => crop_clipped(image, bbox)?,
            None => image.clone(),
        };
        let resize = if map { &self.map_resize } else { &self.image_resize };
        resize.apply(cropped)
    }

    fn build(&mut self, index: usize) -> Result<Record> {
        let decoded = self.decode(index)?;
        let entry = &self.entries[index];
        let window = entry.window;

        let image = self.prepare(&decoded.image, window, false)?;
        let seg = self.prepare(&decoded.seg, window, true)?;
        ensure!(
            image.dimensions() == seg.dimensions(),
            "image is {:?} but label map is {:?}",
            image.dimensions(),
            seg.dimensions()
        );
        let (width, height) = image.dimensions();
        let dim = Tensor::from_slice(&[height as f32, width as f32]);
        let ignore = self.ignore_label as f64;

        let payload = ImageToTensor.apply(image)?;
        let seg_map = ImageToTensor.apply(seg.clone())?;
        let record = Record::new(payload);

        Ok(match self.kind {
            SourceKind::ImageSeg | SourceKind::WindowSeg => {
                record.with_spatial_field("label", seg_map).with_field("dim", dim)
            }
            SourceKind::WindowSegBinary => record
                .with_spatial_field("label", binarize(&seg_map, ignore))
                .with_field("dim", dim),
            SourceKind::SegBinaryCtrl => {
                let class = entry.classes[0];
                record
                    .with_spatial_field("label", class_mask(&seg_map, class, ignore))
                    .with_field("ctrl", one_hot(class, self.label_dim)?)
            }
            SourceKind::SelectSegBinary => {
                let pick = self.order.rng().random_range(0..entry.classes.len());
                let class = entry.classes[pick];
                record
                    .with_spatial_field("label", class_mask(&seg_map, class, ignore))
                    .with_field("cls", one_hot(class, self.label_dim)?)
            }
            SourceKind::WindowCls => {
                let present = classes_present(&seg, self.label_dim, self.ignore_label)?;
                record.with_field("cls", present).with_field("dim", dim)
            }
            SourceKind::WindowInstSeg => {
                let inst = decoded
                    .inst
                    .as_ref()
                    .context("instance map was not decoded")?;
                let inst = self.prepare(inst, window, true)?;
                ensure!(
                    inst.dimensions() == (width, height),
                    "instance map is {:?}, image is {:?}",
                    inst.dimensions(),
                    (width, height)
                );
                let inst_map = ImageToTensor.apply(inst)?;
                let label = inst_map
                    .eq(entry.classes[0])
                    .to_kind(Kind::Float)
                    .masked_fill(&seg_map.eq(ignore), ignore);
                record.with_spatial_field("label", label).with_field("dim", dim)
            }
            other => bail!("{:?} is not a segmentation list variant", other),
        })
    }
}

impl RecordSource for SegmentationSource {
    fn next(&mut self) -> Result<Record> {
        let index = self.order.next_index();
        self.build(index).with_context(|| {
            DataLayerError::record(format!("entry {}", self.entries[index].image.display()))
        })
    }

    fn reset_epoch(&mut self) {
        self.order.reset_epoch();
    }

    fn describe_outputs(&self) -> &OutputLayout {
        &self.layout
    }

    fn len(&self) -> Option<usize> {
        Some(self.entries.len())
    }

    fn epoch(&self) -> usize {
        self.order.epoch()
    }
}

/// `ignore` stays `ignore`, any other non-zero label becomes 1.
pub fn binarize(seg: &Tensor, ignore: f64) -> Tensor {
    seg.ne(0.0)
        .to_kind(Kind::Float)
        .masked_fill(&seg.eq(ignore), ignore)
}

/// 1 where the map equals `class`, `ignore` where it is ignored, 0 elsewhere.
pub fn class_mask(seg: &Tensor, class: i64, ignore: f64) -> Tensor {
    seg.eq(class)
        .to_kind(Kind::Float)
        .masked_fill(&seg.eq(ignore), ignore)
}

pub fn one_hot(class: i64, dim: usize) -> Result<Tensor> {
    ensure!(
        class >= 0 && (class as usize) < dim,
        "class {} outside 0..{}",
        class,
        dim
    );
    let mut values = vec![0f32; dim];
    values[class as usize] = 1.0;
    Ok(Tensor::from_slice(&values))
}

/// Multi-hot vector of the classes found in a label map, 0 and `ignore` excluded.
fn classes_present(seg: &DynamicImage, dim: usize, ignore: u8) -> Result<Tensor> {
    let mut values = vec![0f32; dim];
    for &label in seg.to_luma8().as_raw() {
        if label == 0 || label == ignore {
            continue;
        }
        ensure!((label as usize) < dim, "class {} outside 0..{}", label, dim);
        values[label as usize] = 1.0;
    }
    Ok(Tensor::from_slice(&values))
}
