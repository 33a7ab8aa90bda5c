use crate::config::DataLayerConfig;
use crate::error::DataLayerError;
use crate::record::Record;
use crate::sources::list::{parse_field, read_list, resolve, DecodeCache};
use crate::sources::{derive_seed, Arity, EpochOrder, OutputLayout, OutputSpec, RecordSource};
use crate::transforms::vision::{image_decoder, ImageDecoder};
use crate::transforms::Transform;
use anyhow::{Context, Result};
use image::imageops::FilterType;
use std::path::PathBuf;
use tch::Tensor;
use tracing::info;

/// Reads `path label` lines and decodes one image per record.
///
/// The path is everything before the last run of whitespace, so file names
/// containing spaces are accepted. Outputs: `data [C, H, W]`, `label []`.
pub struct ImageListSource {
    entries: Vec<(PathBuf, i64)>,
    order: EpochOrder,
    decode: ImageDecoder,
    cache: DecodeCache<Record>,
    layout: OutputLayout,
}

impl ImageListSource {
    pub fn open(config: &DataLayerConfig, base_seed: u64) -> Result<Self> {
        let lines = read_list(&config.source)?;
        let entries = lines
            .iter()
            .map(|line| {
                let (path, label) = line
                    .text
                    .rsplit_once(char::is_whitespace)
                    .ok_or_else(|| line.error(&config.source, "expected `path label`"))?;
                let label = parse_field(line, &config.source, label.trim(), "label")?;
                Ok((resolve(&config.root_folder, path.trim_end()), label))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut order = EpochOrder::new(entries.len(), config.shuffle, derive_seed(base_seed, 0))
            .with_context(|| format!("{} has no images", config.source.display()))?;
        let decode = image_decoder(
            config.is_color,
            config.new_height,
            config.new_width,
            FilterType::Triangle,
        )
        .context(DataLayerError::config("invalid resize target"))?;

        let skipped = order.random_skip(config.rand_skip);
        info!(
            source = %config.source.display(),
            images = entries.len(),
            skipped,
            "opened image list"
        );

        let mut source = Self {
            entries,
            order,
            decode,
            cache: DecodeCache::new(config.cache_images),
            layout: OutputLayout::new(Vec::new(), Arity::exact(2)),
        };

        // The first image fixes the record shape.
        let first = source
            .load(0)
            .context(DataLayerError::config("cannot decode the first image of the list"))?;
        source.layout.outputs = vec![OutputSpec::payload(first.payload.size()), OutputSpec::label()];
        Ok(source)
    }

    fn load(&mut self, index: usize) -> Result<Record> {
        let (path, label) = &self.entries[index];
        let decode = &self.decode;
        self.cache.fetch(index, || {
            let image = decode.apply(path.clone())?;
            Ok(Record::new(image).with_field("label", Tensor::from(*label as f32)))
        })
    }
}

impl RecordSource for ImageListSource {
    fn next(&mut self) -> Result<Record> {
        let index = self.order.next_index();
        self.load(index).with_context(|| {
            DataLayerError::record(format!("image {}", self.entries[index].0.display()))
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
