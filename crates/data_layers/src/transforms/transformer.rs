//! Record-level transforms applied by the prefetch worker before a record is
//! written into its batch row.

use crate::config::{DataLayerConfig, Phase, TransformConfig};
use crate::error::DataLayerError;
use crate::record::{Field, FieldKind, Record};
use crate::sources::{derive_seed, OutputSpec};
use crate::transforms::vision::SubtractMean;
use crate::transforms::Transform;
use anyhow::{ensure, Context, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use tch::{Device, Kind, Tensor};

/// Turns a raw record into the record whose tensors are copied into a batch.
///
/// Implementations may own an RNG; they are moved into the prefetch worker
/// together with the source and are never called from two threads at once.
pub trait RecordTransform: Send {
    fn transform(&mut self, record: Record) -> Result<Record>;

    /// Per-record shape of an output after this transform, given the shape the
    /// source reports for it. Used to size batch buffers.
    fn output_shape(&self, spec: &OutputSpec) -> Vec<i64> {
        spec.shape.clone()
    }

    /// Rejects a payload this transform can never handle, before any record
    /// is read.
    fn check_input(&self, _payload: &OutputSpec) -> Result<()> {
        Ok(())
    }
}

/// Casts the payload to `Float` and leaves everything else untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl RecordTransform for Passthrough {
    fn transform(&mut self, mut record: Record) -> Result<Record> {
        record.payload = record.payload.to_kind(Kind::Float);
        Ok(record)
    }
}

/// The default record transform: mean subtraction, scaling, crop or pad to
/// `crop_size`, and horizontal mirroring.
///
/// Order of operations on the payload:
/// 1. `(input - mean) * scale`
/// 2. pad bottom/right with 0 up to `crop_size` when the input is smaller
/// 3. crop `crop_size x crop_size` (random offset in `Train`, centred in `Test`)
/// 4. mirror with probability 1/2 (`Train` with `mirror` only)
///
/// Spatial fields (label maps) go through steps 2-4 with the payload's
/// offsets and mirror decision, padded with `ignore_label` instead of 0.
/// Plain fields are passed through.
#[derive(Debug)]
pub struct DataTransformer {
    normalize: SubtractMean,
    crop_size: i64,
    mirror: bool,
    phase: Phase,
    ignore_label: f64,
    rng: StdRng,
}

impl DataTransformer {
    pub fn new(config: &TransformConfig, ignore_label: u8, seed: u64) -> Result<Self> {
        let normalize = match (&config.mean_file, config.mean_value.as_slice()) {
            (Some(_), values) if !values.is_empty() => {
                return Err(
                    DataLayerError::config("specify either mean_file or mean_value, not both").into(),
                )
            }
            (Some(path), _) => SubtractMean::from_file(path, config.scale).with_context(|| {
                DataLayerError::config(format!("cannot load mean file {}", path.display()))
            })?,
            (None, []) => SubtractMean::scale_only(config.scale),
            (None, values) => SubtractMean::from_values(values, config.scale)?,
        };

        Ok(Self {
            normalize,
            crop_size: config.crop_size as i64,
            mirror: config.mirror,
            phase: config.phase,
            ignore_label: ignore_label as f64,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Builds the transformer of a layer; its RNG is stream 1 of the layer seed.
    pub fn for_layer(config: &DataLayerConfig, base_seed: u64) -> Result<Self> {
        Self::new(&config.transform, config.ignore_label, derive_seed(base_seed, 1))
    }

    fn is_spatial(&self) -> bool {
        self.crop_size > 0 || (self.mirror && self.phase == Phase::Train)
    }

    fn plan(&mut self, payload: &Tensor) -> Result<Option<SpatialPlan>> {
        let wants_mirror = self.mirror && self.phase == Phase::Train;
        if !self.is_spatial() {
            return Ok(None);
        }
        let (_, height, width) = payload
            .size3()
            .context("crop and mirror need a [C, H, W] payload")?;

        let crop = if self.crop_size > 0 {
            let size = self.crop_size;
            let (padded_h, padded_w) = (height.max(size), width.max(size));
            let (h_off, w_off) = match self.phase {
                Phase::Train => (
                    self.rng.random_range(0..=padded_h - size),
                    self.rng.random_range(0..=padded_w - size),
                ),
                Phase::Test => ((padded_h - size) / 2, (padded_w - size) / 2),
            };
            Some(CropWindow {
                size,
                padded_h,
                padded_w,
                h_off,
                w_off,
            })
        } else {
            None
        };
        let flip = wants_mirror && self.rng.random_bool(0.5);

        Ok(Some(SpatialPlan {
            height,
            width,
            crop,
            flip,
        }))
    }
}

impl RecordTransform for DataTransformer {
    fn transform(&mut self, record: Record) -> Result<Record> {
        let Record { payload, fields } = record;

        let payload = self
            .normalize
            .apply(payload.to_kind(Kind::Float))
            .context("mean subtraction failed")?;
        let plan = self.plan(&payload)?;
        let payload = match &plan {
            Some(plan) => plan.apply(&payload, 0.0)?,
            None => payload,
        };

        let mut transformed = HashMap::with_capacity(fields.len());
        for (name, field) in fields {
            let value = match (field.kind, &plan) {
                (FieldKind::Spatial, Some(plan)) => plan
                    .apply(&field.value.to_kind(Kind::Float), self.ignore_label)
                    .with_context(|| format!("field '{}' is not aligned with the payload", name))?,
                _ => field.value,
            };
            transformed.insert(
                name,
                Field {
                    value,
                    kind: field.kind,
                },
            );
        }

        Ok(Record {
            payload,
            fields: transformed,
        })
    }

    fn output_shape(&self, spec: &OutputSpec) -> Vec<i64> {
        let spatial = matches!(spec.kind, FieldKind::Payload | FieldKind::Spatial);
        match spec.shape.as_slice() {
            &[channels, _, _] if spatial && self.crop_size > 0 => {
                vec![channels, self.crop_size, self.crop_size]
            }
            _ => spec.shape.clone(),
        }
    }

    fn check_input(&self, payload: &OutputSpec) -> Result<()> {
        ensure!(
            !self.is_spatial() || payload.shape.len() == 3,
            DataLayerError::config(format!(
                "crop and mirror need a [C, H, W] payload, '{}' is {:?}",
                payload.name, payload.shape
            ))
        );
        self.normalize
            .check_input(&payload.shape)
            .with_context(|| DataLayerError::config(format!("mean does not fit '{}'", payload.name)))
    }
}

#[derive(Debug, Clone, Copy)]
struct CropWindow {
    size: i64,
    padded_h: i64,
    padded_w: i64,
    h_off: i64,
    w_off: i64,
}

/// Crop/pad/mirror decisions drawn once per record and shared by the payload
/// and every spatial field.
#[derive(Debug, Clone, Copy)]
struct SpatialPlan {
    height: i64,
    width: i64,
    crop: Option<CropWindow>,
    flip: bool,
}

impl SpatialPlan {
    fn apply(&self, tensor: &Tensor, fill: f64) -> Result<Tensor> {
        let (channels, height, width) = tensor.size3()?;
        ensure!(
            (height, width) == (self.height, self.width),
            "expected {}x{} map, got {}x{}",
            self.height,
            self.width,
            height,
            width
        );

        let mut out = tensor.shallow_clone();
        if let Some(crop) = self.crop {
            if crop.padded_h > height || crop.padded_w > width {
                let canvas = Tensor::full(
                    &[channels, crop.padded_h, crop.padded_w],
                    fill,
                    (Kind::Float, Device::Cpu),
                );
                canvas.narrow(1, 0, height).narrow(2, 0, width).copy_(&out);
                out = canvas;
            }
            out = out
                .narrow(1, crop.h_off, crop.size)
                .narrow(2, crop.w_off, crop.size);
        }
        if self.flip {
            out = out.flip(&[2]);
        }
        Ok(out.contiguous())
    }
}
