use crate::config::DataLayerConfig;
use crate::error::DataLayerError;
use crate::record::Record;
use crate::sources::list::{read_list, resolve};
use crate::sources::{derive_seed, Arity, EpochOrder, OutputLayout, OutputSpec, RecordSource};
use anyhow::{bail, ensure, Context, Result};
use bytemuck::pod_collect_to_vec;
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use safetensors::{
    tensor::{Dtype, TensorView},
    SafeTensors,
};
use std::fs;
use std::path::{Path, PathBuf};
use tch::Tensor;
use tracing::{debug, info};

/// Rows of one array file held in memory.
struct LoadedArrays {
    data: Tensor,
    label: Option<Tensor>,
    rows: Vec<usize>,
    cursor: usize,
}

impl LoadedArrays {
    fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read array file: {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&bytes)
            .with_context(|| format!("Invalid safetensors file: {}", path.display()))?;

        let data = tensors
            .tensor("data")
            .with_context(|| format!("No 'data' tensor in {}", path.display()))
            .and_then(|view| tensor_from_view(&view))?;
        let label = match tensors.tensor("label") {
            Ok(view) => Some(tensor_from_view(&view)?),
            Err(_) => None,
        };

        let rows = *data.size().first().context("'data' must have a leading row dimension")?;
        ensure!(rows > 0, "{} holds no rows", path.display());
        if let Some(label) = &label {
            ensure!(
                label.size().first() == Some(&rows),
                "'label' has {:?} rows, 'data' has {}",
                label.size().first(),
                rows
            );
        }
        Ok(Self {
            data,
            label,
            rows: (0..rows as usize).collect(),
            cursor: 0,
        })
    }

    fn exhausted(&self) -> bool {
        self.cursor >= self.rows.len()
    }

    fn next_record(&mut self) -> Record {
        let row = self.rows[self.cursor] as i64;
        self.cursor += 1;
        let record = Record::new(self.data.get(row));
        match &self.label {
            Some(label) => record.with_field("label", label.get(row)),
            None => record,
        }
    }
}

/// Reads records from a list of `.safetensors` files, each holding a
/// `data [N, ...]` tensor and optionally a `label [N, ...]` tensor.
///
/// One file is resident at a time. With `shuffle`, both the file order and
/// the row order inside each file are permuted every pass. The epoch ticks
/// once the last row of the last file in a pass has been served.
pub struct ArrayFileSource {
    files: Vec<PathBuf>,
    file_order: EpochOrder,
    epoch: usize,
    current: LoadedArrays,
    shuffle: bool,
    row_rng: StdRng,
    layout: OutputLayout,
}

impl ArrayFileSource {
    pub fn open(config: &DataLayerConfig, base_seed: u64) -> Result<Self> {
        let files: Vec<PathBuf> = read_list(&config.source)?
            .iter()
            .map(|line| resolve(&config.root_folder, &line.text))
            .collect();
        let mut file_order = EpochOrder::new(files.len(), config.shuffle, derive_seed(base_seed, 0))
            .with_context(|| format!("{} lists no array files", config.source.display()))?;

        let first = file_order.next_index();
        let current = LoadedArrays::load(&files[first]).with_context(|| {
            DataLayerError::config(format!("cannot load {}", files[first].display()))
        })?;

        let mut outputs = vec![OutputSpec::payload(current.data.size()[1..].to_vec())];
        if let Some(label) = &current.label {
            outputs.push(OutputSpec::plain("label", label.size()[1..].to_vec()));
        }

        let mut source = Self {
            files,
            file_order,
            epoch: 0,
            current,
            shuffle: config.shuffle,
            row_rng: StdRng::seed_from_u64(derive_seed(base_seed, 2)),
            layout: OutputLayout::new(outputs, Arity::between(1, 2)),
        };
        if source.shuffle {
            source.current.rows.shuffle(&mut source.row_rng);
        }

        info!(
            source = %config.source.display(),
            files = source.files.len(),
            first_rows = source.current.rows.len(),
            "opened array files"
        );
        Ok(source)
    }

    fn advance_file(&mut self) -> Result<()> {
        let index = self.file_order.next_index();
        let path = &self.files[index];
        debug!(file = %path.display(), "loading array file");

        let mut loaded = LoadedArrays::load(path)
            .with_context(|| DataLayerError::record(format!("cannot load {}", path.display())))?;
        let row_shape = &loaded.data.size()[1..];
        if row_shape != self.layout.outputs[0].shape.as_slice() {
            bail!(DataLayerError::record(format!(
                "{} has rows of shape {:?}, expected {:?}",
                path.display(),
                row_shape,
                self.layout.outputs[0].shape
            )));
        }
        if self.shuffle {
            loaded.rows.shuffle(&mut self.row_rng);
        }
        self.current = loaded;
        Ok(())
    }
}

impl RecordSource for ArrayFileSource {
    fn next(&mut self) -> Result<Record> {
        if self.current.exhausted() {
            self.advance_file()?;
        }
        let record = self.current.next_record();
        // The file order wraps when the last file of a pass is loaded.
        if self.current.exhausted() && self.file_order.cursor() == 0 {
            self.epoch += 1;
        }
        Ok(record)
    }

    fn reset_epoch(&mut self) {
        self.file_order.reset_epoch();
        self.current.cursor = self.current.rows.len();
        self.epoch += 1;
    }

    fn describe_outputs(&self) -> &OutputLayout {
        &self.layout
    }

    /// Number of array files (rows per file are only known once loaded).
    fn len(&self) -> Option<usize> {
        Some(self.files.len())
    }

    fn epoch(&self) -> usize {
        self.epoch
    }
}

/// Converts a safetensors view to a tch tensor. The byte buffer carries no
/// alignment guarantee, so values are collected rather than cast in place.
fn tensor_from_view(view: &TensorView<'_>) -> Result<Tensor> {
    let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
    let raw = view.data();
    let tensor = match view.dtype() {
        Dtype::U8 => Tensor::from_slice(raw),
        Dtype::I8 => Tensor::from_slice(&pod_collect_to_vec::<u8, i8>(raw)),
        Dtype::I16 => Tensor::from_slice(&pod_collect_to_vec::<u8, i16>(raw)),
        Dtype::I32 => Tensor::from_slice(&pod_collect_to_vec::<u8, i32>(raw)),
        Dtype::I64 => Tensor::from_slice(&pod_collect_to_vec::<u8, i64>(raw)),
        Dtype::F32 => Tensor::from_slice(&pod_collect_to_vec::<u8, f32>(raw)),
        Dtype::F64 => Tensor::from_slice(&pod_collect_to_vec::<u8, f64>(raw)),
        other => bail!(
            "Unsupported dtype {:?} (supported: U8, I8, I16, I32, I64, F32, F64), shape {:?}",
            other,
            shape
        ),
    };
    Ok(tensor.view(shape.as_slice()))
}
