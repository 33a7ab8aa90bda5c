use crate::batch::Batch;
use crate::error::DataLayerError;
use crate::record::Record;
use crate::sources::OutputSpec;
use crate::transforms::{Passthrough, RecordTransform};
use anyhow::{bail, ensure, Context, Result};
use tch::Tensor;
use tracing::debug;

enum Storage<'a> {
    Empty,
    Borrowed { data: &'a [f32], labels: &'a [f32] },
    Owned { data: Vec<f32>, labels: Vec<f32> },
}

impl Storage<'_> {
    fn slices(&self) -> Option<(&[f32], &[f32])> {
        match self {
            Self::Empty => None,
            Self::Borrowed { data, labels } => Some((*data, *labels)),
            Self::Owned { data, labels } => Some((data.as_slice(), labels.as_slice())),
        }
    }
}

/// A synchronous layer that serves batches out of memory the caller owns.
///
/// No prefetching: each `forward` copies the next `batch_size` records out of
/// the installed slices and advances `pos` by one batch, wrapping at `n`. The
/// slices passed to [`reset`](Self::reset) are borrowed for `'a`, so they
/// cannot be freed or modified while the layer can still read them.
pub struct MemoryDataLayer<'a, T = Passthrough> {
    batch_size: usize,
    shape: [i64; 3],
    storage: Storage<'a>,
    n: usize,
    pos: usize,
    transform: T,
}

impl<'a> MemoryDataLayer<'a, Passthrough> {
    pub fn new(batch_size: usize, channels: i64, height: i64, width: i64) -> Result<Self> {
        ensure!(
            batch_size > 0 && channels > 0 && height > 0 && width > 0,
            DataLayerError::config(format!(
                "memory layer needs positive sizes (batch {}, shape {}x{}x{})",
                batch_size, channels, height, width
            ))
        );
        Ok(Self {
            batch_size,
            shape: [channels, height, width],
            storage: Storage::Empty,
            n: 0,
            pos: 0,
            transform: Passthrough,
        })
    }
}

impl<'a, T: RecordTransform> MemoryDataLayer<'a, T> {
    /// Replaces the transform applied by [`add_records`](Self::add_records).
    pub fn with_transform<U: RecordTransform>(self, transform: U) -> MemoryDataLayer<'a, U> {
        MemoryDataLayer {
            batch_size: self.batch_size,
            shape: self.shape,
            storage: self.storage,
            n: self.n,
            pos: self.pos,
            transform,
        }
    }

    fn record_len(&self) -> usize {
        self.shape.iter().product::<i64>() as usize
    }

    fn check_count(&self, n: usize) -> Result<()> {
        ensure!(
            n > 0 && n % self.batch_size == 0,
            DataLayerError::config(format!(
                "record count {} must be a positive multiple of batch size {}",
                n, self.batch_size
            ))
        );
        Ok(())
    }

    /// Serves `n` records straight out of `data` and `labels` from now on.
    pub fn reset(&mut self, data: &'a [f32], labels: &'a [f32], n: usize) -> Result<()> {
        self.check_count(n)?;
        ensure!(
            data.len() >= n * self.record_len() && labels.len() >= n,
            DataLayerError::config(format!(
                "{} data values and {} labels cannot hold {} records of {:?}",
                data.len(),
                labels.len(),
                n,
                self.shape
            ))
        );
        self.storage = Storage::Borrowed { data, labels };
        self.n = n;
        self.pos = 0;
        Ok(())
    }

    /// Transforms `records` and keeps owned copies of them, replacing any
    /// previously installed data.
    pub fn add_records(&mut self, records: Vec<Record>) -> Result<()> {
        self.check_count(records.len())?;
        let input = OutputSpec::payload(self.shape.to_vec());
        self.transform.check_input(&input)?;
        let expected = self.transform.output_shape(&input);
        ensure!(
            expected == self.shape,
            DataLayerError::config(format!(
                "transform changes records from {:?} to {:?}",
                self.shape, expected
            ))
        );

        let mut data = Vec::with_capacity(records.len() * self.record_len());
        let mut labels = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            let record = self
                .transform
                .transform(record)
                .with_context(|| DataLayerError::record(format!("record {}", index)))?;
            if record.payload.size() != self.shape {
                bail!(DataLayerError::record(format!(
                    "record {} has shape {:?}, expected {:?}",
                    index,
                    record.payload.size(),
                    self.shape
                )));
            }
            let label = record
                .label()
                .with_context(|| DataLayerError::record(format!("record {} has no label", index)))?;
            if label.numel() != 1 {
                bail!(DataLayerError::record(format!(
                    "record {} has a label of shape {:?}, expected a scalar",
                    index,
                    label.size()
                )));
            }
            let label = label.f_double_value(&[])?;
            data.extend(Vec::<f32>::try_from(&record.payload.flatten(0, -1).contiguous())?);
            labels.push(label as f32);
        }

        debug!(records = labels.len(), "memory layer holds owned records");
        self.n = labels.len();
        self.pos = 0;
        self.storage = Storage::Owned { data, labels };
        Ok(())
    }

    /// Copies out the batch at `pos` and advances by one batch.
    pub fn forward(&mut self) -> Result<Batch> {
        let (data, labels) = self
            .storage
            .slices()
            .with_context(|| DataLayerError::config("memory layer has no data, call reset first"))?;
        let record_len = self.record_len();
        let start = self.pos;
        let end = start + self.batch_size;

        let shape = [self.batch_size as i64, self.shape[0], self.shape[1], self.shape[2]];
        let batch = Batch::new(vec![
            (
                "data".to_string(),
                Tensor::from_slice(&data[start * record_len..end * record_len]).view(&shape[..]),
            ),
            ("label".to_string(), Tensor::from_slice(&labels[start..end])),
        ]);

        self.pos = end % self.n;
        Ok(batch)
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }
}
