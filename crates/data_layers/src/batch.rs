//! src/batch.rs
//!
//! Preallocated batch storage and the batches handed to the consumer.

use crate::error::DataLayerError;
use crate::record::Record;
use crate::sources::{OutputSpec, RecordSource};
use crate::transforms::RecordTransform;
use anyhow::{bail, ensure, Context, Result};
use tch::{Device, Kind, Tensor};
use tracing::debug;

/// One step's output: named `[batch_size, ...]` float tensors in the order
/// declared by the source.
#[derive(Debug)]
pub struct Batch {
    tensors: Vec<(String, Tensor)>,
}

impl Batch {
    pub fn new(tensors: Vec<(String, Tensor)>) -> Self {
        Self { tensors }
    }

    /// Looks up an output by name; `"data"` is always the first output.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn data(&self) -> &Tensor {
        &self.tensors[0].1
    }

    pub fn names(&self) -> Vec<&str> {
        self.tensors.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Number of outputs.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Rows per output.
    pub fn batch_size(&self) -> i64 {
        self.tensors.first().map(|(_, t)| t.size()[0]).unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn into_tensors(self) -> Vec<(String, Tensor)> {
        self.tensors
    }
}

/// Fill state of a [`BatchBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Empty,
    Filling,
    Ready,
}

/// One set of preallocated output tensors, filled row by row.
///
/// A buffer is only ever touched by the thread holding it: the prefetch
/// worker while `Filling`, the layer once `Ready`.
#[derive(Debug)]
pub struct BatchBuffer {
    id: usize,
    specs: Vec<OutputSpec>,
    tensors: Vec<Tensor>,
    batch_size: usize,
    state: BufferState,
}

impl BatchBuffer {
    /// Allocates one `[batch_size, ...spec.shape]` zeroed tensor per output.
    pub fn new(id: usize, specs: &[OutputSpec], batch_size: usize) -> Self {
        let tensors = specs
            .iter()
            .map(|spec| {
                let mut shape = vec![batch_size as i64];
                shape.extend_from_slice(&spec.shape);
                Tensor::zeros(shape.as_slice(), (Kind::Float, Device::Cpu))
            })
            .collect();
        Self {
            id,
            specs: specs.to_vec(),
            tensors,
            batch_size,
            state: BufferState::Empty,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Pulls `batch_size` records, transforms them and writes them row by row.
    ///
    /// The first failure aborts the fill and leaves the buffer `Filling`, so
    /// a partially written buffer can never be snapshotted.
    pub fn fill<S, T>(&mut self, source: &mut S, transform: &mut T) -> Result<()>
    where
        S: RecordSource + ?Sized,
        T: RecordTransform + ?Sized,
    {
        ensure!(
            self.state != BufferState::Filling,
            "buffer {} is already being filled",
            self.id
        );
        self.state = BufferState::Filling;

        for row in 0..self.batch_size {
            let written = source
                .next()
                .and_then(|record| transform.transform(record))
                .and_then(|record| self.write_row(row, &record))
                .with_context(|| {
                    DataLayerError::record(format!(
                        "row {} of buffer {} (epoch {})",
                        row,
                        self.id,
                        source.epoch()
                    ))
                });
            written?;
        }

        self.state = BufferState::Ready;
        debug!(buffer = self.id, rows = self.batch_size, "buffer filled");
        Ok(())
    }

    fn write_row(&self, row: usize, record: &Record) -> Result<()> {
        for (spec, tensor) in self.specs.iter().zip(&self.tensors) {
            let value = record.get(&spec.name)?;
            if value.size() != spec.shape {
                bail!(DataLayerError::record(format!(
                    "output '{}' expects shape {:?}, record has {:?}",
                    spec.name,
                    spec.shape,
                    value.size()
                )));
            }
            tensor.get(row as i64).copy_(&value.to_kind(Kind::Float));
        }
        Ok(())
    }

    /// Copies the first `count` outputs out of a ready buffer.
    pub fn snapshot(&self, count: usize) -> Result<Batch> {
        ensure!(
            self.state == BufferState::Ready,
            "buffer {} is {:?}, not ready",
            self.id,
            self.state
        );
        Ok(Batch::new(
            self.specs
                .iter()
                .zip(&self.tensors)
                .take(count)
                .map(|(spec, tensor)| (spec.name.clone(), tensor.copy()))
                .collect(),
        ))
    }

    /// Marks a consumed buffer as reusable.
    pub fn release(&mut self) {
        self.state = BufferState::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{ArraySource, OutputLayout};
    use crate::transforms::Passthrough;
    use anyhow::anyhow;

    fn source(values: usize) -> Result<ArraySource> {
        let data: Vec<f32> = (0..values * 2).map(|v| v as f32).collect();
        let labels: Vec<f32> = (0..values).map(|v| v as f32 * 10.0).collect();
        ArraySource::new(data, labels, &[2], false, 0)
    }

    fn buffer(source: &ArraySource, batch_size: usize) -> BatchBuffer {
        BatchBuffer::new(0, &source.describe_outputs().outputs, batch_size)
    }

    #[test]
    fn test_fill_then_snapshot() -> Result<()> {
        let mut source = source(3)?;
        let mut buffer = buffer(&source, 2);
        assert_eq!(buffer.state(), BufferState::Empty);
        assert!(buffer.snapshot(2).is_err(), "Empty buffer cannot be read");

        buffer.fill(&mut source, &mut Passthrough)?;
        assert_eq!(buffer.state(), BufferState::Ready);

        let batch = buffer.snapshot(2)?;
        assert_eq!(batch.names(), vec!["data", "label"]);
        assert_eq!(batch.data().size(), vec![2, 2]);
        assert_eq!(batch.get("label").map(|l| l.double_value(&[1])), Some(10.0));

        // Snapshot is a copy, refilling does not change it.
        buffer.release();
        buffer.fill(&mut source, &mut Passthrough)?;
        assert_eq!(batch.data().double_value(&[0, 0]), 0.0);
        assert_eq!(buffer.snapshot(1)?.data().double_value(&[0, 0]), 4.0);
        assert_eq!(buffer.snapshot(1)?.len(), 1);
        Ok(())
    }

    struct Failing {
        layout: OutputLayout,
        served: usize,
    }

    impl RecordSource for Failing {
        fn next(&mut self) -> Result<Record> {
            self.served += 1;
            if self.served == 2 {
                return Err(anyhow!("corrupt"));
            }
            Ok(Record::new(Tensor::ones(&[2], (Kind::Float, Device::Cpu))))
        }
        fn reset_epoch(&mut self) {}
        fn describe_outputs(&self) -> &OutputLayout {
            &self.layout
        }
        fn len(&self) -> Option<usize> {
            None
        }
        fn epoch(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_failed_fill_is_not_ready() -> Result<()> {
        let layout = OutputLayout::new(vec![OutputSpec::payload(vec![2])], crate::sources::Arity::exact(1));
        let mut failing = Failing { layout, served: 0 };
        let mut buffer = BatchBuffer::new(1, &failing.layout.outputs, 3);

        let err = buffer.fill(&mut failing, &mut Passthrough).err().context("expected failure")?;
        assert!(DataLayerError::is_record(&err));
        assert!(format!("{:#}", err).contains("row 1"));
        assert_eq!(buffer.state(), BufferState::Filling);
        assert!(buffer.snapshot(1).is_err());
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_record_error() -> Result<()> {
        let mut source = source(2)?;
        let specs = vec![OutputSpec::payload(vec![3]), OutputSpec::label()];
        let mut buffer = BatchBuffer::new(0, &specs, 1);

        let err = buffer.fill(&mut source, &mut Passthrough).err().context("expected mismatch")?;
        assert!(DataLayerError::is_record(&err));
        Ok(())
    }
}
