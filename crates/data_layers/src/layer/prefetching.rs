use crate::batch::{Batch, BatchBuffer};
use crate::config::DataLayerConfig;
use crate::error::DataLayerError;
use crate::prefetch::{FillLease, PrefetchWorker};
use crate::sources::{AnySource, OutputLayout, OutputSpec, RecordSource};
use crate::transforms::{DataTransformer, RecordTransform};
use anyhow::{bail, Context, Result};
use tracing::{info, warn};

/// A data layer with one batch of lookahead.
///
/// While the caller works on batch `k`, a background thread fills batch
/// `k + 1` into the other of two preallocated buffers. `forward` waits for
/// that fill, copies the buffer out, and immediately starts the next fill.
///
/// A record error during a fill is returned by the `forward` that would have
/// delivered the batch; the layer is unusable afterwards.
pub struct DataLayer<S = AnySource, T = DataTransformer>
where
    S: RecordSource + 'static,
    T: RecordTransform + 'static,
{
    layout: OutputLayout,
    top_count: usize,
    batch_size: usize,
    worker: PrefetchWorker<S, T>,
    spare: Option<BatchBuffer>,
    last_buffer: Option<usize>,
    epoch: usize,
    steps: usize,
    poisoned: bool,
}

impl DataLayer<AnySource, DataTransformer> {
    /// Opens the configured source, builds the transformer and starts
    /// prefetching the first batch.
    pub fn setup(config: &DataLayerConfig) -> Result<Self> {
        config.validate()?;
        let seed = config.effective_seed();
        let source = AnySource::open(config, seed)?;
        let transform = DataTransformer::for_layer(config, seed)?;
        Self::from_parts(source, transform, config.batch_size, config.top_count)
    }
}

impl<S, T> DataLayer<S, T>
where
    S: RecordSource + 'static,
    T: RecordTransform + 'static,
{
    /// Builds a layer over an already opened source.
    ///
    /// `top_count` is the number of outputs the caller wants; `None` takes
    /// every output of the source.
    pub fn from_parts(source: S, transform: T, batch_size: usize, top_count: Option<usize>) -> Result<Self> {
        if batch_size == 0 {
            bail!(DataLayerError::config("batch_size must be greater than 0"));
        }
        let described = source.describe_outputs();
        let top_count = described.resolve(top_count)?;
        if let Some(payload) = described.outputs.first() {
            transform.check_input(payload)?;
        }
        let outputs: Vec<OutputSpec> = described
            .outputs
            .iter()
            .map(|spec| OutputSpec {
                shape: transform.output_shape(spec),
                ..spec.clone()
            })
            .collect();
        let layout = OutputLayout::new(outputs, described.arity);

        info!(
            outputs = ?layout.names(),
            top_count,
            batch_size,
            records = ?source.len(),
            "data layer ready"
        );

        let first = BatchBuffer::new(0, &layout.outputs, batch_size);
        let second = BatchBuffer::new(1, &layout.outputs, batch_size);
        let mut worker = PrefetchWorker::new("data-layer");
        worker.create(FillLease {
            buffer: first,
            source,
            transform,
        })?;

        Ok(Self {
            layout,
            top_count,
            batch_size,
            worker,
            spare: Some(second),
            last_buffer: None,
            epoch: 0,
            steps: 0,
            poisoned: false,
        })
    }

    /// Returns the prefetched batch and starts filling the next one.
    pub fn forward(&mut self) -> Result<Batch> {
        if self.poisoned {
            bail!(DataLayerError::Poisoned);
        }
        let lease = match self.worker.join() {
            Ok(lease) => lease,
            Err(e) => {
                self.poisoned = true;
                return Err(e.context(format!("Failed to prefetch batch {}", self.steps)));
            }
        };

        let FillLease {
            buffer: mut ready,
            source,
            transform,
        } = lease;
        let batch = ready.snapshot(self.top_count)?;
        ready.release();
        self.last_buffer = Some(ready.id());
        self.epoch = source.epoch();

        let next = self.spare.replace(ready).context("spare buffer missing")?;
        if let Err(e) = self.worker.create(FillLease {
            buffer: next,
            source,
            transform,
        }) {
            self.poisoned = true;
            return Err(e);
        }

        self.steps += 1;
        Ok(batch)
    }

    /// Output names, per-record shapes and arity after the transformer.
    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Names of the outputs returned by `forward`.
    pub fn output_names(&self) -> Vec<&str> {
        self.layout.names().into_iter().take(self.top_count).collect()
    }

    pub fn top_count(&self) -> usize {
        self.top_count
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Buffer id the last batch was copied from.
    pub fn last_buffer(&self) -> Option<usize> {
        self.last_buffer
    }

    /// Source epoch as of the last delivered batch.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

impl<S, T> Drop for DataLayer<S, T>
where
    S: RecordSource + 'static,
    T: RecordTransform + 'static,
{
    fn drop(&mut self) {
        if self.worker.is_running() {
            if let Err(e) = self.worker.join() {
                warn!("prefetch failed while dropping data layer: {:#}", e);
            }
        }
    }
}
