#![allow(dead_code)]

use data_layers::{
    sources::{Arity, OutputLayout, OutputSpec, RecordSource},
    Record,
};

use anyhow::{anyhow, Result};
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tch::Tensor;

/// Tracks how many threads are inside `RecordSource::next` at once.
#[derive(Debug, Default)]
pub struct WriterGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
    served: AtomicUsize,
}

impl WriterGauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

/// Serves `values[i]` as a `[1]` payload with label `i`, in order, wrapping
/// at the end. An index listed in `fail_at` produces an error instead.
pub struct VecSource {
    values: Vec<f32>,
    cursor: usize,
    epoch: usize,
    fail_at: Option<usize>,
    delay: Duration,
    gauge: Arc<WriterGauge>,
    layout: OutputLayout,
}

impl VecSource {
    pub fn new(values: &[f32]) -> Self {
        Self {
            values: values.to_vec(),
            cursor: 0,
            epoch: 0,
            fail_at: None,
            delay: Duration::ZERO,
            gauge: Arc::new(WriterGauge::default()),
            layout: OutputLayout::new(
                vec![OutputSpec::payload(vec![1]), OutputSpec::label()],
                Arity::between(1, 2),
            ),
        }
    }

    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn gauge(&self) -> Arc<WriterGauge> {
        self.gauge.clone()
    }
}

impl RecordSource for VecSource {
    fn next(&mut self) -> Result<Record> {
        let now = self.gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let index = self.cursor;
        self.cursor += 1;
        if self.cursor == self.values.len() {
            self.cursor = 0;
            self.epoch += 1;
        }
        self.gauge.served.fetch_add(1, Ordering::SeqCst);
        self.gauge.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail_at == Some(index) {
            return Err(anyhow!("record {} is malformed", index));
        }
        Ok(Record::new(Tensor::from_slice(&[self.values[index]]))
            .with_field("label", Tensor::from(index as f32)))
    }

    fn reset_epoch(&mut self) {
        self.cursor = 0;
        self.epoch += 1;
    }

    fn describe_outputs(&self) -> &OutputLayout {
        &self.layout
    }

    fn len(&self) -> Option<usize> {
        Some(self.values.len())
    }

    fn epoch(&self) -> usize {
        self.epoch
    }
}

/// Flattens the first column of a `[N, ...]` tensor.
pub fn column(tensor: &Tensor) -> Result<Vec<f32>> {
    let rows = tensor.size()[0];
    let flat = tensor.reshape(&[rows, -1]).select(1, 0).contiguous();
    Ok(Vec::<f32>::try_from(&flat)?)
}

/// Writes a `width x height` RGB image whose red channel is `value`.
pub fn write_rgb(path: &Path, width: u32, height: u32, value: u8) -> Result<()> {
    RgbImage::from_pixel(width, height, Rgb([value, value / 2, 0])).save(path)?;
    Ok(())
}

/// Writes a label map where pixel `(x, y)` is `label(x, y)`.
pub fn write_labels(path: &Path, width: u32, height: u32, label: impl Fn(u32, u32) -> u8) -> Result<()> {
    GrayImage::from_fn(width, height, |x, y| Luma([label(x, y)])).save(path)?;
    Ok(())
}
