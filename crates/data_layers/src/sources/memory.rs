use crate::error::DataLayerError;
use crate::record::Record;
use crate::sources::{derive_seed, Arity, EpochOrder, OutputLayout, OutputSpec, RecordSource};
use anyhow::{Context, Result};
use tch::Tensor;

/// Serves records from arrays owned by the source.
///
/// `data` holds `N` records of `record_shape` back to back, `labels` holds
/// one value per record. Used by applications that already have their data
/// in memory and still want prefetching.
#[derive(Debug)]
pub struct ArraySource {
    data: Tensor,
    labels: Tensor,
    order: EpochOrder,
    layout: OutputLayout,
}

impl ArraySource {
    pub fn new(
        data: Vec<f32>,
        labels: Vec<f32>,
        record_shape: &[i64],
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        let per_record: i64 = record_shape.iter().product();
        let count = labels.len();
        if per_record <= 0 || data.len() as i64 != per_record * count as i64 {
            return Err(DataLayerError::config(format!(
                "{} values do not make {} records of shape {:?}",
                data.len(),
                count,
                record_shape
            ))
            .into());
        }

        let mut full_shape = vec![count as i64];
        full_shape.extend_from_slice(record_shape);
        let order = EpochOrder::new(count, shuffle, derive_seed(seed, 0))
            .context("in-memory source has no records")?;

        Ok(Self {
            data: Tensor::from_slice(&data).view(full_shape.as_slice()),
            labels: Tensor::from_slice(&labels),
            order,
            layout: OutputLayout::new(
                vec![OutputSpec::payload(record_shape.to_vec()), OutputSpec::label()],
                Arity::exact(2),
            ),
        })
    }
}

impl RecordSource for ArraySource {
    fn next(&mut self) -> Result<Record> {
        let index = self.order.next_index() as i64;
        Ok(Record::new(self.data.get(index)).with_field("label", self.labels.get(index)))
    }

    fn reset_epoch(&mut self) {
        self.order.reset_epoch();
    }

    fn describe_outputs(&self) -> &OutputLayout {
        &self.layout
    }

    fn len(&self) -> Option<usize> {
        Some(self.order.len())
    }

    fn epoch(&self) -> usize {
        self.order.epoch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serves_rows_in_order() -> Result<()> {
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let mut source = ArraySource::new(data, vec![0.0, 1.0, 2.0], &[2, 2], false, 0)?;

        assert_eq!(source.describe_outputs().outputs[0].shape, vec![2, 2]);
        let record = source.next()?;
        assert_eq!(record.payload.size(), vec![2, 2]);
        assert_eq!(record.payload.double_value(&[1, 1]), 3.0);

        source.next()?;
        let third = source.next()?;
        assert_eq!(third.label().map(|l| l.double_value(&[])), Some(2.0));
        assert_eq!(source.epoch(), 1);
        Ok(())
    }

    #[test]
    fn test_rejects_inconsistent_arrays() {
        let err = ArraySource::new(vec![0.0; 5], vec![0.0, 1.0], &[2], false, 0).unwrap_err();
        assert!(DataLayerError::is_config(&err));

        let err = ArraySource::new(Vec::new(), Vec::new(), &[2], false, 0).unwrap_err();
        assert!(DataLayerError::is_config(&err));
    }
}
