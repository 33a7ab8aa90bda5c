use anyhow::{anyhow, Result};
use std::collections::HashMap;
use tch::Tensor;

/// How a field of a [`Record`] is treated when the record is transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// The primary payload (image or feature vector).
    Payload,
    /// A `[C, H, W]` map aligned with the payload pixels (e.g. a segmentation
    /// mask). Follows the payload's crop and mirror, but not its mean/scale.
    Spatial,
    /// Copied into its output row untouched (class id, control vector, dims).
    Plain,
}

/// A named auxiliary value of a [`Record`].
#[derive(Debug)]
pub struct Field {
    pub value: Tensor,
    pub kind: FieldKind,
}

/// The `Record` struct represents a single training example produced by a
/// record source.
///
/// It holds one payload tensor plus any number of named auxiliary fields.
/// Which fields exist is decided by the source that produced the record:
///
/// - Image list: `{"label": []}`
/// - Window sampler: `{"label": [], "window": [4], "overlap": []}`
/// - Segmentation: `{"label": [1, H, W], "dim": [2]}`
///
/// A record is never mutated after it leaves its source; transforms consume
/// it and build a new one.
#[derive(Debug)]
pub struct Record {
    pub payload: Tensor,
    pub fields: HashMap<String, Field>,
}

/// Creates a shallow clone of the `Record`
impl Clone for Record {
    fn clone(&self) -> Self {
        let fields = self
            .fields
            .iter()
            .map(|(name, field)| {
                (
                    name.clone(),
                    Field {
                        value: field.value.shallow_clone(),
                        kind: field.kind,
                    },
                )
            })
            .collect();
        Self {
            payload: self.payload.shallow_clone(),
            fields,
        }
    }
}

impl Record {
    /// Creates a record carrying only a payload.
    ///
    /// Chain with [`with_field`](Self::with_field) to add auxiliary values.
    pub fn new(payload: Tensor) -> Self {
        Self {
            payload,
            fields: HashMap::new(),
        }
    }

    /// Adds or overwrites a plain field.
    pub fn with_field(self, name: impl Into<String>, value: Tensor) -> Self {
        self.with_kind(name, value, FieldKind::Plain)
    }

    /// Adds or overwrites a field that is spatially aligned with the payload.
    pub fn with_spatial_field(self, name: impl Into<String>, value: Tensor) -> Self {
        self.with_kind(name, value, FieldKind::Spatial)
    }

    pub fn with_kind(mut self, name: impl Into<String>, value: Tensor, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), Field { value, kind });
        self
    }

    /// Returns a reference to a field value by name. `"data"` names the payload.
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        if name == "data" {
            return Ok(&self.payload);
        }
        self.fields
            .get(name)
            .map(|field| &field.value)
            .ok_or_else(|| anyhow!("Field '{}' not found in record", name))
    }

    /// Returns the `"label"` field, if the source produced one.
    pub fn label(&self) -> Option<&Tensor> {
        self.fields.get("label").map(|field| &field.value)
    }

    /// Returns an iterator over all auxiliary field names.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod record_test {
    use super::*;
    use anyhow::Result;
    use tch::{Device, Kind, Tensor};

    fn make_record(value: i64) -> Record {
        Record::new(Tensor::from_slice(&[value as f32, 0.0, 1.0]))
            .with_field("label", Tensor::from((value % 2) as f32))
            .with_spatial_field("mask", Tensor::ones(&[1, 2, 2], (Kind::Float, Device::Cpu)))
    }

    #[test]
    fn test_record_basic_construction() -> Result<()> {
        let record = make_record(7);

        assert_eq!(record.get("data")?.double_value(&[0]), 7.0);
        assert_eq!(record.label().map(|l| l.double_value(&[])), Some(1.0));
        assert_eq!(record.fields["mask"].kind, FieldKind::Spatial);
        assert_eq!(record.fields["label"].kind, FieldKind::Plain);
        assert!(record.get("missing").is_err());

        let names: Vec<_> = record.field_names().collect();
        assert_eq!(names.len(), 2);
        Ok(())
    }

    #[test]
    fn test_record_clone_shares_storage() {
        let record = make_record(3);
        let copy = record.clone();
        assert_eq!(copy.payload.data_ptr(), record.payload.data_ptr());
        assert_eq!(copy.fields["mask"].kind, FieldKind::Spatial);
    }
}
