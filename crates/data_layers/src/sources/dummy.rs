use crate::config::{DataLayerConfig, DummyOutput, Filler};
use crate::error::DataLayerError;
use crate::record::{FieldKind, Record};
use crate::sources::{derive_seed, Arity, OutputLayout, OutputSpec, RecordSource};
use anyhow::{ensure, Result};
use rand::distr::Uniform;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tch::Tensor;

enum Generator {
    Constant(f32),
    Uniform(Uniform<f32>),
    Gaussian(Normal<f32>),
}

impl Generator {
    fn new(filler: &Filler) -> Result<Self> {
        Ok(match *filler {
            Filler::Constant { value } => Self::Constant(value),
            Filler::Uniform { min, max } => Self::Uniform(
                Uniform::new_inclusive(min, max)
                    .map_err(|e| DataLayerError::config(format!("uniform filler [{}, {}]: {}", min, max, e)))?,
            ),
            Filler::Gaussian { mean, std } => Self::Gaussian(
                Normal::new(mean, std)
                    .map_err(|e| DataLayerError::config(format!("gaussian filler std {}: {}", std, e)))?,
            ),
        })
    }

    fn generate(&self, shape: &[i64], rng: &mut StdRng) -> Tensor {
        let numel: i64 = shape.iter().product();
        let values: Vec<f32> = match self {
            Self::Constant(value) => vec![*value; numel as usize],
            Self::Uniform(dist) => (0..numel).map(|_| dist.sample(&mut *rng)).collect(),
            Self::Gaussian(dist) => (0..numel).map(|_| dist.sample(&mut *rng)).collect(),
        };
        Tensor::from_slice(&values).view(shape)
    }
}

struct DummySlot {
    spec: DummyOutput,
    generator: Generator,
    refill: bool,
    cached: Option<Tensor>,
}

/// Generates records from fillers, for benchmarking and smoke tests.
///
/// Constant fillers are generated once and reused; random fillers are
/// regenerated for every record unless `refill` is set to false.
pub struct DummySource {
    slots: Vec<DummySlot>,
    rng: StdRng,
    layout: OutputLayout,
}

impl DummySource {
    pub fn open(config: &DataLayerConfig, base_seed: u64) -> Result<Self> {
        Self::new(&config.dummy, base_seed)
    }

    pub fn new(outputs: &[DummyOutput], base_seed: u64) -> Result<Self> {
        if outputs.is_empty() {
            return Err(DataLayerError::config("dummy source needs at least one output").into());
        }

        let mut specs = Vec::with_capacity(outputs.len());
        let mut slots = Vec::with_capacity(outputs.len());
        for (index, output) in outputs.iter().enumerate() {
            ensure!(
                output.shape.iter().all(|&d| d > 0),
                DataLayerError::config(format!(
                    "dummy output '{}' has invalid shape {:?}",
                    output.name, output.shape
                ))
            );
            let kind = if index == 0 {
                FieldKind::Payload
            } else {
                FieldKind::Plain
            };
            specs.push(OutputSpec {
                name: output.name.clone(),
                shape: output.shape.clone(),
                kind,
            });

            let refill = output
                .refill
                .unwrap_or(!matches!(output.filler, Filler::Constant { .. }));
            slots.push(DummySlot {
                spec: output.clone(),
                generator: Generator::new(&output.filler)?,
                refill,
                cached: None,
            });
        }

        Ok(Self {
            slots,
            rng: StdRng::seed_from_u64(derive_seed(base_seed, 0)),
            layout: OutputLayout::new(specs, Arity::at_least(1)),
        })
    }

    fn produce(&mut self, index: usize) -> Tensor {
        let slot = &mut self.slots[index];
        if !slot.refill {
            if let Some(cached) = &slot.cached {
                return cached.shallow_clone();
            }
        }
        let tensor = slot.generator.generate(&slot.spec.shape, &mut self.rng);
        if !slot.refill {
            slot.cached = Some(tensor.shallow_clone());
        }
        tensor
    }
}

impl RecordSource for DummySource {
    fn next(&mut self) -> Result<Record> {
        let mut record = Record::new(self.produce(0));
        for index in 1..self.slots.len() {
            let value = self.produce(index);
            record = record.with_field(self.slots[index].spec.name.clone(), value);
        }
        Ok(record)
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

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use tch::Kind;

    fn output(name: &str, shape: &[i64], filler: Filler) -> DummyOutput {
        DummyOutput {
            name: name.into(),
            shape: shape.to_vec(),
            filler,
            refill: None,
        }
    }

    #[test]
    fn test_constant_and_random_fillers() -> Result<()> {
        let mut source = DummySource::new(
            &[
                output("data", &[2, 3], Filler::Uniform { min: -1.0, max: 1.0 }),
                output("label", &[1], Filler::Constant { value: 4.0 }),
            ],
            9,
        )?;
        assert_eq!(source.describe_outputs().names(), vec!["data", "label"]);

        let first = source.next()?;
        let second = source.next()?;
        assert_eq!(first.payload.size(), vec![2, 3]);
        assert!(!first.payload.equal(&second.payload), "Random filler is refilled");

        let max = first.payload.abs().max().double_value(&[]);
        assert!(max <= 1.0);

        let label = second.get("label")?;
        assert_eq!(label.double_value(&[0]), 4.0);
        assert_eq!(label.data_ptr(), first.get("label")?.data_ptr(), "Constant is reused");
        Ok(())
    }

    #[test]
    fn test_gaussian_without_refill_is_frozen() -> Result<()> {
        let mut frozen = output("data", &[16], Filler::Gaussian { mean: 0.0, std: 1.0 });
        frozen.refill = Some(false);
        let mut source = DummySource::new(&[frozen], 1)?;

        let a = source.next()?.payload;
        let b = source.next()?.payload;
        assert!(a.equal(&b));
        assert_eq!(a.kind(), Kind::Float);
        Ok(())
    }

    #[test]
    fn test_invalid_fillers_are_config_errors() -> Result<()> {
        let err = DummySource::new(&[], 0).err().context("no outputs")?;
        assert!(DataLayerError::is_config(&err));

        let bad_std = output("data", &[1], Filler::Gaussian { mean: 0.0, std: -1.0 });
        let err = DummySource::new(&[bad_std], 0).err().context("negative std")?;
        assert!(DataLayerError::is_config(&err));

        let bad_shape = output("data", &[0, 2], Filler::Constant { value: 0.0 });
        let err = DummySource::new(&[bad_shape], 0).err().context("empty shape")?;
        assert!(DataLayerError::is_config(&err));
        Ok(())
    }
}
