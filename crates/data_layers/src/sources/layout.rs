use crate::error::DataLayerError;
use crate::record::FieldKind;
use anyhow::Result;

/// One output tensor of a layer, described per record (no batch dimension).
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    pub shape: Vec<i64>,
    pub kind: FieldKind,
}

impl OutputSpec {
    pub fn payload(shape: Vec<i64>) -> Self {
        Self {
            name: "data".to_string(),
            shape,
            kind: FieldKind::Payload,
        }
    }

    pub fn plain(name: impl Into<String>, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            shape,
            kind: FieldKind::Plain,
        }
    }

    pub fn spatial(name: impl Into<String>, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            shape,
            kind: FieldKind::Spatial,
        }
    }

    /// Scalar label output.
    pub fn label() -> Self {
        Self::plain("label", Vec::new())
    }

    /// Number of scalars in one record's slice of this output.
    pub fn numel(&self) -> i64 {
        self.shape.iter().product()
    }
}

/// How many outputs a caller may request from a source.
///
/// - exact: `min == max`
/// - bounded: `min..=max`
/// - open: `max == None`
///
/// With `auto` set, any count from 1 up to the full list is accepted and
/// the outputs past the requested count are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: Option<usize>,
    pub auto: bool,
}

impl Arity {
    pub fn exact(count: usize) -> Self {
        Self {
            min: count,
            max: Some(count),
            auto: false,
        }
    }

    pub fn between(min: usize, max: usize) -> Self {
        Self {
            min,
            max: Some(max),
            auto: false,
        }
    }

    pub fn at_least(min: usize) -> Self {
        Self {
            min,
            max: None,
            auto: false,
        }
    }

    pub fn with_auto(mut self) -> Self {
        self.auto = true;
        self
    }
}

/// Ordered outputs of a source plus the arity it accepts.
///
/// `outputs[0]` is always the `"data"` payload; auxiliary outputs follow in
/// the variant's fixed order.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLayout {
    pub outputs: Vec<OutputSpec>,
    pub arity: Arity,
}

impl OutputLayout {
    pub fn new(outputs: Vec<OutputSpec>, arity: Arity) -> Self {
        Self { outputs, arity }
    }

    /// Validates the number of outputs a caller asked for and returns how
    /// many outputs the layer will hand out per batch.
    ///
    /// `None` means "everything the source produces".
    pub fn resolve(&self, requested: Option<usize>) -> Result<usize> {
        let available = self.outputs.len();
        let Some(count) = requested else {
            return Ok(available);
        };

        let max = self.arity.max.unwrap_or(available).min(available);
        let min = if self.arity.auto { 1 } else { self.arity.min };
        if count < min || count > max {
            return Err(DataLayerError::config(format!(
                "requested {} outputs, source accepts {}..={} ({})",
                count,
                min,
                max,
                self.names().join(", ")
            ))
            .into());
        }
        Ok(count)
    }

    pub fn names(&self) -> Vec<&str> {
        self.outputs.iter().map(|o| o.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|o| o.name == name)
    }
}
