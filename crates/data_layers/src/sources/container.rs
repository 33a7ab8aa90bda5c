use crate::config::DataLayerConfig;
use crate::error::DataLayerError;
use crate::record::Record;
use crate::sources::{derive_seed, Arity, OutputLayout, OutputSpec, RecordSource};
use anyhow::{ensure, Context, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use tch::Tensor;
use tracing::{debug, info, warn};

/// One line of a datum container.
///
/// ```json
/// {"channels": 1, "height": 2, "width": 2, "data": [0, 1, 2, 3], "label": 7}
/// ```
///
/// Pixels go in `data` (bytes) or `float_data`, in `[C, H, W]` order.
#[derive(Debug, Clone, Deserialize)]
pub struct Datum {
    pub channels: i64,
    pub height: i64,
    pub width: i64,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub float_data: Vec<f32>,
    #[serde(default)]
    pub label: i64,
}

impl Datum {
    pub fn shape(&self) -> Vec<i64> {
        vec![self.channels, self.height, self.width]
    }

    pub fn into_record(self) -> Result<Record> {
        let shape = self.shape();
        let expected: i64 = shape.iter().product();
        let payload = if !self.data.is_empty() {
            ensure!(
                self.data.len() as i64 == expected,
                "datum holds {} bytes, shape {:?} needs {}",
                self.data.len(),
                shape,
                expected
            );
            Tensor::from_slice(&self.data)
        } else {
            ensure!(
                self.float_data.len() as i64 == expected,
                "datum holds {} floats, shape {:?} needs {}",
                self.float_data.len(),
                shape,
                expected
            );
            Tensor::from_slice(&self.float_data)
        };
        Ok(Record::new(payload.view(shape.as_slice())).with_field("label", Tensor::from(self.label as f32)))
    }
}

/// Streams datums from a JSON-lines container, front to back, restarting at
/// the first line when the end is reached. Order is fixed; `shuffle` does
/// not apply.
pub struct ContainerSource {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_number: usize,
    total: usize,
    epoch: usize,
    layout: OutputLayout,
}

impl ContainerSource {
    pub fn open(config: &DataLayerConfig, base_seed: u64) -> Result<Self> {
        let path = config.source.clone();
        let (total, first) = scan(&path)?;

        let mut source = Self {
            lines: open_lines(&path)?,
            path,
            line_number: 0,
            total,
            epoch: 0,
            layout: OutputLayout::new(
                vec![OutputSpec::payload(first.shape()), OutputSpec::label()],
                Arity::between(1, 2),
            ),
        };

        let skip = if config.rand_skip > 0 {
            StdRng::seed_from_u64(derive_seed(base_seed, 0)).random_range(0..config.rand_skip)
        } else {
            0
        };
        for _ in 0..skip {
            source.next_line()?;
        }

        info!(source = %source.path.display(), records = total, skipped = skip, "opened datum container");
        Ok(source)
    }

    fn rewind(&mut self) -> Result<()> {
        self.lines = open_lines(&self.path)?;
        self.line_number = 0;
        self.epoch += 1;
        debug!(source = %self.path.display(), epoch = self.epoch, "container rewound");
        Ok(())
    }

    /// Next non-blank line, rewinding at end of file.
    fn next_line(&mut self) -> Result<String> {
        let mut rewound = false;
        loop {
            match self.lines.next() {
                Some(line) => {
                    self.line_number += 1;
                    let text = line.with_context(|| format!("read error at line {}", self.line_number))?;
                    if !text.trim().is_empty() {
                        return Ok(text);
                    }
                }
                None if rewound => {
                    return Err(DataLayerError::record(format!(
                        "{} no longer contains any record",
                        self.path.display()
                    ))
                    .into())
                }
                None => {
                    self.rewind()?;
                    rewound = true;
                }
            }
        }
    }
}

impl RecordSource for ContainerSource {
    fn next(&mut self) -> Result<Record> {
        let text = self.next_line()?;
        let datum: Datum = serde_json::from_str(&text).with_context(|| {
            DataLayerError::record(format!("{}:{}: invalid datum", self.path.display(), self.line_number))
        })?;
        datum.into_record().with_context(|| {
            DataLayerError::record(format!("{}:{}", self.path.display(), self.line_number))
        })
    }

    /// Reopens the container. If that fails the current pass continues and
    /// the epoch is unchanged.
    fn reset_epoch(&mut self) {
        if let Err(err) = self.rewind() {
            warn!(
                source = %self.path.display(),
                epoch = self.epoch,
                "container reset skipped: {:#}",
                err
            );
        }
    }

    fn describe_outputs(&self) -> &OutputLayout {
        &self.layout
    }

    fn len(&self) -> Option<usize> {
        Some(self.total)
    }

    fn epoch(&self) -> usize {
        self.epoch
    }
}

fn open_lines(path: &Path) -> Result<Lines<BufReader<File>>> {
    let file = File::open(path).with_context(|| {
        DataLayerError::config(format!("cannot open datum container {}", path.display()))
    })?;
    Ok(BufReader::new(file).lines())
}

/// Counts records and parses the first one, which fixes the output shape.
fn scan(path: &Path) -> Result<(usize, Datum)> {
    let mut first = None;
    let mut total = 0;
    for (index, line) in open_lines(path)?.enumerate() {
        let text = line.with_context(|| {
            DataLayerError::config(format!("{}: read error at line {}", path.display(), index + 1))
        })?;
        if text.trim().is_empty() {
            continue;
        }
        if first.is_none() {
            let datum: Datum = serde_json::from_str(&text).with_context(|| {
                DataLayerError::config(format!("{}:{}: invalid datum", path.display(), index + 1))
            })?;
            first = Some(datum);
        }
        total += 1;
    }
    let first = first.ok_or_else(|| {
        DataLayerError::config(format!("{} contains no records", path.display()))
    })?;
    Ok((total, first))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn container(lines: &[&str]) -> Result<NamedTempFile> {
        let mut file = NamedTempFile::with_suffix(".jsonl")?;
        for line in lines {
            writeln!(file, "{}", line)?;
        }
        Ok(file)
    }

    fn open(file: &NamedTempFile) -> Result<ContainerSource> {
        let config = DataLayerConfig::builder().source(file.path()).build();
        ContainerSource::open(&config, 0)
    }

    #[test]
    fn test_reads_sequentially_and_wraps() -> Result<()> {
        let file = container(&[
            r#"{"channels": 1, "height": 1, "width": 2, "data": [1, 2], "label": 0}"#,
            "",
            r#"{"channels": 1, "height": 1, "width": 2, "float_data": [0.5, 1.5], "label": 1}"#,
        ])?;
        let mut source = open(&file)?;
        assert_eq!(source.len(), Some(2));
        assert_eq!(source.describe_outputs().outputs[0].shape, vec![1, 1, 2]);

        let labels: Vec<f64> = (0..5)
            .map(|_| Ok(source.next()?.label().context("label")?.double_value(&[])))
            .collect::<Result<_>>()?;
        assert_eq!(labels, vec![0.0, 1.0, 0.0, 1.0, 0.0]);
        assert_eq!(source.epoch(), 2);
        Ok(())
    }

    #[test]
    fn test_malformed_line_is_record_error() -> Result<()> {
        let file = container(&[
            r#"{"channels": 1, "height": 1, "width": 1, "data": [1]}"#,
            r#"{"channels": 1, "height": 2, "width": 2, "data": [1]}"#,
            "not json",
        ])?;
        let mut source = open(&file)?;
        source.next()?;

        let size_mismatch = source.next().err().context("expected error")?;
        assert!(DataLayerError::is_record(&size_mismatch));
        let bad_json = source.next().err().context("expected error")?;
        assert!(DataLayerError::is_record(&bad_json));
        Ok(())
    }

    #[test]
    fn test_failed_reset_keeps_current_pass() -> Result<()> {
        let file = container(&[
            r#"{"channels": 1, "height": 1, "width": 1, "data": [1], "label": 0}"#,
            r#"{"channels": 1, "height": 1, "width": 1, "data": [2], "label": 1}"#,
        ])?;
        let mut source = open(&file)?;
        source.next()?;

        source.reset_epoch();
        assert_eq!(source.epoch(), 1);
        assert_eq!(source.next()?.label().context("label")?.double_value(&[]), 0.0);

        // The open handle still reads after the path is gone.
        file.close()?;
        source.reset_epoch();
        assert_eq!(source.epoch(), 1, "Epoch unchanged when the reopen fails");
        assert_eq!(source.next()?.label().context("label")?.double_value(&[]), 1.0);
        Ok(())
    }

    #[test]
    fn test_empty_container_is_config_error() -> Result<()> {
        let file = container(&["", "  "])?;
        let err = open(&file).err().context("expected error")?;
        assert!(DataLayerError::is_config(&err));
        Ok(())
    }
}
