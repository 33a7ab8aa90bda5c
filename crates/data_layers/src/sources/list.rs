use crate::error::DataLayerError;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One non-blank line of a list file with its 1-based line number.
#[derive(Debug, Clone, PartialEq)]
pub struct ListLine {
    pub number: usize,
    pub text: String,
}

impl ListLine {
    pub fn fields(&self) -> Vec<&str> {
        self.text.split_whitespace().collect()
    }

    /// Builds a configuration error that points at this line.
    pub fn error(&self, path: &Path, message: impl std::fmt::Display) -> anyhow::Error {
        DataLayerError::config(format!("{}:{}: {}", path.display(), self.number, message)).into()
    }
}

/// Reads a list file, skipping blank lines. A missing or unreadable file is
/// a configuration error.
pub fn read_list(path: &Path) -> Result<Vec<ListLine>> {
    let file = File::open(path).with_context(|| {
        DataLayerError::config(format!("cannot open list file {}", path.display()))
    })?;

    let mut lines = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let text = line.with_context(|| {
            DataLayerError::config(format!("{}: read error at line {}", path.display(), index + 1))
        })?;
        if text.trim().is_empty() {
            continue;
        }
        lines.push(ListLine {
            number: index + 1,
            text: text.trim().to_string(),
        });
    }
    Ok(lines)
}

/// Joins a path read from a list onto the configured root folder.
pub fn resolve(root: &Path, relative: &str) -> PathBuf {
    root.join(relative)
}

/// Parses one whitespace-separated field of a list line.
pub fn parse_field<T: std::str::FromStr>(line: &ListLine, path: &Path, value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| line.error(path, format!("invalid {} '{}'", what, value)))
}

/// Lazily filled, per-index cache of decoded payloads.
///
/// Disabled caches call `load` every time. Enabled caches call it once per
/// key and afterwards return a clone of the stored value, so `V` should be
/// cheap to clone (`Arc`, shallow-cloned tensors).
#[derive(Debug)]
pub struct DecodeCache<V> {
    enabled: bool,
    entries: HashMap<usize, V>,
}

impl<V: Clone> DecodeCache<V> {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: HashMap::new(),
        }
    }

    pub fn fetch(&mut self, key: usize, load: impl FnOnce() -> Result<V>) -> Result<V> {
        if !self.enabled {
            return load();
        }
        if let Some(value) = self.entries.get(&key) {
            return Ok(value.clone());
        }
        let value = load()?;
        self.entries.insert(key, value.clone());
        debug!(key, cached = self.entries.len(), "decode cache filled");
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
