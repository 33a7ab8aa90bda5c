use crate::error::DataLayerError;
use anyhow::Result;
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

/// Derives the seed of an independent RNG stream from the layer's base seed.
///
/// Seed formula: `base_seed + (stream << 32)`. Stream 0 is the record order,
/// stream 1 the transformer, higher streams belong to source internals
/// (e.g. the foreground and background pools of a window source).
pub fn derive_seed(base_seed: u64, stream: u64) -> u64 {
    base_seed.wrapping_add(stream << 32)
}

/// Index order over `0..len` with a cursor that wraps at the end of an epoch.
///
/// Yields indices sequentially `(0, 1, ..., len - 1)` when `shuffle` is false.
/// When `shuffle` is true a fresh permutation is drawn from the owned RNG at
/// construction and at every wrap, so a fixed seed reproduces the same
/// sequence of epochs.
///
/// # Wrap policy
/// The cursor wraps (and reshuffles) right after the last index of an epoch
/// is handed out, before the next index is computed. Between calls
/// `0 <= cursor < len` always holds.
///
/// # Example
/// ```ignore
/// let mut order = EpochOrder::new(3, false, 0)?;
/// let indices: Vec<_> = (0..5).map(|_| order.next_index()).collect();
/// assert_eq!(indices, vec![0, 1, 2, 0, 1]);
/// ```
#[derive(Debug, Clone)]
pub struct EpochOrder {
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    shuffle: bool,
    rng: StdRng,
}

impl EpochOrder {
    pub fn new(len: usize, shuffle: bool, seed: u64) -> Result<Self> {
        if len == 0 {
            return Err(DataLayerError::config("record source is empty").into());
        }
        let mut order = Self {
            order: (0..len).collect(),
            cursor: 0,
            epoch: 0,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        };
        if shuffle {
            order.order.shuffle(&mut order.rng);
        }
        Ok(order)
    }

    /// Returns the next index and advances, wrapping at the end of the epoch.
    pub fn next_index(&mut self) -> usize {
        let index = self.order[self.cursor];
        self.cursor += 1;
        if self.cursor == self.order.len() {
            debug!(epoch = self.epoch, len = self.order.len(), "record order wrapped");
            self.reset_epoch();
        }
        index
    }

    /// Starts a new epoch: cursor back to 0 and, if enabled, a new permutation.
    pub fn reset_epoch(&mut self) {
        self.cursor = 0;
        self.epoch += 1;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    /// Skips a uniformly random number of indices in `[0, max_skip)`.
    /// Returns the number skipped.
    pub fn random_skip(&mut self, max_skip: usize) -> usize {
        if max_skip == 0 {
            return 0;
        }
        let skip = self.rng.random_range(0..max_skip);
        for _ in 0..skip {
            self.next_index();
        }
        skip
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// The RNG that drives shuffling. Sources reuse it for their own per-record
    /// draws so a single seed reproduces the whole stream.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}
