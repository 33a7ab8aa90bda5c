//! src/sources/mod.rs
//!
//! Record sources: everything that produces one `Record` at a time for the
//! prefetch worker.
//!
//! ```text
//! sources/
//! ├── order.rs         → EpochOrder (cursor, wrap, reshuffle), derive_seed
//! ├── layout.rs        → OutputSpec, OutputLayout, Arity
//! ├── list.rs          → list-file parsing helpers, DecodeCache
//! ├── container.rs     → ContainerSource (JSON-lines datums)
//! ├── image_list.rs    → ImageListSource (`path label`)
//! ├── window.rs        → WindowSource (fg/bg balanced window sampling)
//! ├── array_file.rs    → ArrayFileSource (list of .safetensors files)
//! ├── dummy.rs         → DummySource (filler generated)
//! ├── memory.rs        → ArraySource (caller-owned arrays)
//! └── segmentation.rs  → SegmentationSource (seven `img seg ...` variants)
//! ```
//!
//! A layer owns exactly one source. While a batch is being prefetched the
//! source is moved into the worker thread, so sources only need `Send`.

pub mod array_file;
pub mod container;
pub mod dummy;
pub mod image_list;
pub mod layout;
pub mod list;
pub mod memory;
pub mod order;
pub mod segmentation;
pub mod window;

pub use array_file::ArrayFileSource;
pub use container::{ContainerSource, Datum};
pub use dummy::DummySource;
pub use image_list::ImageListSource;
pub use layout::{Arity, OutputLayout, OutputSpec};
pub use memory::ArraySource;
pub use order::{derive_seed, EpochOrder};
pub use segmentation::SegmentationSource;
pub use window::{WindowFile, WindowRecord, WindowSource};

use crate::config::{DataLayerConfig, SourceKind};
use crate::record::Record;
use anyhow::Result;

/// A producer of records with a fixed output layout.
///
/// `next` never signals exhaustion: finite sources wrap around to the
/// beginning (reshuffling if configured) and bump their epoch counter.
pub trait RecordSource: Send {
    /// Produces the next record, advancing the cursor.
    fn next(&mut self) -> Result<Record>;

    /// Ends the current pass early; the next record starts a new epoch.
    fn reset_epoch(&mut self);

    /// Names, per-record shapes and accepted output counts.
    fn describe_outputs(&self) -> &OutputLayout;

    /// Number of distinct records, if known.
    fn len(&self) -> Option<usize>;

    /// Completed passes over the records.
    fn epoch(&self) -> usize;
}

impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    fn next(&mut self) -> Result<Record> {
        (**self).next()
    }

    fn reset_epoch(&mut self) {
        (**self).reset_epoch()
    }

    fn describe_outputs(&self) -> &OutputLayout {
        (**self).describe_outputs()
    }

    fn len(&self) -> Option<usize> {
        (**self).len()
    }

    fn epoch(&self) -> usize {
        (**self).epoch()
    }
}

/// Every built-in source behind one concrete type, so a configured layer
/// does not need dynamic dispatch.
pub enum AnySource {
    Container(ContainerSource),
    ImageList(ImageListSource),
    Window(WindowSource),
    ArrayFile(ArrayFileSource),
    Dummy(DummySource),
    Memory(ArraySource),
    Segmentation(SegmentationSource),
}

impl AnySource {
    /// Opens the source selected by `config.variant`.
    pub fn open(config: &DataLayerConfig, base_seed: u64) -> Result<Self> {
        Ok(match config.variant {
            SourceKind::Container => Self::Container(ContainerSource::open(config, base_seed)?),
            SourceKind::ImageList => Self::ImageList(ImageListSource::open(config, base_seed)?),
            SourceKind::Window => Self::Window(WindowSource::open(config, base_seed)?),
            SourceKind::ArrayFile => Self::ArrayFile(ArrayFileSource::open(config, base_seed)?),
            SourceKind::Dummy => Self::Dummy(DummySource::open(config, base_seed)?),
            SourceKind::ImageSeg
            | SourceKind::WindowSeg
            | SourceKind::WindowSegBinary
            | SourceKind::SegBinaryCtrl
            | SourceKind::SelectSegBinary
            | SourceKind::WindowCls
            | SourceKind::WindowInstSeg => {
                Self::Segmentation(SegmentationSource::open(config, base_seed)?)
            }
        })
    }

    fn inner(&self) -> &dyn RecordSource {
        match self {
            Self::Container(s) => s,
            Self::ImageList(s) => s,
            Self::Window(s) => s,
            Self::ArrayFile(s) => s,
            Self::Dummy(s) => s,
            Self::Memory(s) => s,
            Self::Segmentation(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn RecordSource {
        match self {
            Self::Container(s) => s,
            Self::ImageList(s) => s,
            Self::Window(s) => s,
            Self::ArrayFile(s) => s,
            Self::Dummy(s) => s,
            Self::Memory(s) => s,
            Self::Segmentation(s) => s,
        }
    }
}

impl RecordSource for AnySource {
    fn next(&mut self) -> Result<Record> {
        self.inner_mut().next()
    }

    fn reset_epoch(&mut self) {
        self.inner_mut().reset_epoch()
    }

    fn describe_outputs(&self) -> &OutputLayout {
        self.inner().describe_outputs()
    }

    fn len(&self) -> Option<usize> {
        self.inner().len()
    }

    fn epoch(&self) -> usize {
        self.inner().epoch()
    }
}

impl From<ArraySource> for AnySource {
    fn from(source: ArraySource) -> Self {
        Self::Memory(source)
    }
}
