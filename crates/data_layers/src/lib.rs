pub mod batch;
pub mod config;
pub mod error;
pub mod layer;
pub mod prefetch;
pub mod record;
pub mod sources;
pub mod transforms;

pub use batch::{Batch, BatchBuffer, BufferState};
pub use config::{CropMode, DataLayerConfig, DummyOutput, Filler, Phase, SourceKind, TransformConfig, WindowConfig};
pub use error::DataLayerError;
pub use layer::{DataLayer, MemoryDataLayer};
pub use prefetch::{FillLease, PrefetchWorker, WorkerState};
pub use record::{Field, FieldKind, Record};
pub use sources::{AnySource, Arity, OutputLayout, OutputSpec, RecordSource};
pub use transforms::{DataTransformer, Passthrough, RecordTransform};
