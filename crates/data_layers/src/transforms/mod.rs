pub mod core;
pub mod transformer;
pub mod vision;

pub use core::{Chain, Transform};
pub use transformer::{DataTransformer, Passthrough, RecordTransform};
