//! src/layer/mod.rs
//!
//! Data layers: the objects a training loop calls once per step.
//!
//! # Architecture Overview
//!
//! ```text
//!        ┌──────────────────┐
//!        │ DataLayerConfig  │
//!        └────────┬─────────┘
//!                 │ setup()
//!                 ↓
//!   ┌───────────────────────────┐        ┌────────────────────────┐
//!   │ AnySource (RecordSource)  │──────► │ DataTransformer        │
//!   └───────────────────────────┘        └───────────┬────────────┘
//!                 │   leased to the worker for one fill  │
//!                 ↓                                      ↓
//!        ┌──────────────────┐   fill()   ┌─────────────────────────┐
//!        │  PrefetchWorker  │──────────► │ BatchBuffer A / B       │
//!        └──────────────────┘            └───────────┬─────────────┘
//!                                                    │ snapshot()
//!                                                    ↓
//!                                              ┌──────────┐
//!                                              │  Batch   │
//!                                              └──────────┘
//! ```
//!
//! ```text
//! src/layer/
//! ├── mod.rs          # Module docs and exports
//! ├── prefetching.rs  # DataLayer: setup, forward, double buffering
//! └── memory.rs       # MemoryDataLayer: synchronous, over caller memory
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! let config = DataLayerConfig::builder()
//!     .variant(SourceKind::ImageList)
//!     .source("train.txt")
//!     .root_folder("images/")
//!     .batch_size(32)
//!     .crop_size(227)
//!     .mirror(true)
//!     .shuffle(true)
//!     .seed(42)
//!     .build();
//!
//! let mut layer = DataLayer::setup(&config)?;
//! for _ in 0..steps {
//!     let batch = layer.forward()?;
//!     let images = batch.data();          // [32, 3, 227, 227]
//!     let labels = batch.get("label");    // [32]
//! }
//! ```

pub mod memory;
pub mod prefetching;

pub use memory::MemoryDataLayer;
pub use prefetching::DataLayer;
