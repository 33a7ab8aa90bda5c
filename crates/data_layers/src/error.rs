//! Error categories for data layers.
//!
//! Every fallible call in this crate returns `anyhow::Result`. The variants
//! below are attached to those errors (directly or as context) so that callers
//! can tell which category a failure belongs to:
//!
//! ```ignore
//! match layer.forward() {
//!     Err(e) if DataLayerError::is_record(&e) => { /* abort the run */ }
//!     ...
//! }
//! ```

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataLayerError {
    // ========== Setup ==========
    /// The layer cannot be constructed: empty source, unreadable list file,
    /// no usable windows, inconsistent options.
    #[error("invalid data layer configuration: {message}")]
    Config { message: String },

    // ========== Fill ==========
    /// A record could not be read, decoded or written into its batch row.
    /// Aborts the batch being filled.
    #[error("malformed record: {message}")]
    Record { message: String },

    /// A previous fill failed; the layer no longer owns a source.
    #[error("data layer is unusable after a failed prefetch")]
    Poisoned,
}

impl DataLayerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn record(message: impl Into<String>) -> Self {
        Self::Record {
            message: message.into(),
        }
    }

    /// True if `error` (or any context attached to it) is a configuration error.
    pub fn is_config(error: &anyhow::Error) -> bool {
        matches!(error.downcast_ref::<Self>(), Some(Self::Config { .. }))
    }

    /// True if `error` (or any context attached to it) is a record error.
    pub fn is_record(error: &anyhow::Error) -> bool {
        matches!(error.downcast_ref::<Self>(), Some(Self::Record { .. }))
    }
}
