//! src/prefetch.rs
//!
//! The single background fill of a data layer.
//!
//! ```text
//!   layer                     worker thread
//!   ─────                     ─────────────
//!   create(lease) ──move──►   buffer.fill(source, transform)
//!        ...                  done_tx.send(())
//!   join() ◄──────move─────   lease
//! ```
//!
//! The lease (buffer, source, transformer) is moved into the thread and moved
//! back out by `join`, so at most one thread can touch the source at a time
//! without any lock.

use crate::batch::BatchBuffer;
use crate::error::DataLayerError;
use crate::sources::RecordSource;
use crate::transforms::RecordTransform;
use anyhow::{anyhow, ensure, Context, Result};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Exclusive access to everything one fill needs.
pub struct FillLease<S, T> {
    pub buffer: BatchBuffer,
    pub source: S,
    pub transform: T,
}

/// Where a [`PrefetchWorker`] is in its fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Done,
}

type FillOutcome<S, T> = (FillLease<S, T>, Result<()>);

/// Runs one [`BatchBuffer::fill`] on a named background thread.
///
/// `create` never blocks; `join` is the only blocking call. A worker can be
/// reused once joined.
pub struct PrefetchWorker<S, T> {
    name: String,
    handle: Option<JoinHandle<FillOutcome<S, T>>>,
    done_rx: Option<Receiver<()>>,
    finished: bool,
    fills: usize,
}

impl<S, T> PrefetchWorker<S, T>
where
    S: RecordSource + 'static,
    T: RecordTransform + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: None,
            done_rx: None,
            finished: false,
            fills: 0,
        }
    }

    pub fn state(&mut self) -> WorkerState {
        if self.handle.is_none() {
            return WorkerState::Idle;
        }
        if !self.finished {
            if let Some(rx) = &self.done_rx {
                // A disconnected channel means the thread ended without
                // signalling, i.e. it panicked.
                self.finished = !matches!(rx.try_recv(), Err(TryRecvError::Empty));
            }
        }
        if self.finished {
            WorkerState::Done
        } else {
            WorkerState::Running
        }
    }

    /// Starts filling `lease.buffer` in the background.
    ///
    /// Starting a worker that has not been joined is a usage error.
    pub fn create(&mut self, lease: FillLease<S, T>) -> Result<()> {
        ensure!(
            self.handle.is_none(),
            "prefetch worker '{}' is already running",
            self.name
        );

        let (done_tx, done_rx) = bounded(1);
        let thread_name = format!("{}-fill-{}", self.name, self.fills);
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut lease = lease;
                let FillLease {
                    buffer,
                    source,
                    transform,
                } = &mut lease;
                let result = buffer.fill(source, transform);
                let _ = done_tx.send(());
                (lease, result)
            })
            .with_context(|| format!("Failed to spawn prefetch thread {}", thread_name))?;

        debug!(worker = %thread_name, "prefetch started");
        self.handle = Some(handle);
        self.done_rx = Some(done_rx);
        self.finished = false;
        self.fills += 1;
        Ok(())
    }

    /// Blocks until the fill ends and hands the lease back.
    ///
    /// A failed fill or a panicking thread loses the lease: the source is
    /// dropped with the error and the caller can no longer produce batches.
    pub fn join(&mut self) -> Result<FillLease<S, T>> {
        let handle = self
            .handle
            .take()
            .with_context(|| format!("prefetch worker '{}' is not running", self.name))?;
        self.done_rx = None;
        self.finished = false;

        let (lease, result) = handle.join().map_err(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            anyhow!(DataLayerError::record(format!(
                "prefetch thread panicked: {}",
                message
            )))
        })?;
        result?;

        debug!(worker = %self.name, buffer = lease.buffer.id(), "prefetch joined");
        Ok(lease)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}
