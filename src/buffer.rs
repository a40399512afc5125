//! Buffer module for accumulating records between flushes.
//!
//! The buffer and its lifecycle state share one mutex. A flush swaps the
//! pending records out for a fresh vector and releases the lock before any
//! network I/O happens, so writers never wait on a slow push.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::record::Record;

/// Lifecycle of a shipping transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting writes
    Running,
    /// Shutdown requested; the background flusher is doing its final flush
    Draining,
    /// The background flusher has exited
    Stopped,
}

/// What triggered a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The buffer reached the batch size
    Size,
    /// The flush interval elapsed
    Interval,
    /// Final flush during shutdown
    Shutdown,
    /// Explicit flush request
    Manual,
}

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Total number of records accepted
    pub records_received: u64,

    /// Total number of records handed off for delivery
    pub records_flushed: u64,

    /// Number of flushes triggered by the batch size
    pub size_flushes: u64,

    /// Number of flushes triggered by the flush interval
    pub interval_flushes: u64,

    /// Number of shutdown flushes that found records
    pub shutdown_flushes: u64,

    /// Number of explicit flushes that found records
    pub manual_flushes: u64,
}

/// Errors that can occur during buffer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// The buffer is draining or stopped and no longer accepts records
    #[error("buffer has been closed")]
    Closed,
}

struct State {
    records: Vec<Arc<Record>>,
    lifecycle: Lifecycle,
    stats: BufferStats,
}

/// Mutex-guarded batch of pending records.
pub struct BatchBuffer {
    state: Mutex<State>,
    batch_size: usize,
}

impl BatchBuffer {
    /// Create a running buffer that reports full at `batch_size` records.
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            state: Mutex::new(State {
                records: Vec::with_capacity(batch_size),
                lifecycle: Lifecycle::Running,
                stats: BufferStats::default(),
            }),
            batch_size,
        }
    }

    /// Append records in order. Returns whether the buffer is now full.
    pub fn push(
        &self,
        records: impl IntoIterator<Item = Arc<Record>>,
    ) -> Result<bool, BufferError> {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Running {
            return Err(BufferError::Closed);
        }

        let before = state.records.len();
        state.records.extend(records);
        state.stats.records_received += (state.records.len() - before) as u64;

        Ok(state.records.len() >= self.batch_size)
    }

    /// Swap out all pending records, or `None` if there are none.
    ///
    /// The returned vector is never touched by the buffer again.
    pub fn take(&self, trigger: FlushTrigger) -> Option<Vec<Arc<Record>>> {
        let mut state = self.state.lock();
        if state.records.is_empty() {
            return None;
        }

        let batch = std::mem::replace(&mut state.records, Vec::with_capacity(self.batch_size));
        state.stats.records_flushed += batch.len() as u64;
        match trigger {
            FlushTrigger::Size => state.stats.size_flushes += 1,
            FlushTrigger::Interval => state.stats.interval_flushes += 1,
            FlushTrigger::Shutdown => state.stats.shutdown_flushes += 1,
            FlushTrigger::Manual => state.stats.manual_flushes += 1,
        }

        Some(batch)
    }

    /// Move from `Running` to `Draining`. Returns `false` if shutdown had
    /// already begun.
    pub fn begin_drain(&self) -> bool {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Running {
            state.lifecycle = Lifecycle::Draining;
            true
        } else {
            false
        }
    }

    /// Mark the background flusher as exited.
    pub fn mark_stopped(&self) {
        self.state.lock().lifecycle = Lifecycle::Stopped;
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    /// Number of pending records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn stats(&self) -> BufferStats {
        self.state.lock().stats.clone()
    }
}
