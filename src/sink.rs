//! Sink abstraction and the console sink.
//!
//! A [`Sink`] is anything the logger fans records out to. Every sink has a
//! name used in [`TransportError`]s, and each operation is attempted
//! independently of the others.

use std::io::{self, Write};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Operation, TransportError};
use crate::record::Record;

/// Destination for log records.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name reported in errors, e.g. `"loki"` or `"console"`.
    fn name(&self) -> &str;

    /// Accept records. May deliver synchronously or buffer them.
    async fn write(&self, records: &[Arc<Record>]) -> Result<(), TransportError>;

    /// Deliver everything accepted so far.
    async fn flush(&self) -> Result<(), TransportError>;

    /// Deliver everything accepted so far and release resources.
    /// Calling it more than once is harmless.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Renders records as text lines:
/// `YYYY-MM-DD HH:MM:SS [LEVEL] message key=value ...`
pub struct ConsoleSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    /// Console sink writing to stdout.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    fn io_error(&self, op: Operation, err: io::Error) -> TransportError {
        TransportError::new(self.name(), op, err)
    }
}

/// Render one record as a console line, without the trailing newline.
pub fn render(record: &Record) -> String {
    let mut line = format!(
        "{} [{}] {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.level.as_str().to_uppercase(),
        record.message
    );

    let mut fields: Vec<_> = record.fields.iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in fields {
        match value {
            serde_json::Value::String(s) => line.push_str(&format!(" {}={}", key, s)),
            other => line.push_str(&format!(" {}={}", key, other)),
        }
    }

    line
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn write(&self, records: &[Arc<Record>]) -> Result<(), TransportError> {
        let mut out = self.out.lock();
        for record in records {
            writeln!(out, "{}", render(record)).map_err(|e| self.io_error(Operation::Write, e))?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.out
            .lock()
            .flush()
            .map_err(|e| self.io_error(Operation::Flush, e))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.out
            .lock()
            .flush()
            .map_err(|e| self.io_error(Operation::Close, e))
    }
}

impl std::fmt::Debug for ConsoleSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleSink").finish_non_exhaustive()
    }
}
