//! Shipping transport: batch buffer, background flusher and push client.
//!
//! Records written to a [`LokiTransport`] are buffered and pushed when the
//! batch fills up, when the flush interval elapses, on an explicit flush,
//! and once more during shutdown. The background flusher is a tokio task
//! with two one-shot signals, both [`CancellationToken`]s: one asking it to
//! stop and one it fires after its final flush, which every closer awaits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffer::{BatchBuffer, BufferStats, FlushTrigger, Lifecycle};
use crate::client::{ClientError, LokiClient};
use crate::config::{Config, ErrorHandler};
use crate::error::{Cause, Operation, TransportError};
use crate::record::Record;
use crate::sink::Sink;

/// Name reported for this transport in errors.
pub const TRANSPORT_NAME: &str = "loki";

/// Batching and shutdown settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Number of records that triggers an immediate flush
    pub batch_size: usize,

    /// Period of the background flush
    pub flush_interval: Duration,

    /// Deadline for one flush, retries included
    pub flush_timeout: Duration,

    /// How long `close` waits for the background flusher
    pub shutdown_timeout: Duration,
}

impl From<&Config> for TransportConfig {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            flush_timeout: config.flush_timeout,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// State shared between the transport handle and its background flusher.
struct Inner {
    client: LokiClient,
    buffer: BatchBuffer,
    flush_timeout: Duration,
    on_error: ErrorHandler,
}

impl Inner {
    /// Swap out the buffer and push it. The buffer lock is released before
    /// any network I/O.
    async fn flush(
        &self,
        trigger: FlushTrigger,
        op: Operation,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let Some(batch) = self.buffer.take(trigger) else {
            return Ok(());
        };

        let batch_id = Uuid::new_v4();
        debug!(
            batch_id = %batch_id,
            records = batch.len(),
            trigger = ?trigger,
            "Flushing log batch"
        );

        let result = match timeout(self.flush_timeout, self.client.push(&batch, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::DeadlineExceeded(self.flush_timeout)),
        };

        match result {
            Ok(()) => {
                debug!(batch_id = %batch_id, records = batch.len(), "Batch delivered");
                Ok(())
            }
            Err(e) => {
                // Not re-queued: a long outage would otherwise grow the buffer without bound.
                error!(
                    batch_id = %batch_id,
                    records = batch.len(),
                    error = %e,
                    "Dropping log batch"
                );
                Err(TransportError::new(TRANSPORT_NAME, op, e))
            }
        }
    }

    fn report(&self, err: &TransportError) {
        (self.on_error)(TRANSPORT_NAME, err);
    }
}

/// Batched HTTP transport to Loki.
///
/// Must be created from within a Tokio runtime; the constructor spawns the
/// background flusher.
pub struct LokiTransport {
    inner: Arc<Inner>,
    stop: CancellationToken,
    stopped: CancellationToken,
    shutdown_timeout: Duration,
}

impl LokiTransport {
    /// Build the push client from `config` and start the transport.
    pub fn new(config: &Config, on_error: ErrorHandler) -> Result<Self, ClientError> {
        let client = LokiClient::new(config)?;
        Ok(Self::with_client(client, TransportConfig::from(config), on_error))
    }

    /// Start a transport around an existing client.
    pub fn with_client(client: LokiClient, config: TransportConfig, on_error: ErrorHandler) -> Self {
        let inner = Arc::new(Inner {
            client,
            buffer: BatchBuffer::new(config.batch_size),
            flush_timeout: config.flush_timeout,
            on_error,
        });

        let stop = CancellationToken::new();
        let stopped = CancellationToken::new();

        tokio::spawn(run_flusher(
            inner.clone(),
            config.flush_interval,
            stop.clone(),
            stopped.clone(),
        ));

        debug!(
            batch_size = inner.buffer.batch_size(),
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            push_url = %inner.client.push_url(),
            max_retries = inner.client.max_retries(),
            "Loki transport started"
        );

        Self {
            inner,
            stop,
            stopped,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Flush, aborting the push (including retry backoff) as soon as
    /// `cancel` fires.
    pub async fn flush_with(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        self.inner
            .flush(FlushTrigger::Manual, Operation::Flush, cancel)
            .await
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.buffer.lifecycle()
    }

    /// Number of records waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.inner.buffer.len()
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.buffer.stats()
    }
}

#[async_trait]
impl Sink for LokiTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    async fn write(&self, records: &[Arc<Record>]) -> Result<(), TransportError> {
        let full = self
            .inner
            .buffer
            .push(records.iter().cloned())
            .map_err(|_| TransportError::new(TRANSPORT_NAME, Operation::Write, Cause::Closed))?;

        if full {
            self.inner
                .flush(FlushTrigger::Size, Operation::Write, &CancellationToken::new())
                .await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.flush_with(&CancellationToken::new()).await
    }

    /// Stop the background flusher and wait for its final flush.
    ///
    /// Concurrent callers all wait for the same final flush. On timeout the
    /// flusher keeps running to completion in the background. Once it has
    /// stopped, further calls return `Ok(())` immediately.
    async fn close(&self) -> Result<(), TransportError> {
        self.inner.buffer.begin_drain();
        self.stop.cancel();

        if self.lifecycle() == Lifecycle::Stopped {
            return Ok(());
        }

        match timeout(self.shutdown_timeout, self.stopped.cancelled()).await {
            Ok(_) => {
                info!("Loki transport closed");
                Ok(())
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    buffered = self.buffered(),
                    "Timed out waiting for background flusher"
                );
                Err(TransportError::new(
                    TRANSPORT_NAME,
                    Operation::Close,
                    Cause::ShutdownTimeout(self.shutdown_timeout),
                ))
            }
        }
    }
}

impl Drop for LokiTransport {
    fn drop(&mut self) {
        self.inner.buffer.begin_drain();
        self.stop.cancel();
    }
}

impl std::fmt::Debug for LokiTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LokiTransport")
            .field("client", &self.inner.client)
            .field("lifecycle", &self.lifecycle())
            .field("buffered", &self.buffered())
            .finish()
    }
}

/// Background flusher: flush on every tick until asked to stop, then flush
/// once more and acknowledge.
async fn run_flusher(
    inner: Arc<Inner>,
    flush_interval: Duration,
    stop: CancellationToken,
    stopped: CancellationToken,
) {
    let mut ticker = interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let cancel = CancellationToken::new();
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = inner.flush(FlushTrigger::Interval, Operation::Flush, &cancel).await {
                    inner.report(&e);
                }
            }
        }
    }

    debug!(buffered = inner.buffer.len(), "Background flusher stopping");
    if let Err(e) = inner
        .flush(FlushTrigger::Shutdown, Operation::Close, &cancel)
        .await
    {
        inner.report(&e);
    }

    inner.buffer.mark_stopped();
    stopped.cancel();
}
