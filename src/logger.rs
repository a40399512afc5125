//! Logging frontend.
//!
//! A [`Logger`] turns calls like `logger.info("msg", fields)` into records
//! and fans them out to every sink. Admission goes level filter, then rate
//! limiter (skipped for `always_log_levels`), then label assembly and
//! cardinality tracking. Sink failures are reported through the error
//! handler and never returned to the caller.
//!
//! Handles derived with [`Logger::with_labels`] share sinks, limiter and
//! tracker with their parent and only own their extra labels.

use std::backtrace::Backtrace;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cardinality::CardinalityTracker;
use crate::config::{Config, ErrorHandler, Handlers};
use crate::error::{Cause, LoggerError, Operation, TransportError};
use crate::rate_limit::{RateLimitHandler, RateLimiter};
use crate::record::{Fields, Labels, Level, Record};
use crate::sink::{ConsoleSink, Sink};
use crate::transport::LokiTransport;

/// Field that suppresses the stack trace on a single error or fatal record.
pub const SKIP_STACK_TRACE_FIELD: &str = "_skip_stack_trace";

/// State shared by a logger and every handle derived from it.
struct Shared {
    config: Config,
    sinks: Vec<Arc<dyn Sink>>,
    limiter: Arc<RateLimiter>,
    tracker: CardinalityTracker,
    on_error: ErrorHandler,
    reporter_stop: CancellationToken,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable logging handle.
#[derive(Clone)]
pub struct Logger {
    shared: Arc<Shared>,
    labels: Labels,
}

impl Logger {
    /// Build a logger with a console sink (unless `console` is off) and a
    /// Loki sink (unless `only_console` is set).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: Config, handlers: Handlers) -> Result<Self, LoggerError> {
        config.validate()?;

        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        if config.console {
            sinks.push(Arc::new(ConsoleSink::stdout()));
        }
        if !config.only_console {
            sinks.push(Arc::new(LokiTransport::new(
                &config,
                handlers.on_error.clone(),
            )?));
        }

        Self::with_sinks(config, handlers, sinks)
    }

    /// Build a logger over caller-provided sinks.
    pub fn with_sinks(
        config: Config,
        handlers: Handlers,
        sinks: Vec<Arc<dyn Sink>>,
    ) -> Result<Self, LoggerError> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::new(
            config.max_logs_per_second,
            config.sampling_ratio,
        ));
        let tracker = CardinalityTracker::new(
            config.max_label_cardinality,
            handlers.on_cardinality_warning.clone(),
        );

        let reporter_stop = CancellationToken::new();
        let reporter = match &handlers.on_rate_limit {
            Some(handler) if limiter.is_enabled() => Some(tokio::spawn(report_rate_limits(
                limiter.clone(),
                handler.clone(),
                config.rate_limit_stats_interval,
                reporter_stop.clone(),
            ))),
            _ => None,
        };

        debug!(
            app = %config.app_name,
            sinks = sinks.len(),
            min_level = %config.log_level,
            rate_limited = limiter.is_enabled(),
            "Logger initialized"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                sinks,
                limiter,
                tracker,
                on_error: handlers.on_error,
                reporter_stop,
                reporter: Mutex::new(reporter),
            }),
            labels: Labels::new(),
        })
    }

    /// Derived handle adding `labels` to every record it logs.
    pub fn with_labels<K, V>(&self, labels: impl IntoIterator<Item = (K, V)>) -> Logger
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged = self.labels.clone();
        merged.extend(labels.into_iter().map(|(k, v)| (k.into(), v.into())));
        Logger {
            shared: self.shared.clone(),
            labels: merged,
        }
    }

    pub async fn debug(&self, message: impl Into<String>, fields: impl Into<Option<Fields>>) {
        self.log(Level::Debug, message, fields).await
    }

    pub async fn info(&self, message: impl Into<String>, fields: impl Into<Option<Fields>>) {
        self.log(Level::Info, message, fields).await
    }

    pub async fn warn(&self, message: impl Into<String>, fields: impl Into<Option<Fields>>) {
        self.log(Level::Warn, message, fields).await
    }

    pub async fn error(&self, message: impl Into<String>, fields: impl Into<Option<Fields>>) {
        self.log(Level::Error, message, fields).await
    }

    /// Logs at fatal level. Does not exit the process.
    pub async fn fatal(&self, message: impl Into<String>, fields: impl Into<Option<Fields>>) {
        self.log(Level::Fatal, message, fields).await
    }

    /// Log one record at `level`. Never fails; sink errors go to the error
    /// handler.
    pub async fn log(
        &self,
        level: Level,
        message: impl Into<String>,
        fields: impl Into<Option<Fields>>,
    ) {
        let shared = &self.shared;
        let config = &shared.config;

        if !level.is_enabled(config.log_level) {
            return;
        }
        if !config.always_log_levels.contains(&level) && !shared.limiter.allow().is_allowed() {
            return;
        }

        let mut fields = fields.into().unwrap_or_default();
        let mut message = message.into();
        let skip_stack_trace =
            matches!(fields.remove(SKIP_STACK_TRACE_FIELD), Some(Value::Bool(true)));
        if config.include_stack_trace
            && !skip_stack_trace
            && matches!(level, Level::Error | Level::Fatal)
        {
            message = format!("{}\n\nStack trace:\n{}", message, Backtrace::force_capture());
        }

        let labels = self.labels_for(level);
        for (key, value) in &labels {
            shared.tracker.track(key, value);
        }

        let record = Arc::new(
            Record::new(level, message)
                .with_fields(fields)
                .with_labels(labels),
        );
        self.dispatch(&[record]).await;
    }

    /// Label set for a record: `app`, `level`, configured labels, then this
    /// handle's own labels. Later entries win.
    fn labels_for(&self, level: Level) -> Labels {
        let config = &self.shared.config;
        let mut labels = Labels::with_capacity(2 + config.labels.len() + self.labels.len());
        labels.insert("app".to_string(), config.app_name.clone());
        labels.insert("level".to_string(), level.as_str().to_string());
        labels.extend(config.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        labels.extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        labels
    }

    async fn dispatch(&self, records: &[Arc<Record>]) {
        let write_timeout = self.shared.config.write_timeout;
        for sink in &self.shared.sinks {
            let result = match timeout(write_timeout, sink.write(records)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::new(
                    sink.name(),
                    Operation::Write,
                    Cause::WriteTimeout(write_timeout),
                )),
            };
            if let Err(e) = result {
                (self.shared.on_error)(sink.name(), &e);
            }
        }
    }

    /// Flush every sink. All sinks are attempted; the first failure is
    /// returned.
    pub async fn flush(&self) -> Result<(), LoggerError> {
        let mut first_error = None;
        for sink in &self.shared.sinks {
            if let Err(e) = sink.flush().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Stop the rate-limit reporter and close every sink, flushing what
    /// they buffer. Affects every handle sharing these sinks. Safe to call
    /// more than once.
    pub async fn close(&self) -> Result<(), LoggerError> {
        self.shared.reporter_stop.cancel();
        let reporter = self.shared.reporter.lock().take();
        if let Some(handle) = reporter {
            let _ = handle.await;
        }

        let mut first_error = None;
        for sink in &self.shared.sinks {
            if let Err(e) = sink.close().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Labels owned by this handle (not including `app`, `level` or
    /// configured labels).
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sinks: Vec<_> = self.shared.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("Logger")
            .field("app", &self.shared.config.app_name)
            .field("sinks", &sinks)
            .field("labels", &self.labels)
            .field("limiter", &self.shared.limiter)
            .finish()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.reporter_stop.cancel();
    }
}

/// Hand rate-limit statistics to `handler` every `every` until stopped.
/// Quiet intervals are not reported.
async fn report_rate_limits(
    limiter: Arc<RateLimiter>,
    handler: RateLimitHandler,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let stats = limiter.take_stats();
                if stats.dropped > 0 || stats.sampled > 0 {
                    debug!(dropped = stats.dropped, sampled = stats.sampled, "Rate limit statistics");
                    handler(stats.dropped, stats.sampled);
                }
            }
        }
    }
}
