//! Loki Shipper Library
//!
//! This library ships structured log records to Grafana Loki:
//!
//! - **record**: Log records, levels, labels and fields
//! - **stream_key**: Deterministic grouping key for a label set
//! - **rate_limit**: Token-bucket rate limiter with probabilistic sampling
//! - **cardinality**: Per-label distinct value tracking with one-time warnings
//! - **pool**: Bounded pool of serialization scratch buffers
//! - **client**: HTTP push client with retry and exponential backoff
//! - **buffer**: Mutex-guarded batch buffer and lifecycle state
//! - **transport**: Batched Loki transport with a background flusher
//! - **sink**: Sink trait and console sink
//! - **logger**: Logging frontend fanning records out to sinks
//! - **config**: Environment-based configuration and callbacks
//! - **error**: Error types
//!
//! # Example
//!
//! ```no_run
//! use loki_shipper::config::{Config, Handlers};
//! use loki_shipper::logger::Logger;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Console and Loki sinks, default tracing-based callbacks
//!     let logger = Logger::new(config, Handlers::default()).expect("Failed to create logger");
//!
//!     // Derived handles share the same transport
//!     let db = logger.with_labels([("component", "db")]);
//!     db.info("connected", None).await;
//!
//!     // Flush remaining records and stop background tasks
//!     logger.close().await.ok();
//! }
//! ```

// Module declarations
pub mod buffer;
pub mod cardinality;
pub mod client;
pub mod config;
pub mod error;
pub mod logger;
pub mod pool;
pub mod rate_limit;
pub mod record;
pub mod sink;
pub mod stream_key;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use buffer::{BatchBuffer, BufferError, BufferStats, FlushTrigger, Lifecycle};
pub use cardinality::{CardinalityTracker, CardinalityWarningHandler};
pub use client::{ClientError, HttpFailure, LokiClient, PushRequest, StreamEntry};
pub use config::{Config, Credentials, ErrorHandler, Handlers};
pub use error::{Cause, ConfigError, LoggerError, Operation, TransportError};
pub use logger::Logger;
pub use rate_limit::{Decision, RateLimitHandler, RateLimitStats, RateLimiter};
pub use record::{Fields, Labels, Level, Record};
pub use sink::{ConsoleSink, Sink};
pub use stream_key::stream_key;
pub use transport::{LokiTransport, TransportConfig};
