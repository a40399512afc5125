//! Configuration module for the log shipper.
//!
//! [`Config`] carries every tunable with sensible defaults and can be loaded
//! from `LOKI_SHIPPER_*` environment variables. [`Handlers`] carries the
//! caller-supplied callbacks, which default to reporting through `tracing`.

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::cardinality::CardinalityWarningHandler;
use crate::client::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ERROR_BODY_BYTES};
use crate::error::{ConfigError, TransportError};
use crate::rate_limit::RateLimitHandler;
use crate::record::{Labels, Level};

/// Prefix shared by every environment variable.
const ENV_PREFIX: &str = "LOKI_SHIPPER_";

/// Default Loki base URL
const DEFAULT_URL: &str = "http://localhost:3100";

/// Default batch size (number of records per push)
const DEFAULT_BATCH_SIZE: usize = 100;

/// Maximum allowed batch size to prevent memory issues
const MAX_BATCH_SIZE: usize = 10_000;

/// Default flush interval in milliseconds
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;

/// Callback receiving `(transport_name, error)` for every failed sink
/// operation.
pub type ErrorHandler = Arc<dyn Fn(&str, &TransportError) + Send + Sync>;

/// HTTP basic-auth credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Configuration for a [`Logger`](crate::logger::Logger) and its sinks.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application name, sent as the `app` label
    pub app_name: String,

    /// Base URL of the Loki server
    pub url: String,

    /// Optional basic-auth credentials
    pub credentials: Option<Credentials>,

    /// Minimum level that is logged
    pub log_level: Level,

    /// Labels attached to every record
    pub labels: Labels,

    /// Number of records to accumulate before pushing
    pub batch_size: usize,

    /// How often buffered records are pushed regardless of batch size
    pub flush_interval: Duration,

    /// Number of retries after a failed push
    pub max_retries: u32,

    /// First backoff delay; doubles on each retry
    pub retry_base_delay: Duration,

    /// Timeout for a single HTTP request
    pub request_timeout: Duration,

    /// Deadline for one sink write, including a size-triggered flush
    pub write_timeout: Duration,

    /// Deadline for one flush, including retries
    pub flush_timeout: Duration,

    /// How long `close` waits for the background flusher
    pub shutdown_timeout: Duration,

    /// How much of an error response body is kept for diagnostics
    pub max_error_body_bytes: usize,

    /// Skip the Loki sink entirely
    pub only_console: bool,

    /// Render records on stdout
    pub console: bool,

    /// Append a backtrace to error and fatal messages
    pub include_stack_trace: bool,

    /// Distinct values per label before a warning; 0 disables tracking
    pub max_label_cardinality: usize,

    /// Token-bucket rate; 0 disables rate limiting
    pub max_logs_per_second: u32,

    /// Fraction of over-limit records admitted anyway
    pub sampling_ratio: f64,

    /// Levels that bypass the rate limiter
    pub always_log_levels: Vec<Level>,

    /// How often rate-limit statistics are reported
    pub rate_limit_stats_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "app".to_string(),
            url: DEFAULT_URL.to_string(),
            credentials: None,
            log_level: Level::Info,
            labels: Labels::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            request_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            max_error_body_bytes: DEFAULT_MAX_ERROR_BODY_BYTES,
            only_console: false,
            console: true,
            include_stack_trace: false,
            max_label_cardinality: 10,
            max_logs_per_second: 0,
            sampling_ratio: 0.1,
            always_log_levels: vec![Level::Error, Level::Fatal],
            rate_limit_stats_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// Recognised variables (all prefixed with `LOKI_SHIPPER_`): `APP_NAME`,
    /// `URL`, `USERNAME`, `PASSWORD`, `LOG_LEVEL`, `LABELS` (`k=v,k2=v2`),
    /// `BATCH_SIZE`, `FLUSH_INTERVAL_MS`, `MAX_RETRIES`,
    /// `REQUEST_TIMEOUT_SECS`, `SHUTDOWN_TIMEOUT_SECS`, `ONLY_CONSOLE`,
    /// `CONSOLE`, `MAX_LABEL_CARDINALITY`, `MAX_LOGS_PER_SECOND`,
    /// `SAMPLING_RATIO`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use loki_shipper::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Loki URL: {}", config.url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(app_name) = var("APP_NAME") {
            config.app_name = app_name;
        }
        if let Some(url) = var("URL") {
            config.url = url.trim_end_matches('/').to_string();
        }

        let username = var("USERNAME").unwrap_or_default();
        let password = var("PASSWORD").unwrap_or_default();
        if !username.is_empty() && !password.is_empty() {
            config.credentials = Some(Credentials { username, password });
        }

        if let Some(level) = var("LOG_LEVEL") {
            config.log_level = Level::parse(&level);
        }
        if let Some(labels) = var("LABELS") {
            config.labels = parse_labels(&labels)?;
        }

        config.batch_size = Self::parse_batch_size()?;
        if let Some(ms) = parse_var::<u64>("FLUSH_INTERVAL_MS")? {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_var("MAX_RETRIES")? {
            config.max_retries = retries;
        }
        if let Some(secs) = parse_var::<u64>("REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("SHUTDOWN_TIMEOUT_SECS")? {
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(only_console) = parse_var("ONLY_CONSOLE")? {
            config.only_console = only_console;
        }
        if let Some(console) = parse_var("CONSOLE")? {
            config.console = console;
        }
        if let Some(max) = parse_var("MAX_LABEL_CARDINALITY")? {
            config.max_label_cardinality = max;
        }
        if let Some(max) = parse_var("MAX_LOGS_PER_SECOND")? {
            config.max_logs_per_second = max;
        }
        if let Some(ratio) = parse_var("SAMPLING_RATIO")? {
            config.sampling_ratio = ratio;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse batch size from environment variable with validation.
    fn parse_batch_size() -> Result<usize, ConfigError> {
        let name = format!("{}BATCH_SIZE", ENV_PREFIX);

        match parse_var::<usize>("BATCH_SIZE")? {
            Some(0) => Err(ConfigError::new(name, "batch size must be greater than 0")),
            Some(size) if size > MAX_BATCH_SIZE => Err(ConfigError::new(
                name,
                format!(
                    "batch size {} exceeds maximum allowed ({})",
                    size, MAX_BATCH_SIZE
                ),
            )),
            Some(size) => Ok(size),
            None => Ok(DEFAULT_BATCH_SIZE),
        }
    }

    /// Check the configuration for values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.is_empty() {
            return Err(ConfigError::new("app_name", "is required"));
        }
        if !self.only_console && self.url.is_empty() {
            return Err(ConfigError::new(
                "url",
                "is required when only_console is false",
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::new("batch_size", "must be greater than 0"));
        }

        let durations = [
            ("flush_interval", self.flush_interval),
            ("request_timeout", self.request_timeout),
            ("write_timeout", self.write_timeout),
            ("flush_timeout", self.flush_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
            ("rate_limit_stats_interval", self.rate_limit_stats_interval),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::new(field, "must be greater than 0"));
            }
        }

        if !self.sampling_ratio.is_finite() {
            return Err(ConfigError::new("sampling_ratio", "must be a finite number"));
        }

        Ok(())
    }
}

/// Caller-supplied callbacks.
#[derive(Clone)]
pub struct Handlers {
    /// Called for every failed sink write, flush or close
    pub on_error: ErrorHandler,

    /// Called once per label when it crosses the cardinality threshold
    pub on_cardinality_warning: Option<CardinalityWarningHandler>,

    /// Called with rate-limit statistics on every reporting interval
    pub on_rate_limit: Option<RateLimitHandler>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            on_error: Arc::new(|transport: &str, err: &TransportError| {
                error!(transport = transport, error = %err, "Transport error");
            }),
            on_cardinality_warning: Some(Arc::new(
                |label: &str, unique_values: usize, threshold: usize| {
                    warn!(
                        label = label,
                        unique_values = unique_values,
                        threshold = threshold,
                        "High label cardinality can impact Loki performance"
                    );
                },
            )),
            on_rate_limit: None,
        }
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("on_cardinality_warning", &self.on_cardinality_warning.is_some())
            .field("on_rate_limit", &self.on_rate_limit.is_some())
            .finish_non_exhaustive()
    }
}

fn var(suffix: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, suffix)).ok()
}

fn parse_var<T: FromStr>(suffix: &str) -> Result<Option<T>, ConfigError> {
    match var(suffix) {
        Some(value) => value.trim().parse().map(Some).map_err(|_| {
            ConfigError::new(
                format!("{}{}", ENV_PREFIX, suffix),
                format!("'{}' is not a valid value", value),
            )
        }),
        None => Ok(None),
    }
}

/// Parse `k=v,k2=v2` into labels. Empty segments are ignored.
fn parse_labels(raw: &str) -> Result<Labels, ConfigError> {
    let mut labels = Labels::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(ConfigError::new(
                format!("{}LABELS", ENV_PREFIX),
                format!("'{}' is not a key=value pair", pair),
            ));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::new(
                format!("{}LABELS", ENV_PREFIX),
                format!("'{}' has an empty key", pair),
            ));
        }
        labels.insert(key.to_string(), value.trim().to_string());
    }
    Ok(labels)
}
