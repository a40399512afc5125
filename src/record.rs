//! Record module: the structured log event that flows through the pipeline.
//!
//! A [`Record`] is built once by the logging frontend and never mutated
//! afterwards; downstream components share it behind an `Arc`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Indexed, low-cardinality metadata used to group records into streams.
pub type Labels = HashMap<String, String>;

/// Unindexed structured data; values may be any JSON value.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Log severity levels, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    /// Lowercase name as it appears in labels and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }

    /// Parse a level name case-insensitively.
    ///
    /// `warning` is accepted as an alias for `warn`. Unknown names map to
    /// [`Level::Info`].
    pub fn parse(name: &str) -> Level {
        match name.trim().to_ascii_lowercase().as_str() {
            "debug" => Level::Debug,
            "info" => Level::Info,
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            "fatal" => Level::Fatal,
            _ => Level::Info,
        }
    }

    /// Whether this level passes the configured minimum.
    pub fn is_enabled(&self, minimum: Level) -> bool {
        *self >= minimum
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single structured log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Severity of the event
    pub level: Level,

    /// Main log message
    pub message: String,

    /// Structured, unindexed data
    #[serde(default)]
    pub fields: Fields,

    /// When the event was created
    pub timestamp: DateTime<Utc>,

    /// Indexed labels; must stay low-cardinality
    #[serde(default)]
    pub labels: Labels,
}

impl Record {
    /// Create a record stamped with the current time and no fields or labels.
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            fields: Fields::new(),
            timestamp: Utc::now(),
            labels: Labels::new(),
        }
    }

    /// Replace the structured fields.
    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = fields;
        self
    }

    /// Add a single structured field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add every label from `labels`, overriding existing keys.
    pub fn with_labels<K, V>(mut self, labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.labels
            .extend(labels.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Override the creation timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Unix timestamp in nanoseconds.
    ///
    /// Saturates to 0 for dates outside the representable range (before 1677
    /// or after 2262).
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp.timestamp_nanos_opt().unwrap_or_default()
    }
}
