//! HTTP client for pushing log batches to Loki.
//!
//! Records are grouped into streams by label set, each record is rendered as
//! a single-line JSON document, and the result is POSTed to
//! `{base_url}/loki/api/v1/push`. Failed sends (transport errors and non-2xx
//! responses alike) are retried with exponential backoff; the backoff waits
//! and in-flight requests both abort as soon as the caller's cancellation
//! token fires.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Config, Credentials};
use crate::pool;
use crate::record::Record;
use crate::stream_key::stream_key;

/// Loki push API path, appended to the base URL.
pub const PUSH_PATH: &str = "/loki/api/v1/push";

/// Default base delay for exponential backoff (in milliseconds).
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Default cap on how much of an error response body is kept.
pub const DEFAULT_MAX_ERROR_BODY_BYTES: usize = 1024;

/// Body of a push request.
#[derive(Debug, Serialize)]
pub struct PushRequest {
    pub streams: Vec<StreamEntry>,
}

/// One label set and its `[timestamp_ns, line]` values.
#[derive(Debug, Serialize)]
pub struct StreamEntry {
    pub stream: BTreeMap<String, String>,
    pub values: Vec<[String; 2]>,
}

/// Why a single HTTP exchange failed.
#[derive(Debug, Error)]
pub enum HttpFailure {
    #[error("failed to send request: {0}")]
    Send(#[source] reqwest::Error),

    #[error("backend returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Errors that can occur while pushing to Loki.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("client error [{method} {url}]: {cause}")]
    Http {
        method: Method,
        url: String,
        #[source]
        cause: HttpFailure,
    },

    #[error("failed after {retries} retries: {last}")]
    RetriesExhausted {
        retries: u32,
        #[source]
        last: Box<ClientError>,
    },

    #[error("push cancelled")]
    Cancelled,

    #[error("push deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl ClientError {
    /// HTTP status of the final failed attempt, if the backend answered.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Http {
                cause: HttpFailure::Status { status, .. },
                ..
            } => Some(*status),
            ClientError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

/// HTTP push client for a single Loki endpoint.
///
/// The underlying `reqwest::Client` is reused across pushes for connection
/// pooling.
#[derive(Clone)]
pub struct LokiClient {
    client: Client,
    push_url: String,
    credentials: Option<Credentials>,
    max_retries: u32,
    base_delay: Duration,
    max_error_body_bytes: usize,
    timeout: Duration,
}

impl LokiClient {
    /// Create a client from the shipping configuration.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Ok(Self::with_settings(&config.url, config.request_timeout, config.max_retries)?
            .with_base_delay(config.retry_base_delay)
            .with_max_error_body_bytes(config.max_error_body_bytes)
            .with_credentials(config.credentials.clone()))
    }

    /// Create a client with explicit settings and default backoff.
    pub fn with_settings(
        base_url: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(ClientError::Build)?;

        Ok(Self {
            client,
            push_url: format!("{}{}", base_url.trim_end_matches('/'), PUSH_PATH),
            credentials: None,
            max_retries,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_error_body_bytes: DEFAULT_MAX_ERROR_BODY_BYTES,
            timeout,
        })
    }

    /// Use HTTP basic authentication.
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Override the first backoff delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Override how many bytes of an error body are kept.
    pub fn with_max_error_body_bytes(mut self, limit: usize) -> Self {
        self.max_error_body_bytes = limit;
        self
    }

    /// Push records to Loki, retrying failed attempts.
    ///
    /// An empty slice returns immediately without any network call. After
    /// `max_retries` failed retries the last failure is returned wrapped in
    /// [`ClientError::RetriesExhausted`]; the batch is not kept anywhere.
    pub async fn push(
        &self,
        records: &[Arc<Record>],
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        if records.is_empty() {
            return Ok(());
        }

        let payload = build_payload(records)?;
        let body = {
            let mut buf = pool::acquire();
            serde_json::to_writer(&mut *buf, &payload)?;
            buf.to_vec()
        };

        debug!(
            records = records.len(),
            streams = payload.streams.len(),
            bytes = body.len(),
            url = %self.push_url,
            "Pushing log batch"
        );

        self.send_with_retry(body, cancel).await
    }

    async fn send_with_retry(
        &self,
        body: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let mut last_error: Option<ClientError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff_delay(attempt);
                warn!(
                    attempt = attempt,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying push after failure"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                result = self.send(body.clone()) => result,
            };

            match result {
                Ok(()) => {
                    debug!(attempts = attempt + 1, "Push succeeded");
                    return Ok(());
                }
                Err(e) => {
                    debug!(error = %e, attempt = attempt + 1, "Push attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(ClientError::RetriesExhausted {
            retries: self.max_retries,
            last: Box::new(last_error.unwrap_or(ClientError::Cancelled)),
        })
    }

    /// Send a single HTTP request without retry logic.
    async fn send(&self, body: Vec<u8>) -> Result<(), ClientError> {
        let mut request = self
            .client
            .post(&self.push_url)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);

        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.http_error(HttpFailure::Send(e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = read_bounded(response, self.max_error_body_bytes).await;
        Err(self.http_error(HttpFailure::Status { status, body }))
    }

    fn http_error(&self, cause: HttpFailure) -> ClientError {
        ClientError::Http {
            method: Method::POST,
            url: self.push_url.clone(),
            cause,
        }
    }

    /// Backoff before retry `attempt` (1-based): `base * 2^(attempt - 1)`,
    /// capped at 30s.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1 << exponent);
        delay.min(Duration::from_millis(MAX_RETRY_DELAY_MS))
    }

    /// Full push endpoint URL.
    pub fn push_url(&self) -> &str {
        &self.push_url
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl std::fmt::Debug for LokiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LokiClient")
            .field("push_url", &self.push_url)
            .field("authenticated", &self.credentials.is_some())
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Group records into streams, preserving first-seen stream order and
/// per-stream record order.
pub fn build_payload(records: &[Arc<Record>]) -> Result<PushRequest, ClientError> {
    let mut streams: Vec<StreamEntry> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        let key = stream_key(&record.labels);
        let slot = *index.entry(key).or_insert_with(|| {
            streams.push(StreamEntry {
                stream: record
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                values: Vec::new(),
            });
            streams.len() - 1
        });

        let line = format_line(record)?;
        streams[slot]
            .values
            .push([record.timestamp_nanos().to_string(), line]);
    }

    Ok(PushRequest { streams })
}

/// Render a record as one JSON object: every field, plus `level` and
/// `message`, which always reflect the record itself.
pub fn format_line(record: &Record) -> Result<String, ClientError> {
    let mut data = record.fields.clone();
    data.insert("level".into(), record.level.as_str().into());
    data.insert("message".into(), record.message.clone().into());

    let mut buf = pool::acquire();
    serde_json::to_writer(&mut *buf, &data)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Read at most `limit` bytes of a response body.
async fn read_bounded(mut response: Response, limit: usize) -> String {
    let mut body = Vec::new();
    while body.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - body.len());
                body.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}
