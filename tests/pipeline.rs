//! End-to-end tests: logger and transport against a mock Loki server.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use mockito::Matcher;
use parking_lot::Mutex;
use serde_json::json;

use loki_shipper::client::{LokiClient, PUSH_PATH};
use loki_shipper::config::{Config, ErrorHandler, Handlers};
use loki_shipper::error::TransportError;
use loki_shipper::logger::Logger;
use loki_shipper::record::{Level, Record};
use loki_shipper::sink::Sink;
use loki_shipper::transport::{LokiTransport, TransportConfig};

fn record(message: &str, secs: i64) -> Arc<Record> {
    Arc::new(
        Record::new(Level::Info, message)
            .with_label("app", "x")
            .with_timestamp(Utc.timestamp_opt(secs, 0).unwrap()),
    )
}

fn collecting_handler() -> (ErrorHandler, Arc<Mutex<Vec<String>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = errors.clone();
    let handler: ErrorHandler = Arc::new(move |name: &str, err: &TransportError| {
        seen.lock().push(format!("{}: {}", name, err));
    });
    (handler, errors)
}

#[tokio::test]
async fn test_second_write_flushes_one_stream() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", PUSH_PATH)
        .match_header("content-type", "application/json")
        .match_body(Matcher::Json(json!({
            "streams": [{
                "stream": { "app": "x" },
                "values": [
                    ["1000000000000", r#"{"level":"info","message":"first"}"#],
                    ["1001000000000", r#"{"level":"info","message":"second"}"#]
                ]
            }]
        })))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let client = LokiClient::with_settings(&server.url(), Duration::from_secs(5), 0).unwrap();
    let (on_error, errors) = collecting_handler();
    let transport = LokiTransport::with_client(
        client,
        TransportConfig {
            batch_size: 2,
            flush_interval: Duration::from_secs(3600),
            flush_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        },
        on_error,
    );

    transport.write(&[record("first", 1000)]).await.unwrap();
    assert_eq!(transport.buffered(), 1);

    transport.write(&[record("second", 1001)]).await.unwrap();
    assert_eq!(transport.buffered(), 0);

    transport.write(&[record("third", 1002)]).await.unwrap();

    mock.assert_async().await;
    assert_eq!(transport.buffered(), 1);
    assert_eq!(transport.stats().size_flushes, 1);
    assert!(errors.lock().is_empty());
}

#[tokio::test]
async fn test_server_error_reports_status_and_body() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", PUSH_PATH)
        .with_status(500)
        .with_body("server error")
        .expect(2)
        .create_async()
        .await;

    let config = Config {
        url: server.url(),
        app_name: "x".to_string(),
        console: false,
        max_retries: 1,
        retry_base_delay: Duration::from_millis(1),
        ..Config::default()
    };
    let (on_error, errors) = collecting_handler();
    let logger = Logger::new(
        config,
        Handlers {
            on_error,
            ..Handlers::default()
        },
    )
    .unwrap();

    logger.info("lost", None).await;
    let err = logger.flush().await.unwrap_err();

    mock.assert_async().await;
    let text = err.to_string();
    assert!(text.contains("500"), "{}", text);
    assert!(text.contains("server error"), "{}", text);
    assert!(text.contains("1 retries"), "{}", text);

    // Explicit flush failures are returned, not reported.
    assert!(errors.lock().is_empty());
    logger.close().await.unwrap();
}

#[tokio::test]
async fn test_logger_close_delivers_buffered_records() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", PUSH_PATH)
        .match_body(Matcher::PartialJson(json!({
            "streams": [{ "stream": { "app": "svc", "level": "info", "component": "api" } }]
        })))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let config = Config {
        url: server.url(),
        app_name: "svc".to_string(),
        console: false,
        flush_interval: Duration::from_secs(3600),
        ..Config::default()
    };
    let logger = Logger::new(config, Handlers::default()).unwrap();
    let api = logger.with_labels([("component", "api")]);

    api.info("request handled", None).await;
    api.close().await.unwrap();
    logger.close().await.unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn test_records_grouped_by_label_set() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", PUSH_PATH)
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""component":"db""#.to_string()),
            Matcher::Regex(r#""component":"cache""#.to_string()),
        ]))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let config = Config {
        url: server.url(),
        console: false,
        batch_size: 3,
        flush_interval: Duration::from_secs(3600),
        ..Config::default()
    };
    let logger = Logger::new(config, Handlers::default()).unwrap();
    let db = logger.with_labels([("component", "db")]);
    let cache = logger.with_labels([("component", "cache")]);

    db.info("query", None).await;
    cache.info("miss", None).await;
    db.info("query", None).await;

    mock.assert_async().await;
    logger.close().await.unwrap();
}
