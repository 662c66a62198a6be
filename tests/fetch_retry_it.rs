mod common;

use std::{sync::Arc, time::Duration};

use champion::{
    config::CircuitBreakerConfig,
    error::FetchError,
    fetch::{Fetcher, circuit::CircuitBreaker},
};
use chrono::NaiveDate;
use common::{Scripted, ScriptedTransport, nse_bhavcopy_csv, nse_descriptor, nse_url};
use tokio_util::sync::CancellationToken;

fn trade_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
}

fn fetcher(transport: Arc<ScriptedTransport>, dir: &std::path::Path, threshold: u32) -> Fetcher {
    Fetcher::new(
        transport,
        CircuitBreaker::new(&CircuitBreakerConfig {
            threshold,
            cooldown: Duration::from_secs(600),
        }),
        3,
        dir.to_path_buf(),
    )
    .with_base_delay(Duration::from_millis(1))
}

#[tokio::test]
async fn network_flap_recovers_with_one_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    let url = nse_url(trade_date());

    // 503 twice, then the bulletin.
    transport.push(&url, Scripted::Status(503));
    transport.push(&url, Scripted::Status(503));
    transport.push(
        &url,
        Scripted::OwnedBody(nse_bhavcopy_csv(10, "02-JAN-2024").into_bytes()),
    );

    let fetcher = fetcher(transport.clone(), dir.path(), 10);
    let path = fetcher
        .fetch(&nse_descriptor(), trade_date(), &CancellationToken::new())
        .await
        .unwrap()
        .expect("bulletin staged");

    assert_eq!(transport.request_count(), 3, "two failures and one success");
    assert!(path.exists());
    // Exactly one artifact materialized, no temp leftovers.
    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .collect();
    assert_eq!(files.len(), 1);
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_status() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    let url = nse_url(trade_date());
    for _ in 0..10 {
        transport.push(&url, Scripted::Status(503));
    }

    let fetcher = fetcher(transport.clone(), dir.path(), 100);
    let err = fetcher
        .fetch(&nse_descriptor(), trade_date(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Status { status: 503, .. }));
    // retries = 3 means four attempts in total.
    assert_eq!(transport.request_count(), 4);
}

#[tokio::test]
async fn open_circuit_blocks_without_a_network_request() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    let url = nse_url(trade_date());
    for _ in 0..10 {
        transport.push(&url, Scripted::Status(500));
    }

    // Threshold 3: the first fetch's failures open the circuit.
    let fetcher = fetcher(transport.clone(), dir.path(), 3);
    let first = fetcher
        .fetch(&nse_descriptor(), trade_date(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(first, FetchError::Status { .. }));
    let requests_after_first = transport.request_count();

    let second = fetcher
        .fetch(&nse_descriptor(), trade_date(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(second, FetchError::CircuitOpen { .. }));
    assert_eq!(
        transport.request_count(),
        requests_after_first,
        "an open circuit must not issue requests"
    );
}

#[tokio::test]
async fn unexpected_404_is_not_found_without_calendar() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    // No scripted response: 404.

    let fetcher = fetcher(transport, dir.path(), 10);
    let err = fetcher
        .fetch(&nse_descriptor(), trade_date(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::NotFound { .. }));
}

#[tokio::test]
async fn client_errors_do_not_retry() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    let url = nse_url(trade_date());
    transport.push(&url, Scripted::Status(403));
    transport.push(&url, Scripted::Status(200));

    let fetcher = fetcher(transport.clone(), dir.path(), 10);
    let err = fetcher
        .fetch(&nse_descriptor(), trade_date(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 403, .. }));
    assert_eq!(transport.request_count(), 1);
}
