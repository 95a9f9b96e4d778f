//! End-to-end tests for the concurrent range engine against a mock origin.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer};

use gust_core::{ConcurrentDownloader, GustError, LimiterRegistry, ProgressState};
use gust_types::{ChunkState, EngineEvent, Phase, RuntimeConfig};

use support::{random_body, RangeResponder, RateLimitedResponder};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

fn runtime(connections: u32, min_chunk: u64) -> RuntimeConfig {
    RuntimeConfig {
        max_connections_per_host: connections,
        min_chunk_size: min_chunk,
        request_timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    }
}

fn downloader(
    id: &str,
    state: Arc<ProgressState>,
    runtime: RuntimeConfig,
) -> ConcurrentDownloader {
    ConcurrentDownloader::new(id, None, state, runtime)
        .expect("downloader")
        .with_registry(Arc::new(LimiterRegistry::new()))
}

#[tokio::test]
async fn downloads_ranged_resource_in_parallel() {
    let body = random_body(MIB);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("temp dir");
    let dest = dir.path().join("test_download.bin");
    let state = Arc::new(ProgressState::new("test-id", MIB as u64));
    let (event_tx, mut events) = tokio::sync::broadcast::channel(16);

    let dl = downloader("test-id", state.clone(), runtime(4, 64 * KIB as u64))
        .with_events(event_tx);

    // Poll the counter at UI cadence while the transfer runs; it must
    // never go backwards.
    let poller_state = state.clone();
    let poll_stop = CancellationToken::new();
    let poller = {
        let stop = poll_stop.clone();
        tokio::spawn(async move {
            let mut samples = Vec::new();
            while !stop.is_cancelled() {
                samples.push(poller_state.downloaded());
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            samples
        })
    };

    let url = format!("{}/test_download.bin", server.uri());
    dl.download(CancellationToken::new(), &url, &dest, MIB as u64, false)
        .await
        .expect("download");
    poll_stop.cancel();

    let written = tokio::fs::read(&dest).await.expect("read result");
    assert_eq!(written.len(), MIB);
    assert_eq!(written, body, "downloaded bytes must match the source");
    assert_eq!(state.downloaded(), MIB as u64);
    assert_eq!(state.phase(), Phase::Completed);

    let chunks = state.chunks();
    assert_eq!(chunks.len(), 4);
    assert!(chunks.iter().all(|c| c.state == ChunkState::Done));

    // The partial file was renamed away.
    let partial = dir.path().join("test_download.bin.gust");
    assert!(!partial.exists());

    let samples = poller.await.expect("poller");
    assert!(
        samples.windows(2).all(|w| w[0] <= w[1]),
        "downloaded counter must be monotonically non-decreasing"
    );

    match events.try_recv().expect("started event") {
        EngineEvent::Started { id, total, .. } => {
            assert_eq!(id, "test-id");
            assert_eq!(total, MIB as u64);
        }
        other => panic!("expected Started, got {other:?}"),
    }
    assert!(matches!(
        events.try_recv().expect("completed event"),
        EngineEvent::Completed { .. }
    ));
}

#[tokio::test]
async fn yields_to_single_stream_for_small_files() {
    let body = random_body(64 * KIB);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("temp dir");
    let dest = dir.path().join("small.bin");
    let state = Arc::new(ProgressState::new("small-id", body.len() as u64));

    // Default 1 MiB minimum chunk: a 64 KiB file is not worth splitting.
    let dl = downloader("small-id", state.clone(), RuntimeConfig::default());
    let url = format!("{}/small.bin", server.uri());
    dl.download(CancellationToken::new(), &url, &dest, body.len() as u64, false)
        .await
        .expect("download");

    assert_eq!(tokio::fs::read(&dest).await.expect("read"), body);
    assert_eq!(state.downloaded(), body.len() as u64);
    assert_eq!(state.phase(), Phase::Completed);
    assert!(state.chunks().is_empty(), "single-stream path plans no chunks");
}

#[tokio::test]
async fn per_request_latency_does_not_break_the_transfer() {
    let body = random_body(64 * KIB);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            RangeResponder::new(body.clone()).with_delay(Duration::from_millis(100)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("temp dir");
    let dest = dir.path().join("latency.bin");
    let state = Arc::new(ProgressState::new("latency-id", body.len() as u64));
    let dl = downloader("latency-id", state.clone(), runtime(2, 16 * KIB as u64));

    let start = Instant::now();
    let url = format!("{}/latency.bin", server.uri());
    dl.download(CancellationToken::new(), &url, &dest, body.len() as u64, false)
        .await
        .expect("download");

    assert!(
        start.elapsed() >= Duration::from_millis(100),
        "latency was not applied"
    );
    assert_eq!(tokio::fs::read(&dest).await.expect("read"), body);
}

#[tokio::test]
async fn retries_chunks_after_a_429() {
    let body = random_body(64 * KIB);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(RateLimitedResponder::new(
            RangeResponder::new(body.clone()),
            1,
            "1",
        ))
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("temp dir");
    let dest = dir.path().join("limited.bin");
    let state = Arc::new(ProgressState::new("limited-id", body.len() as u64));
    let registry = Arc::new(LimiterRegistry::new());

    let dl = ConcurrentDownloader::new(
        "limited-id",
        None,
        state.clone(),
        runtime(2, 16 * KIB as u64),
    )
    .expect("downloader")
    .with_registry(registry.clone());

    let start = Instant::now();
    let url = format!("{}/limited.bin", server.uri());
    dl.download(CancellationToken::new(), &url, &dest, body.len() as u64, false)
        .await
        .expect("download should survive a 429");

    // The limiter slept out roughly the advertised second before retrying.
    assert!(
        start.elapsed() >= Duration::from_millis(850),
        "expected a Retry-After sleep, finished in {:?}",
        start.elapsed()
    );
    assert_eq!(tokio::fs::read(&dest).await.expect("read"), body);
    assert_eq!(state.downloaded(), body.len() as u64);
    assert_eq!(registry.active_hosts(), 1);
}

#[tokio::test]
async fn resume_skips_completed_chunks() {
    let total = 256 * KIB;
    let body = random_body(total);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("temp dir");
    let dest = dir.path().join("resume.bin");
    let partial = dir.path().join("resume.bin.gust");

    let config = runtime(4, 32 * KIB as u64);
    let mut chunks = gust_core::plan_chunks(total as u64, &config);
    assert_eq!(chunks.len(), 4);

    // First chunk already on disk from an earlier session.
    let first_size = chunks[0].size() as usize;
    let mut seeded = vec![0u8; total];
    seeded[..first_size].copy_from_slice(&body[..first_size]);
    tokio::fs::write(&partial, &seeded).await.expect("seed partial");
    chunks[0].bytes_written = first_size as u64;
    chunks[0].state = ChunkState::Done;

    let state = Arc::new(ProgressState::new("resume-id", total as u64));
    state.set_chunks(chunks);

    let dl = downloader("resume-id", state.clone(), config);
    let url = format!("{}/resume.bin", server.uri());
    dl.download(CancellationToken::new(), &url, &dest, total as u64, true)
        .await
        .expect("resume download");

    assert_eq!(tokio::fs::read(&dest).await.expect("read"), body);
    assert_eq!(state.downloaded(), total as u64);

    // The finished chunk was never requested again.
    let requests = server.received_requests().await.expect("recording");
    let first_range = format!("bytes=0-{}", first_size - 1);
    assert!(
        !requests.iter().any(|r| {
            r.headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == first_range)
        }),
        "completed chunk must not be re-downloaded"
    );
}

#[tokio::test]
async fn cancellation_leaves_the_partial_file() {
    let body = random_body(MIB);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            RangeResponder::new(body.clone()).with_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("temp dir");
    let dest = dir.path().join("cancelled.bin");
    let state = Arc::new(ProgressState::new("cancel-id", MIB as u64));
    let dl = downloader("cancel-id", state.clone(), runtime(4, 64 * KIB as u64));

    let cancel = CancellationToken::new();
    let url = format!("{}/cancelled.bin", server.uri());
    let task = {
        let cancel = cancel.clone();
        let dest = dest.clone();
        tokio::spawn(async move { dl.download(cancel, &url, &dest, MIB as u64, false).await })
    };

    tokio::time::sleep(Duration::from_millis(450)).await;
    cancel.cancel();
    let result = task.await.expect("join");

    assert!(matches!(result, Err(GustError::Cancelled)));
    assert_eq!(state.phase(), Phase::Failed);
    assert!(
        dir.path().join("cancelled.bin.gust").exists(),
        "partial file must survive cancellation"
    );
    assert!(!dest.exists());
}

#[tokio::test]
async fn pause_cancellation_parks_the_download() {
    let body = random_body(MIB);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            RangeResponder::new(body.clone()).with_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("temp dir");
    let dest = dir.path().join("paused.bin");
    let state = Arc::new(ProgressState::new("pause-id", MIB as u64));
    let dl = downloader("pause-id", state.clone(), runtime(4, 64 * KIB as u64));
    let pause = dl.pause_flag();

    let cancel = CancellationToken::new();
    let url = format!("{}/paused.bin", server.uri());
    let task = {
        let cancel = cancel.clone();
        let dest = dest.clone();
        tokio::spawn(async move { dl.download(cancel, &url, &dest, MIB as u64, false).await })
    };

    tokio::time::sleep(Duration::from_millis(450)).await;
    pause.store(true, std::sync::atomic::Ordering::Release);
    cancel.cancel();
    let result = task.await.expect("join");

    assert!(matches!(result, Err(GustError::Cancelled)));
    assert_eq!(state.phase(), Phase::Paused);
    assert!(dir.path().join("paused.bin.gust").exists());
}

#[tokio::test]
async fn missing_resource_fails_without_retry() {
    let server = MockServer::start().await;
    // No mounts: every request 404s.

    let dir = TempDir::new().expect("temp dir");
    let dest = dir.path().join("missing.bin");
    let state = Arc::new(ProgressState::new("missing-id", 0));
    let dl = downloader("missing-id", state.clone(), RuntimeConfig::default());

    let url = format!("{}/missing.bin", server.uri());
    let result = dl
        .download(CancellationToken::new(), &url, &dest, 0, false)
        .await;

    assert!(matches!(result, Err(GustError::Status { status: 404, .. })));
    assert_eq!(state.phase(), Phase::Failed);
    assert!(!dest.exists());
}
