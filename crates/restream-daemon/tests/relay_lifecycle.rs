#![cfg(unix)]
#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Relay lifecycle tests against real subprocesses.
//!
//! `sh -c <script>` stands in for ffmpeg through the launch prefix. The relay
//! arguments become the script's positional parameters, so `$3` is the
//! source path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use restream_core::config::RelayConfig;
use restream_daemon::relay::{ProcessLauncher, StreamJob, StreamRegistry, StreamStatus};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Sources containing "long" keep running until signalled; others exit 0.
const SELECTIVE_SCRIPT: &str = r#"case "$3" in *long*) exec sleep 30 ;; *) exit 0 ;; esac"#;

fn registry(script: &str) -> StreamRegistry {
    StreamRegistry::new(ProcessLauncher::new(&RelayConfig {
        ffmpeg_bin: PathBuf::from("relay"),
        launch_prefix: vec!["sh".into(), "-c".into(), script.into()],
        ..RelayConfig::default()
    }))
}

/// Poll until `done` holds, recording every status seen.
async fn wait_until(job: &StreamJob, done: impl Fn(StreamStatus) -> bool) -> Vec<StreamStatus> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let status = job.status().await;
        if seen.last() != Some(&status) {
            seen.push(status);
        }
        if done(status) {
            return seen;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out, statuses seen: {seen:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn start_long_running(registry: &StreamRegistry, name: &str) -> Arc<StreamJob> {
    let job = registry
        .create(PathBuf::from(format!("/tmp/{name}-long.mp4")), "abc123".into(), None)
        .await;
    registry.start_async(Arc::clone(&job));
    wait_until(&job, |s| s == StreamStatus::Streaming).await;
    job
}

#[tokio::test]
async fn clean_exit_completes_and_never_returns_to_preparing() {
    let registry = registry("exit 0");
    let job = registry
        .create(PathBuf::from("/tmp/a.mp4"), "abc123".into(), None)
        .await;
    assert_eq!(job.status().await, StreamStatus::Preparing);

    registry.start_async(Arc::clone(&job));
    let seen = wait_until(&job, |s| s.is_terminal()).await;

    assert_eq!(seen.last(), Some(&StreamStatus::Completed));
    assert!(!seen[1..].contains(&StreamStatus::Preparing), "{seen:?}");
    let snap = job.snapshot().await;
    assert!(snap.start_time.is_some());
    assert_eq!(snap.exit_code, Some(0));
    assert!(snap.error.is_none());
}

#[tokio::test]
async fn nonzero_exit_is_error() {
    let registry = registry("echo 'Connection refused' >&2; exit 3");
    let job = registry
        .create(PathBuf::from("/tmp/a.mp4"), "abc123".into(), None)
        .await;
    registry.start_async(Arc::clone(&job));
    wait_until(&job, |s| s.is_terminal()).await;

    let snap = job.snapshot().await;
    assert_eq!(snap.status, StreamStatus::Error);
    assert_eq!(snap.exit_code, Some(3));
    assert!(snap.error.unwrap().starts_with("relay exited with"));
}

#[tokio::test]
async fn missing_executable_is_error_without_start_time() {
    let registry = StreamRegistry::new(ProcessLauncher::new(&RelayConfig {
        ffmpeg_bin: PathBuf::from("/nonexistent/restream-test/ffmpeg"),
        ..RelayConfig::default()
    }));
    let job = registry
        .create(PathBuf::from("/tmp/a.mp4"), "abc123".into(), None)
        .await;
    registry.start_async(Arc::clone(&job)).await.unwrap();

    let snap = job.snapshot().await;
    assert_eq!(snap.status, StreamStatus::Error);
    assert!(snap.start_time.is_none());
    assert!(snap.duration.abs() < f64::EPSILON);
}

#[tokio::test]
async fn stop_moves_streaming_job_to_stopped_and_stays_there() {
    let registry = registry(SELECTIVE_SCRIPT);
    let job = start_long_running(&registry, "stop").await;

    assert!(registry.stop_one(job.id()).await.unwrap());
    assert_eq!(job.status().await, StreamStatus::Stopped);

    // The watcher observes the SIGTERM exit; the status must not flip to error.
    for _ in 0..15 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(job.status().await, StreamStatus::Stopped);
    }
    assert!(!job.stop().await);
}

#[tokio::test]
async fn concurrent_stops_signal_once() {
    let registry = registry(SELECTIVE_SCRIPT);
    let job = start_long_running(&registry, "concurrent").await;

    let (a, b) = tokio::join!(job.stop(), job.stop());
    assert!(a ^ b, "exactly one stop should signal (got {a}, {b})");
    assert_eq!(job.status().await, StreamStatus::Stopped);
}

#[tokio::test]
async fn stop_all_counts_only_streaming_jobs() {
    let registry = registry(SELECTIVE_SCRIPT);
    let streaming = start_long_running(&registry, "all").await;

    let completed = registry
        .create(PathBuf::from("/tmp/short.mp4"), "abc123".into(), None)
        .await;
    registry.start_async(Arc::clone(&completed));
    wait_until(&completed, |s| s.is_terminal()).await;

    let idle = registry
        .create(PathBuf::from("/tmp/idle-long.mp4"), "abc123".into(), None)
        .await;

    let keyless = registry
        .create(PathBuf::from("/tmp/keyless-long.mp4"), String::new(), None)
        .await;
    registry.start_async(Arc::clone(&keyless)).await.unwrap();

    assert_eq!(registry.stop_all().await, 1);
    assert_eq!(streaming.status().await, StreamStatus::Stopped);
    assert_eq!(completed.status().await, StreamStatus::Completed);
    assert_eq!(idle.status().await, StreamStatus::Preparing);
    assert_eq!(keyless.status().await, StreamStatus::Error);

    assert_eq!(registry.stop_all().await, 0);
}

#[tokio::test]
async fn duration_grows_while_streaming() {
    let registry = registry(SELECTIVE_SCRIPT);
    let job = start_long_running(&registry, "duration").await;

    let first = job.snapshot().await.duration;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = job.snapshot().await.duration;
    assert!(first >= 0.0);
    assert!(second > first, "{second} should exceed {first}");

    assert!(job.stop().await);
}
