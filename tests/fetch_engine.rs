mod common;

use std::sync::Arc;
use std::time::Duration;

use bit_set::BitSet;
use common::{mount, recorder, requested_starts, sample_body, RangeResponder};
use media_downloader_rust::downloader::{FetchOutcome, ReqwestFetcher};
use media_downloader_rust::persistence::{encode_bitmap, fingerprint};
use media_downloader_rust::{DownloadEngine, DownloadEvent, FileProgressStore, ProgressStore};
use tempfile::TempDir;
use wiremock::MockServer;

const PART: usize = 512 * 1024;

fn engine(store: Arc<FileProgressStore>) -> Arc<DownloadEngine> {
    Arc::new(DownloadEngine::new(
        Arc::new(ReqwestFetcher::new().unwrap()),
        store,
        4,
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_writes_exact_bytes_and_reports_monotonic_progress() {
    let server = MockServer::start().await;
    let body = sample_body(6 * PART + 1234);
    let url = mount(&server, "/video.mp4", RangeResponder::new(body.clone())).await;

    let temp = TempDir::new().unwrap();
    let store = Arc::new(FileProgressStore::new(temp.path().join("progress")));
    let engine = engine(store.clone());
    let output = temp.path().join("video.mp4");

    let (listener, events) = recorder();
    let handle = engine.fetch(&url, &output, Some(listener));
    let outcome = tokio::time::timeout(Duration::from_secs(30), handle.wait())
        .await
        .unwrap();

    assert!(matches!(outcome, FetchOutcome::Completed(ref p) if *p == output));
    assert_eq!(std::fs::read(&output).unwrap(), body);
    // 完成后位图被删除
    assert!(store.load(&fingerprint(&url)).is_none());
    assert!(!engine.is_active(&url));

    let events = events.lock().unwrap();
    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            DownloadEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] < w[1]));
    assert!(percents.iter().all(|p| *p <= 99));
    assert!(matches!(events.last(), Some(DownloadEvent::Complete(_))));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_resumes_from_persisted_bitmap() {
    let server = MockServer::start().await;
    // 3 MiB -> 6 个 512 KiB 分片
    let body = sample_body(6 * PART);
    let url = mount(&server, "/audio.m4a", RangeResponder::new(body.clone())).await;

    let temp = TempDir::new().unwrap();
    let store = Arc::new(FileProgressStore::new(temp.path().join("progress")));
    let output = temp.path().join("audio.m4a");

    // 模拟上次进程退出前完成了分片 0 和 1
    let mut partial = vec![0u8; body.len()];
    partial[..2 * PART].copy_from_slice(&body[..2 * PART]);
    std::fs::write(&output, &partial).unwrap();
    let mut bits = BitSet::new();
    bits.insert(0);
    bits.insert(1);
    store.save(&fingerprint(&url), &encode_bitmap(&bits)).unwrap();

    let engine = engine(store.clone());
    let outcome = engine.fetch(&url, &output, None).wait().await;
    assert!(matches!(outcome, FetchOutcome::Completed(_)));
    assert_eq!(std::fs::read(&output).unwrap(), body);

    let starts = requested_starts(&server, "/audio.m4a").await;
    assert_eq!(
        starts,
        (2..6).map(|i| (i * PART) as u64).collect::<Vec<_>>()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bitmap_ignored_when_output_missing() {
    let server = MockServer::start().await;
    let body = sample_body(4 * PART);
    let url = mount(&server, "/clip.mp4", RangeResponder::new(body.clone())).await;

    let temp = TempDir::new().unwrap();
    let store = Arc::new(FileProgressStore::new(temp.path().join("progress")));
    let mut bits = BitSet::new();
    bits.insert(0);
    store.save(&fingerprint(&url), &encode_bitmap(&bits)).unwrap();

    let output = temp.path().join("clip.mp4");
    let outcome = engine(store).fetch(&url, &output, None).wait().await;
    assert!(matches!(outcome, FetchOutcome::Completed(_)));
    assert_eq!(std::fs::read(&output).unwrap(), body);
    assert_eq!(requested_starts(&server, "/clip.mp4").await.first(), Some(&0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_without_ranges_uses_single_request() {
    let server = MockServer::start().await;
    let body = sample_body(PART * 3);
    let url = mount(
        &server,
        "/plain.bin",
        RangeResponder::new(body.clone()).without_ranges(),
    )
    .await;

    let temp = TempDir::new().unwrap();
    let store = Arc::new(FileProgressStore::new(temp.path().join("progress")));
    let output = temp.path().join("plain.bin");
    let outcome = engine(store).fetch(&url, &output, None).wait().await;

    assert!(matches!(outcome, FetchOutcome::Completed(_)));
    assert_eq!(std::fs::read(&output).unwrap(), body);
    let gets = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "GET")
        .count();
    assert_eq!(gets, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_http_error_fails_fetch() {
    let server = MockServer::start().await;
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FileProgressStore::new(temp.path().join("progress")));

    // 没有挂载任何路由，wiremock 返回 404
    let url = format!("{}/missing.mp4", server.uri());
    let (listener, events) = recorder();
    let outcome = engine(store)
        .fetch(&url, temp.path().join("missing.mp4"), Some(listener))
        .wait()
        .await;

    assert!(matches!(outcome, FetchOutcome::Failed(_)));
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], DownloadEvent::Error(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_mid_download_removes_bitmap() {
    let server = MockServer::start().await;
    let body = sample_body(8 * PART);
    let url = mount(
        &server,
        "/slow.mp4",
        RangeResponder::new(body).with_delay(Duration::from_millis(500)),
    )
    .await;

    let temp = TempDir::new().unwrap();
    let store = Arc::new(FileProgressStore::new(temp.path().join("progress")));
    let engine = engine(store.clone());
    let (listener, events) = recorder();
    let handle = engine.fetch(&url, temp.path().join("slow.mp4"), Some(listener));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.cancel(&url));
    assert!(matches!(handle.wait().await, FetchOutcome::Cancelled));
    assert!(store.load(&fingerprint(&url)).is_none());

    // 等迟到的分片响应回来，确认不会再写回位图或补发事件
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(store.load(&fingerprint(&url)).is_none());
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], DownloadEvent::Cancel));
}
