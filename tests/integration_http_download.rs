//! Integration test: real HTTP transfers against a local range-capable server,
//! driven through the public `DownloadManager` API.

mod common;

use common::range_server::{self, RangeServerOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taper::prelude::*;
use tempfile::{tempdir, TempDir};

fn body() -> Vec<u8> {
    (0..5000u32).map(|i| (i % 251) as u8).collect()
}

struct Setup {
    _dir: TempDir,
    manager: DownloadManager,
}

async fn setup() -> Setup {
    let dir = tempdir().unwrap();
    let store = StateManager::new(&dir.path().join("state/jobs.db")).await.unwrap();
    let client = HttpClient::with_client(
        reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap(),
    );
    let config = EngineConfig {
        backoff_base_secs: 0,
        backoff_max_secs: 0,
        checkpoint_interval_ms: 50,
        stall_timeout_secs: 5,
        min_free_storage_bytes: 0,
        ..EngineConfig::default()
    };
    let manager = DownloadManager::new(
        Arc::new(store),
        Arc::new(client),
        Arc::new(ManualConstraints::default()),
        config,
        dir.path().join("downloads"),
    );
    Setup { _dir: dir, manager }
}

async fn wait_for(manager: &DownloadManager, job_id: &str, status: JobStatus) -> DownloadJob {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let job = manager.get_job(job_id).await.unwrap().expect("job exists");
        if job.status == status {
            return job;
        }
        assert!(Instant::now() < deadline, "job stuck in {:?}", job.status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn download_completes_and_file_matches() {
    let server = range_server::start(body());
    let s = setup().await;
    let ids = s
        .manager
        .enqueue("rec-1", vec![FileRequest::new("track01.flac", server.url.clone())], 0)
        .await
        .unwrap();

    s.manager.dispatch_now().await.unwrap();
    let job = wait_for(&s.manager, &ids[0], JobStatus::Completed).await;

    assert_eq!(job.total_bytes, 5000);
    assert_eq!(std::fs::read(&job.local_path).unwrap(), body());
    assert!(job.local_path.ends_with("rec-1/track01.flac"));
    assert_eq!(
        s.manager.get_status("rec-1").await.unwrap(),
        RecordingDownloadStatus::Downloaded
    );
    assert_eq!(*server.requests.lock().unwrap(), vec![None]);
}

#[tokio::test]
async fn dropped_connection_resumes_with_range_request() {
    let server = range_server::start_with_options(
        body(),
        RangeServerOptions {
            truncate_first: Some(1000),
            ..RangeServerOptions::default()
        },
    );
    let s = setup().await;
    let ids = s
        .manager
        .enqueue("rec-2", vec![FileRequest::new("a.bin", server.url.clone())], 0)
        .await
        .unwrap();

    s.manager.dispatch_now().await.unwrap();
    let failed = wait_for(&s.manager, &ids[0], JobStatus::Failed).await;
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.bytes_downloaded, 1000);
    assert_eq!(std::fs::metadata(failed.temporary_path()).unwrap().len(), 1000);

    // Zero backoff: the next dispatch re-queues and restarts it.
    tokio::time::sleep(Duration::from_millis(5)).await;
    s.manager.dispatch_now().await.unwrap();
    let done = wait_for(&s.manager, &ids[0], JobStatus::Completed).await;
    assert_eq!(std::fs::read(&done.local_path).unwrap(), body());
    assert_eq!(*server.requests.lock().unwrap(), vec![None, Some(1000)]);
}

#[tokio::test]
async fn server_without_range_support_restarts_from_zero() {
    let server = range_server::start_with_options(
        body(),
        RangeServerOptions {
            support_ranges: false,
            ..RangeServerOptions::default()
        },
    );
    let s = setup().await;
    let file = FileRequest::new("a.bin", server.url.clone());
    let ids = s.manager.enqueue("rec-3", vec![file], 0).await.unwrap();

    let job = s.manager.get_job(&ids[0]).await.unwrap().unwrap();
    std::fs::create_dir_all(job.local_path.parent().unwrap()).unwrap();
    std::fs::write(job.temporary_path(), vec![0xFFu8; 300]).unwrap();

    s.manager.dispatch_now().await.unwrap();
    let done = wait_for(&s.manager, &ids[0], JobStatus::Completed).await;
    assert_eq!(std::fs::read(&done.local_path).unwrap(), body());
    assert_eq!(*server.requests.lock().unwrap(), vec![Some(300)]);
}

#[tokio::test]
async fn missing_file_fails_permanently() {
    let server = range_server::start_with_options(
        body(),
        RangeServerOptions {
            fail_status: Some(404),
            ..RangeServerOptions::default()
        },
    );
    let s = setup().await;
    let ids = s
        .manager
        .enqueue("rec-4", vec![FileRequest::new("gone.flac", server.url.clone())], 0)
        .await
        .unwrap();

    s.manager.dispatch_now().await.unwrap();
    let failed = wait_for(&s.manager, &ids[0], JobStatus::Failed).await;
    assert_eq!(failed.retry_count, 5);
    assert_eq!(
        s.manager.get_status("rec-4").await.unwrap(),
        RecordingDownloadStatus::Failed {
            message: "HTTP 404".to_string()
        }
    );

    // Terminal: further dispatch cycles never pick it up again.
    s.manager.dispatch_now().await.unwrap();
    assert_eq!(server.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn checksum_is_verified_before_completion() {
    let server = range_server::start(b"abc".to_vec());
    let s = setup().await;
    let mut file = FileRequest::new("abc.txt", server.url.clone());
    file.sha256 = Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into());
    let ids = s.manager.enqueue("rec-5", vec![file], 0).await.unwrap();

    s.manager.dispatch_now().await.unwrap();
    let done = wait_for(&s.manager, &ids[0], JobStatus::Completed).await;
    assert_eq!(std::fs::read(&done.local_path).unwrap(), b"abc");
}
