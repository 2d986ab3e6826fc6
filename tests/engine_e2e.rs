//! End-to-end engine scenarios against the mock NNTP server.

mod common;

use common::{nzb_document, MockNntpServer};
use nzb_connect::config::PostProcessConfig;
use nzb_connect::engine::Engine;
use nzb_connect::nntp::PoolManager;
use nzb_connect::postprocess::PostProcessor;
use nzb_connect::queue::{NewDownload, QueueStore};
use nzb_connect::types::{DownloadId, Status};
use nzb_connect::yenc;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    store: Arc<QueueStore>,
    engine: Engine,
    #[allow(dead_code)]
    pool_manager: Arc<PoolManager>,
    complete_dir: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

/// Wire store, pools, engine, and post-processor against one mock server
async fn harness(server: &MockNntpServer, workers: usize) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(
        QueueStore::open(&dir.path().join("queue.db"))
            .await
            .expect("open store"),
    );

    let pool_manager = Arc::new(PoolManager::new(""));
    pool_manager
        .update_servers(&[server.server_config("mock", 4)])
        .await;

    let incomplete = dir.path().join("incomplete");
    let complete = dir.path().join("complete");
    let engine = Engine::new(pool_manager.clone(), store.clone(), incomplete, workers);

    let post_processor = PostProcessor::new(
        store.clone(),
        complete.clone(),
        PostProcessConfig::default(),
    );
    {
        let post_processor = post_processor.clone();
        engine.on_ready(move |download| post_processor.spawn(download));
    }
    engine.start();

    Harness {
        store,
        engine,
        pool_manager,
        complete_dir: complete,
        _dir: dir,
    }
}

async fn enqueue(harness: &Harness, name: &str, nzb: Vec<u8>) -> DownloadId {
    let plan = nzb_connect::nzb::Nzb::parse(&nzb).expect("valid fixture NZB");
    let id = DownloadId::generate();
    harness
        .store
        .add(&NewDownload {
            id: id.clone(),
            name: name.to_string(),
            category: String::new(),
            total_bytes: plan.total_bytes() as i64,
            total_segments: plan.total_segments() as i64,
            raw_nzb: nzb,
        })
        .await
        .expect("enqueue");
    harness.engine.notify();
    id
}

async fn wait_for<F>(harness: &Harness, id: &DownloadId, timeout: Duration, predicate: F) -> Status
where
    F: Fn(Status) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let download = harness
            .store
            .get(id)
            .await
            .expect("store read")
            .expect("job exists");
        if predicate(download.status()) {
            return download.status();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting; last status {:?}, error '{}'",
            download.status(),
            download.error_msg
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn single_segment_single_file_completes_with_exact_bytes() {
    // One file, one segment carrying "Hello" with a correct CRC
    let server = MockNntpServer::start().await;
    server.add_yenc_article("seg1@test", b"Hello", "hello.txt");

    let harness = harness(&server, 4).await;
    let nzb = nzb_document(&[(r#"job [1/1] - "hello.txt" yEnc (1/1)"#, vec![(1, 5, "seg1@test")])]);
    let id = enqueue(&harness, "hello-job", nzb).await;

    let status = wait_for(&harness, &id, Duration::from_secs(10), |s| s.is_terminal()).await;
    assert_eq!(status, Status::Completed);

    let assembled = tokio::fs::read(harness.complete_dir.join("hello-job/hello.txt"))
        .await
        .expect("assembled file");
    assert_eq!(assembled, b"Hello");

    let finished = harness.store.get(&id).await.unwrap().unwrap();
    assert_eq!(finished.done_segments, 1);
    assert_eq!(finished.downloaded_bytes, 5);
}

#[tokio::test]
async fn multi_segment_file_is_assembled_in_ordinal_order() {
    let server = MockNntpServer::start().await;
    let payload = b"The quick brown fox jumps over the lazy dog".to_vec();
    let (first, second) = payload.split_at(20);
    let total = payload.len() as u64;
    server.add_article(
        "part1@test",
        yenc::encode(first, "fox.bin", 128, Some((1, 2, 1, 20, total))),
    );
    server.add_article(
        "part2@test",
        yenc::encode(second, "fox.bin", 128, Some((2, 2, 21, total, total))),
    );

    let harness = harness(&server, 2).await;
    // Segments listed out of order in the NZB; ordinals drive assembly
    let nzb = nzb_document(&[(
        r#"job - "fox.bin" yEnc (1/2)"#,
        vec![
            (2, second.len() as u64, "part2@test"),
            (1, first.len() as u64, "part1@test"),
        ],
    )]);
    let id = enqueue(&harness, "fox-job", nzb).await;

    let status = wait_for(&harness, &id, Duration::from_secs(10), |s| s.is_terminal()).await;
    assert_eq!(status, Status::Completed);

    let assembled = tokio::fs::read(harness.complete_dir.join("fox-job/fox.bin"))
        .await
        .expect("assembled file");
    assert_eq!(assembled, payload);
}

#[tokio::test]
async fn crc_mismatch_fails_the_job_and_skips_completion() {
    // The second part's pcrc32 does not match its payload
    let server = MockNntpServer::start().await;
    let payload = b"0123456789abcdef".to_vec();
    let (first, second) = payload.split_at(8);
    let total = payload.len() as u64;
    server.add_article(
        "good@test",
        yenc::encode(first, "data.bin", 128, Some((1, 2, 1, 8, total))),
    );

    let mut corrupted = yenc::encode(second, "data.bin", 128, Some((2, 2, 9, total, total)));
    let marker = b"pcrc32=";
    let pos = corrupted
        .windows(marker.len())
        .position(|window| window == marker)
        .expect("trailer has pcrc32")
        + marker.len();
    corrupted[pos] = if corrupted[pos] == b'0' { b'1' } else { b'0' };
    server.add_article("bad@test", corrupted);

    let harness = harness(&server, 2).await;
    let nzb = nzb_document(&[(
        r#"job - "data.bin" yEnc (1/2)"#,
        vec![(1, 8, "good@test"), (2, 8, "bad@test")],
    )]);
    let id = enqueue(&harness, "crc-job", nzb).await;

    let status = wait_for(&harness, &id, Duration::from_secs(10), |s| s.is_terminal()).await;
    assert_eq!(status, Status::Failed);

    let failed = harness.store.get(&id).await.unwrap().unwrap();
    assert!(
        failed.error_msg.contains("CRC"),
        "error was: {}",
        failed.error_msg
    );
    assert!(
        !harness.complete_dir.join("crc-job").exists(),
        "a failed job must not reach the completion directory"
    );
}

#[tokio::test]
async fn missing_article_everywhere_fails_the_job() {
    let server = MockNntpServer::start().await;
    server.fail_article("gone@test", 430);

    let harness = harness(&server, 2).await;
    let nzb = nzb_document(&[(r#"job - "lost.bin" yEnc (1/1)"#, vec![(1, 10, "gone@test")])]);
    let id = enqueue(&harness, "lost-job", nzb).await;

    let status = wait_for(&harness, &id, Duration::from_secs(15), |s| s.is_terminal()).await;
    assert_eq!(status, Status::Failed);

    let failed = harness.store.get(&id).await.unwrap().unwrap();
    assert!(
        failed.error_msg.contains("gone@test"),
        "error should name the article: {}",
        failed.error_msg
    );
}

#[tokio::test]
async fn cancellation_fails_the_job_once_and_freezes_progress() {
    // Cancel while segments are in flight
    let server = MockNntpServer::start().await;
    server.set_delay(Duration::from_millis(150));
    let mut segments = Vec::new();
    for i in 1..=6u32 {
        let id = format!("seg{i}@test");
        server.add_yenc_article(&id, format!("segment {i} data").as_bytes(), "slow.bin");
        segments.push((i, 14u64, id));
    }
    let segment_refs: Vec<(u32, u64, &str)> = segments
        .iter()
        .map(|(n, b, id)| (*n, *b, id.as_str()))
        .collect();

    let harness = harness(&server, 2).await;
    let nzb = nzb_document(&[(r#"job - "slow.bin" yEnc (1/6)"#, segment_refs)]);
    let id = enqueue(&harness, "cancel-job", nzb).await;

    wait_for(&harness, &id, Duration::from_secs(5), |status| {
        status == Status::Downloading
    })
    .await;
    harness.engine.cancel_download(&id).await;

    let status = wait_for(&harness, &id, Duration::from_secs(10), |s| s.is_terminal()).await;
    assert_eq!(status, Status::Failed);

    let cancelled = harness.store.get(&id).await.unwrap().unwrap();
    assert_eq!(cancelled.error_msg, "cancelled by user");

    // No further progress updates after the terminal write
    tokio::time::sleep(Duration::from_millis(600)).await;
    let later = harness.store.get(&id).await.unwrap().unwrap();
    assert_eq!(later.done_segments, cancelled.done_segments);
    assert_eq!(later.downloaded_bytes, cancelled.downloaded_bytes);
    assert_eq!(later.error_msg, "cancelled by user");
}

#[tokio::test]
async fn paused_queue_dispatches_nothing() {
    let server = MockNntpServer::start().await;
    server.add_yenc_article("seg1@test", b"Hello", "hello.txt");

    let harness = harness(&server, 2).await;
    harness.store.set_paused(true);

    let nzb = nzb_document(&[(r#"job - "hello.txt" yEnc (1/1)"#, vec![(1, 5, "seg1@test")])]);
    let id = enqueue(&harness, "paused-job", nzb).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    let download = harness.store.get(&id).await.unwrap().unwrap();
    assert_eq!(download.status(), Status::Queued, "paused queue takes no work");
    assert_eq!(
        server.connections_opened(),
        0,
        "no connections may be opened while paused"
    );
}

#[tokio::test]
async fn pause_mid_job_requeues_and_resume_completes() {
    // A pause lands mid-download, the job drains and is re-queued, and
    // the resume re-downloads it to the end.
    let server = MockNntpServer::start().await;
    server.set_delay(Duration::from_millis(100));
    let mut segments = Vec::new();
    for i in 1..=6u32 {
        let id = format!("p{i}@test");
        server.add_yenc_article(&id, format!("chunk {i}").as_bytes(), "resume.bin");
        segments.push((i, 7u64, id));
    }
    let segment_refs: Vec<(u32, u64, &str)> = segments
        .iter()
        .map(|(n, b, id)| (*n, *b, id.as_str()))
        .collect();

    let harness = harness(&server, 2).await;
    let nzb = nzb_document(&[(r#"job - "resume.bin" yEnc (1/6)"#, segment_refs)]);
    let id = enqueue(&harness, "resume-job", nzb).await;

    wait_for(&harness, &id, Duration::from_secs(5), |status| {
        status == Status::Downloading
    })
    .await;
    harness.store.set_paused(true);

    // The engine drains in-flight fetches and leaves the job for re-queue
    tokio::time::sleep(Duration::from_millis(800)).await;

    harness.store.set_paused(false);
    harness.engine.notify();

    let status = wait_for(&harness, &id, Duration::from_secs(15), |s| s.is_terminal()).await;
    assert_eq!(status, Status::Completed);

    let assembled = tokio::fs::read(harness.complete_dir.join("resume-job/resume.bin"))
        .await
        .expect("assembled file");
    let expected: Vec<u8> = (1..=6)
        .flat_map(|i| format!("chunk {i}").into_bytes())
        .collect();
    assert_eq!(assembled, expected);
}

#[tokio::test]
async fn files_download_sequentially_within_a_job() {
    let server = MockNntpServer::start().await;
    server.add_yenc_article("a1@test", b"first file", "a.bin");
    server.add_yenc_article("b1@test", b"second file", "b.bin");

    let harness = harness(&server, 4).await;
    let nzb = nzb_document(&[
        (r#"job - "a.bin" yEnc (1/1)"#, vec![(1, 10, "a1@test")]),
        (r#"job - "b.bin" yEnc (1/1)"#, vec![(1, 11, "b1@test")]),
    ]);
    let id = enqueue(&harness, "two-files", nzb).await;

    let status = wait_for(&harness, &id, Duration::from_secs(10), |s| s.is_terminal()).await;
    assert_eq!(status, Status::Completed);

    let a = tokio::fs::read(harness.complete_dir.join("two-files/a.bin"))
        .await
        .expect("first file");
    let b = tokio::fs::read(harness.complete_dir.join("two-files/b.bin"))
        .await
        .expect("second file");
    assert_eq!(a, b"first file");
    assert_eq!(b, b"second file");

    let finished = harness.store.get(&id).await.unwrap().unwrap();
    assert_eq!(finished.done_segments, 2);
}
