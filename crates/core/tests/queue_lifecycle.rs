mod common;

use std::sync::Arc;
use std::time::Duration;

use arkload_core::api::UploadMetadata;
use arkload_core::config::{MIB, UploadConfig};
use arkload_core::model::{FileStatus, NetworkChangeReason, QueueStatus, UploadEvent, UploadSource};
use arkload_core::network::NetworkMonitor;
use arkload_core::{MemoryKeyValueStore, ProgressManager, SqliteKeyValueStore, UploadQueueService};
use common::{TimedApi, patterned, wait_for};
use tempfile::TempDir;

fn service(
    api: Arc<TimedApi>,
    network: Arc<NetworkMonitor>,
) -> (Arc<UploadQueueService>, ProgressManager) {
    let progress = ProgressManager::new(Arc::new(MemoryKeyValueStore::new()));
    let svc = UploadQueueService::new(&UploadConfig::default(), api, network, progress.clone());
    (svc, progress)
}

fn is_completed(e: &UploadEvent) -> bool {
    matches!(e, UploadEvent::QueueCompleted { .. })
}

#[tokio::test]
async fn queue_completes_once_within_concurrency_bound() {
    let api = Arc::new(TimedApi::new(Duration::from_millis(40)));
    let (svc, progress) = service(api.clone(), Arc::new(NetworkMonitor::default()));
    let mut rx = svc.subscribe();

    let sources = (0..7)
        .map(|i| UploadSource::from_bytes(format!("f{i}.bin"), patterned(1000 + i)))
        .collect();
    svc.add_files(sources, None).await.unwrap();

    wait_for(&mut rx, is_completed).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut extra_completions = 0;
    while let Ok(ev) = rx.try_recv() {
        if is_completed(&ev) {
            extra_completions += 1;
        }
    }
    assert_eq!(extra_completions, 0);
    // wired link: concurrency 3 files, one chunk each
    assert!(api.max_concurrent() <= 3, "{}", api.max_concurrent());
    assert!(api.max_concurrent() >= 2);

    let q = svc.queue().unwrap();
    assert_eq!(q.status, QueueStatus::Completed);
    assert_eq!(q.progress.completed_files, 7);
    assert_eq!(q.progress.uploaded_bytes, q.progress.total_bytes);
    assert_eq!(api.inner.file_count().await, 7);

    let persisted = progress.load_queue(&q.id).await.unwrap();
    assert_eq!(persisted.status, QueueStatus::Completed);
    assert!(progress.load_queue_progress(&q.id).await.is_empty());
}

#[tokio::test]
async fn transient_chunk_errors_do_not_count_as_file_retries() {
    let api = Arc::new(TimedApi::new(Duration::ZERO));
    api.fail_chunk(0, &["connection reset", "connection reset"]);
    let (svc, _) = service(api.clone(), Arc::new(NetworkMonitor::default()));
    let mut rx = svc.subscribe();

    svc.add_files(vec![UploadSource::from_bytes("flaky.bin", patterned(4096))], None)
        .await
        .unwrap();
    wait_for(&mut rx, is_completed).await;

    let q = svc.queue().unwrap();
    assert_eq!(q.files[0].status, FileStatus::Completed);
    assert_eq!(q.files[0].retry_count, 0);
    assert!(q.files[0].error.is_none());
    assert_eq!(api.attempts_for(0).len(), 3);
    assert_eq!(svc.stats().retry.total_attempts, 2);
}

#[tokio::test]
async fn metadata_reaches_init_and_open_session_reports_status() {
    let api = Arc::new(TimedApi::new(Duration::ZERO));
    api.fail_chunk(0, &["http 400 Bad Request: rejected"]);
    let metadata = UploadMetadata {
        description: Some("quarterly report".to_string()),
        tags: Some("finance,q3".to_string()),
        category_id: Some(7),
    };
    let svc = UploadQueueService::with_metadata(
        &UploadConfig::default(),
        api.clone(),
        Arc::new(NetworkMonitor::default()),
        ProgressManager::new(Arc::new(MemoryKeyValueStore::new())),
        Some(metadata),
    );
    let mut rx = svc.subscribe();

    svc.add_files(vec![UploadSource::from_bytes("report.bin", patterned(2048))], None)
        .await
        .unwrap();
    wait_for(&mut rx, is_completed).await;

    let inits = api.inits();
    assert_eq!(inits.len(), 1);
    let (req, session_id) = &inits[0];
    assert_eq!(req.metadata.description.as_deref(), Some("quarterly report"));
    assert_eq!(req.metadata.tags.as_deref(), Some("finance,q3"));
    assert_eq!(req.metadata.category_id, Some(7));

    let status = svc
        .check_upload_status(session_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(status.total_chunks, 1);
    assert!(status.uploaded_chunks.is_empty());
    assert!(!status.completed);

    assert!(svc.check_upload_status("no-such-session").await.is_err());
}

#[tokio::test]
async fn failed_file_is_reported_and_can_be_retried() {
    let api = Arc::new(TimedApi::new(Duration::ZERO));
    api.fail_chunk(0, &["http 400 Bad Request: rejected"]);
    let (svc, _) = service(api.clone(), Arc::new(NetworkMonitor::default()));
    let mut rx = svc.subscribe();

    let ids = svc
        .add_files(vec![UploadSource::from_bytes("bad.bin", patterned(2048))], None)
        .await
        .unwrap();

    let ev = wait_for(&mut rx, |e| matches!(e, UploadEvent::FileError { .. })).await;
    match ev {
        UploadEvent::FileError {
            file_id,
            retry_count,
            error,
            ..
        } => {
            assert_eq!(file_id, ids[0]);
            assert_eq!(retry_count, 1);
            assert!(error.contains("400"), "{error}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    match wait_for(&mut rx, is_completed).await {
        UploadEvent::QueueCompleted {
            completed_files,
            failed_files,
            ..
        } => {
            assert_eq!(completed_files, 0);
            assert_eq!(failed_files, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }

    svc.retry_file(&ids[0]).await.unwrap();
    assert_eq!(svc.queue().unwrap().files[0].status, FileStatus::Pending);
    svc.start_queue().await.unwrap();

    match wait_for(&mut rx, is_completed).await {
        UploadEvent::QueueCompleted {
            completed_files,
            failed_files,
            ..
        } => {
            assert_eq!(completed_files, 1);
            assert_eq!(failed_files, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(api.inner.file_count().await, 1);
}

#[tokio::test]
async fn pause_and_resume_finish_without_duplicating_chunks() {
    let api = Arc::new(TimedApi::new(Duration::from_millis(150)));
    let (svc, _) = service(api.clone(), Arc::new(NetworkMonitor::default()));
    let mut rx = svc.subscribe();

    // 4 chunks of 5 MiB; the first batch of 3 lands, then pause.
    let bytes = patterned(20 * MIB as usize);
    svc.add_files(vec![UploadSource::from_bytes("big.bin", bytes.clone())], None)
        .await
        .unwrap();

    wait_for(&mut rx, |e| matches!(e, UploadEvent::FileProgress { .. })).await;
    svc.pause_queue().await;
    wait_for(&mut rx, |e| matches!(e, UploadEvent::QueuePaused { .. })).await;

    let q = svc.queue().unwrap();
    assert_eq!(q.status, QueueStatus::Paused);
    assert_eq!(q.files[0].status, FileStatus::Paused);
    assert!(q.files[0].error.is_none());
    assert_eq!(q.files[0].retry_count, 0);
    assert!(!svc.is_processing());

    // Let the cancelled attempt settle; nothing may flip the file back.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(svc.queue().unwrap().files[0].status, FileStatus::Paused);

    svc.resume_queue().await.unwrap();
    wait_for(&mut rx, is_completed).await;

    let q = svc.queue().unwrap();
    assert_eq!(q.files[0].status, FileStatus::Completed);
    assert_eq!(q.files[0].uploaded_bytes, bytes.len() as u64);
    for index in 0..3 {
        assert_eq!(api.attempts_for(index).len(), 1, "chunk {index}");
    }
    assert_eq!(api.inner.file_by_name("big.bin").await.unwrap().bytes, bytes);
}

#[tokio::test]
async fn network_loss_pauses_and_restoration_resumes() {
    let api = Arc::new(TimedApi::new(Duration::from_millis(200)));
    let network = Arc::new(NetworkMonitor::default());
    let (svc, _) = service(api.clone(), network.clone());
    let mut rx = svc.subscribe();

    let sources = (0..5)
        .map(|i| UploadSource::from_bytes(format!("n{i}.bin"), patterned(512)))
        .collect();
    svc.add_files(sources, None).await.unwrap();
    wait_for(&mut rx, |e| matches!(e, UploadEvent::QueueStarted { .. })).await;

    network.set_online(false);
    match wait_for(&mut rx, |e| matches!(e, UploadEvent::NetworkChange { .. })).await {
        UploadEvent::NetworkChange { is_online, reason } => {
            assert!(!is_online);
            assert_eq!(reason, NetworkChangeReason::ConnectionLost);
        }
        other => panic!("unexpected event {other:?}"),
    }
    wait_for(&mut rx, |e| matches!(e, UploadEvent::QueuePaused { .. })).await;
    assert_eq!(svc.queue().unwrap().status, QueueStatus::Paused);

    // Resume is refused while still offline.
    svc.resume_queue().await.unwrap();
    assert_eq!(svc.queue().unwrap().status, QueueStatus::Paused);

    network.set_online(true);
    wait_for(&mut rx, is_completed).await;

    let q = svc.queue().unwrap();
    assert_eq!(q.progress.completed_files, 5);
    assert!(q.files.iter().all(|f| f.retry_count == 0));
    assert_eq!(api.inner.file_count().await, 5);
}

#[tokio::test]
async fn restored_queue_resumes_files_added_by_path() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("progress.sqlite");
    let data_path = temp.path().join("report.bin");
    let bytes = patterned(3 * MIB as usize + 17);
    std::fs::write(&data_path, &bytes).unwrap();

    let api = Arc::new(TimedApi::new(Duration::ZERO));

    {
        let network = Arc::new(NetworkMonitor::default());
        network.set_online(false);
        let store = SqliteKeyValueStore::open(&db_path).await.unwrap();
        let progress = ProgressManager::new(Arc::new(store));
        let svc = UploadQueueService::new(&UploadConfig::default(), api.clone(), network, progress);
        let source = UploadSource::from_path(&data_path).await.unwrap();
        svc.add_files(vec![source], Some(&["docs/report.bin".to_string()]))
            .await
            .unwrap();
        assert_eq!(svc.queue().unwrap().status, QueueStatus::Pending);
        svc.shutdown().await;
    }

    let store = SqliteKeyValueStore::open(&db_path).await.unwrap();
    let progress = ProgressManager::new(Arc::new(store));
    let svc = UploadQueueService::new(
        &UploadConfig::default(),
        api.clone(),
        Arc::new(NetworkMonitor::default()),
        progress,
    );
    let restored = svc.restore().await.unwrap();
    assert_eq!(restored.status, QueueStatus::Pending);
    assert_eq!(
        restored.files[0].file.relative_path.as_deref(),
        Some("docs/report.bin")
    );

    let mut rx = svc.subscribe();
    svc.start_queue().await.unwrap();
    wait_for(&mut rx, is_completed).await;

    assert_eq!(api.inner.file_by_name("report.bin").await.unwrap().bytes, bytes);
}

#[tokio::test]
async fn adopted_queue_takes_new_files_instead_of_orphaning_them() {
    let temp = TempDir::new().unwrap();
    let a_path = temp.path().join("a.bin");
    let b_path = temp.path().join("b.bin");
    std::fs::write(&a_path, patterned(300)).unwrap();
    std::fs::write(&b_path, patterned(400)).unwrap();

    let api = Arc::new(TimedApi::new(Duration::ZERO));
    let progress = ProgressManager::new(Arc::new(MemoryKeyValueStore::new()));

    let first_id = {
        let network = Arc::new(NetworkMonitor::default());
        network.set_online(false);
        let svc =
            UploadQueueService::new(&UploadConfig::default(), api.clone(), network, progress.clone());
        let source = UploadSource::from_path(&a_path).await.unwrap();
        svc.add_files(vec![source], None).await.unwrap();
        svc.start_queue().await.unwrap();
        let q = svc.queue().unwrap();
        assert_eq!(q.status, QueueStatus::Paused);
        svc.shutdown().await;
        q.id
    };

    let svc = UploadQueueService::new(
        &UploadConfig::default(),
        api.clone(),
        Arc::new(NetworkMonitor::default()),
        progress.clone(),
    );
    let adopted = svc.restore().await.unwrap();
    assert_eq!(adopted.id, first_id);

    let mut rx = svc.subscribe();
    let source = UploadSource::from_path(&b_path).await.unwrap();
    svc.add_files(vec![source], None).await.unwrap();
    assert_eq!(svc.queue().unwrap().status, QueueStatus::Paused);
    svc.resume_queue().await.unwrap();
    wait_for(&mut rx, is_completed).await;

    let q = svc.queue().unwrap();
    assert_eq!(q.id, first_id);
    assert_eq!(q.progress.completed_files, 2);
    assert_eq!(progress.load_all_queues().await.len(), 1);
    assert_eq!(api.inner.file_count().await, 2);
}
