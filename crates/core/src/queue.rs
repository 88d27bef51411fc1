use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{SessionStatus, UploadApi, UploadMetadata};
use crate::config::UploadConfig;
use crate::model::{
    FileStatus, NetworkChangeReason, QueueProgress, QueueStatus, QueuedFile, UploadEvent,
    UploadQueue, UploadSource,
};
use crate::network::{NetworkMonitor, NetworkStatus, QualityTier};
use crate::progress::{ProgressManager, QueueCompletion};
use crate::retry::{DEFAULT_STATE_TTL, RetryConfig, RetryManager, RetryStats};
use crate::uploader::{ChunkUploadConfig, ChunkUploader, ProgressSink, UploadOptions, UploadStats};
use crate::{Error, Result};

const IN_FLIGHT_POLL: Duration = Duration::from_millis(1000);
const LOOP_PAUSE: Duration = Duration::from_millis(100);
const RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue: Option<QueueProgress>,
    pub status: Option<QueueStatus>,
    pub completion: QueueCompletion,
    pub network: NetworkStatus,
    pub quality: QualityTier,
    pub uploader: UploadStats,
    pub retry: RetryStats,
}

struct State {
    queue: Option<UploadQueue>,
    /// Bumped every time a file enters `uploading`; stale attempts are ignored.
    attempts: HashMap<String, u64>,
    /// Files whose upload call has not returned yet, including cancelled ones.
    in_flight: HashSet<String>,
}

/// Owns the active upload queue and drives it to completion.
pub struct UploadQueueService {
    state: Mutex<State>,
    uploader: Arc<ChunkUploader>,
    network: Arc<NetworkMonitor>,
    retry: Arc<RetryManager>,
    progress: ProgressManager,
    events: broadcast::Sender<UploadEvent>,
    is_processing: AtomicBool,
    loop_epoch: AtomicU64,
    concurrency: usize,
    metadata: Option<UploadMetadata>,
    shutdown: CancellationToken,
}

impl UploadQueueService {
    /// Builds the service and starts listening for network changes. Must be
    /// called from within a Tokio runtime.
    pub fn new(
        config: &UploadConfig,
        api: Arc<dyn UploadApi>,
        network: Arc<NetworkMonitor>,
        progress: ProgressManager,
    ) -> Arc<Self> {
        Self::with_metadata(config, api, network, progress, None)
    }

    pub fn with_metadata(
        config: &UploadConfig,
        api: Arc<dyn UploadApi>,
        network: Arc<NetworkMonitor>,
        progress: ProgressManager,
        metadata: Option<UploadMetadata>,
    ) -> Arc<Self> {
        let retry = Arc::new(RetryManager::new(RetryConfig::from(config)));
        let uploader = Arc::new(ChunkUploader::new(
            ChunkUploadConfig::from(config),
            api,
            retry.clone(),
            network.clone(),
            progress.clone(),
        ));
        let (events, _) = broadcast::channel(1024);

        let service = Arc::new(Self {
            state: Mutex::new(State {
                queue: None,
                attempts: HashMap::new(),
                in_flight: HashSet::new(),
            }),
            uploader,
            network,
            retry,
            progress,
            events,
            is_processing: AtomicBool::new(false),
            loop_epoch: AtomicU64::new(0),
            concurrency: config.concurrency,
            metadata,
            shutdown: CancellationToken::new(),
        });
        service.spawn_network_listener();
        service
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> Option<UploadQueue> {
        self.lock().queue.as_ref().map(UploadQueue::snapshot)
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        let (progress, status, completion) = {
            let st = self.lock();
            match &st.queue {
                Some(q) => (
                    Some(q.progress.clone()),
                    Some(q.status),
                    QueueCompletion::of(q),
                ),
                None => (None, None, QueueCompletion::default()),
            }
        };
        QueueStats {
            queue: progress,
            status,
            completion,
            network: self.network.status(),
            quality: self.network.connection_quality(),
            uploader: self.uploader.upload_stats(),
            retry: self.retry.retry_stats(),
        }
    }

    /// Asks the server which chunks of an open session it holds.
    pub async fn check_upload_status(&self, session_id: &str) -> Result<SessionStatus> {
        self.uploader.check_upload_status(session_id).await
    }

    /// Adopts the most recently created unfinished queue from the store. A
    /// queue persisted while `running` comes back `paused`; files left
    /// `uploading` come back `pending`. No-op when a queue is already active.
    pub async fn restore(&self) -> Option<UploadQueue> {
        if self.lock().queue.is_some() {
            return None;
        }

        let mut latest = self
            .progress
            .resume_from_progress()
            .await
            .into_iter()
            .max_by_key(|q| q.created_at)?;

        if latest.status == QueueStatus::Running {
            latest.status = QueueStatus::Paused;
        }
        for f in &mut latest.files {
            if f.status == FileStatus::Uploading {
                f.status = FileStatus::Pending;
            }
            f.reattach_handle();
        }
        latest.recompute_progress(Utc::now());

        let snapshot = {
            let mut st = self.lock();
            if st.queue.is_some() {
                return None;
            }
            let snapshot = latest.snapshot();
            st.queue = Some(latest);
            snapshot
        };
        self.progress.save_queue(&snapshot).await;
        info!(
            event = "queue.restored",
            queue_id = %snapshot.id,
            files = snapshot.files.len(),
            status = ?snapshot.status,
            "queue.restored"
        );
        Some(snapshot)
    }

    /// Appends files to the active queue, creating one if needed. Returns the
    /// new file ids. `relative_paths`, when given, is matched by position.
    pub async fn add_files(
        self: &Arc<Self>,
        sources: Vec<UploadSource>,
        relative_paths: Option<&[String]>,
    ) -> Result<Vec<String>> {
        let (snapshot, added) = {
            let mut st = self.lock();
            let queue = st.queue.get_or_insert_with(|| {
                UploadQueue::new(format!("queue-{}", uuid::Uuid::new_v4()), self.concurrency)
            });
            if queue.status == QueueStatus::Completed {
                queue.status = QueueStatus::Pending;
                queue.completed_at = None;
            }

            let mut added = Vec::with_capacity(sources.len());
            for (i, mut source) in sources.into_iter().enumerate() {
                if let Some(rel) = relative_paths.and_then(|p| p.get(i)) {
                    source.meta.relative_path = Some(rel.clone());
                }
                let file = QueuedFile::new(format!("file-{}", uuid::Uuid::new_v4()), source);
                added.push((file.id.clone(), file.file.name.clone(), file.file.size));
                queue.files.push(file);
            }
            queue.recompute_progress(Utc::now());
            (queue.snapshot(), added)
        };

        self.progress.save_queue(&snapshot).await;
        for (file_id, file_name, file_size) in &added {
            self.emit(UploadEvent::FileStarted {
                queue_id: snapshot.id.clone(),
                file_id: file_id.clone(),
                file_name: file_name.clone(),
                file_size: *file_size,
            });
        }
        debug!(
            event = "queue.files_added",
            queue_id = %snapshot.id,
            added = added.len(),
            "queue.files_added"
        );

        if snapshot.status == QueueStatus::Pending && self.network.is_online() {
            self.start_queue().await?;
        }
        Ok(added.into_iter().map(|(id, _, _)| id).collect())
    }

    pub async fn start_queue(self: &Arc<Self>) -> Result<()> {
        if self.lock().queue.is_none() {
            return Err(Error::NoQueue);
        }
        if self
            .is_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(event = "queue.already_processing", "queue.already_processing");
            return Ok(());
        }

        let online = self.network.is_online();
        let snapshot = {
            let mut st = self.lock();
            let Some(queue) = st.queue.as_mut() else {
                self.is_processing.store(false, Ordering::SeqCst);
                return Err(Error::NoQueue);
            };
            if online {
                queue.status = QueueStatus::Running;
                if queue.started_at.is_none() {
                    queue.started_at = Some(Utc::now());
                }
            } else {
                queue.status = QueueStatus::Paused;
                self.is_processing.store(false, Ordering::SeqCst);
            }
            queue.snapshot()
        };
        self.progress.save_queue(&snapshot).await;

        if !online {
            warn!(
                event = "queue.start_deferred_offline",
                queue_id = %snapshot.id,
                "queue.start_deferred_offline"
            );
            return Ok(());
        }

        info!(
            event = "queue.started",
            queue_id = %snapshot.id,
            files = snapshot.files.len(),
            "queue.started"
        );
        self.emit(UploadEvent::QueueStarted {
            queue_id: snapshot.id.clone(),
            total_files: snapshot.files.len() as u64,
        });

        let epoch = self.loop_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(self.clone().process_queue(epoch));
        Ok(())
    }

    pub async fn pause_queue(&self) {
        let snapshot = {
            let mut st = self.lock();
            let Some(queue) = st.queue.as_mut() else {
                return;
            };
            if queue.status != QueueStatus::Running {
                return;
            }
            queue.status = QueueStatus::Paused;
            self.is_processing.store(false, Ordering::SeqCst);
            for f in &mut queue.files {
                if f.status == FileStatus::Uploading {
                    self.uploader.pause_upload(&f.id);
                    f.status = FileStatus::Paused;
                }
            }
            queue.recompute_progress(Utc::now());
            queue.snapshot()
        };

        self.progress.save_queue(&snapshot).await;
        info!(event = "queue.paused", queue_id = %snapshot.id, "queue.paused");
        self.emit(UploadEvent::QueuePaused {
            queue_id: snapshot.id.clone(),
        });
    }

    pub async fn resume_queue(self: &Arc<Self>) -> Result<()> {
        {
            let mut st = self.lock();
            let Some(queue) = st.queue.as_mut() else {
                return Err(Error::NoQueue);
            };
            if queue.status != QueueStatus::Paused {
                return Ok(());
            }
            if !self.network.is_online() {
                warn!(
                    event = "queue.resume_skipped_offline",
                    queue_id = %queue.id,
                    "queue.resume_skipped_offline"
                );
                return Ok(());
            }
            for f in &mut queue.files {
                if f.status == FileStatus::Paused {
                    f.status = FileStatus::Pending;
                }
            }
        }
        self.start_queue().await
    }

    pub async fn remove_file(&self, file_id: &str) {
        let snapshot = {
            let mut st = self.lock();
            st.attempts.remove(file_id);
            let Some(queue) = st.queue.as_mut() else {
                return;
            };
            let Some(pos) = queue.files.iter().position(|f| f.id == file_id) else {
                return;
            };
            if queue.files[pos].status == FileStatus::Uploading {
                self.uploader.cancel_upload(file_id);
            }
            queue.files.remove(pos);
            queue.recompute_progress(Utc::now());
            queue.snapshot()
        };
        self.progress.clear_file_progress(&snapshot.id, file_id).await;
        self.progress.save_queue(&snapshot).await;
    }

    /// Moves a failed file back to `pending`. When the queue is running the
    /// file is started right away.
    pub async fn retry_file(self: &Arc<Self>, file_id: &str) -> Result<()> {
        let snapshot = {
            let mut st = self.lock();
            let Some(queue) = st.queue.as_mut() else {
                return Err(Error::NoQueue);
            };
            let Some(file) = queue.file_mut(file_id) else {
                return Ok(());
            };
            if file.status != FileStatus::Error {
                return Ok(());
            }
            file.status = FileStatus::Pending;
            file.error = None;
            file.retry_count = 0;
            queue.recompute_progress(Utc::now());
            queue.snapshot()
        };
        self.progress.save_queue(&snapshot).await;

        if snapshot.status == QueueStatus::Running {
            tokio::spawn(self.clone().process_file(file_id.to_string()));
        }
        Ok(())
    }

    pub async fn clear_completed(&self) -> usize {
        let (snapshot, removed) = {
            let mut st = self.lock();
            let Some(queue) = st.queue.as_mut() else {
                return 0;
            };
            let removed: Vec<String> = queue
                .files
                .iter()
                .filter(|f| f.status == FileStatus::Completed)
                .map(|f| f.id.clone())
                .collect();
            queue.files.retain(|f| f.status != FileStatus::Completed);
            queue.recompute_progress(Utc::now());
            let snapshot = queue.snapshot();
            for id in &removed {
                st.attempts.remove(id);
            }
            (snapshot, removed)
        };
        for id in &removed {
            self.progress.clear_file_progress(&snapshot.id, id).await;
        }
        self.progress.save_queue(&snapshot).await;
        removed.len()
    }

    /// Pauses running work and stops background tasks.
    pub async fn shutdown(&self) {
        self.pause_queue().await;
        self.shutdown.cancel();
        self.uploader.destroy();
        self.retry.destroy();
        debug!(event = "queue.shutdown", "queue.shutdown");
    }

    async fn process_queue(self: Arc<Self>, epoch: u64) {
        loop {
            if !self.is_processing.load(Ordering::SeqCst)
                || self.loop_epoch.load(Ordering::SeqCst) != epoch
                || self.shutdown.is_cancelled()
            {
                break;
            }

            let (pending, has_incomplete) = {
                let mut guard = self.lock();
                let st = &mut *guard;
                let Some(queue) = st.queue.as_mut() else {
                    break;
                };
                if queue.status != QueueStatus::Running {
                    break;
                }
                // A file left paused by a finished attempt rejoins a running queue.
                for f in &mut queue.files {
                    if f.status == FileStatus::Paused && !st.in_flight.contains(&f.id) {
                        f.status = FileStatus::Pending;
                    }
                }
                let pending: Vec<String> = queue
                    .files
                    .iter()
                    .filter(|f| f.status == FileStatus::Pending && !st.in_flight.contains(&f.id))
                    .map(|f| f.id.clone())
                    .collect();
                let has_incomplete = queue.files.iter().any(|f| {
                    matches!(
                        f.status,
                        FileStatus::Uploading | FileStatus::Pending | FileStatus::Paused
                    )
                });
                (pending, has_incomplete)
            };

            if pending.is_empty() {
                if !has_incomplete {
                    self.complete_queue().await;
                    break;
                }
                if !self.pause_or_shutdown(IN_FLIGHT_POLL).await {
                    break;
                }
                continue;
            }

            if !self.network.is_online() || self.network.should_pause_uploads() {
                warn!(
                    event = "queue.network_unfit",
                    online = self.network.is_online(),
                    quality = ?self.network.connection_quality(),
                    "queue.network_unfit"
                );
                self.pause_queue().await;
                break;
            }

            let n = pending.len().min(self.network.recommended_concurrency().max(1));
            let batch = pending
                .into_iter()
                .take(n)
                .map(|id| self.clone().process_file(id));
            join_all(batch).await;

            if !self.pause_or_shutdown(LOOP_PAUSE).await {
                break;
            }
        }
        debug!(event = "queue.loop_exited", epoch, "queue.loop_exited");
    }

    /// Sleeps for `d`; false when shutdown fired first.
    async fn pause_or_shutdown(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }

    async fn process_file(self: Arc<Self>, file_id: String) {
        let started = {
            let mut st = self.lock();
            if st.in_flight.contains(&file_id) {
                return;
            }
            let attempt = st.attempts.get(&file_id).copied().unwrap_or(0) + 1;
            let Some(queue) = st.queue.as_mut() else {
                return;
            };
            let queue_id = queue.id.clone();
            let Some(file) = queue.file_mut(&file_id) else {
                return;
            };
            if file.status != FileStatus::Pending {
                return;
            }
            file.status = FileStatus::Uploading;
            file.started_at = Some(Utc::now());
            file.error = None;
            let local = file.clone();
            queue.recompute_progress(Utc::now());
            let snapshot = queue.snapshot();
            st.attempts.insert(file_id.clone(), attempt);
            st.in_flight.insert(file_id.clone());
            (queue_id, local, attempt, snapshot)
        };
        let (queue_id, mut local, attempt, snapshot) = started;
        self.progress.save_queue(&snapshot).await;

        let sink = FileProgressSink {
            service: &self,
            queue_id: &queue_id,
            file_id: &file_id,
            attempt,
        };
        let result = self
            .uploader
            .upload_file(
                &mut local,
                &queue_id,
                UploadOptions {
                    progress: Some(&sink),
                    metadata: self.metadata.as_ref(),
                },
            )
            .await;

        let mut event = None;
        let snapshot = {
            let mut st = self.lock();
            st.in_flight.remove(&file_id);
            if st.attempts.get(&file_id) != Some(&attempt) {
                return;
            }
            let Some(queue) = st.queue.as_mut() else {
                return;
            };
            let Some(file) = queue.file_mut(&file_id) else {
                return;
            };
            file.chunks = std::mem::take(&mut local.chunks);
            file.chunk_size = local.chunk_size;
            file.uploaded_bytes = local.uploaded_bytes;

            match result {
                Ok(_) => {
                    file.status = FileStatus::Completed;
                    file.completed_at = Some(Utc::now());
                    file.progress = 100;
                    file.uploaded_bytes = file.file.size;
                    event = Some(UploadEvent::FileCompleted {
                        queue_id: queue_id.clone(),
                        file_id: file_id.clone(),
                        file_name: file.file.name.clone(),
                    });
                }
                Err(Error::Cancelled) => {
                    if file.status == FileStatus::Uploading {
                        file.status = FileStatus::Paused;
                    }
                }
                Err(Error::Offline) => {
                    file.status = FileStatus::Pending;
                    file.error = Some(Error::Offline.to_string());
                }
                Err(e) => {
                    file.status = FileStatus::Error;
                    file.error = Some(e.to_string());
                    file.retry_count += 1;
                    warn!(
                        event = "queue.file_failed",
                        queue_id = %queue_id,
                        file_id = %file_id,
                        code = e.code(),
                        error = %e,
                        retry_count = file.retry_count,
                        "queue.file_failed"
                    );
                    event = Some(UploadEvent::FileError {
                        queue_id: queue_id.clone(),
                        file_id: file_id.clone(),
                        file_name: file.file.name.clone(),
                        error: e.to_string(),
                        retry_count: file.retry_count,
                    });
                }
            }
            queue.recompute_progress(Utc::now());
            queue.snapshot()
        };

        if let Some(ev) = event {
            self.emit(ev);
        }
        self.progress.save_queue(&snapshot).await;
    }

    async fn complete_queue(&self) {
        let snapshot = {
            let mut st = self.lock();
            let Some(queue) = st.queue.as_mut() else {
                return;
            };
            if queue.status != QueueStatus::Running {
                return;
            }
            queue.status = QueueStatus::Completed;
            queue.completed_at = Some(Utc::now());
            self.is_processing.store(false, Ordering::SeqCst);
            queue.recompute_progress(Utc::now());
            queue.snapshot()
        };

        self.progress.save_queue(&snapshot).await;
        info!(
            event = "queue.completed",
            queue_id = %snapshot.id,
            completed = snapshot.progress.completed_files,
            failed = snapshot.progress.failed_files,
            "queue.completed"
        );
        self.emit(UploadEvent::QueueCompleted {
            queue_id: snapshot.id.clone(),
            total_files: snapshot.progress.total_files,
            completed_files: snapshot.progress.completed_files,
            failed_files: snapshot.progress.failed_files,
        });
    }

    fn on_file_progress(&self, queue_id: &str, file_id: &str, attempt: u64, percent: u8, bytes: u64) {
        {
            let mut st = self.lock();
            if st.attempts.get(file_id) != Some(&attempt) {
                return;
            }
            let Some(queue) = st.queue.as_mut() else {
                return;
            };
            let Some(file) = queue.file_mut(file_id) else {
                return;
            };
            if file.status != FileStatus::Uploading {
                return;
            }
            file.progress = percent;
            file.uploaded_bytes = bytes;
            queue.recompute_progress(Utc::now());
        }
        self.emit(UploadEvent::FileProgress {
            queue_id: queue_id.to_string(),
            file_id: file_id.to_string(),
            progress: percent,
            uploaded_bytes: bytes,
        });
    }

    fn spawn_network_listener(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut rx = self.network.subscribe();
        let shutdown = self.shutdown.clone();
        let retry = self.retry.clone();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(RETRY_SWEEP_INTERVAL);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let change = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sweep.tick() => {
                        let removed = retry.cleanup_expired_states(DEFAULT_STATE_TTL);
                        if removed > 0 {
                            debug!(event = "retry.states_swept", removed, "retry.states_swept");
                        }
                        continue;
                    }
                    r = rx.recv() => match r {
                        Ok(c) => c,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                let Some(service) = weak.upgrade() else {
                    break;
                };
                service.handle_network_change(change.is_online, change.reason).await;
            }
        });
    }

    async fn handle_network_change(self: &Arc<Self>, is_online: bool, reason: NetworkChangeReason) {
        self.emit(UploadEvent::NetworkChange { is_online, reason });

        let status = self.lock().queue.as_ref().map(|q| q.status);
        if !is_online {
            if status == Some(QueueStatus::Running) {
                self.pause_queue().await;
            }
        } else if reason == NetworkChangeReason::ConnectionRestored
            && status == Some(QueueStatus::Paused)
            && let Err(e) = self.resume_queue().await
        {
            warn!(event = "queue.auto_resume_failed", error = %e, "queue.auto_resume_failed");
        }
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.events.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct FileProgressSink<'a> {
    service: &'a UploadQueueService,
    queue_id: &'a str,
    file_id: &'a str,
    attempt: u64,
}

impl ProgressSink for FileProgressSink<'_> {
    fn on_progress(&self, percent: u8, uploaded_bytes: u64) {
        self.service
            .on_file_progress(self.queue_id, self.file_id, self.attempt, percent, uploaded_bytes);
    }
}
