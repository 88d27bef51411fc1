use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{FileStatus, QueueStatus, UploadProgress, UploadQueue};
use crate::store::KeyValueStore;

const PROGRESS_PREFIX: &str = "progress/";
const QUEUE_PREFIX: &str = "queue/";

fn progress_key(queue_id: &str, file_id: &str) -> String {
    format!("{PROGRESS_PREFIX}{queue_id}-{file_id}")
}

fn queue_key(queue_id: &str) -> String {
    format!("{QUEUE_PREFIX}{queue_id}")
}

fn expiry_cutoff(now: DateTime<Utc>, hours: u64, factor: i64) -> Option<DateTime<Utc>> {
    let hours = i64::try_from(hours).ok()?.checked_mul(factor)?;
    now.checked_sub_signed(TimeDelta::try_hours(hours)?)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStats {
    pub total_queues: u64,
    pub active_queues: u64,
    pub completed_queues: u64,
    pub total_files: u64,
    pub completed_files: u64,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
}

/// Percentages in `0..=100`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCompletion {
    pub files_progress: u8,
    pub bytes_progress: u8,
    /// Unweighted mean of the file and byte fractions.
    pub overall_progress: u8,
}

impl QueueCompletion {
    pub fn of(queue: &UploadQueue) -> Self {
        let completed = queue.count(FileStatus::Completed) as f64;
        let files = if queue.files.is_empty() {
            0.0
        } else {
            completed / queue.files.len() as f64 * 100.0
        };
        let bytes = if queue.progress.total_bytes > 0 {
            queue.progress.uploaded_bytes as f64 / queue.progress.total_bytes as f64 * 100.0
        } else {
            0.0
        };
        Self {
            files_progress: percent(files),
            bytes_progress: percent(bytes),
            overall_progress: percent((files + bytes) / 2.0),
        }
    }
}

fn percent(v: f64) -> u8 {
    v.round().clamp(0.0, 100.0) as u8
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub progress_removed: u64,
    pub queues_removed: u64,
}

/// Durable upload bookkeeping on top of a `KeyValueStore`. Every failure is
/// logged and swallowed; callers never see a persistence error.
#[derive(Clone)]
pub struct ProgressManager {
    store: Arc<dyn KeyValueStore>,
}

impl ProgressManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn save_progress(&self, progress: &UploadProgress) {
        let key = progress_key(&progress.queue_id, &progress.file_id);
        self.put(&key, progress).await;
    }

    pub async fn load_file_progress(&self, queue_id: &str, file_id: &str) -> Option<UploadProgress> {
        self.fetch(&progress_key(queue_id, file_id)).await
    }

    /// Saves a fresh snapshot. `completed_chunks` must be the full set.
    pub async fn update_file_progress(
        &self,
        queue_id: &str,
        file_id: &str,
        completed_chunks: &[String],
        uploaded_bytes: u64,
        total_bytes: u64,
        total_chunks: u32,
    ) {
        let progress = UploadProgress {
            queue_id: queue_id.to_string(),
            file_id: file_id.to_string(),
            completed_chunks: completed_chunks.to_vec(),
            total_chunks,
            uploaded_bytes,
            total_bytes,
            last_updated: Utc::now(),
        };
        self.save_progress(&progress).await;
    }

    pub async fn clear_file_progress(&self, queue_id: &str, file_id: &str) {
        self.remove(&progress_key(queue_id, file_id)).await;
    }

    /// All file checkpoints belonging to `queue_id`.
    pub async fn load_queue_progress(&self, queue_id: &str) -> Vec<UploadProgress> {
        let prefix = format!("{PROGRESS_PREFIX}{queue_id}-");
        let mut out = Vec::new();
        for key in self.list(&prefix).await {
            if let Some(p) = self.fetch::<UploadProgress>(&key).await
                && p.queue_id == queue_id
            {
                out.push(p);
            }
        }
        out
    }

    pub async fn clear_queue_progress(&self, queue_id: &str) {
        for p in self.load_queue_progress(queue_id).await {
            self.clear_file_progress(&p.queue_id, &p.file_id).await;
        }
    }

    /// The most recently updated checkpoint of a queue.
    pub async fn latest_progress(&self, queue_id: &str) -> Option<UploadProgress> {
        self.load_queue_progress(queue_id)
            .await
            .into_iter()
            .max_by_key(|p| p.last_updated)
    }

    /// Persists queue metadata. Chunk bytes and file handles are never written.
    pub async fn save_queue(&self, queue: &UploadQueue) {
        self.put(&queue_key(&queue.id), queue).await;
    }

    pub async fn load_queue(&self, queue_id: &str) -> Option<UploadQueue> {
        self.fetch(&queue_key(queue_id)).await
    }

    pub async fn delete_queue(&self, queue_id: &str) {
        self.remove(&queue_key(queue_id)).await;
    }

    pub async fn load_all_queues(&self) -> Vec<UploadQueue> {
        let mut out = Vec::new();
        for key in self.list(QUEUE_PREFIX).await {
            if let Some(q) = self.fetch::<UploadQueue>(&key).await {
                out.push(q);
            }
        }
        out
    }

    /// Every persisted queue that has not completed.
    pub async fn resume_from_progress(&self) -> Vec<UploadQueue> {
        self.load_all_queues()
            .await
            .into_iter()
            .filter(|q| q.status != QueueStatus::Completed)
            .collect()
    }

    /// Drops checkpoints older than `max_age_hours`, completed queues that
    /// finished before then, and unfinished queues created more than twice
    /// that long ago.
    pub async fn cleanup_expired_progress(&self, max_age_hours: u64) -> CleanupReport {
        self.cleanup_expired_at(max_age_hours, Utc::now()).await
    }

    async fn cleanup_expired_at(&self, max_age_hours: u64, now: DateTime<Utc>) -> CleanupReport {
        // None: the cutoff predates anything chrono can represent, so nothing expires
        let cutoff = expiry_cutoff(now, max_age_hours, 1);
        let unfinished_cutoff = expiry_cutoff(now, max_age_hours, 2);
        let mut report = CleanupReport::default();

        for key in self.list(PROGRESS_PREFIX).await {
            let Some(p) = self.fetch::<UploadProgress>(&key).await else {
                continue;
            };
            if cutoff.is_some_and(|c| p.last_updated < c) {
                self.remove(&key).await;
                report.progress_removed += 1;
            }
        }

        for q in self.load_all_queues().await {
            let expired = match q.completed_at {
                Some(done) => cutoff.is_some_and(|c| done < c),
                None => unfinished_cutoff.is_some_and(|c| q.created_at < c),
            };
            if expired {
                self.delete_queue(&q.id).await;
                report.queues_removed += 1;
            }
        }

        debug!(
            event = "progress.cleanup",
            max_age_hours,
            progress_removed = report.progress_removed,
            queues_removed = report.queues_removed,
            "progress.cleanup"
        );
        report
    }

    pub async fn progress_stats(&self) -> ProgressStats {
        let mut stats = ProgressStats::default();
        for q in self.load_all_queues().await {
            stats.total_queues += 1;
            match q.status {
                QueueStatus::Completed => stats.completed_queues += 1,
                QueueStatus::Running | QueueStatus::Paused => stats.active_queues += 1,
                QueueStatus::Pending => {}
            }
            stats.total_files += q.files.len() as u64;
            stats.completed_files += q.count(FileStatus::Completed) as u64;
            stats.total_bytes += q.progress.total_bytes;
            stats.uploaded_bytes += q.progress.uploaded_bytes;
        }
        stats
    }

    pub fn calculate_file_progress(progress: &UploadProgress) -> u8 {
        if progress.total_chunks == 0 {
            return 0;
        }
        percent(progress.completed_chunks.len() as f64 / progress.total_chunks as f64 * 100.0)
    }

    pub async fn calculate_queue_progress(&self, queue_id: &str) -> QueueCompletion {
        match self.load_queue(queue_id).await {
            Some(q) => QueueCompletion::of(&q),
            None => QueueCompletion::default(),
        }
    }

    async fn put<T: Serialize>(&self, key: &str, value: &T) {
        let text = match serde_json::to_string(value) {
            Ok(t) => t,
            Err(e) => {
                warn!(event = "progress.encode_failed", key, error = %e, "progress.encode_failed");
                return;
            }
        };
        if let Err(e) = self.store.set(key, text).await {
            warn!(event = "progress.save_failed", key, error = %e, "progress.save_failed");
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let text = match self.store.get(key).await {
            Ok(v) => v?,
            Err(e) => {
                warn!(event = "progress.load_failed", key, error = %e, "progress.load_failed");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(event = "progress.decode_failed", key, error = %e, "progress.decode_failed");
                None
            }
        }
    }

    async fn remove(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!(event = "progress.delete_failed", key, error = %e, "progress.delete_failed");
        }
    }

    async fn list(&self, prefix: &str) -> Vec<String> {
        match self.store.keys(prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(event = "progress.list_failed", prefix, error = %e, "progress.list_failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;

    use super::*;
    use crate::model::{QueuedFile, UploadSource};
    use crate::store::MemoryKeyValueStore;
    use crate::{Error, Result};

    fn manager() -> ProgressManager {
        ProgressManager::new(Arc::new(MemoryKeyValueStore::new()))
    }

    fn checkpoint(queue_id: &str, file_id: &str, done: usize, age_hours: i64) -> UploadProgress {
        UploadProgress {
            queue_id: queue_id.to_string(),
            file_id: file_id.to_string(),
            completed_chunks: (0..done).map(|i| format!("c{i}")).collect(),
            total_chunks: 4,
            uploaded_bytes: done as u64 * 10,
            total_bytes: 40,
            last_updated: Utc::now() - chrono::Duration::hours(age_hours),
        }
    }

    #[tokio::test]
    async fn file_progress_point_operations() {
        let m = manager();
        assert!(m.load_file_progress("q", "f").await.is_none());

        let chunks = vec!["a".to_string(), "b".to_string()];
        m.update_file_progress("q", "f", &chunks, 20, 40, 4).await;
        let p = m.load_file_progress("q", "f").await.unwrap();
        assert_eq!(p.completed_chunks, chunks);
        assert_eq!(ProgressManager::calculate_file_progress(&p), 50);

        m.clear_file_progress("q", "f").await;
        assert!(m.load_file_progress("q", "f").await.is_none());
    }

    #[tokio::test]
    async fn queue_progress_is_scoped_by_queue_id() {
        let m = manager();
        m.save_progress(&checkpoint("q1", "a", 1, 2)).await;
        m.save_progress(&checkpoint("q1", "b", 3, 0)).await;
        m.save_progress(&checkpoint("q10", "a", 1, 0)).await;

        assert_eq!(m.load_queue_progress("q1").await.len(), 2);
        assert_eq!(m.latest_progress("q1").await.unwrap().file_id, "b");

        m.clear_queue_progress("q1").await;
        assert!(m.load_queue_progress("q1").await.is_empty());
        assert_eq!(m.load_queue_progress("q10").await.len(), 1);
    }

    fn queue(id: &str, status: QueueStatus, age_hours: i64, completed_age: Option<i64>) -> UploadQueue {
        let mut q = UploadQueue::new(id.to_string(), 3);
        q.status = status;
        q.created_at = Utc::now() - chrono::Duration::hours(age_hours);
        q.completed_at = completed_age.map(|h| Utc::now() - chrono::Duration::hours(h));
        q
    }

    #[tokio::test]
    async fn cleanup_keeps_unfinished_queues_twice_as_long() {
        let m = manager();
        m.save_progress(&checkpoint("q", "old", 1, 30)).await;
        m.save_progress(&checkpoint("q", "new", 1, 1)).await;
        m.save_queue(&queue("done-old", QueueStatus::Completed, 40, Some(30))).await;
        m.save_queue(&queue("done-new", QueueStatus::Completed, 40, Some(1))).await;
        m.save_queue(&queue("paused-30h", QueueStatus::Paused, 30, None)).await;
        m.save_queue(&queue("paused-50h", QueueStatus::Paused, 50, None)).await;

        let report = m.cleanup_expired_progress(24).await;
        assert_eq!(
            report,
            CleanupReport {
                progress_removed: 1,
                queues_removed: 2,
            }
        );
        assert!(m.load_queue("done-new").await.is_some());
        assert!(m.load_queue("paused-30h").await.is_some());
        assert!(m.load_queue("paused-50h").await.is_none());

        let resumable: Vec<String> = m
            .resume_from_progress()
            .await
            .into_iter()
            .map(|q| q.id)
            .collect();
        assert_eq!(resumable, vec!["paused-30h".to_string()]);
    }

    #[tokio::test]
    async fn huge_max_age_expires_nothing() {
        let m = manager();
        m.save_progress(&checkpoint("q", "fresh", 1, 0)).await;
        m.save_queue(&queue("running", QueueStatus::Running, 0, None)).await;
        m.save_queue(&queue("done", QueueStatus::Completed, 1, Some(0))).await;

        for hours in [u64::MAX, 3_000_000_000_000, i64::MAX as u64 / 2 + 1] {
            assert_eq!(m.cleanup_expired_progress(hours).await, CleanupReport::default());
        }
        assert!(m.load_file_progress("q", "fresh").await.is_some());
        assert_eq!(m.load_all_queues().await.len(), 2);
    }

    #[tokio::test]
    async fn stats_and_blended_queue_progress() {
        let m = manager();
        let mut q = queue("q", QueueStatus::Running, 0, None);
        for (i, (size, uploaded, status)) in [
            (100u64, 100u64, FileStatus::Completed),
            (300, 0, FileStatus::Pending),
        ]
        .into_iter()
        .enumerate()
        {
            let mut f = QueuedFile::new(
                format!("f{i}"),
                UploadSource::from_bytes(format!("f{i}.bin"), vec![0; size as usize]),
            );
            f.uploaded_bytes = uploaded;
            f.status = status;
            q.files.push(f);
        }
        q.recompute_progress(Utc::now());
        m.save_queue(&q).await;

        let c = m.calculate_queue_progress("q").await;
        assert_eq!(c.files_progress, 50);
        assert_eq!(c.bytes_progress, 25);
        assert_eq!(c.overall_progress, 38);
        assert_eq!(m.calculate_queue_progress("missing").await, QueueCompletion::default());

        let stats = m.progress_stats().await;
        assert_eq!(stats.total_queues, 1);
        assert_eq!(stats.active_queues, 1);
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.completed_files, 1);
        assert_eq!(stats.total_bytes, 400);
        assert_eq!(stats.uploaded_bytes, 100);
    }

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get<'a>(
            &'a self,
            _key: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
            Box::pin(async {
                Err(Error::Persistence {
                    message: "disk full".to_string(),
                })
            })
        }

        fn set<'a>(
            &'a self,
            _key: &'a str,
            _value: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async {
                Err(Error::Persistence {
                    message: "disk full".to_string(),
                })
            })
        }

        fn delete<'a>(&'a self, _key: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async {
                Err(Error::Persistence {
                    message: "disk full".to_string(),
                })
            })
        }

        fn keys<'a>(
            &'a self,
            _prefix: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>> {
            Box::pin(async {
                Err(Error::Persistence {
                    message: "disk full".to_string(),
                })
            })
        }
    }

    #[tokio::test]
    async fn store_failures_are_swallowed() {
        let m = ProgressManager::new(Arc::new(BrokenStore));
        m.update_file_progress("q", "f", &[], 0, 10, 1).await;
        assert!(m.load_file_progress("q", "f").await.is_none());
        m.save_queue(&UploadQueue::new("q".to_string(), 1)).await;
        assert!(m.resume_from_progress().await.is_empty());
        assert_eq!(m.cleanup_expired_progress(24).await, CleanupReport::default());
    }
}
