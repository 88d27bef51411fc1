use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::api::{
    ChunkUploadRequest, InitSessionRequest, SessionStatus, UploadApi, UploadMetadata,
};
use crate::chunker::{FileChunk, FileHandle, slice_file};
use crate::config::UploadConfig;
use crate::model::QueuedFile;
use crate::network::NetworkMonitor;
use crate::progress::ProgressManager;
use crate::retry::{BackoffStrategy, RetryManager};
use crate::{Error, Result};

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, percent: u8, uploaded_bytes: u64);
}

#[derive(Default)]
pub struct UploadOptions<'a> {
    pub progress: Option<&'a dyn ProgressSink>,
    pub metadata: Option<&'a UploadMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadConfig {
    pub chunk_size: u64,
    pub concurrency: usize,
    pub timeout_ms: u64,
}

impl From<&UploadConfig> for ChunkUploadConfig {
    fn from(c: &UploadConfig) -> Self {
        Self {
            chunk_size: c.chunk_size,
            concurrency: c.concurrency,
            timeout_ms: c.timeout_ms,
        }
    }
}

/// Server-negotiated session for one upload attempt of one file.
#[derive(Debug, Clone)]
pub struct ChunkSession {
    pub id: String,
    pub file_hash: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    /// Reconciled chunk ids, in insertion order.
    pub completed_chunks: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    /// The server already had the file; no chunk was sent.
    pub existing: bool,
    pub session_id: Option<String>,
    pub file: Option<serde_json::Value>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStats {
    pub active_uploads: usize,
    pub total_retries: u64,
    pub current_config: ChunkUploadConfig,
}

/// Transfers one file chunk by chunk with resume, retry and adaptive tuning.
pub struct ChunkUploader {
    api: Arc<dyn UploadApi>,
    retry: Arc<RetryManager>,
    network: Arc<NetworkMonitor>,
    progress: ProgressManager,
    config: Mutex<ChunkUploadConfig>,
    /// `{queueId}-{fileId}` -> token cancelling the whole file attempt.
    active_files: Mutex<HashMap<String, CancellationToken>>,
    /// `{queueId}-{fileId}-{chunkId}` -> token aborting that transfer.
    active_chunks: Mutex<HashMap<String, CancellationToken>>,
}

impl ChunkUploader {
    pub fn new(
        config: ChunkUploadConfig,
        api: Arc<dyn UploadApi>,
        retry: Arc<RetryManager>,
        network: Arc<NetworkMonitor>,
        progress: ProgressManager,
    ) -> Self {
        Self {
            api,
            retry,
            network,
            progress,
            config: Mutex::new(config),
            active_files: Mutex::new(HashMap::new()),
            active_chunks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> ChunkUploadConfig {
        lock(&self.config).clone()
    }

    /// Uploads `file` and finalizes it on the server. Chunks already
    /// recorded for `(queue_id, file.id)` are not sent again.
    pub async fn upload_file(
        &self,
        file: &mut QueuedFile,
        queue_id: &str,
        options: UploadOptions<'_>,
    ) -> Result<UploadOutcome> {
        if !self.network.is_online() {
            return Err(Error::Offline);
        }
        let tuning = self.adjust_config_for_network();

        let file_key = format!("{queue_id}-{}", file.id);
        let file_cancel = CancellationToken::new();
        lock(&self.active_files).insert(file_key.clone(), file_cancel.clone());

        let result = self
            .run_upload(file, queue_id, &tuning, &file_cancel, &options)
            .await;

        lock(&self.active_files).remove(&file_key);
        if let Err(Error::Cancelled) = &result {
            debug!(event = "upload.file_cancelled", queue_id, file_id = %file.id, "upload.file_cancelled");
        } else if let Err(e) = &result {
            error!(
                event = "upload.file_failed",
                queue_id,
                file_id = %file.id,
                file_name = %file.file.name,
                code = e.code(),
                error = %e,
                "upload.file_failed"
            );
        }
        result
    }

    async fn run_upload(
        &self,
        file: &mut QueuedFile,
        queue_id: &str,
        tuning: &ChunkUploadConfig,
        file_cancel: &CancellationToken,
        options: &UploadOptions<'_>,
    ) -> Result<UploadOutcome> {
        let handle = file.handle.clone();

        if file.chunks.is_empty() && file.file.size > 0 {
            let source = handle.as_ref().ok_or_else(|| Error::SourceUnavailable {
                file_id: file.id.clone(),
            })?;
            let mut chunks = slice_file(
                source,
                &file.id,
                &file.file.name,
                file.file.size,
                tuning.chunk_size,
            )
            .await?;
            if matches!(source, FileHandle::Path(_)) {
                // Disk files are re-read per chunk.
                for c in &mut chunks {
                    c.data = Vec::new();
                }
            }
            file.chunks = chunks;
            file.chunk_size = Some(tuning.chunk_size);
            debug!(
                event = "upload.sliced",
                file_id = %file.id,
                chunks = file.chunks.len(),
                chunk_size = tuning.chunk_size,
                "upload.sliced"
            );
        }
        let chunk_size = file.chunk_size.unwrap_or(tuning.chunk_size);

        let local_completed = self
            .progress
            .load_file_progress(queue_id, &file.id)
            .await
            .map(|p| p.completed_chunks)
            .unwrap_or_default();

        let file_hash = match &handle {
            Some(h) => h.sha256_hex().await?,
            None => {
                return Err(Error::SourceUnavailable {
                    file_id: file.id.clone(),
                });
            }
        };

        let req = InitSessionRequest {
            file_name: file.file.name.clone(),
            file_size: file.file.size,
            file_hash: file_hash.clone(),
            total_chunks: file.chunks.len() as u32,
            chunk_size,
            relative_path: file.file.relative_path.clone(),
            completed_chunks: local_completed.clone(),
            metadata: options.metadata.cloned().unwrap_or_default(),
        };
        let init = self
            .api
            .init_session(&req)
            .await
            .map_err(|e| Error::SessionInit {
                message: e.to_string(),
            })?;

        if init.existing {
            info!(
                event = "upload.already_stored",
                file_id = %file.id,
                file_name = %file.file.name,
                "upload.already_stored"
            );
            self.progress.clear_file_progress(queue_id, &file.id).await;
            file.uploaded_bytes = file.file.size;
            if let Some(sink) = options.progress {
                sink.on_progress(100, file.uploaded_bytes);
            }
            return Ok(UploadOutcome {
                existing: true,
                session_id: None,
                file: init.file,
                message: init.message,
            });
        }

        let session_id = init.session_id.ok_or_else(|| Error::SessionInit {
            message: "server returned no session id".to_string(),
        })?;

        // The server's view wins when it gives one.
        let known: HashSet<&str> = file.chunks.iter().map(|c| c.id.as_str()).collect();
        let mut session = ChunkSession {
            id: session_id,
            file_hash,
            total_chunks: file.chunks.len() as u32,
            chunk_size,
            completed_chunks: Vec::new(),
        };
        for id in init.completed_chunks.unwrap_or(local_completed) {
            if known.contains(id.as_str()) && !session.completed_chunks.contains(&id) {
                session.completed_chunks.push(id);
            }
        }
        drop(known);

        let done: HashSet<String> = session.completed_chunks.iter().cloned().collect();
        let remaining: Vec<usize> = (0..file.chunks.len())
            .filter(|&i| !done.contains(&file.chunks[i].id))
            .collect();

        let total_bytes = file.file.size;
        let mut uploaded_bytes: u64 = file
            .chunks
            .iter()
            .filter(|c| done.contains(&c.id))
            .map(|c| c.size)
            .sum();
        file.uploaded_bytes = uploaded_bytes;
        if uploaded_bytes > 0
            && let Some(sink) = options.progress
        {
            sink.on_progress(percent(uploaded_bytes, total_bytes), uploaded_bytes);
        }

        debug!(
            event = "upload.session_opened",
            queue_id,
            file_id = %file.id,
            session_id = %session.id,
            total_chunks = session.total_chunks,
            completed = session.completed_chunks.len(),
            remaining = remaining.len(),
            "upload.session_opened"
        );

        let concurrency = tuning.concurrency.max(1);
        for batch in remaining.chunks(concurrency) {
            if file_cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let uploads = batch.iter().map(|&i| {
                self.upload_chunk_with_retry(
                    &session.id,
                    queue_id,
                    &file.id,
                    &file.chunks[i],
                    handle.as_ref(),
                    file_cancel,
                    tuning.timeout_ms,
                )
            });
            let results = join_all(uploads).await;

            let mut first_error = None;
            for (&i, result) in batch.iter().zip(results) {
                match result {
                    Ok(()) => {
                        let chunk = &file.chunks[i];
                        session.completed_chunks.push(chunk.id.clone());
                        uploaded_bytes += chunk.size;
                        file.uploaded_bytes = uploaded_bytes;
                        self.progress
                            .update_file_progress(
                                queue_id,
                                &file.id,
                                &session.completed_chunks,
                                uploaded_bytes,
                                total_bytes,
                                session.total_chunks,
                            )
                            .await;
                        if let Some(sink) = options.progress {
                            sink.on_progress(percent(uploaded_bytes, total_bytes), uploaded_bytes);
                        }
                    }
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(match e {
                    Error::Cancelled | Error::Offline => e,
                    other => Error::ChunkUpload {
                        message: other.to_string(),
                    },
                });
            }

            if !self.network.is_online() {
                return Err(Error::Offline);
            }
        }

        let finalized = self
            .api
            .finalize(&session.id)
            .await
            .map_err(|e| Error::Finalize {
                message: e.to_string(),
            })?;
        self.progress.clear_file_progress(queue_id, &file.id).await;

        info!(
            event = "upload.file_finalized",
            queue_id,
            file_id = %file.id,
            file_name = %file.file.name,
            bytes = total_bytes,
            "upload.file_finalized"
        );
        Ok(UploadOutcome {
            existing: false,
            session_id: Some(session.id),
            file: finalized.file,
            message: finalized.message,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_chunk_with_retry(
        &self,
        session_id: &str,
        queue_id: &str,
        file_id: &str,
        chunk: &FileChunk,
        handle: Option<&FileHandle>,
        file_cancel: &CancellationToken,
        timeout_ms: u64,
    ) -> Result<()> {
        let task_id = format!("{queue_id}-{file_id}-{}", chunk.id);
        let cancel = file_cancel.child_token();
        lock(&self.active_chunks).insert(task_id.clone(), cancel.clone());

        let result = self
            .retry
            .retry(&task_id, BackoffStrategy::Exponential, || {
                self.upload_chunk(session_id, chunk, handle, &cancel, timeout_ms)
            })
            .await;

        lock(&self.active_chunks).remove(&task_id);
        if let Err(e) = &result {
            debug!(
                event = "upload.chunk_failed",
                task_id = %task_id,
                chunk_index = chunk.index,
                error = %e,
                "upload.chunk_failed"
            );
        }
        result
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        chunk: &FileChunk,
        handle: Option<&FileHandle>,
        cancel: &CancellationToken,
        timeout_ms: u64,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let data = if chunk.has_data() {
            chunk.data.clone()
        } else {
            let handle = handle.ok_or_else(|| Error::SourceUnavailable {
                file_id: chunk.file_id.clone(),
            })?;
            handle.read_range(chunk.offset, chunk.size).await?
        };

        let req = ChunkUploadRequest {
            session_id: session_id.to_string(),
            chunk_index: chunk.index,
            chunk_hash: chunk.hash.clone(),
            data,
        };

        let timeout = Duration::from_millis(timeout_ms);
        let res = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = tokio::time::timeout(timeout, self.api.upload_chunk(req)) => r,
        };
        let res = res.map_err(|_| Error::Timeout)??;
        if !res.success {
            return Err(Error::Http {
                message: format!("chunk {} rejected by server", chunk.index),
            });
        }
        Ok(())
    }

    pub async fn check_upload_status(&self, session_id: &str) -> Result<SessionStatus> {
        self.api.status(session_id).await
    }

    /// Aborts in-flight transfers and pending retries of every task whose id
    /// contains `file_id`. Returns immediately.
    pub fn cancel_upload(&self, file_id: &str) {
        let mut cancelled = 0usize;
        for (key, token) in lock(&self.active_files).iter() {
            if key.contains(file_id) {
                token.cancel();
                cancelled += 1;
            }
        }
        for (key, token) in lock(&self.active_chunks).iter() {
            if key.contains(file_id) {
                token.cancel();
            }
        }
        let retries = self.retry.cancel_matching(file_id);
        debug!(
            event = "upload.cancelled",
            file_id,
            files = cancelled,
            retries,
            "upload.cancelled"
        );
    }

    /// Chunk transfers cannot be frozen; pausing cancels and the next
    /// attempt resumes from the persisted checkpoint.
    pub fn pause_upload(&self, file_id: &str) {
        self.cancel_upload(file_id);
    }

    pub fn upload_stats(&self) -> UploadStats {
        UploadStats {
            active_uploads: lock(&self.active_chunks).len(),
            total_retries: self.retry.retry_stats().total_attempts,
            current_config: self.config(),
        }
    }

    pub fn destroy(&self) {
        for token in lock(&self.active_files).values() {
            token.cancel();
        }
        for token in lock(&self.active_chunks).values() {
            token.cancel();
        }
    }

    fn adjust_config_for_network(&self) -> ChunkUploadConfig {
        let chunk_size = self.network.recommended_chunk_size();
        let concurrency = self.network.recommended_concurrency();
        let mut config = lock(&self.config);
        if config.chunk_size != chunk_size || config.concurrency != concurrency {
            debug!(
                event = "upload.retuned",
                old_chunk_size = config.chunk_size,
                chunk_size,
                old_concurrency = config.concurrency,
                concurrency,
                "upload.retuned"
            );
            config.chunk_size = chunk_size;
            config.concurrency = concurrency;
        }
        config.clone()
    }
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
