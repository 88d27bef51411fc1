use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunker::{FileChunk, FileHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Uploading,
    Paused,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Running,
    Paused,
    Completed,
}

/// Serializable description of a source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub relative_path: Option<String>,
    /// Set for files added from disk; lets a restored queue reopen the file.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// A file handed to the queue by the caller.
#[derive(Debug, Clone)]
pub struct UploadSource {
    pub meta: FileMeta,
    pub handle: FileHandle,
}

impl UploadSource {
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            meta: FileMeta {
                name: name.into(),
                size: bytes.len() as u64,
                relative_path: None,
                path: None,
            },
            handle: FileHandle::Memory(Arc::new(bytes)),
        }
    }

    pub async fn from_path(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = tokio::fs::canonicalize(path.into()).await?;
        let metadata = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Ok(Self {
            meta: FileMeta {
                name,
                size: metadata.len(),
                relative_path: None,
                path: Some(path.clone()),
            },
            handle: FileHandle::Path(path),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedFile {
    pub id: String,
    pub file: FileMeta,
    #[serde(skip)]
    pub handle: Option<FileHandle>,
    /// Empty until the first upload attempt slices the file.
    #[serde(default)]
    pub chunks: Vec<FileChunk>,
    /// Chunk size the file was sliced with; fixed once `chunks` is populated.
    #[serde(default)]
    pub chunk_size: Option<u64>,
    pub status: FileStatus,
    pub progress: u8,
    pub retry_count: u32,
    pub uploaded_bytes: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueuedFile {
    /// Clone of the file with chunk bytes dropped.
    pub fn without_chunk_data(&self) -> Self {
        Self {
            id: self.id.clone(),
            file: self.file.clone(),
            handle: self.handle.clone(),
            chunks: self.chunks.iter().map(FileChunk::without_data).collect(),
            chunk_size: self.chunk_size,
            status: self.status,
            progress: self.progress,
            retry_count: self.retry_count,
            uploaded_bytes: self.uploaded_bytes,
            error: self.error.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    pub fn new(id: String, source: UploadSource) -> Self {
        Self {
            id,
            file: source.meta,
            handle: Some(source.handle),
            chunks: Vec::new(),
            chunk_size: None,
            status: FileStatus::Pending,
            progress: 0,
            retry_count: 0,
            uploaded_bytes: 0,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Reopens the on-disk handle after deserialization, if the path still exists.
    pub fn reattach_handle(&mut self) {
        if self.handle.is_some() {
            return;
        }
        if let Some(path) = &self.file.path
            && path.is_file()
        {
            self.handle = Some(FileHandle::Path(path.clone()));
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueProgress {
    pub total_files: u64,
    pub completed_files: u64,
    pub failed_files: u64,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    /// Bytes per second since the queue started.
    pub current_speed: f64,
    /// Seconds.
    pub estimated_time_remaining: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQueue {
    pub id: String,
    pub files: Vec<QueuedFile>,
    pub concurrency: usize,
    pub status: QueueStatus,
    pub progress: QueueProgress,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadQueue {
    pub fn new(id: String, concurrency: usize) -> Self {
        Self {
            id,
            files: Vec::new(),
            concurrency,
            status: QueueStatus::Pending,
            progress: QueueProgress::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Clone for persisting and handing out; chunk bytes stay in memory only.
    pub fn snapshot(&self) -> Self {
        Self {
            id: self.id.clone(),
            files: self.files.iter().map(QueuedFile::without_chunk_data).collect(),
            concurrency: self.concurrency,
            status: self.status,
            progress: self.progress.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    pub fn file(&self, file_id: &str) -> Option<&QueuedFile> {
        self.files.iter().find(|f| f.id == file_id)
    }

    pub fn file_mut(&mut self, file_id: &str) -> Option<&mut QueuedFile> {
        self.files.iter_mut().find(|f| f.id == file_id)
    }

    pub fn count(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|f| f.status == status).count()
    }

    /// Recomputes the aggregate counters from the file list.
    pub fn recompute_progress(&mut self, now: DateTime<Utc>) {
        let total_bytes: u64 = self.files.iter().map(|f| f.file.size).sum();
        let uploaded_bytes: u64 = self.files.iter().map(|f| f.uploaded_bytes).sum();
        let completed_files = self.count(FileStatus::Completed) as u64;
        let failed_files = self.count(FileStatus::Error) as u64;

        let p = &mut self.progress;
        p.total_files = self.files.len() as u64;
        p.completed_files = completed_files;
        p.failed_files = failed_files;
        p.total_bytes = total_bytes;
        p.uploaded_bytes = uploaded_bytes;

        if total_bytes > 0 && uploaded_bytes > 0 {
            let elapsed = self
                .started_at
                .map(|t| (now - t).num_milliseconds() as f64 / 1000.0)
                .unwrap_or(0.0);
            if elapsed > 0.0 {
                p.current_speed = uploaded_bytes as f64 / elapsed;
                let remaining = total_bytes.saturating_sub(uploaded_bytes) as f64;
                p.estimated_time_remaining = remaining / p.current_speed;
            }
        }
    }
}

/// Persisted per-(queue, file) checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub queue_id: String,
    pub file_id: String,
    /// Insertion-ordered chunk ids.
    pub completed_chunks: Vec<String>,
    pub total_chunks: u32,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkChangeReason {
    ConnectionRestored,
    ConnectionLost,
    ConnectionQualityChange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UploadEvent {
    #[serde(rename_all = "camelCase")]
    FileStarted {
        queue_id: String,
        file_id: String,
        file_name: String,
        file_size: u64,
    },
    #[serde(rename_all = "camelCase")]
    FileProgress {
        queue_id: String,
        file_id: String,
        progress: u8,
        uploaded_bytes: u64,
    },
    #[serde(rename_all = "camelCase")]
    FileCompleted {
        queue_id: String,
        file_id: String,
        file_name: String,
    },
    #[serde(rename_all = "camelCase")]
    FileError {
        queue_id: String,
        file_id: String,
        file_name: String,
        error: String,
        retry_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    QueueStarted { queue_id: String, total_files: u64 },
    #[serde(rename_all = "camelCase")]
    QueuePaused { queue_id: String },
    #[serde(rename_all = "camelCase")]
    QueueCompleted {
        queue_id: String,
        total_files: u64,
        completed_files: u64,
        failed_files: u64,
    },
    #[serde(rename_all = "camelCase")]
    NetworkChange {
        is_online: bool,
        reason: NetworkChangeReason,
    },
}
