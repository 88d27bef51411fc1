pub mod api;
pub mod chunker;
pub mod config;
mod error;
pub mod logging;
pub mod model;
pub mod network;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod store;
pub mod uploader;

pub const APP_NAME: &str = "Arkload";

pub use api::{HttpUploadApi, MemoryUploadApi, UploadApi, UploadMetadata};
pub use config::{Settings, UploadConfig};
pub use error::{Error, Result};
pub use model::{
    FileStatus, QueueStatus, QueuedFile, UploadEvent, UploadProgress, UploadQueue, UploadSource,
};
pub use network::{ConnectivityProbe, HttpConnectivityProbe, NetworkMonitor, NetworkStatus};
pub use progress::ProgressManager;
pub use queue::{QueueStats, UploadQueueService};
pub use retry::{BackoffStrategy, RetryConfig, RetryManager};
pub use store::{KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore};
pub use uploader::{ChunkUploader, ProgressSink, UploadOptions};
