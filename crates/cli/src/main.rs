use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arkload_core::config::{self, Settings};
use arkload_core::model::{QueueStatus, UploadEvent};
use arkload_core::network::{HttpConnectivityProbe, NetworkMonitor};
use arkload_core::{
    APP_NAME, HttpUploadApi, ProgressManager, SqliteKeyValueStore, UploadMetadata,
    UploadQueueService, UploadSource,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "arkload")]
#[command(about = "Arkload CLI (resumable chunked uploads)", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue files and upload them.
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Directory that relative paths are computed against.
        #[arg(long)]
        base: Option<PathBuf>,
        #[arg(long)]
        description: Option<String>,
        /// Comma-separated tags.
        #[arg(long)]
        tags: Option<String>,
        #[arg(long)]
        category_id: Option<u64>,
    },
    /// Restore the persisted queue and continue it.
    Resume,
    Status,
    /// Ask the server which chunks of an upload session it holds.
    SessionStatus { session_id: String },
    Cleanup {
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
    ClearCompleted,
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    Init,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }
}

impl From<arkload_core::Error> for CliError {
    fn from(e: arkload_core::Error) -> Self {
        let retryable = matches!(
            e,
            arkload_core::Error::Offline | arkload_core::Error::Timeout
        ) || arkload_core::retry::should_retry(&e.to_string());
        Self {
            code: e.code(),
            message: e.to_string(),
            details: serde_json::json!({}),
            retryable,
        }
    }
}

struct Runtime {
    service: Arc<UploadQueueService>,
    probe_cancel: CancellationToken,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    arkload_core::logging::init_logging(cli.json);
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("ARKLOAD_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("ARKLOAD_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);

    match cli.cmd {
        Command::Upload {
            paths,
            base,
            description,
            tags,
            category_id,
        } => {
            let metadata = (description.is_some() || tags.is_some() || category_id.is_some())
                .then(|| UploadMetadata {
                    description,
                    tags,
                    category_id,
                });
            upload(&config_dir, &data_dir, paths, base, metadata, cli.json).await
        }
        Command::Resume => resume(&config_dir, &data_dir, cli.json).await,
        Command::Status => status(&config_dir, &data_dir, cli.json).await,
        Command::SessionStatus { session_id } => {
            session_status(&config_dir, &data_dir, &session_id, cli.json).await
        }
        Command::Cleanup { max_age_hours } => {
            cleanup(&config_dir, &data_dir, max_age_hours, cli.json).await
        }
        Command::ClearCompleted => clear_completed(&config_dir, &data_dir, cli.json).await,
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json),
            SettingsCmd::Init => settings_init(&config_dir, cli.json),
        },
    }
}

async fn upload(
    config_dir: &Path,
    data_dir: &Path,
    paths: Vec<PathBuf>,
    base: Option<PathBuf>,
    metadata: Option<UploadMetadata>,
    json: bool,
) -> Result<(), CliError> {
    let settings = config::load_settings(config_dir)?;
    let mut sources = Vec::with_capacity(paths.len());
    let mut relative_paths = Vec::with_capacity(paths.len());
    for path in paths {
        let source = UploadSource::from_path(&path).await?;
        let rel = base
            .as_deref()
            .and_then(|b| path.strip_prefix(b).ok())
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|| source.meta.name.clone());
        relative_paths.push(rel);
        sources.push(source);
    }

    let rt = open_runtime(&settings, data_dir, metadata).await?;
    if let Some(adopted) = rt.service.restore().await {
        info!(
            event = "cli.queue_adopted",
            queue_id = %adopted.id,
            files = adopted.files.len(),
            "cli.queue_adopted"
        );
    }
    let mut events = rt.service.subscribe();
    let ids = rt.service.add_files(sources, Some(&relative_paths)).await?;
    info!(event = "cli.files_queued", files = ids.len(), "cli.files_queued");
    continue_queue(&rt).await?;

    drive(&rt, &mut events, json).await
}

async fn resume(config_dir: &Path, data_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = config::load_settings(config_dir)?;
    let rt = open_runtime(&settings, data_dir, None).await?;
    if rt.service.restore().await.is_none() {
        rt.probe_cancel.cancel();
        return Err(CliError::new("queue.missing", "no unfinished queue to resume"));
    }

    let mut events = rt.service.subscribe();
    continue_queue(&rt).await?;
    drive(&rt, &mut events, json).await
}

/// Starts or resumes the active queue unless it is already running.
async fn continue_queue(rt: &Runtime) -> Result<(), CliError> {
    match rt.service.queue().map(|q| q.status) {
        Some(QueueStatus::Paused) => rt.service.resume_queue().await?,
        Some(QueueStatus::Pending) => rt.service.start_queue().await?,
        _ => {}
    }
    Ok(())
}

async fn session_status(
    config_dir: &Path,
    data_dir: &Path,
    session_id: &str,
    json: bool,
) -> Result<(), CliError> {
    let settings = config::load_settings(config_dir)?;
    let rt = open_runtime(&settings, data_dir, None).await?;
    let result = rt.service.check_upload_status(session_id).await;
    rt.service.shutdown().await;
    rt.probe_cancel.cancel();
    let status = result?;

    if json {
        println!("{}", serde_json::to_string(&status).map_err(json_err)?);
    } else {
        println!(
            "sessionId={} uploaded={}/{} completed={}",
            session_id,
            status.uploaded_chunks.len(),
            status.total_chunks,
            status.completed
        );
    }
    Ok(())
}

/// Streams events until the queue completes or pauses. Ctrl-C pauses.
async fn drive(
    rt: &Runtime,
    events: &mut broadcast::Receiver<UploadEvent>,
    json: bool,
) -> Result<(), CliError> {
    let running = rt
        .service
        .queue()
        .map(|q| q.status == QueueStatus::Running)
        .unwrap_or(false);

    if running {
        loop {
            let ev = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    warn!(event = "cli.interrupted", "cli.interrupted");
                    rt.service.pause_queue().await;
                    break;
                }
                r = events.recv() => match r {
                    Ok(ev) => ev,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            print_event(&ev, json)?;
            if matches!(
                ev,
                UploadEvent::QueueCompleted { .. } | UploadEvent::QueuePaused { .. }
            ) {
                break;
            }
        }
    }

    rt.service.shutdown().await;
    rt.probe_cancel.cancel();

    let queue = rt.service.queue();
    let stats = rt.service.stats();
    if json {
        println!(
            "{}",
            serde_json::json!({ "type": "queue.summary", "queue": queue, "stats": stats })
        );
    } else if let Some(q) = queue {
        println!(
            "queueId={} status={:?} files={} completed={} failed={} uploadedBytes={}/{}",
            q.id,
            q.status,
            q.progress.total_files,
            q.progress.completed_files,
            q.progress.failed_files,
            q.progress.uploaded_bytes,
            q.progress.total_bytes
        );
    }
    Ok(())
}

async fn status(config_dir: &Path, data_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = config::load_settings(config_dir)?;
    let progress = open_progress(&settings, data_dir).await?;
    let latest = progress
        .load_all_queues()
        .await
        .into_iter()
        .max_by_key(|q| q.created_at);
    let completion = match &latest {
        Some(q) => Some(progress.calculate_queue_progress(&q.id).await),
        None => None,
    };
    let stats = progress.progress_stats().await;

    if json {
        println!(
            "{}",
            serde_json::json!({ "queue": latest, "completion": completion, "stats": stats })
        );
        return Ok(());
    }

    match latest {
        Some(q) => {
            println!("queueId={} status={:?}", q.id, q.status);
            for f in &q.files {
                println!(
                    "  {} {:?} {}% {}/{}{}",
                    f.file.relative_path.as_deref().unwrap_or(&f.file.name),
                    f.status,
                    f.progress,
                    f.uploaded_bytes,
                    f.file.size,
                    f.error
                        .as_deref()
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default()
                );
            }
            if let Some(c) = completion {
                println!(
                    "files={}% bytes={}% overall={}%",
                    c.files_progress, c.bytes_progress, c.overall_progress
                );
            }
        }
        None => println!("no queue"),
    }
    println!(
        "queues={} active={} completed={}",
        stats.total_queues, stats.active_queues, stats.completed_queues
    );
    Ok(())
}

async fn cleanup(
    config_dir: &Path,
    data_dir: &Path,
    max_age_hours: Option<u64>,
    json: bool,
) -> Result<(), CliError> {
    let mut settings = config::load_settings(config_dir)?;
    if let Some(hours) = max_age_hours {
        settings.progress.max_age_hours = hours;
        config::validate_settings(&settings)?;
    }
    let progress = open_progress(&settings, data_dir).await?;
    let report = progress
        .cleanup_expired_progress(settings.progress.max_age_hours)
        .await;

    if json {
        println!("{}", serde_json::to_string(&report).map_err(json_err)?);
    } else {
        println!(
            "progressRemoved={} queuesRemoved={}",
            report.progress_removed, report.queues_removed
        );
    }
    Ok(())
}

async fn clear_completed(config_dir: &Path, data_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = config::load_settings(config_dir)?;
    let rt = open_runtime(&settings, data_dir, None).await?;
    let removed = match rt.service.restore().await {
        Some(_) => rt.service.clear_completed().await,
        None => 0,
    };
    rt.service.shutdown().await;
    rt.probe_cancel.cancel();

    if json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else {
        println!("removed={removed}");
    }
    Ok(())
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = config::load_settings(config_dir)?;
    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        let text = toml::to_string(&settings).map_err(|e| CliError::new("config.invalid", e.to_string()))?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn settings_init(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let path = config::config_path(config_dir);
    let created = !path.exists();
    if created {
        config::save_settings(config_dir, &Settings::default())?;
    }
    if json {
        println!(
            "{}",
            serde_json::json!({ "path": path.display().to_string(), "created": created })
        );
    } else {
        println!("{} {}", if created { "created" } else { "exists" }, path.display());
    }
    Ok(())
}

async fn open_progress(settings: &Settings, data_dir: &Path) -> Result<ProgressManager, CliError> {
    let db_path = settings.progress.resolve_db_path(data_dir);
    let store = SqliteKeyValueStore::open(&db_path).await?;
    Ok(ProgressManager::new(Arc::new(store)))
}

async fn open_runtime(
    settings: &Settings,
    data_dir: &Path,
    metadata: Option<UploadMetadata>,
) -> Result<Runtime, CliError> {
    let progress = open_progress(settings, data_dir).await?;
    let token = std::env::var(&settings.server.api_token_env)
        .ok()
        .filter(|t| !t.is_empty());
    let api = Arc::new(HttpUploadApi::new(&settings.server.base_url, token));

    let network = Arc::new(NetworkMonitor::default());
    let probe = Arc::new(HttpConnectivityProbe::new(
        &settings.server.base_url,
        &settings.network.health_path,
        Duration::from_millis(settings.network.probe_timeout_ms),
    ));
    network.check_once(probe.as_ref()).await;
    let probe_cancel = CancellationToken::new();
    network.spawn_probe_loop(
        probe,
        Duration::from_secs(settings.network.probe_interval_secs),
        probe_cancel.clone(),
    );

    let service =
        UploadQueueService::with_metadata(&settings.upload, api, network, progress, metadata);
    Ok(Runtime {
        service,
        probe_cancel,
    })
}

fn print_event(ev: &UploadEvent, json: bool) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::to_string(ev).map_err(json_err)?);
        return Ok(());
    }
    match ev {
        UploadEvent::FileProgress {
            file_id, progress, ..
        } => println!("{file_id} {progress}%"),
        UploadEvent::FileCompleted { file_name, .. } => println!("done {file_name}"),
        UploadEvent::FileError {
            file_name, error, ..
        } => println!("failed {file_name}: {error}"),
        UploadEvent::QueuePaused { queue_id } => println!("paused {queue_id}"),
        UploadEvent::NetworkChange { is_online, reason } => {
            println!("network online={is_online} ({reason:?})")
        }
        _ => {}
    }
    Ok(())
}

fn json_err(e: serde_json::Error) -> CliError {
    CliError::new("json", e.to_string())
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join(APP_NAME.to_lowercase())
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join(APP_NAME.to_lowercase())
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
