use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const MIB: u64 = 1024 * 1024;

/// Upper bound for `progress.max_age_hours`, roughly one hundred years.
pub const MAX_PROGRESS_AGE_HOURS: u64 = 100 * 365 * 24;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub progress: Progress,
}

/// Transfer tuning. `chunk_size` and `concurrency` are starting values; the
/// uploader re-tunes both from network quality at the start of every file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub chunk_size: u64,
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub base_url: String,
    pub api_token_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub health_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Progress {
    pub db_path: Option<PathBuf>,
    pub max_age_hours: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5 * MIB,
            concurrency: 3,
            timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_token_env: "ARKLOAD_API_TOKEN".to_string(),
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            probe_timeout_ms: 5000,
            health_path: "/api/health".to_string(),
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            db_path: None,
            max_age_hours: 24,
        }
    }
}

impl Progress {
    pub fn resolve_db_path(&self, data_dir: &Path) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| data_dir.join("progress.sqlite"))
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text)?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> Result<Settings> {
    toml::from_str::<Settings>(text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    let text = toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })?;

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    let upload = &settings.upload;
    if upload.chunk_size == 0 {
        return Err(Error::InvalidConfig {
            message: "upload.chunk_size must be > 0".to_string(),
        });
    }
    if upload.concurrency == 0 {
        return Err(Error::InvalidConfig {
            message: "upload.concurrency must be >= 1".to_string(),
        });
    }
    if upload.max_retries == 0 {
        return Err(Error::InvalidConfig {
            message: "upload.max_retries must be >= 1".to_string(),
        });
    }
    if upload.timeout_ms == 0 {
        return Err(Error::InvalidConfig {
            message: "upload.timeout_ms must be > 0".to_string(),
        });
    }
    if !(upload.backoff_multiplier >= 1.0) {
        return Err(Error::InvalidConfig {
            message: format!(
                "upload.backoff_multiplier must be >= 1 (got {})",
                upload.backoff_multiplier
            ),
        });
    }

    if settings.server.base_url.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "server.base_url must not be empty".to_string(),
        });
    }
    if settings.network.probe_interval_secs == 0 {
        return Err(Error::InvalidConfig {
            message: "network.probe_interval_secs must be > 0".to_string(),
        });
    }
    if settings.progress.max_age_hours == 0 {
        return Err(Error::InvalidConfig {
            message: "progress.max_age_hours must be > 0".to_string(),
        });
    }
    if settings.progress.max_age_hours > MAX_PROGRESS_AGE_HOURS {
        return Err(Error::InvalidConfig {
            message: format!("progress.max_age_hours must be <= {MAX_PROGRESS_AGE_HOURS}"),
        });
    }
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let s = parse_settings("").unwrap();
        assert_eq!(s.upload, UploadConfig::default());
        assert_eq!(s.upload.chunk_size, 5 * MIB);
        assert_eq!(s.network.probe_interval_secs, 30);
        assert_eq!(s.progress.max_age_hours, 24);
        validate_settings(&s).unwrap();
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let s = parse_settings(
            r#"
[upload]
chunk_size = 1048576
max_retries = 5

[server]
base_url = "https://files.example.test"
"#,
        )
        .unwrap();
        assert_eq!(s.upload.chunk_size, MIB);
        assert_eq!(s.upload.max_retries, 5);
        assert_eq!(s.upload.concurrency, 3);
        assert_eq!(s.upload.retry_delay_ms, 1000);
        assert_eq!(s.server.base_url, "https://files.example.test");
        assert_eq!(s.server.api_token_env, "ARKLOAD_API_TOKEN");
    }

    #[test]
    fn rejects_out_of_range_progress_age() {
        let mut s = Settings::default();
        s.progress.max_age_hours = MAX_PROGRESS_AGE_HOURS;
        validate_settings(&s).unwrap();

        for hours in [0, MAX_PROGRESS_AGE_HOURS + 1, u64::MAX] {
            s.progress.max_age_hours = hours;
            let err = validate_settings(&s).unwrap_err().to_string();
            assert!(err.contains("progress.max_age_hours"), "{err}");
        }
    }

    #[test]
    fn rejects_zero_concurrency_and_low_multiplier() {
        let mut s = Settings::default();
        s.upload.concurrency = 0;
        let err = validate_settings(&s).unwrap_err().to_string();
        assert!(err.contains("upload.concurrency"), "{err}");

        let mut s = Settings::default();
        s.upload.backoff_multiplier = 0.5;
        let err = validate_settings(&s).unwrap_err().to_string();
        assert!(err.contains("backoff_multiplier"), "{err}");
    }

    #[test]
    fn save_then_load_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Settings::default();
        s.upload.timeout_ms = 12_000;
        s.progress.max_age_hours = 48;
        save_settings(dir.path(), &s).unwrap();

        let loaded = load_settings(dir.path()).unwrap();
        assert_eq!(loaded.upload.timeout_ms, 12_000);
        assert_eq!(loaded.progress.max_age_hours, 48);
        assert!(!config_path(dir.path()).with_extension("tmp").exists());
    }
}
