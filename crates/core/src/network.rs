use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MIB;
use crate::model::NetworkChangeReason;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Poor,
    Fair,
    Good,
    Excellent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMethod {
    Standard,
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub is_online: bool,
    pub connection_type: String,
    /// One of `slow-2g`, `2g`, `3g`, `4g` or `unknown`.
    pub effective_type: String,
    /// Mbps.
    pub downlink: f64,
    /// Milliseconds.
    pub rtt: u64,
    pub last_check: DateTime<Utc>,
}

impl NetworkStatus {
    pub fn unknown() -> Self {
        Self {
            is_online: true,
            connection_type: "unknown".to_string(),
            effective_type: "unknown".to_string(),
            downlink: 0.0,
            rtt: 0,
            last_check: Utc::now(),
        }
    }

    /// Starting point for a wired desktop link before the first probe lands.
    pub fn wired() -> Self {
        Self {
            connection_type: "ethernet".to_string(),
            effective_type: "4g".to_string(),
            downlink: 10.0,
            ..Self::unknown()
        }
    }

    pub fn quality(&self) -> QualityTier {
        if !self.is_online {
            return QualityTier::Poor;
        }
        match self.effective_type.as_str() {
            "4g" if self.downlink > 10.0 && self.rtt < 100 => QualityTier::Excellent,
            "4g" => QualityTier::Good,
            "3g" if self.downlink > 5.0 => QualityTier::Good,
            "3g" | "2g" => QualityTier::Fair,
            _ => QualityTier::Poor,
        }
    }
}

/// Platform link information, as reported by the OS or a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub connection_type: String,
    pub effective_type: String,
    pub downlink: f64,
    pub rtt: u64,
}

/// Effective connection type derived from a round-trip time, using the
/// thresholds of the Network Information API.
pub fn effective_type_for_rtt(rtt_ms: u64) -> &'static str {
    match rtt_ms {
        0..270 => "4g",
        270..1400 => "3g",
        1400..2000 => "2g",
        _ => "slow-2g",
    }
}

#[derive(Debug, Clone)]
pub struct NetworkChange {
    pub is_online: bool,
    pub reason: NetworkChangeReason,
    pub status: NetworkStatus,
}

/// A cheap liveness check. Returns the measured round-trip time.
pub trait ConnectivityProbe: Send + Sync {
    fn probe<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<Duration>> + Send + 'a>>;
}

pub struct HttpConnectivityProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpConnectivityProbe {
    pub fn new(base_url: &str, health_path: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}{}", base_url.trim_end_matches('/'), health_path),
            timeout,
        }
    }
}

impl ConnectivityProbe for HttpConnectivityProbe {
    fn probe<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<Duration>> + Send + 'a>> {
        Box::pin(async move {
            let started = Instant::now();
            let res = self
                .client
                .get(&self.url)
                .header(reqwest::header::CACHE_CONTROL, "no-cache")
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        Error::Timeout
                    } else {
                        Error::Http {
                            message: format!("health request failed: {e}"),
                        }
                    }
                })?;
            let status = res.status();
            if !status.is_success() {
                return Err(Error::Http {
                    message: format!("health http {status}"),
                });
            }
            Ok(started.elapsed())
        })
    }
}

/// Best-effort view of reachability and link quality.
pub struct NetworkMonitor {
    status: Mutex<NetworkStatus>,
    events: broadcast::Sender<NetworkChange>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            status: Mutex::new(initial),
            events,
        }
    }

    pub fn status(&self) -> NetworkStatus {
        self.lock().clone()
    }

    pub fn is_online(&self) -> bool {
        self.lock().is_online
    }

    pub fn connection_quality(&self) -> QualityTier {
        self.lock().quality()
    }

    pub fn recommended_chunk_size(&self) -> u64 {
        match self.connection_quality() {
            QualityTier::Excellent => 10 * MIB,
            QualityTier::Good => 5 * MIB,
            QualityTier::Fair => 2 * MIB,
            QualityTier::Poor => MIB,
        }
    }

    pub fn recommended_concurrency(&self) -> usize {
        match self.connection_quality() {
            QualityTier::Excellent => 5,
            QualityTier::Good => 3,
            QualityTier::Fair => 2,
            QualityTier::Poor => 1,
        }
    }

    pub fn should_pause_uploads(&self) -> bool {
        let status = self.lock();
        !status.is_online || status.quality() == QualityTier::Poor
    }

    /// Advisory only; the uploader always transfers in chunks.
    pub fn recommended_upload_method(&self) -> UploadMethod {
        let status = self.lock();
        if status.quality() == QualityTier::Poor || status.rtt >= 200 {
            UploadMethod::Chunked
        } else {
            UploadMethod::Standard
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkChange> {
        self.events.subscribe()
    }

    /// Explicit connectivity signal from the platform. Emits only on a flip.
    pub fn set_online(&self, online: bool) {
        let snapshot = {
            let mut status = self.lock();
            if status.is_online == online {
                status.last_check = Utc::now();
                return;
            }
            status.is_online = online;
            status.last_check = Utc::now();
            status.clone()
        };

        let reason = if online {
            info!(event = "network.online", "network.online");
            NetworkChangeReason::ConnectionRestored
        } else {
            warn!(event = "network.offline", "network.offline");
            NetworkChangeReason::ConnectionLost
        };
        self.emit(NetworkChange {
            is_online: online,
            reason,
            status: snapshot,
        });
    }

    /// Applies new link figures. Emits a quality change when the effective
    /// type changes, downlink moves by more than 1 Mbps or rtt by more than 100 ms.
    pub fn update_link(&self, link: LinkInfo) {
        let changed = {
            let mut status = self.lock();
            let material = status.effective_type != link.effective_type
                || (status.downlink - link.downlink).abs() > 1.0
                || status.rtt.abs_diff(link.rtt) > 100;
            if !material {
                return;
            }
            let old_tier = status.quality();
            status.connection_type = link.connection_type;
            status.effective_type = link.effective_type;
            status.downlink = link.downlink;
            status.rtt = link.rtt;
            status.last_check = Utc::now();
            debug!(
                event = "network.quality_changed",
                effective_type = %status.effective_type,
                downlink = status.downlink,
                rtt = status.rtt,
                old_tier = ?old_tier,
                new_tier = ?status.quality(),
                "network.quality_changed"
            );
            status.clone()
        };

        self.emit(NetworkChange {
            is_online: changed.is_online,
            reason: NetworkChangeReason::ConnectionQualityChange,
            status: changed,
        });
    }

    /// Runs one liveness probe. Failures are logged and never change
    /// reachability; a success refreshes rtt and the derived effective type.
    pub async fn check_once(&self, probe: &dyn ConnectivityProbe) {
        if !self.is_online() {
            return;
        }
        match probe.probe().await {
            Ok(elapsed) => {
                let rtt = elapsed.as_millis() as u64;
                let link = {
                    let mut status = self.lock();
                    status.last_check = Utc::now();
                    LinkInfo {
                        connection_type: status.connection_type.clone(),
                        effective_type: effective_type_for_rtt(rtt).to_string(),
                        downlink: status.downlink,
                        rtt,
                    }
                };
                self.update_link(link);
            }
            Err(e) => {
                warn!(
                    event = "network.probe_failed",
                    error = %e,
                    "network.probe_failed"
                );
            }
        }
    }

    /// Probes every `interval` until `cancel` fires.
    pub fn spawn_probe_loop(
        self: &Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                monitor.check_once(probe.as_ref()).await;
            }
            debug!(event = "network.probe_loop_stopped", "network.probe_loop_stopped");
        })
    }

    fn emit(&self, change: NetworkChange) {
        // No receivers is fine.
        let _ = self.events.send(change);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::wired())
    }
}
