#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use arkload_core::api::{
    ChunkUploadRequest, ChunkUploadResponse, FinalizeResponse, InitSessionRequest,
    InitSessionResponse, MemoryUploadApi, SessionStatus, UploadApi,
};
use arkload_core::model::UploadEvent;
use arkload_core::network::NetworkStatus;
use arkload_core::{Error, Result};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Wraps the in-process server with a per-chunk delay, scripted chunk
/// failures and a high-water mark of concurrent chunk transfers.
pub struct TimedApi {
    pub inner: MemoryUploadApi,
    delay: Duration,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    failures: Mutex<HashMap<u32, VecDeque<String>>>,
    attempts: Mutex<Vec<(u32, Instant)>>,
    inits: Mutex<Vec<(InitSessionRequest, Option<String>)>>,
}

impl TimedApi {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryUploadApi::new(),
            delay,
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            failures: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            inits: Mutex::new(Vec::new()),
        }
    }

    /// Every session init request seen, with the session id the server issued.
    pub fn inits(&self) -> Vec<(InitSessionRequest, Option<String>)> {
        self.inits.lock().unwrap().clone()
    }

    /// The next `messages.len()` transfers of chunk `index` fail, in order.
    pub fn fail_chunk(&self, index: u32, messages: &[&str]) {
        self.failures
            .lock()
            .unwrap()
            .entry(index)
            .or_default()
            .extend(messages.iter().map(|m| m.to_string()));
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn attempts_for(&self, index: u32) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| *i == index)
            .map(|(_, t)| *t)
            .collect()
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    fn enter(&self) {
        let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(current, Ordering::SeqCst);
    }
}

struct Leave<'a>(&'a AtomicUsize);

impl Drop for Leave<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl UploadApi for TimedApi {
    fn init_session<'a>(
        &'a self,
        req: &'a InitSessionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<InitSessionResponse>> + Send + 'a>> {
        Box::pin(async move {
            let res = self.inner.init_session(req).await?;
            self.inits
                .lock()
                .unwrap()
                .push((req.clone(), res.session_id.clone()));
            Ok(res)
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        req: ChunkUploadRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkUploadResponse>> + Send + 'a>> {
        Box::pin(async move {
            self.attempts
                .lock()
                .unwrap()
                .push((req.chunk_index, Instant::now()));
            self.enter();
            let _leave = Leave(&self.concurrent);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = self
                .failures
                .lock()
                .unwrap()
                .get_mut(&req.chunk_index)
                .and_then(|q| q.pop_front());
            if let Some(message) = scripted {
                return Err(Error::Http { message });
            }
            self.inner.upload_chunk(req).await
        })
    }

    fn finalize<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<FinalizeResponse>> + Send + 'a>> {
        self.inner.finalize(session_id)
    }

    fn status<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionStatus>> + Send + 'a>> {
        self.inner.status(session_id)
    }
}

pub fn excellent_network() -> NetworkStatus {
    NetworkStatus {
        effective_type: "4g".to_string(),
        downlink: 20.0,
        rtt: 40,
        ..NetworkStatus::wired()
    }
}

pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub async fn wait_for(
    rx: &mut broadcast::Receiver<UploadEvent>,
    pred: impl Fn(&UploadEvent) -> bool,
) -> UploadEvent {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match rx.recv().await {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
