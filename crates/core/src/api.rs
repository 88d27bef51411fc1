use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::chunker::{checksum_bytes, chunk_id};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSessionRequest {
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
    pub completed_chunks: Vec<String>,
    #[serde(flatten)]
    pub metadata: UploadMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSessionResponse {
    #[serde(default)]
    pub session_id: Option<String>,
    /// The server already stores a file with this hash; nothing to upload.
    #[serde(default)]
    pub existing: bool,
    /// Chunk ids the server already holds. `None` when the server does not say.
    #[serde(default)]
    pub completed_chunks: Option<Vec<String>>,
    #[serde(default)]
    pub file: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChunkUploadRequest {
    pub session_id: String,
    pub chunk_index: u32,
    pub chunk_hash: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    #[serde(default)]
    pub success: bool,
    pub chunk_index: u32,
    #[serde(default)]
    pub uploaded_chunks: Vec<u32>,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    #[serde(default)]
    pub file: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl FinalizeResponse {
    /// The `id` of the stored file record, as a string.
    pub fn file_id(&self) -> Option<String> {
        match self.file.as_ref()?.get("id")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[serde(default)]
    pub uploaded_chunks: Vec<u32>,
    pub total_chunks: u32,
    #[serde(default)]
    pub completed: bool,
}

/// The server side of a chunked upload session.
pub trait UploadApi: Send + Sync {
    fn init_session<'a>(
        &'a self,
        req: &'a InitSessionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<InitSessionResponse>> + Send + 'a>>;

    fn upload_chunk<'a>(
        &'a self,
        req: ChunkUploadRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkUploadResponse>> + Send + 'a>>;

    fn finalize<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<FinalizeResponse>> + Send + 'a>>;

    fn status<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionStatus>> + Send + 'a>>;
}

pub struct HttpUploadApi {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpUploadApi {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/files/{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let res = self.authorize(req).send().await.map_err(transport_error)?;
        let status = res.status();
        let body = res.text().await.map_err(transport_error)?;

        if !status.is_success() {
            let detail = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                .unwrap_or(body);
            return Err(Error::Http {
                message: format!(
                    "http {} {}: {detail}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("")
                ),
            });
        }
        unwrap_envelope(&body)
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else if e.is_connect() {
        Error::Http {
            message: format!("connection refused: {e}"),
        }
    } else {
        Error::Http {
            message: format!("network error: {e}"),
        }
    }
}

/// Accepts both bare payloads and `{ success, data, message }` envelopes.
fn unwrap_envelope<T: DeserializeOwned>(body: &str) -> Result<T> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| Error::Http {
        message: format!("invalid json: {e}; body={body}"),
    })?;

    let value = match value {
        serde_json::Value::Object(mut map)
            if map.contains_key("success")
                && (map.contains_key("data") || map.contains_key("message")) =>
        {
            let ok = map
                .get("success")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !ok {
                let message = map
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("server returned success=false")
                    .to_string();
                return Err(Error::Http { message });
            }
            match map.remove("data") {
                Some(data) if !data.is_null() => data,
                _ => serde_json::Value::Object(map),
            }
        }
        other => other,
    };

    serde_json::from_value(value).map_err(|e| Error::Http {
        message: format!("unexpected response shape: {e}; body={body}"),
    })
}

impl UploadApi for HttpUploadApi {
    fn init_session<'a>(
        &'a self,
        req: &'a InitSessionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<InitSessionResponse>> + Send + 'a>> {
        Box::pin(async move {
            self.send(self.client.post(self.url("chunk-init")).json(req))
                .await
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        req: ChunkUploadRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkUploadResponse>> + Send + 'a>> {
        Box::pin(async move {
            let part = reqwest::multipart::Part::bytes(req.data)
                .file_name(format!("chunk_{}", req.chunk_index));
            let form = reqwest::multipart::Form::new()
                .text("sessionId", req.session_id)
                .text("chunkIndex", req.chunk_index.to_string())
                .text("chunkHash", req.chunk_hash)
                .part("chunkData", part);
            self.send(self.client.post(self.url("chunk-upload")).multipart(form))
                .await
        })
    }

    fn finalize<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<FinalizeResponse>> + Send + 'a>> {
        Box::pin(async move {
            let body = serde_json::json!({ "sessionId": session_id });
            self.send(self.client.post(self.url("chunk-finalize")).json(&body))
                .await
        })
    }

    fn status<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionStatus>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.url(&format!("chunk-status/{session_id}"));
            self.send(self.client.get(url)).await
        })
    }
}

struct MemorySession {
    file_name: String,
    file_size: u64,
    file_hash: String,
    total_chunks: u32,
    chunk_size: u64,
    uploaded: BTreeSet<u32>,
}

impl MemorySession {
    fn store_key(&self) -> String {
        format!("{}:{}", self.file_hash, self.chunk_size)
    }
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub id: u64,
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<String, MemorySession>,
    /// `{file_hash}:{chunk_size}` -> index -> (hash, bytes). Survives sessions.
    chunks: HashMap<String, BTreeMap<u32, (String, Vec<u8>)>>,
    files: HashMap<String, StoredFile>,
    next_file_id: u64,
}

/// In-process session server. Verifies chunk and file digests the way the
/// HTTP server does, and remembers chunks per file hash across sessions.
#[derive(Default)]
pub struct MemoryUploadApi {
    pub sessions_opened: AtomicUsize,
    pub chunk_uploads: AtomicUsize,
    pub finalizes: AtomicUsize,
    inner: Mutex<MemoryInner>,
}

impl MemoryUploadApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn file_by_name(&self, name: &str) -> Option<StoredFile> {
        self.inner
            .lock()
            .await
            .files
            .values()
            .find(|f| f.name == name)
            .cloned()
    }

    pub async fn file_count(&self) -> usize {
        self.inner.lock().await.files.len()
    }

    pub fn chunk_upload_count(&self) -> usize {
        self.chunk_uploads.load(Ordering::SeqCst)
    }

    /// Forgets every chunk received so far, as if the server purged its
    /// temporary storage.
    pub async fn purge_chunks(&self) {
        let mut inner = self.inner.lock().await;
        inner.chunks.clear();
        for s in inner.sessions.values_mut() {
            s.uploaded.clear();
        }
    }
}

fn client_error(status: &str, detail: &str) -> Error {
    Error::Http {
        message: format!("http {status}: {detail}"),
    }
}

impl UploadApi for MemoryUploadApi {
    fn init_session<'a>(
        &'a self,
        req: &'a InitSessionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<InitSessionResponse>> + Send + 'a>> {
        Box::pin(async move {
            self.sessions_opened.fetch_add(1, Ordering::SeqCst);
            let mut inner = self.inner.lock().await;

            if let Some(existing) = inner.files.get(&req.file_hash) {
                return Ok(InitSessionResponse {
                    existing: true,
                    file: Some(serde_json::json!({
                        "id": existing.id,
                        "name": existing.name,
                        "size": existing.bytes.len(),
                    })),
                    message: Some("file already exists".to_string()),
                    ..InitSessionResponse::default()
                });
            }

            let mut session = MemorySession {
                file_name: req.file_name.clone(),
                file_size: req.file_size,
                file_hash: req.file_hash.clone(),
                total_chunks: req.total_chunks,
                chunk_size: req.chunk_size,
                uploaded: BTreeSet::new(),
            };

            let mut completed = Vec::new();
            if let Some(known) = inner.chunks.get(&session.store_key()) {
                for (index, (hash, _)) in known {
                    if *index < req.total_chunks {
                        session.uploaded.insert(*index);
                        completed.push(chunk_id(&req.file_name, *index, hash));
                    }
                }
            }

            let session_id = uuid::Uuid::new_v4().to_string();
            inner.sessions.insert(session_id.clone(), session);
            Ok(InitSessionResponse {
                session_id: Some(session_id),
                existing: false,
                completed_chunks: Some(completed),
                ..InitSessionResponse::default()
            })
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        req: ChunkUploadRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkUploadResponse>> + Send + 'a>> {
        Box::pin(async move {
            self.chunk_uploads.fetch_add(1, Ordering::SeqCst);
            let mut inner = self.inner.lock().await;

            let (key, total) = {
                let session = inner
                    .sessions
                    .get(&req.session_id)
                    .ok_or_else(|| client_error("404 Not Found", "upload session not found"))?;
                if req.chunk_index >= session.total_chunks {
                    return Err(client_error("400 Bad Request", "chunk index out of range"));
                }
                (session.store_key(), session.total_chunks)
            };

            if checksum_bytes(&req.data) != req.chunk_hash {
                return Err(client_error("400 Bad Request", "chunk hash mismatch"));
            }

            inner
                .chunks
                .entry(key)
                .or_default()
                .insert(req.chunk_index, (req.chunk_hash, req.data));

            let session = inner
                .sessions
                .get_mut(&req.session_id)
                .ok_or_else(|| client_error("404 Not Found", "upload session not found"))?;
            session.uploaded.insert(req.chunk_index);

            Ok(ChunkUploadResponse {
                success: true,
                chunk_index: req.chunk_index,
                uploaded_chunks: session.uploaded.iter().copied().collect(),
                completed: session.uploaded.len() as u32 >= total,
            })
        })
    }

    fn finalize<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<FinalizeResponse>> + Send + 'a>> {
        Box::pin(async move {
            self.finalizes.fetch_add(1, Ordering::SeqCst);
            let mut inner = self.inner.lock().await;

            let session = inner
                .sessions
                .get(session_id)
                .ok_or_else(|| client_error("404 Not Found", "upload session not found"))?;
            if (session.uploaded.len() as u32) < session.total_chunks {
                return Err(client_error(
                    "400 Bad Request",
                    &format!(
                        "upload incomplete: {}/{}",
                        session.uploaded.len(),
                        session.total_chunks
                    ),
                ));
            }

            let key = session.store_key();
            let none = BTreeMap::new();
            let stored = inner.chunks.get(&key).unwrap_or(&none);
            let mut bytes = Vec::with_capacity(session.file_size as usize);
            for index in 0..session.total_chunks {
                let (_, data) = stored
                    .get(&index)
                    .ok_or_else(|| client_error("400 Bad Request", "missing chunk"))?;
                bytes.extend_from_slice(data);
            }

            if bytes.len() as u64 != session.file_size {
                return Err(client_error("400 Bad Request", "file size mismatch"));
            }
            if checksum_bytes(&bytes) != session.file_hash {
                return Err(client_error("400 Bad Request", "file hash verification failed"));
            }

            let name = session.file_name.clone();
            let file_hash = session.file_hash.clone();
            inner.next_file_id += 1;
            let id = inner.next_file_id;
            let size = bytes.len();
            inner.files.insert(file_hash, StoredFile { id, name: name.clone(), bytes });
            inner.chunks.remove(&key);
            inner.sessions.remove(session_id);

            Ok(FinalizeResponse {
                file: Some(serde_json::json!({ "id": id, "name": name, "size": size })),
                message: Some("upload complete".to_string()),
            })
        })
    }

    fn status<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionStatus>> + Send + 'a>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let session = inner
                .sessions
                .get(session_id)
                .ok_or_else(|| client_error("404 Not Found", "upload session not found"))?;
            Ok(SessionStatus {
                uploaded_chunks: session.uploaded.iter().copied().collect(),
                total_chunks: session.total_chunks,
                completed: session.uploaded.len() as u32 >= session.total_chunks,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_is_unwrapped() {
        let r: InitSessionResponse = unwrap_envelope(
            r#"{"success":true,"data":{"sessionId":"s1","existing":false,"chunkSize":5}}"#,
        )
        .unwrap();
        assert_eq!(r.session_id.as_deref(), Some("s1"));
        assert!(r.completed_chunks.is_none());

        let r: ChunkUploadResponse =
            unwrap_envelope(r#"{"success":true,"chunkIndex":2,"uploadedChunks":[0,2],"completed":false}"#)
                .unwrap();
        assert_eq!(r.chunk_index, 2);
        assert_eq!(r.uploaded_chunks, vec![0, 2]);

        let err = unwrap_envelope::<FinalizeResponse>(
            r#"{"success":false,"message":"upload incomplete: 1/3"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("upload incomplete"), "{err}");
    }

    #[test]
    fn init_request_uses_wire_names() {
        let req = InitSessionRequest {
            file_name: "a.bin".to_string(),
            file_size: 10,
            file_hash: "h".to_string(),
            total_chunks: 1,
            chunk_size: 10,
            relative_path: None,
            completed_chunks: vec![],
            metadata: UploadMetadata {
                category_id: Some(4),
                ..UploadMetadata::default()
            },
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["fileName"], "a.bin");
        assert_eq!(v["totalChunks"], 1);
        assert_eq!(v["categoryId"], 4);
        assert!(v.get("relativePath").is_none());
        assert!(v.get("description").is_none());
    }

    fn init_for(data: &[u8], chunk_size: u64) -> InitSessionRequest {
        InitSessionRequest {
            file_name: "f.bin".to_string(),
            file_size: data.len() as u64,
            file_hash: checksum_bytes(data),
            total_chunks: (data.len() as u64).div_ceil(chunk_size) as u32,
            chunk_size,
            relative_path: None,
            completed_chunks: vec![],
            metadata: UploadMetadata::default(),
        }
    }

    fn chunk(session_id: &str, data: &[u8], index: u32, chunk_size: usize) -> ChunkUploadRequest {
        let start = index as usize * chunk_size;
        let end = (start + chunk_size).min(data.len());
        let bytes = data[start..end].to_vec();
        ChunkUploadRequest {
            session_id: session_id.to_string(),
            chunk_index: index,
            chunk_hash: checksum_bytes(&bytes),
            data: bytes,
        }
    }

    #[tokio::test]
    async fn memory_server_reconciles_and_assembles() {
        let api = MemoryUploadApi::new();
        let data: Vec<u8> = (0..250u32).map(|i| (i % 251) as u8).collect();
        let init = init_for(&data, 100);

        let s1 = api.init_session(&init).await.unwrap().session_id.unwrap();
        api.upload_chunk(chunk(&s1, &data, 1, 100)).await.unwrap();
        assert!(api.finalize(&s1).await.is_err());

        let r = api.init_session(&init).await.unwrap();
        let s2 = r.session_id.unwrap();
        let known = r.completed_chunks.unwrap();
        assert_eq!(known.len(), 1);
        assert!(known[0].starts_with("f.bin-1-"));

        let status = api.status(&s2).await.unwrap();
        assert_eq!(status.uploaded_chunks, vec![1]);
        assert!(!status.completed);

        let mut bad = chunk(&s2, &data, 0, 100);
        bad.chunk_hash = "00".to_string();
        assert!(api.upload_chunk(bad).await.unwrap_err().to_string().contains("hash mismatch"));

        api.upload_chunk(chunk(&s2, &data, 0, 100)).await.unwrap();
        let last = api.upload_chunk(chunk(&s2, &data, 2, 100)).await.unwrap();
        assert!(last.completed);

        let done = api.finalize(&s2).await.unwrap();
        assert_eq!(done.file_id().as_deref(), Some("1"));
        assert_eq!(api.file_by_name("f.bin").await.unwrap().bytes, data);

        let again = api.init_session(&init).await.unwrap();
        assert!(again.existing);
        assert!(again.session_id.is_none());
    }
}
