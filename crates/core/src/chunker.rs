use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::Result;

/// One contiguous slice of a file. `data` is never persisted; after a restart
/// it is re-read from the file handle using `offset` and `size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub id: String,
    pub file_id: String,
    pub index: u32,
    pub offset: u64,
    pub size: u64,
    pub hash: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl FileChunk {
    pub fn has_data(&self) -> bool {
        self.data.len() as u64 == self.size
    }

    /// Copies the descriptor, leaving the bytes behind.
    pub fn without_data(&self) -> Self {
        Self {
            id: self.id.clone(),
            file_id: self.file_id.clone(),
            index: self.index,
            offset: self.offset,
            size: self.size,
            hash: self.hash.clone(),
            data: Vec::new(),
        }
    }
}

/// Where the bytes of a queued file come from.
#[derive(Debug, Clone)]
pub enum FileHandle {
    Path(PathBuf),
    Memory(Arc<Vec<u8>>),
}

impl FileHandle {
    pub async fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        match self {
            FileHandle::Path(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
            FileHandle::Memory(bytes) => {
                let start = offset as usize;
                let end = start + len as usize;
                bytes
                    .get(start..end)
                    .map(|s| s.to_vec())
                    .ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!("range {start}..{end} outside of {} bytes", bytes.len()),
                        )
                        .into()
                    })
            }
        }
    }

    /// SHA-256 over the whole file, hex encoded.
    pub async fn sha256_hex(&self) -> Result<String> {
        match self {
            FileHandle::Path(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                let mut hasher = Sha256::new();
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(hex::encode(hasher.finalize()))
            }
            FileHandle::Memory(bytes) => Ok(checksum_bytes(bytes)),
        }
    }
}

pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn chunk_id(file_name: &str, index: u32, hash: &str) -> String {
    let prefix = hash.get(..8).unwrap_or(hash);
    format!("{file_name}-{index}-{prefix}")
}

/// Byte ranges `(offset, size)` covering `[0, file_size)` in order. Every range
/// is `chunk_size` long except the last, which may be shorter.
pub fn chunk_ranges(file_size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    assert!(chunk_size > 0, "chunk_size must be > 0");
    let mut ranges = Vec::with_capacity(file_size.div_ceil(chunk_size) as usize);
    let mut offset = 0;
    while offset < file_size {
        let size = chunk_size.min(file_size - offset);
        ranges.push((offset, size));
        offset += size;
    }
    ranges
}

/// Reads and hashes every chunk of a file.
pub async fn slice_file(
    handle: &FileHandle,
    file_id: &str,
    file_name: &str,
    file_size: u64,
    chunk_size: u64,
) -> Result<Vec<FileChunk>> {
    let mut chunks = Vec::new();
    for (index, (offset, size)) in chunk_ranges(file_size, chunk_size).into_iter().enumerate() {
        let index = index as u32;
        let data = handle.read_range(offset, size).await?;
        let hash = checksum_bytes(&data);
        chunks.push(FileChunk {
            id: chunk_id(file_name, index, &hash),
            file_id: file_id.to_string(),
            index,
            offset,
            size,
            hash,
            data,
        });
    }
    Ok(chunks)
}
