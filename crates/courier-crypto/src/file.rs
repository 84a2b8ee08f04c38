//! Whole-file encryption for small files and path selection by size.
//!
//! Small files are sealed in one AES-GCM call and keep the plain
//! `EncryptedPayload` shape. Larger files go through `chunk`. The two wire
//! shapes are not interchangeable; `EncryptedFile` tags which one a local
//! container holds.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroize;

use courier_core::{CourierError, CourierResult, Phase, Progress, ProgressFn};

use crate::chunk::{decrypt_file_chunked_to, encrypt_file_chunked, ChunkedEncryptionResult};
use crate::cipher::{decrypt_bytes, encrypt_bytes, EncryptedPayload};
use crate::keys::{DerivedKey, KeyMaterial};

/// Which encryption path a file of a given size takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePath {
    WholeBuffer,
    Chunked,
}

/// Files strictly below `threshold` use the whole-buffer path.
pub fn select_file_path(size: u64, threshold: u64) -> FilePath {
    if size < threshold {
        FilePath::WholeBuffer
    } else {
        FilePath::Chunked
    }
}

/// Encrypt a small file held in memory.
pub fn encrypt_file(key: &DerivedKey, data: &[u8]) -> CourierResult<EncryptedPayload> {
    encrypt_bytes(key, data)
}

pub fn decrypt_file(key: &DerivedKey, payload: &EncryptedPayload) -> CourierResult<Vec<u8>> {
    decrypt_bytes(key, payload)
}

/// A small file sealed in one payload, with its name and type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WholeFile {
    pub file_name: String,
    pub file_type: String,
    pub original_size: u64,
    pub payload: EncryptedPayload,
}

/// Local container for either encrypted file shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum EncryptedFile {
    Whole(WholeFile),
    Chunked(ChunkedEncryptionResult),
}

impl EncryptedFile {
    pub fn file_name(&self) -> &str {
        match self {
            EncryptedFile::Whole(w) => &w.file_name,
            EncryptedFile::Chunked(c) => &c.file_name,
        }
    }

    pub fn original_size(&self) -> u64 {
        match self {
            EncryptedFile::Whole(w) => w.original_size,
            EncryptedFile::Chunked(c) => c.original_size,
        }
    }

    pub fn path(&self) -> FilePath {
        match self {
            EncryptedFile::Whole(_) => FilePath::WholeBuffer,
            EncryptedFile::Chunked(_) => FilePath::Chunked,
        }
    }

    pub fn to_json(&self) -> CourierResult<String> {
        serde_json::to_string(self)
            .map_err(|e| CourierError::Other(anyhow::anyhow!("encrypted file serialization: {e}")))
    }

    pub fn from_json(s: &str) -> CourierResult<Self> {
        serde_json::from_str(s)
            .map_err(|e| CourierError::Envelope(format!("encrypted file container: {e}")))
    }

    /// Decrypt into `writer`. Returns plaintext bytes written.
    pub async fn decrypt_to<W: AsyncWrite + Unpin>(
        &self,
        material: &KeyMaterial,
        writer: &mut W,
        progress: Option<&ProgressFn>,
        cancel: Option<&CancellationToken>,
    ) -> CourierResult<u64> {
        match self {
            EncryptedFile::Whole(whole) => {
                let mut plaintext = decrypt_file(&material.derive(), &whole.payload)?;
                if plaintext.len() as u64 != whole.original_size {
                    plaintext.zeroize();
                    return Err(CourierError::FileIntegrity);
                }
                writer.write_all(&plaintext).await?;
                writer.flush().await?;
                let written = plaintext.len() as u64;
                plaintext.zeroize();
                if let Some(cb) = progress {
                    cb(&Progress::new(Phase::Complete, 100.0, written, written));
                }
                Ok(written)
            }
            EncryptedFile::Chunked(result) => {
                decrypt_file_chunked_to(result, material, writer, progress, cancel).await
            }
        }
    }
}

/// Encrypt a file on disk, choosing the path by its size.
pub async fn encrypt_path(
    path: &Path,
    material: &KeyMaterial,
    threshold: u64,
    progress: Option<&ProgressFn>,
    cancel: Option<&CancellationToken>,
) -> CourierResult<EncryptedFile> {
    let size = tokio::fs::metadata(path).await?.len();
    match select_file_path(size, threshold) {
        FilePath::Chunked => Ok(EncryptedFile::Chunked(
            encrypt_file_chunked(path, material, progress, cancel).await?,
        )),
        FilePath::WholeBuffer => Ok(EncryptedFile::Whole(
            seal_whole(path, size, material, progress).await?,
        )),
    }
}

/// Read and seal a small file in one payload. `size` only sizes the buffer.
pub(crate) async fn seal_whole(
    path: &Path,
    size: u64,
    material: &KeyMaterial,
    progress: Option<&ProgressFn>,
) -> CourierResult<WholeFile> {
    let mut data = Vec::with_capacity(size as usize);
    tokio::fs::File::open(path)
        .await?
        .read_to_end(&mut data)
        .await?;
    let payload = encrypt_file(&material.derive(), &data);
    let original_size = data.len() as u64;
    data.zeroize();
    if let Some(cb) = progress {
        cb(&Progress::new(Phase::Complete, 100.0, original_size, original_size));
    }
    Ok(WholeFile {
        file_name: file_name_of(path),
        file_type: guess_file_type(path).to_string(),
        original_size,
        payload: payload?,
    })
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// MIME type from the file extension, `application/octet-stream` otherwise.
pub fn guess_file_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
