//! Chunked file encryption with per-chunk and whole-file integrity tags.
//!
//! A file of `S` bytes is split into `ceil(S / 512 KiB)` chunks; only the
//! last may be shorter. For each chunk `i`:
//! ```text
//! iv_i          = 12 random bytes
//! ct_i, gcm_i   = AES-256-GCM(derived key, iv_i, chunk_i, AAD = i (8 bytes BE) || file_id)
//! auth_tag_i    = HMAC-SHA256(key material, file_id ":" i ":" base64(ct_i))
//! ```
//! and for the whole file:
//! ```text
//! master_auth_tag = HMAC-SHA256(key material, file_id "master" auth_tag_0 auth_tag_1 ...)
//! ```
//! The master tag authenticates the chunk set and order: swapping, dropping,
//! or substituting chunks fails it even when every chunk verifies alone.
//! Decryption checks the master tag before releasing any plaintext.

use std::path::Path;

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zeroize::Zeroize;

use courier_core::{CourierError, CourierResult, Phase, Progress, ProgressFn};

use crate::cipher::{open, seal};
use crate::encoding::{b64_array, b64_opt, base64_decode, base64_encode};
use crate::file::{file_name_of, guess_file_type};
use crate::keys::{DerivedKey, KeyMaterial};
use crate::{CHUNK_SIZE, IV_SIZE, TAG_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// One encrypted chunk's descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    /// Authoritative ordering key
    pub index: u64,
    #[serde(with = "b64_array")]
    pub iv: [u8; IV_SIZE],
    /// AES-GCM tag for this chunk
    #[serde(with = "b64_array")]
    pub gcm_tag: [u8; TAG_SIZE],
    /// HMAC-SHA256 binding the ciphertext to file id and index (base64)
    pub auth_tag: String,
    /// Ciphertext, when carried in memory; absent in upload manifests
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub encrypted_data: Option<Vec<u8>>,
    pub original_size: u64,
    pub encrypted_size: u64,
}

/// A fully encrypted file: chunk descriptors plus the whole-file seal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedEncryptionResult {
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub total_chunks: u64,
    pub original_size: u64,
    pub encrypted_size: u64,
    pub chunks: Vec<ChunkInfo>,
    #[serde(with = "b64_array")]
    pub master_iv: [u8; IV_SIZE],
    pub master_auth_tag: String,
}

impl ChunkedEncryptionResult {
    pub fn from_parts(
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        chunks: Vec<ChunkInfo>,
        seal: FileSeal,
    ) -> Self {
        Self {
            file_id: seal.file_id,
            file_name: file_name.into(),
            file_type: file_type.into(),
            total_chunks: seal.total_chunks,
            original_size: seal.original_size,
            encrypted_size: seal.encrypted_size,
            chunks,
            master_iv: seal.master_iv,
            master_auth_tag: seal.master_auth_tag,
        }
    }

    /// A copy without chunk ciphertext, for transmission alongside uploads.
    pub fn manifest(&self) -> Self {
        let mut manifest = self.clone();
        for chunk in &mut manifest.chunks {
            chunk.encrypted_data = None;
        }
        manifest
    }

    /// Re-attach ciphertext fetched from storage to the chunk at `index`.
    pub fn attach_chunk_data(&mut self, index: u64, data: Vec<u8>) -> CourierResult<()> {
        let chunk = self
            .chunks
            .iter_mut()
            .find(|c| c.index == index)
            .ok_or_else(|| CourierError::Envelope(format!("no chunk with index {index}")))?;
        chunk.encrypted_data = Some(data);
        Ok(())
    }

    pub fn to_json(&self) -> CourierResult<String> {
        serde_json::to_string(self)
            .map_err(|e| CourierError::Other(anyhow::anyhow!("chunk manifest serialization: {e}")))
    }

    pub fn from_json(s: &str) -> CourierResult<Self> {
        serde_json::from_str(s)
            .map_err(|e| CourierError::Envelope(format!("chunk manifest deserialization: {e}")))
    }
}

/// Number of chunks for a file of `size` bytes (0 for an empty file)
pub fn total_chunks_for(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// Encryptor progress through one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Waiting for the next chunk's plaintext
    Reading,
    /// Encrypting the chunk at this index
    Encrypting(u64),
    /// Every chunk encrypted; master tag not yet computed
    Finalizing,
    Complete,
    Failed,
}

/// Ciphertext plus descriptor for one chunk
#[derive(Debug)]
pub struct EncryptedChunk {
    pub info: ChunkInfo,
    pub ciphertext: Vec<u8>,
}

impl EncryptedChunk {
    /// The descriptor with its ciphertext embedded.
    pub fn into_info_with_data(self) -> ChunkInfo {
        let mut info = self.info;
        info.encrypted_data = Some(self.ciphertext);
        info
    }
}

/// Whole-file values produced once every chunk is encrypted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSeal {
    pub file_id: String,
    pub total_chunks: u64,
    pub original_size: u64,
    pub encrypted_size: u64,
    pub master_iv: [u8; IV_SIZE],
    pub master_auth_tag: String,
}

/// Streaming chunk encryptor: feed chunks in index order, then `finish`.
///
/// Holds at most one chunk at a time, so callers can ship each chunk as
/// soon as it is produced.
pub struct ChunkEncryptor {
    material: KeyMaterial,
    key: DerivedKey,
    file_id: String,
    original_size: u64,
    total_chunks: u64,
    next_index: u64,
    bytes_in: u64,
    bytes_out: u64,
    tags: Vec<String>,
    state: ChunkState,
}

impl ChunkEncryptor {
    /// Start a file with a fresh random file id.
    pub fn new(material: &KeyMaterial, original_size: u64) -> Self {
        Self::with_file_id(material, uuid::Uuid::new_v4().to_string(), original_size)
    }

    pub fn with_file_id(material: &KeyMaterial, file_id: impl Into<String>, original_size: u64) -> Self {
        let total_chunks = total_chunks_for(original_size);
        Self {
            material: material.clone(),
            key: material.derive(),
            file_id: file_id.into(),
            original_size,
            total_chunks,
            next_index: 0,
            bytes_in: 0,
            bytes_out: 0,
            tags: Vec::with_capacity(total_chunks as usize),
            state: if total_chunks == 0 {
                ChunkState::Finalizing
            } else {
                ChunkState::Reading
            },
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    pub fn original_size(&self) -> u64 {
        self.original_size
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Plaintext bytes consumed so far
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_in
    }

    /// Length the next chunk must have, or `None` once all are consumed.
    pub fn next_chunk_len(&self) -> Option<usize> {
        if self.next_index >= self.total_chunks {
            return None;
        }
        let remaining = self.original_size - self.bytes_in;
        Some(remaining.min(CHUNK_SIZE as u64) as usize)
    }

    /// Encrypt the next chunk. `plaintext` must be exactly `next_chunk_len()` bytes.
    pub fn encrypt_next(&mut self, plaintext: &[u8]) -> CourierResult<EncryptedChunk> {
        if self.state != ChunkState::Reading {
            return Err(CourierError::Other(anyhow::anyhow!(
                "chunk encryptor not accepting chunks in state {:?}",
                self.state
            )));
        }
        let expected = self.next_chunk_len().unwrap_or(0);
        if plaintext.len() != expected {
            self.state = ChunkState::Failed;
            return Err(CourierError::Other(anyhow::anyhow!(
                "chunk {} has {} bytes, expected {}",
                self.next_index,
                plaintext.len(),
                expected
            )));
        }

        let index = self.next_index;
        self.state = ChunkState::Encrypting(index);

        let aad = chunk_aad(&self.file_id, index);
        let (iv, gcm_tag, ciphertext) = match seal(&self.key, plaintext, &aad) {
            Ok(sealed) => sealed,
            Err(e) => {
                self.state = ChunkState::Failed;
                return Err(e);
            }
        };
        let auth_tag = chunk_tag(&self.material, &self.file_id, index, &ciphertext)?;

        self.tags.push(auth_tag.clone());
        self.bytes_in += plaintext.len() as u64;
        self.bytes_out += ciphertext.len() as u64;
        self.next_index += 1;
        self.state = if self.next_index == self.total_chunks {
            ChunkState::Finalizing
        } else {
            ChunkState::Reading
        };

        debug!(file_id = %self.file_id, index, size = plaintext.len(), "encrypted chunk");

        Ok(EncryptedChunk {
            info: ChunkInfo {
                index,
                iv,
                gcm_tag,
                auth_tag,
                encrypted_data: None,
                original_size: plaintext.len() as u64,
                encrypted_size: ciphertext.len() as u64,
            },
            ciphertext,
        })
    }

    /// Compute the master tag over all chunk tags, in index order.
    pub fn finish(&mut self) -> CourierResult<FileSeal> {
        if self.state != ChunkState::Finalizing {
            self.state = ChunkState::Failed;
            return Err(CourierError::Other(anyhow::anyhow!(
                "cannot finalize after {} of {} chunks",
                self.next_index,
                self.total_chunks
            )));
        }

        let master_auth_tag = master_tag(&self.material, &self.file_id, &self.tags)?;
        let mut master_iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut master_iv);
        self.state = ChunkState::Complete;

        Ok(FileSeal {
            file_id: self.file_id.clone(),
            total_chunks: self.total_chunks,
            original_size: self.original_size,
            encrypted_size: self.bytes_out,
            master_iv,
            master_auth_tag,
        })
    }
}

/// Build AAD: chunk_index (8 bytes BE) || file_id
fn chunk_aad(file_id: &str, index: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + file_id.len());
    aad.extend_from_slice(&index.to_be_bytes());
    aad.extend_from_slice(file_id.as_bytes());
    aad
}

fn new_mac(material: &KeyMaterial) -> CourierResult<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(material.mac_key())
        .map_err(|e| CourierError::Other(anyhow::anyhow!("HMAC key: {e}")))
}

fn chunk_mac(
    material: &KeyMaterial,
    file_id: &str,
    index: u64,
    ciphertext: &[u8],
) -> CourierResult<HmacSha256> {
    let mut mac = new_mac(material)?;
    mac.update(file_id.as_bytes());
    mac.update(b":");
    mac.update(index.to_string().as_bytes());
    mac.update(b":");
    mac.update(base64_encode(ciphertext).as_bytes());
    Ok(mac)
}

fn master_mac<'a>(
    material: &KeyMaterial,
    file_id: &str,
    tags: impl IntoIterator<Item = &'a str>,
) -> CourierResult<HmacSha256> {
    let mut mac = new_mac(material)?;
    mac.update(file_id.as_bytes());
    mac.update(b"master");
    for tag in tags {
        mac.update(tag.as_bytes());
    }
    Ok(mac)
}

fn chunk_tag(material: &KeyMaterial, file_id: &str, index: u64, ciphertext: &[u8]) -> CourierResult<String> {
    let mac = chunk_mac(material, file_id, index, ciphertext)?;
    Ok(base64_encode(&mac.finalize().into_bytes()))
}

fn master_tag(material: &KeyMaterial, file_id: &str, tags: &[String]) -> CourierResult<String> {
    let mac = master_mac(material, file_id, tags.iter().map(String::as_str))?;
    Ok(base64_encode(&mac.finalize().into_bytes()))
}

/// Constant-time comparison against a base64 tag.
fn mac_matches(mac: HmacSha256, expected_b64: &str) -> bool {
    match base64_decode(expected_b64) {
        Ok(expected) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

fn report(progress: Option<&ProgressFn>, p: Progress) {
    if let Some(cb) = progress {
        cb(&p);
    }
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> CourierResult<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(CourierError::Cancelled),
        _ => Ok(()),
    }
}

/// Encrypt `original_size` bytes from `reader`, writing each chunk's
/// ciphertext to `writer` as soon as it is sealed.
///
/// Returns the manifest; its chunks carry no ciphertext. At most one chunk
/// of plaintext is held at a time. Progress: `reading` 0%, `encrypting` up
/// to 95%, `finalizing` 95%, `complete` 100%. Control is yielded to the
/// executor between chunks and `cancel` is checked before each read.
#[allow(clippy::too_many_arguments)]
pub async fn encrypt_reader_chunked_to<R, W>(
    reader: &mut R,
    original_size: u64,
    file_name: &str,
    file_type: &str,
    material: &KeyMaterial,
    writer: &mut W,
    progress: Option<&ProgressFn>,
    cancel: Option<&CancellationToken>,
) -> CourierResult<ChunkedEncryptionResult>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut encryptor = ChunkEncryptor::new(material, original_size);
    let total = encryptor.total_chunks();
    report(progress, Progress::new(Phase::Reading, 0.0, 0, original_size));

    let mut buf = vec![0u8; (original_size.min(CHUNK_SIZE as u64)) as usize];
    let mut chunks = Vec::with_capacity(total as usize);

    let sealed: CourierResult<()> = async {
        while let Some(len) = encryptor.next_chunk_len() {
            check_cancelled(cancel)?;
            reader.read_exact(&mut buf[..len]).await?;
            let chunk = encryptor.encrypt_next(&buf[..len])?;
            writer.write_all(&chunk.ciphertext).await?;
            chunks.push(chunk.info);

            report(
                progress,
                Progress::in_band(
                    Phase::Encrypting,
                    0.0,
                    95.0,
                    chunks.len() as u64,
                    total,
                    encryptor.bytes_processed(),
                    original_size,
                ),
            );
            tokio::task::yield_now().await;
        }
        writer.flush().await?;
        Ok(())
    }
    .await;
    buf.zeroize();
    sealed?;

    report(
        progress,
        Progress::new(Phase::Finalizing, 95.0, original_size, original_size),
    );
    let seal = encryptor.finish()?;
    report(
        progress,
        Progress::new(Phase::Complete, 100.0, original_size, original_size),
    );

    Ok(ChunkedEncryptionResult::from_parts(
        file_name, file_type, chunks, seal,
    ))
}

/// Encrypt `original_size` bytes from `reader` into an in-memory result
/// with every chunk's ciphertext attached.
pub async fn encrypt_reader_chunked<R: AsyncRead + Unpin>(
    reader: &mut R,
    original_size: u64,
    file_name: &str,
    file_type: &str,
    material: &KeyMaterial,
    progress: Option<&ProgressFn>,
    cancel: Option<&CancellationToken>,
) -> CourierResult<ChunkedEncryptionResult> {
    let mut body = Vec::new();
    let mut result = encrypt_reader_chunked_to(
        reader,
        original_size,
        file_name,
        file_type,
        material,
        &mut body,
        progress,
        cancel,
    )
    .await?;

    let mut offset = 0usize;
    for chunk in &mut result.chunks {
        let end = offset + chunk.encrypted_size as usize;
        let data = body.get(offset..end).ok_or_else(|| {
            CourierError::Other(anyhow::anyhow!("chunk {} ciphertext missing", chunk.index))
        })?;
        chunk.encrypted_data = Some(data.to_vec());
        offset = end;
    }
    Ok(result)
}

/// Encrypt a file from disk through the chunked path.
pub async fn encrypt_file_chunked(
    path: &Path,
    material: &KeyMaterial,
    progress: Option<&ProgressFn>,
    cancel: Option<&CancellationToken>,
) -> CourierResult<ChunkedEncryptionResult> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();

    encrypt_reader_chunked(
        &mut file,
        size,
        &file_name_of(path),
        guess_file_type(path),
        material,
        progress,
        cancel,
    )
    .await
}

/// Check the whole-file structure and master tag. No chunk is decrypted.
///
/// Sizes in a manifest are not covered by any tag, so each one is bounded
/// here before callers size buffers from them.
pub fn verify_manifest(result: &ChunkedEncryptionResult, material: &KeyMaterial) -> CourierResult<()> {
    if result.total_chunks != result.chunks.len() as u64
        || result.total_chunks != total_chunks_for(result.original_size)
    {
        return Err(CourierError::FileIntegrity);
    }
    let mut declared = 0u64;
    for chunk in &result.chunks {
        // GCM ciphertext is exactly as long as its plaintext.
        if chunk.original_size > CHUNK_SIZE as u64 || chunk.encrypted_size != chunk.original_size {
            return Err(CourierError::FileIntegrity);
        }
        declared = declared
            .checked_add(chunk.original_size)
            .ok_or(CourierError::FileIntegrity)?;
    }
    if declared != result.original_size {
        return Err(CourierError::FileIntegrity);
    }

    let mac = master_mac(
        material,
        &result.file_id,
        result.chunks.iter().map(|c| c.auth_tag.as_str()),
    )?;
    if !mac_matches(mac, &result.master_auth_tag) {
        return Err(CourierError::FileIntegrity);
    }
    Ok(())
}

/// Verify and decrypt the chunk at `position` from its attached ciphertext.
fn open_chunk(
    file_id: &str,
    position: u64,
    chunk: &ChunkInfo,
    material: &KeyMaterial,
    key: &DerivedKey,
) -> CourierResult<Vec<u8>> {
    let data = chunk.encrypted_data.as_deref().ok_or_else(|| {
        CourierError::Envelope(format!("chunk {position} has no ciphertext attached"))
    })?;
    open_chunk_data(file_id, position, chunk, data, material, key)
}

fn open_chunk_data(
    file_id: &str,
    position: u64,
    chunk: &ChunkInfo,
    data: &[u8],
    material: &KeyMaterial,
    key: &DerivedKey,
) -> CourierResult<Vec<u8>> {
    let integrity = CourierError::ChunkIntegrity { index: position };
    if chunk.index != position {
        return Err(integrity);
    }
    if data.len() as u64 != chunk.encrypted_size {
        return Err(integrity);
    }

    let mac = chunk_mac(material, file_id, position, data)?;
    if !mac_matches(mac, &chunk.auth_tag) {
        return Err(integrity);
    }

    let aad = chunk_aad(file_id, position);
    let plaintext = open(key, &chunk.iv, &chunk.gcm_tag, data, &aad)
        .map_err(|_| CourierError::ChunkIntegrity { index: position })?;
    if plaintext.len() as u64 != chunk.original_size {
        return Err(integrity);
    }
    Ok(plaintext)
}

/// Verify-then-decrypt into `writer`, chunk by chunk. Returns bytes written.
///
/// The master tag is checked before any plaintext is written. A chunk that
/// fails later aborts with `ChunkIntegrity`; anything already written must
/// then be discarded by the caller.
pub async fn decrypt_file_chunked_to<W: AsyncWrite + Unpin>(
    result: &ChunkedEncryptionResult,
    material: &KeyMaterial,
    writer: &mut W,
    progress: Option<&ProgressFn>,
    cancel: Option<&CancellationToken>,
) -> CourierResult<u64> {
    verify_manifest(result, material)?;

    let key = material.derive();
    let total = result.total_chunks;
    let mut written = 0u64;

    for (position, chunk) in result.chunks.iter().enumerate() {
        check_cancelled(cancel)?;
        let mut plaintext = open_chunk(&result.file_id, position as u64, chunk, material, &key)?;
        writer.write_all(&plaintext).await?;
        written += plaintext.len() as u64;
        plaintext.zeroize();

        report_decrypted(progress, position as u64 + 1, total, written, result.original_size);
        tokio::task::yield_now().await;
    }
    finish_decrypt(writer, written, result, progress).await
}

/// Like [`decrypt_file_chunked_to`], but chunk ciphertext is read in index
/// order from `reader` instead of being attached to the manifest.
///
/// Only one chunk is buffered at a time. A short read is reported as an
/// integrity failure of the chunk being read.
pub async fn decrypt_reader_chunked_to<R, W>(
    result: &ChunkedEncryptionResult,
    material: &KeyMaterial,
    reader: &mut R,
    writer: &mut W,
    progress: Option<&ProgressFn>,
    cancel: Option<&CancellationToken>,
) -> CourierResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    verify_manifest(result, material)?;

    let key = material.derive();
    let total = result.total_chunks;
    let mut written = 0u64;
    let mut data = Vec::with_capacity(CHUNK_SIZE);

    for (position, chunk) in result.chunks.iter().enumerate() {
        let position = position as u64;
        check_cancelled(cancel)?;

        // Bounded by verify_manifest.
        data.resize(chunk.encrypted_size as usize, 0);
        reader.read_exact(&mut data).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CourierError::ChunkIntegrity { index: position }
            } else {
                CourierError::Io(e)
            }
        })?;

        let mut plaintext = open_chunk_data(&result.file_id, position, chunk, &data, material, &key)?;
        writer.write_all(&plaintext).await?;
        written += plaintext.len() as u64;
        plaintext.zeroize();

        report_decrypted(progress, position + 1, total, written, result.original_size);
        tokio::task::yield_now().await;
    }
    finish_decrypt(writer, written, result, progress).await
}

fn report_decrypted(progress: Option<&ProgressFn>, done: u64, total: u64, written: u64, size: u64) {
    report(
        progress,
        Progress::in_band(Phase::Decrypting, 0.0, 100.0, done, total, written, size),
    );
}

async fn finish_decrypt<W: AsyncWrite + Unpin>(
    writer: &mut W,
    written: u64,
    result: &ChunkedEncryptionResult,
    progress: Option<&ProgressFn>,
) -> CourierResult<u64> {
    writer.flush().await?;
    if written != result.original_size {
        return Err(CourierError::FileIntegrity);
    }
    report(
        progress,
        Progress::new(Phase::Complete, 100.0, written, result.original_size),
    );
    Ok(written)
}

/// Verify-then-decrypt into memory. On any failure no plaintext is returned.
pub async fn decrypt_file_chunked(
    result: &ChunkedEncryptionResult,
    material: &KeyMaterial,
    progress: Option<&ProgressFn>,
) -> CourierResult<Vec<u8>> {
    // Sizes are untrusted until the manifest checks out.
    verify_manifest(result, material)?;
    let mut out = Vec::with_capacity(result.original_size as usize);
    match decrypt_file_chunked_to(result, material, &mut out, progress, None).await {
        Ok(_) => Ok(out),
        Err(e) => {
            out.zeroize();
            Err(e)
        }
    }
}
