//! Streaming encrypted uploads.
//!
//! Per file:
//! ```text
//! thumbnail (0-5%) → init session → [encrypt chunk i → PUT url_i] ... → finalize
//!                                    encrypting 5-50%, uploading 50-95%   95-100%
//! ```
//! Each chunk's PUT is issued as soon as the chunk is encrypted, with at most
//! `max_in_flight` PUTs outstanding. Acks complete in any order and are kept
//! by index; finalize lists them in index order. Any chunk failure aborts the
//! upload and nothing is finalized. Thumbnail failures are only logged.

use std::path::Path;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use courier_core::config::UploadConfig;
use courier_core::{CourierError, CourierResult, Phase, Progress, ProgressFn, UserId};
use courier_crypto::{
    find_entry, guess_file_type, unwrap_file_key, wrap_file_key, ChunkEncryptor,
    ChunkedEncryptionResult, DerivedKey, FileKey, KeyMaterial, RecipientKeyEntry, CHUNK_SIZE,
};

use crate::backend::{
    ChunkAck, FinalizeMetadata, FinalizeRequest, InitUploadRequest, ThumbnailGenerator,
    UploadService,
};

/// Result of a finalized upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Server-side reference for the stored file
    pub file_id: String,
    pub upload_id: String,
    /// Chunk manifest (no ciphertext) needed to verify and decrypt later
    pub manifest: ChunkedEncryptionResult,
    pub thumbnail_url: Option<String>,
}

pub struct StreamingUploadCoordinator<U, T> {
    uploader: U,
    thumbnails: T,
    max_in_flight: usize,
    thumbnail_max_dimension: u32,
}

/// Acks indexed by chunk, whatever order they complete in.
struct AckTracker {
    acks: Vec<Option<ChunkAck>>,
    done: u64,
}

impl AckTracker {
    fn new(total: u64) -> Self {
        Self {
            acks: vec![None; total as usize],
            done: 0,
        }
    }

    fn record(&mut self, index: u64, result: CourierResult<Option<String>>) -> CourierResult<()> {
        let etag = result.map_err(|e| CourierError::Upload(format!("chunk {index}: {e}")))?;
        let slot = self
            .acks
            .get_mut(index as usize)
            .ok_or_else(|| CourierError::Upload(format!("ack for unknown chunk {index}")))?;
        *slot = Some(ChunkAck { index, etag });
        self.done += 1;
        Ok(())
    }

    fn into_ordered(self) -> CourierResult<Vec<ChunkAck>> {
        self.acks
            .into_iter()
            .enumerate()
            .map(|(i, ack)| ack.ok_or_else(|| CourierError::Upload(format!("chunk {i} was never acknowledged"))))
            .collect()
    }
}

/// Forwards progress, never letting the percentage go backwards: with
/// pipelining, upload acks can land before later chunks are encrypted.
struct Reporter<'a> {
    callback: Option<&'a ProgressFn>,
    last: f64,
}

impl<'a> Reporter<'a> {
    fn new(callback: Option<&'a ProgressFn>) -> Self {
        Self { callback, last: 0.0 }
    }

    fn emit(&mut self, mut p: Progress) {
        p.percent = p.percent.max(self.last);
        self.last = p.percent;
        if let Some(cb) = self.callback {
            cb(&p);
        }
    }
}

impl<U: UploadService, T: ThumbnailGenerator> StreamingUploadCoordinator<U, T> {
    pub fn new(uploader: U, thumbnails: T, config: &UploadConfig) -> Self {
        Self {
            uploader,
            thumbnails,
            max_in_flight: config.max_in_flight_chunks.max(1),
            thumbnail_max_dimension: config.thumbnail_max_dimension,
        }
    }

    pub fn uploader(&self) -> &U {
        &self.uploader
    }

    /// Encrypt `path` under `material` and upload it chunk by chunk.
    ///
    /// `recipient_keys` is forwarded in the finalize metadata (hybrid uploads).
    pub async fn upload_file(
        &self,
        path: &Path,
        material: &KeyMaterial,
        recipient_keys: Vec<RecipientKeyEntry>,
        progress: Option<&ProgressFn>,
        cancel: Option<&CancellationToken>,
    ) -> CourierResult<UploadOutcome> {
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let file_type = guess_file_type(path);

        let mut reporter = Reporter::new(progress);
        reporter.emit(Progress::new(Phase::Thumbnail, 0.0, 0, size));
        let thumbnail_url = self.upload_thumbnail(path, file_type).await;
        reporter.emit(Progress::new(Phase::Thumbnail, 5.0, 0, size));

        let mut encryptor = ChunkEncryptor::new(material, size);
        let total = encryptor.total_chunks();

        let session = self
            .uploader
            .init_upload(&InitUploadRequest {
                file_name: file_name.clone(),
                file_size: size,
                total_chunks: total,
                file_type: file_type.to_string(),
                thumbnail_url: thumbnail_url.clone(),
            })
            .await?;
        if session.upload_urls.len() as u64 != total {
            return Err(CourierError::Upload(format!(
                "upload session issued {} urls for {total} chunks",
                session.upload_urls.len()
            )));
        }
        info!(upload_id = %session.upload_id, file = %file_name, size, chunks = total, "upload started");

        let uploader = &self.uploader;
        let mut in_flight = FuturesUnordered::new();
        let mut acks = AckTracker::new(total);
        let mut infos = Vec::with_capacity(total as usize);
        let mut buf = vec![0u8; size.min(CHUNK_SIZE as u64) as usize];

        let uploading = |done: u64| {
            let bytes = (done * CHUNK_SIZE as u64).min(size);
            Progress::in_band(Phase::Uploading, 50.0, 95.0, done, total, bytes, size)
        };

        let result: CourierResult<()> = async {
            while let Some(len) = encryptor.next_chunk_len() {
                if cancel.is_some_and(|c| c.is_cancelled()) {
                    return Err(CourierError::Cancelled);
                }
                while in_flight.len() >= self.max_in_flight {
                    if let Some((index, put)) = in_flight.next().await {
                        acks.record(index, put)?;
                        reporter.emit(uploading(acks.done));
                    }
                }

                file.read_exact(&mut buf[..len]).await?;
                let chunk = encryptor.encrypt_next(&buf[..len])?;
                reporter.emit(Progress::in_band(
                    Phase::Encrypting,
                    5.0,
                    50.0,
                    chunk.info.index + 1,
                    total,
                    encryptor.bytes_processed(),
                    size,
                ));

                let index = chunk.info.index;
                let url = session.upload_urls[index as usize].as_str();
                let data = Bytes::from(chunk.ciphertext);
                infos.push(chunk.info);
                in_flight.push(async move { (index, uploader.put_chunk(url, data).await) });
                // Start the new PUT now and collect any that already finished.
                while let Some(Some((index, put))) = in_flight.next().now_or_never() {
                    acks.record(index, put)?;
                    reporter.emit(uploading(acks.done));
                }
            }

            while let Some((index, put)) = in_flight.next().await {
                acks.record(index, put)?;
                reporter.emit(uploading(acks.done));
                if cancel.is_some_and(|c| c.is_cancelled()) {
                    return Err(CourierError::Cancelled);
                }
            }
            Ok(())
        }
        .await;
        buf.zeroize();

        if let Err(e) = result {
            // Dropping the set cancels any PUTs still in flight.
            drop(in_flight);
            warn!(upload_id = %session.upload_id, "upload aborted: {e}");
            return Err(e);
        }

        reporter.emit(Progress::new(Phase::Finalizing, 95.0, size, size));
        let seal = encryptor.finish()?;
        let manifest = ChunkedEncryptionResult::from_parts(file_name, file_type, infos, seal);

        let response = self
            .uploader
            .finalize_upload(&FinalizeRequest {
                upload_id: session.upload_id.clone(),
                chunks: acks.into_ordered()?,
                metadata: FinalizeMetadata::from_manifest(
                    manifest.clone(),
                    recipient_keys,
                    thumbnail_url.clone(),
                ),
            })
            .await?;

        reporter.emit(Progress::new(Phase::Complete, 100.0, size, size));
        info!(upload_id = %session.upload_id, file_id = %response.file_id, "upload finalized");

        Ok(UploadOutcome {
            file_id: response.file_id,
            upload_id: session.upload_id,
            manifest,
            thumbnail_url,
        })
    }

    /// Hybrid upload: encrypt once under a fresh file key and wrap that key
    /// for every recipient.
    pub async fn upload_shared_file(
        &self,
        path: &Path,
        recipients: &[(UserId, DerivedKey)],
        progress: Option<&ProgressFn>,
        cancel: Option<&CancellationToken>,
    ) -> CourierResult<UploadOutcome> {
        let file_key = FileKey::generate();
        let entries = recipients
            .iter()
            .map(|(user_id, key)| wrap_file_key(&file_key, user_id, key))
            .collect::<CourierResult<Vec<_>>>()?;
        debug!(recipients = entries.len(), "wrapped file key");

        self.upload_file(path, &file_key.to_material(), entries, progress, cancel)
            .await
    }

    /// Best effort; a failure is logged and the upload proceeds without one.
    async fn upload_thumbnail(&self, path: &Path, file_type: &str) -> Option<String> {
        let thumbnail = match self
            .thumbnails
            .generate(path, file_type, self.thumbnail_max_dimension)
            .await
        {
            Ok(Some(t)) => t,
            Ok(None) => return None,
            Err(e) => {
                warn!(path = %path.display(), "thumbnail generation failed: {e}");
                return None;
            }
        };
        match self.uploader.upload_thumbnail(&thumbnail).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(path = %path.display(), "thumbnail upload failed: {e}");
                None
            }
        }
    }
}

/// Key material for a hybrid-shared file, from this user's wrapped entry.
pub fn shared_file_material(
    entries: &[RecipientKeyEntry],
    me: &UserId,
    own_key: &DerivedKey,
) -> CourierResult<KeyMaterial> {
    let entry = find_entry(entries, me).ok_or_else(|| {
        CourierError::Envelope(format!("shared file has no key entry for {me}"))
    })?;
    Ok(unwrap_file_key(entry, own_key)?.to_material())
}
