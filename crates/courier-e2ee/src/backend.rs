//! Collaborator interfaces: key directory, upload service, thumbnails.
//!
//! Wire types mirror the backend's JSON. The pipeline only depends on these
//! traits, so tests run against in-memory fakes.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use courier_core::{ConversationId, CourierResult, UserId};
use courier_crypto::{ChunkedEncryptionResult, KeyMaterial, RecipientKeyEntry};

/// Publishes and serves per-user key material; lists conversation members.
pub trait KeyDirectory: Send + Sync {
    /// Fails with `PeerKeyUnavailable` when the user has published nothing.
    fn fetch_public_key(&self, user_id: &UserId) -> impl Future<Output = CourierResult<KeyMaterial>> + Send;

    fn publish_public_key(&self, material: &KeyMaterial) -> impl Future<Output = CourierResult<()>> + Send;

    fn conversation_participants(
        &self,
        conversation: &ConversationId,
    ) -> impl Future<Output = CourierResult<Vec<UserId>>> + Send;
}

/// Chunked upload sessions against presigned write targets.
pub trait UploadService: Send + Sync {
    fn init_upload(
        &self,
        request: &InitUploadRequest,
    ) -> impl Future<Output = CourierResult<InitUploadResponse>> + Send;

    /// Write one chunk's ciphertext. Returns the ETag, if the target sent one.
    fn put_chunk(&self, url: &str, data: Bytes) -> impl Future<Output = CourierResult<Option<String>>> + Send;

    fn finalize_upload(
        &self,
        request: &FinalizeRequest,
    ) -> impl Future<Output = CourierResult<FinalizeResponse>> + Send;

    /// Store an (unencrypted) thumbnail; returns its URL.
    fn upload_thumbnail(&self, thumbnail: &Thumbnail) -> impl Future<Output = CourierResult<String>> + Send;
}

/// Produces a small preview for images and video.
pub trait ThumbnailGenerator: Send + Sync {
    /// `Ok(None)` when the file type has no preview.
    fn generate(
        &self,
        path: &Path,
        file_type: &str,
        max_dimension: u32,
    ) -> impl Future<Output = CourierResult<Option<Thumbnail>>> + Send;
}

/// Generator for builds without an image pipeline
#[derive(Debug, Clone, Copy, Default)]
pub struct NoThumbnails;

impl ThumbnailGenerator for NoThumbnails {
    async fn generate(&self, _path: &Path, _file_type: &str, _max_dimension: u32) -> CourierResult<Option<Thumbnail>> {
        Ok(None)
    }
}

impl<D: KeyDirectory> KeyDirectory for Arc<D> {
    fn fetch_public_key(&self, user_id: &UserId) -> impl Future<Output = CourierResult<KeyMaterial>> + Send {
        (**self).fetch_public_key(user_id)
    }

    fn publish_public_key(&self, material: &KeyMaterial) -> impl Future<Output = CourierResult<()>> + Send {
        (**self).publish_public_key(material)
    }

    fn conversation_participants(
        &self,
        conversation: &ConversationId,
    ) -> impl Future<Output = CourierResult<Vec<UserId>>> + Send {
        (**self).conversation_participants(conversation)
    }
}

impl<U: UploadService> UploadService for Arc<U> {
    fn init_upload(
        &self,
        request: &InitUploadRequest,
    ) -> impl Future<Output = CourierResult<InitUploadResponse>> + Send {
        (**self).init_upload(request)
    }

    fn put_chunk(&self, url: &str, data: Bytes) -> impl Future<Output = CourierResult<Option<String>>> + Send {
        (**self).put_chunk(url, data)
    }

    fn finalize_upload(
        &self,
        request: &FinalizeRequest,
    ) -> impl Future<Output = CourierResult<FinalizeResponse>> + Send {
        (**self).finalize_upload(request)
    }

    fn upload_thumbnail(&self, thumbnail: &Thumbnail) -> impl Future<Output = CourierResult<String>> + Send {
        (**self).upload_thumbnail(thumbnail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub content_type: String,
    pub width: u32,
    pub height: u32,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u64,
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// One presigned write URL per chunk index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub upload_id: String,
    pub upload_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// File-level values sent at finalize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeMetadata {
    /// base64 master IV
    pub iv: String,
    /// base64 master HMAC tag
    #[serde(rename = "authTag")]
    pub auth_tag: String,
    pub original_size: u64,
    pub encrypted_size: u64,
    pub file_name: String,
    pub file_type: String,
    /// Chunk count
    pub chunks: u64,
    /// Per-chunk ivs and tags, without ciphertext
    pub manifest: ChunkedEncryptionResult,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipient_keys: Vec<RecipientKeyEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl FinalizeMetadata {
    pub fn from_manifest(
        manifest: ChunkedEncryptionResult,
        recipient_keys: Vec<RecipientKeyEntry>,
        thumbnail_url: Option<String>,
    ) -> Self {
        let manifest = manifest.manifest();
        Self {
            iv: STANDARD.encode(manifest.master_iv),
            auth_tag: manifest.master_auth_tag.clone(),
            original_size: manifest.original_size,
            encrypted_size: manifest.encrypted_size,
            file_name: manifest.file_name.clone(),
            file_type: manifest.file_type.clone(),
            chunks: manifest.total_chunks,
            manifest,
            recipient_keys,
            thumbnail_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub upload_id: String,
    /// Acknowledgements in chunk index order
    pub chunks: Vec<ChunkAck>,
    pub metadata: FinalizeMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub file_id: String,
}
