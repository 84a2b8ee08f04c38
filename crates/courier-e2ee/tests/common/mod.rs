//! In-memory backend fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use courier_core::config::CourierConfig;
use courier_core::{ConversationId, CourierError, CourierResult, UserId};
use courier_crypto::KeyMaterial;
use courier_e2ee::{
    FinalizeRequest, FinalizeResponse, InitUploadRequest, InitUploadResponse, KeyDirectory,
    Thumbnail, ThumbnailGenerator, UploadService,
};

/// Server-side state shared by every user's directory handle.
#[derive(Default)]
pub struct Server {
    keys: Mutex<HashMap<UserId, KeyMaterial>>,
    conversations: Mutex<HashMap<ConversationId, Vec<UserId>>>,
    pub publish_fails: AtomicBool,
}

impl Server {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_conversation(&self, id: &str, members: &[&str]) {
        self.conversations.lock().unwrap().insert(
            ConversationId::new(id),
            members.iter().map(|m| UserId::new(*m)).collect(),
        );
    }

    pub fn published_key(&self, user: &str) -> Option<KeyMaterial> {
        self.keys.lock().unwrap().get(&UserId::new(user)).cloned()
    }

    pub fn set_key(&self, user: &str, material: KeyMaterial) {
        self.keys.lock().unwrap().insert(UserId::new(user), material);
    }

    pub fn directory(self: &Arc<Self>, user: &str) -> Directory {
        Directory {
            server: self.clone(),
            me: UserId::new(user),
        }
    }
}

/// A user's authenticated view of the key directory
#[derive(Clone)]
pub struct Directory {
    server: Arc<Server>,
    me: UserId,
}

impl KeyDirectory for Directory {
    async fn fetch_public_key(&self, user_id: &UserId) -> CourierResult<KeyMaterial> {
        self.server
            .keys
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .ok_or_else(|| CourierError::PeerKeyUnavailable {
                user_id: user_id.to_string(),
            })
    }

    async fn publish_public_key(&self, material: &KeyMaterial) -> CourierResult<()> {
        if self.server.publish_fails.load(Ordering::SeqCst) {
            return Err(CourierError::Transport("503 Service Unavailable".into()));
        }
        self.server
            .keys
            .lock()
            .unwrap()
            .insert(self.me.clone(), material.clone());
        Ok(())
    }

    async fn conversation_participants(&self, conversation: &ConversationId) -> CourierResult<Vec<UserId>> {
        self.server
            .conversations
            .lock()
            .unwrap()
            .get(conversation)
            .cloned()
            .ok_or_else(|| CourierError::Transport(format!("404 conversation {conversation}")))
    }
}

/// Object storage plus upload-session bookkeeping
#[derive(Default)]
pub struct Uploads {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub init_requests: Mutex<Vec<InitUploadRequest>>,
    pub finalized: Mutex<Vec<FinalizeRequest>>,
    pub thumbnails: AtomicUsize,
    /// Fail the PUT for this chunk index
    pub fail_chunk: Option<u64>,
    /// Complete higher indices first
    pub reverse_completion: bool,
    pub max_concurrent: AtomicUsize,
    pub current: AtomicUsize,
    /// `start <i>` and `done <i>` in the order PUTs began and finished
    pub put_log: Mutex<Vec<String>>,
}

impl Uploads {
    pub fn chunk_url(upload_id: &str, index: u64) -> String {
        format!("https://storage.test/{upload_id}/{index}")
    }

    fn index_of(url: &str) -> u64 {
        url.rsplit('/').next().and_then(|i| i.parse().ok()).unwrap_or(u64::MAX)
    }

    pub fn object(&self, url: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(url).cloned()
    }

    pub fn last_finalize(&self) -> Option<FinalizeRequest> {
        self.finalized.lock().unwrap().last().cloned()
    }

    pub fn log_position(&self, event: &str) -> Option<usize> {
        self.put_log.lock().unwrap().iter().position(|e| e == event)
    }
}

impl UploadService for Uploads {
    async fn init_upload(&self, request: &InitUploadRequest) -> CourierResult<InitUploadResponse> {
        let mut inits = self.init_requests.lock().unwrap();
        inits.push(request.clone());
        let upload_id = format!("up-{}", inits.len());
        let upload_urls = (0..request.total_chunks)
            .map(|i| Self::chunk_url(&upload_id, i))
            .collect();
        Ok(InitUploadResponse {
            upload_id,
            upload_urls,
        })
    }

    async fn put_chunk(&self, url: &str, data: Bytes) -> CourierResult<Option<String>> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let index = Self::index_of(url);
        self.put_log.lock().unwrap().push(format!("start {index}"));
        if self.reverse_completion {
            tokio::time::sleep(Duration::from_millis(50 * 4u64.saturating_sub(index))).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.put_log.lock().unwrap().push(format!("done {index}"));

        if self.fail_chunk == Some(index) {
            return Err(CourierError::Transport(format!("500 writing chunk {index}")));
        }
        self.objects.lock().unwrap().insert(url.to_string(), data.to_vec());
        Ok(Some(format!("\"etag-{index}\"")))
    }

    async fn finalize_upload(&self, request: &FinalizeRequest) -> CourierResult<FinalizeResponse> {
        self.finalized.lock().unwrap().push(request.clone());
        Ok(FinalizeResponse {
            file_id: format!("file-{}", request.upload_id),
        })
    }

    async fn upload_thumbnail(&self, _thumbnail: &Thumbnail) -> CourierResult<String> {
        self.thumbnails.fetch_add(1, Ordering::SeqCst);
        Ok("https://storage.test/thumbs/1.jpg".into())
    }
}

/// Thumbnail generator that succeeds or fails on demand
pub struct Thumbnails {
    pub fail: bool,
}

impl ThumbnailGenerator for Thumbnails {
    async fn generate(&self, _path: &Path, file_type: &str, max_dimension: u32) -> CourierResult<Option<Thumbnail>> {
        if self.fail {
            return Err(CourierError::Other(anyhow::anyhow!("decoder crashed")));
        }
        if !file_type.starts_with("image/") {
            return Ok(None);
        }
        Ok(Some(Thumbnail {
            content_type: "image/jpeg".into(),
            width: max_dimension,
            height: max_dimension,
            bytes: vec![0xFF, 0xD8, 0xFF],
        }))
    }
}

pub fn config_for(user: &str) -> CourierConfig {
    let mut config = CourierConfig::default();
    config.backend.user_id = user.into();
    config.keys.readiness_timeout_ms = 200;
    config.upload.max_in_flight_chunks = 2;
    config
}

pub fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 5)) as u8)
        .collect()
}
