//! Peer key material: fetch from the directory, cache for the session.
//!
//! There is no TTL. A peer who rotated keys is picked up after
//! `invalidate_peer` or a fresh session; callers re-fetch on a miss.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use courier_core::{ConversationId, CourierError, CourierResult, UserId};
use courier_crypto::{DerivedKey, KeyCache, KeyMaterial, KeyPurpose};

use crate::backend::KeyDirectory;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KeyExchange<D> {
    directory: D,
    cache: Arc<KeyCache>,
    self_id: UserId,
    fetch_timeout: Duration,
}

impl<D: KeyDirectory> KeyExchange<D> {
    pub fn new(directory: D, cache: Arc<KeyCache>, self_id: UserId) -> Self {
        Self {
            directory,
            cache,
            self_id,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    /// A peer's published key material, from cache or the directory.
    pub async fn fetch_peer_key_material(&self, user_id: &UserId) -> CourierResult<KeyMaterial> {
        if let Some(material) = self.cache.get_material(user_id) {
            return Ok(material);
        }

        let material = tokio::time::timeout(self.fetch_timeout, self.directory.fetch_public_key(user_id))
            .await
            .map_err(|_| CourierError::Transport(format!("key fetch for {user_id} timed out")))??;

        self.cache.insert_material(user_id.clone(), material.clone());
        debug!(user_id = %user_id, "cached peer key material");
        Ok(material)
    }

    /// A peer's derived AES key.
    pub async fn peer_derived_key(&self, user_id: &UserId) -> CourierResult<DerivedKey> {
        if let Some(key) = self.cache.get_derived(&KeyPurpose::Peer(user_id.clone())) {
            return Ok(key);
        }
        Ok(self.fetch_peer_key_material(user_id).await?.derive())
    }

    /// Conversation members, deduplicated in backend order.
    pub async fn resolve_conversation_participants(
        &self,
        conversation: &ConversationId,
        exclude_self: bool,
    ) -> CourierResult<Vec<UserId>> {
        let members = tokio::time::timeout(
            self.fetch_timeout,
            self.directory.conversation_participants(conversation),
        )
        .await
        .map_err(|_| {
            CourierError::Transport(format!("participant lookup for {conversation} timed out"))
        })??;

        let mut participants: Vec<UserId> = Vec::with_capacity(members.len());
        for member in members {
            if exclude_self && member == self.self_id {
                continue;
            }
            if !participants.contains(&member) {
                participants.push(member);
            }
        }
        Ok(participants)
    }

    /// Populate the cache for `user_ids` concurrently.
    ///
    /// Individual failures are logged and skipped. Returns how many peers
    /// now have cached material.
    pub async fn prefetch_keys(&self, user_ids: &[UserId]) -> usize {
        let results = join_all(
            user_ids
                .iter()
                .map(|id| async move { (id, self.fetch_peer_key_material(id).await) }),
        )
        .await;

        let mut cached = 0;
        for (id, result) in results {
            match result {
                Ok(_) => cached += 1,
                Err(e) => warn!(user_id = %id, "key prefetch failed: {e}"),
            }
        }
        cached
    }

    pub fn invalidate_peer(&self, user_id: &UserId) {
        self.cache.invalidate_peer(user_id);
    }
}
