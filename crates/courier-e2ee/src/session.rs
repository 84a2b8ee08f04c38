//! One signed-in device's E2EE state: key store, key cache, peer keys.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use courier_core::config::CourierConfig;
use courier_core::{ConversationId, CourierError, CourierResult, ProgressFn, UserId};
use courier_crypto::{KeyCache, KeyMaterial, KeyStore};
use courier_secrets::SecretStore;

use crate::backend::{KeyDirectory, ThumbnailGenerator, UploadService};
use crate::exchange::KeyExchange;
use crate::message::MessageCipher;
use crate::upload::{StreamingUploadCoordinator, UploadOutcome};

pub struct E2eeSession<S, D> {
    keys: Arc<KeyStore<S>>,
    exchange: Arc<KeyExchange<D>>,
    messages: MessageCipher<S, D>,
}

impl<S: SecretStore, D: KeyDirectory> E2eeSession<S, D> {
    /// Initialize (or load) this device's key and publish it.
    ///
    /// A failed publish is logged and does not fail the session: peers keep
    /// the previously published material until the next start.
    pub async fn start(store: S, directory: D, config: &CourierConfig) -> CourierResult<Self> {
        if config.backend.user_id.is_empty() {
            return Err(CourierError::Config("backend.user_id is not set".into()));
        }
        let self_id = UserId::new(config.backend.user_id.as_str());
        let readiness = Duration::from_millis(config.keys.readiness_timeout_ms);
        let cache = Arc::new(KeyCache::new());

        let keys = Arc::new(KeyStore::new(
            store,
            config.keys.master_key_entry.as_str(),
            cache.clone(),
        ));
        let exchange = Arc::new(
            KeyExchange::new(directory, cache, self_id.clone())
                .with_fetch_timeout(Duration::from_secs(config.backend.request_timeout_secs)),
        );
        let session = Self {
            messages: MessageCipher::new(keys.clone(), exchange.clone(), readiness),
            keys,
            exchange,
        };

        let material = session.keys.initialize_keys().await?;
        session.publish(&material).await;
        info!(user_id = %self_id, "e2ee session started");
        Ok(session)
    }

    pub fn keys(&self) -> &KeyStore<S> {
        &self.keys
    }

    pub fn exchange(&self) -> &KeyExchange<D> {
        &self.exchange
    }

    pub fn messages(&self) -> &MessageCipher<S, D> {
        &self.messages
    }

    pub fn user_id(&self) -> &UserId {
        self.exchange.self_id()
    }

    /// Delete the device key and forget every cached key.
    pub async fn logout(&self) -> CourierResult<()> {
        self.keys.clear_keys().await?;
        info!(user_id = %self.user_id(), "e2ee session ended");
        Ok(())
    }

    /// Replace the device key and publish the new material.
    pub async fn rotate_keys(&self) -> CourierResult<KeyMaterial> {
        let material = self.keys.rotate_keys().await?;
        self.publish(&material).await;
        Ok(material)
    }

    /// Upload a file readable only by this device, under its own key.
    pub async fn upload_private_file<U: UploadService, T: ThumbnailGenerator>(
        &self,
        coordinator: &StreamingUploadCoordinator<U, T>,
        path: &Path,
        progress: Option<&ProgressFn>,
        cancel: Option<&CancellationToken>,
    ) -> CourierResult<UploadOutcome> {
        let material = self.keys.own_material().await?;
        coordinator
            .upload_file(path, &material, Vec::new(), progress, cancel)
            .await
    }

    /// Hybrid upload for every member of `conversation` plus this device.
    ///
    /// Members whose key cannot be resolved are left out, as for group
    /// messages.
    pub async fn share_file<U: UploadService, T: ThumbnailGenerator>(
        &self,
        coordinator: &StreamingUploadCoordinator<U, T>,
        path: &Path,
        conversation: &ConversationId,
        progress: Option<&ProgressFn>,
        cancel: Option<&CancellationToken>,
    ) -> CourierResult<UploadOutcome> {
        let own = self.keys.get_my_derived_key().await?;
        let members = self
            .exchange
            .resolve_conversation_participants(conversation, true)
            .await?;

        let exchange = &self.exchange;
        let resolved = join_all(members.into_iter().map(|id| async move {
            let key = exchange.peer_derived_key(&id).await;
            (id, key)
        }))
        .await;

        let mut recipients = vec![(self.user_id().clone(), own)];
        for (id, key) in resolved {
            match key {
                Ok(key) => recipients.push((id, key)),
                Err(e) => warn!(user_id = %id, conversation = %conversation, "file not shared with member: {e}"),
            }
        }

        coordinator
            .upload_shared_file(path, &recipients, progress, cancel)
            .await
    }

    async fn publish(&self, material: &KeyMaterial) {
        if let Err(e) = self.exchange.directory().publish_public_key(material).await {
            warn!(user_id = %self.user_id(), "publishing key material failed: {e}");
        }
    }
}
