//! Direct and group message encryption.
//!
//! Every envelope carries one ciphertext per recipient plus one under the
//! sender's own key. Decryption never fails outward: problems surface as a
//! `DecryptedMessage::Placeholder` for the UI to render.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use courier_core::{ConversationId, CourierError, CourierResult, UserId};
use courier_crypto::{
    encrypt_text, DecryptedMessage, KeyStore, MessageEnvelope, PlaceholderReason,
    RecipientCiphertext,
};
use courier_secrets::SecretStore;

use crate::backend::KeyDirectory;
use crate::exchange::KeyExchange;

/// A group envelope plus the participants it could not cover
#[derive(Debug, Clone)]
pub struct GroupEncryption {
    pub envelope: MessageEnvelope,
    /// Participants whose key could not be resolved
    pub skipped: Vec<UserId>,
}

pub struct MessageCipher<S, D> {
    keys: Arc<KeyStore<S>>,
    exchange: Arc<KeyExchange<D>>,
    readiness_timeout: Duration,
}

impl<S: SecretStore, D: KeyDirectory> MessageCipher<S, D> {
    pub fn new(keys: Arc<KeyStore<S>>, exchange: Arc<KeyExchange<D>>, readiness_timeout: Duration) -> Self {
        Self {
            keys,
            exchange,
            readiness_timeout,
        }
    }

    /// Encrypt for one recipient plus a self-copy.
    pub async fn encrypt_message(&self, recipient: &UserId, plaintext: &str) -> CourierResult<MessageEnvelope> {
        self.keys.wait_ready(self.readiness_timeout).await?;
        let own = self.keys.get_my_derived_key().await?;
        let theirs = self.exchange.peer_derived_key(recipient).await?;

        Ok(MessageEnvelope::Direct {
            recipient_encrypted: encrypt_text(&theirs, plaintext)?,
            sender_encrypted: encrypt_text(&own, plaintext)?,
        })
    }

    /// Encrypt once per conversation member plus a self-copy.
    ///
    /// Members whose key cannot be fetched are left out and reported in
    /// `skipped`; the send itself only fails if our own key is missing or
    /// the participant list cannot be loaded.
    pub async fn encrypt_message_for_group(
        &self,
        conversation: &ConversationId,
        plaintext: &str,
    ) -> CourierResult<GroupEncryption> {
        self.keys.wait_ready(self.readiness_timeout).await?;
        let own = self.keys.get_my_derived_key().await?;
        let participants = self
            .exchange
            .resolve_conversation_participants(conversation, true)
            .await?;

        let exchange = &self.exchange;
        let keyed = join_all(
            participants
                .into_iter()
                .map(|id| async move {
                    let key = exchange.peer_derived_key(&id).await;
                    (id, key)
                }),
        )
        .await;

        let mut recipients = Vec::with_capacity(keyed.len());
        let mut skipped = Vec::new();
        for (user_id, key) in keyed {
            match key.and_then(|k| encrypt_text(&k, plaintext)) {
                Ok(encrypted) => recipients.push(RecipientCiphertext { user_id, encrypted }),
                Err(e) => {
                    warn!(user_id = %user_id, conversation = %conversation, "skipping recipient: {e}");
                    skipped.push(user_id);
                }
            }
        }

        debug!(
            conversation = %conversation,
            recipients = recipients.len(),
            skipped = skipped.len(),
            "encrypted group message"
        );

        Ok(GroupEncryption {
            envelope: MessageEnvelope::Group {
                recipients,
                sender_encrypted: encrypt_text(&own, plaintext)?,
            },
            skipped,
        })
    }

    /// Decrypt a serialized envelope sent by `sender`.
    pub async fn decrypt_message(&self, sender: &UserId, serialized: &str) -> DecryptedMessage {
        match MessageEnvelope::from_json(serialized) {
            Ok(envelope) => self.decrypt_envelope(sender, &envelope).await,
            Err(e) => {
                debug!(sender = %sender, "unreadable envelope: {e}");
                DecryptedMessage::Placeholder(PlaceholderReason::Malformed)
            }
        }
    }

    /// Keys that are not ready yet yield a retryable placeholder instead of
    /// blocking.
    pub async fn decrypt_envelope(&self, sender: &UserId, envelope: &MessageEnvelope) -> DecryptedMessage {
        if !self.keys.is_ready() {
            return DecryptedMessage::Placeholder(PlaceholderReason::KeysNotReady);
        }
        let own = match self.keys.get_my_derived_key().await {
            Ok(key) => key,
            Err(e) => {
                if !matches!(e, CourierError::KeyNotInitialized) {
                    warn!("own key unavailable for decryption: {e}");
                }
                return DecryptedMessage::Placeholder(PlaceholderReason::KeysNotReady);
            }
        };
        DecryptedMessage::open(envelope, self.exchange.self_id(), sender, &own)
    }
}
