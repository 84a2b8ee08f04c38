//! Message envelopes: the serialized form of an encrypted chat message.
//!
//! ```text
//! {"type":"direct", "recipient_encrypted": {..}, "sender_encrypted": {..}}
//! {"type":"group",  "recipients": [{"userId": "..", "encrypted": {..}}], "sender_encrypted": {..}}
//! {"type":"legacy", "ciphertext": ".."}
//! ```
//!
//! The sender always gets its own ciphertext so sent history stays readable
//! on the sending device without any recipient key.

use std::fmt;

use serde::{Deserialize, Serialize};

use courier_core::{CourierError, CourierResult, UserId};

use crate::cipher::{decrypt_text, EncryptedPayload};
use crate::keys::DerivedKey;

/// One group member's ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientCiphertext {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    pub encrypted: EncryptedPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageEnvelope {
    /// Pre-AEAD format. Recognised so it can be reported, never decrypted.
    Legacy { ciphertext: String },
    Direct {
        recipient_encrypted: EncryptedPayload,
        sender_encrypted: EncryptedPayload,
    },
    Group {
        recipients: Vec<RecipientCiphertext>,
        sender_encrypted: EncryptedPayload,
    },
}

impl MessageEnvelope {
    pub fn to_json(&self) -> CourierResult<String> {
        serde_json::to_string(self)
            .map_err(|e| CourierError::Other(anyhow::anyhow!("envelope serialization: {e}")))
    }

    pub fn from_json(s: &str) -> CourierResult<Self> {
        serde_json::from_str(s).map_err(|e| CourierError::Envelope(e.to_string()))
    }

    /// Pick the ciphertext `me` can open in a message sent by `sender`.
    pub fn select_ciphertext(
        &self,
        me: &UserId,
        sender: &UserId,
    ) -> Result<&EncryptedPayload, PlaceholderReason> {
        match self {
            MessageEnvelope::Legacy { .. } => Err(PlaceholderReason::LegacyFormat),
            MessageEnvelope::Direct {
                recipient_encrypted,
                sender_encrypted,
            } => Ok(if me == sender {
                sender_encrypted
            } else {
                recipient_encrypted
            }),
            MessageEnvelope::Group {
                recipients,
                sender_encrypted,
            } => {
                if me == sender {
                    return Ok(sender_encrypted);
                }
                recipients
                    .iter()
                    .find(|r| &r.user_id == me)
                    .map(|r| &r.encrypted)
                    .ok_or(PlaceholderReason::NotARecipient)
            }
        }
    }

    /// Number of ciphertexts addressed to others (excluding the sender's copy)
    pub fn recipient_count(&self) -> usize {
        match self {
            MessageEnvelope::Legacy { .. } => 0,
            MessageEnvelope::Direct { .. } => 1,
            MessageEnvelope::Group { recipients, .. } => recipients.len(),
        }
    }
}

/// Why a message is shown as a placeholder instead of its text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderReason {
    KeysNotReady,
    NotARecipient,
    Malformed,
    IntegrityFailed,
    LegacyFormat,
}

impl PlaceholderReason {
    /// Only a keys-not-ready placeholder can resolve on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlaceholderReason::KeysNotReady)
    }
}

impl fmt::Display for PlaceholderReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PlaceholderReason::KeysNotReady => "Waiting for encryption keys...",
            PlaceholderReason::NotARecipient => "This message was not encrypted for you",
            PlaceholderReason::Malformed => "This message could not be read",
            PlaceholderReason::IntegrityFailed => "This message failed its integrity check",
            PlaceholderReason::LegacyFormat => "This message uses an unsupported legacy format",
        };
        f.write_str(text)
    }
}

/// Result of decrypting a message for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptedMessage {
    Plaintext(String),
    Placeholder(PlaceholderReason),
}

impl DecryptedMessage {
    pub fn text(&self) -> Option<&str> {
        match self {
            DecryptedMessage::Plaintext(s) => Some(s),
            DecryptedMessage::Placeholder(_) => None,
        }
    }

    pub fn is_plaintext(&self) -> bool {
        matches!(self, DecryptedMessage::Plaintext(_))
    }

    /// Decrypt `envelope` as `me`. Never fails; failures become placeholders.
    pub fn open(envelope: &MessageEnvelope, me: &UserId, sender: &UserId, own_key: &DerivedKey) -> Self {
        let payload = match envelope.select_ciphertext(me, sender) {
            Ok(p) => p,
            Err(reason) => return DecryptedMessage::Placeholder(reason),
        };
        match decrypt_text(own_key, payload) {
            Ok(text) => DecryptedMessage::Plaintext(text),
            Err(e) if e.is_integrity_failure() => {
                DecryptedMessage::Placeholder(PlaceholderReason::IntegrityFailed)
            }
            Err(_) => DecryptedMessage::Placeholder(PlaceholderReason::Malformed),
        }
    }
}

impl fmt::Display for DecryptedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecryptedMessage::Plaintext(s) => f.write_str(s),
            DecryptedMessage::Placeholder(reason) => reason.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::encrypt_text;
    use crate::keys::KeyMaterial;

    fn key(name: &str) -> DerivedKey {
        KeyMaterial::new(name).derive()
    }

    fn direct(text: &str) -> MessageEnvelope {
        MessageEnvelope::Direct {
            recipient_encrypted: encrypt_text(&key("bob"), text).unwrap(),
            sender_encrypted: encrypt_text(&key("alice"), text).unwrap(),
        }
    }

    #[test]
    fn test_direct_both_sides_read() {
        let env = direct("hello");
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let as_bob = DecryptedMessage::open(&env, &bob, &alice, &key("bob"));
        let as_alice = DecryptedMessage::open(&env, &alice, &alice, &key("alice"));
        assert_eq!(as_bob.text(), Some("hello"));
        assert_eq!(as_alice.text(), Some("hello"));
    }

    #[test]
    fn test_direct_wire_shape() {
        let value: serde_json::Value = serde_json::from_str(&direct("x").to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "direct");
        assert!(value.get("recipient_encrypted").is_some());
        assert!(value.get("sender_encrypted").is_some());
    }

    #[test]
    fn test_group_non_member_gets_placeholder() {
        let env = MessageEnvelope::Group {
            recipients: vec![RecipientCiphertext {
                user_id: UserId::new("bob"),
                encrypted: encrypt_text(&key("bob"), "hi all").unwrap(),
            }],
            sender_encrypted: encrypt_text(&key("alice"), "hi all").unwrap(),
        };
        let json = env.to_json().unwrap();
        assert!(json.contains(r#""userId":"bob""#));
        let env = MessageEnvelope::from_json(&json).unwrap();

        let carol = UserId::new("carol");
        let msg = DecryptedMessage::open(&env, &carol, &UserId::new("alice"), &key("carol"));
        assert_eq!(msg, DecryptedMessage::Placeholder(PlaceholderReason::NotARecipient));
    }

    #[test]
    fn test_wrong_key_is_integrity_placeholder() {
        let env = direct("secret");
        let msg = DecryptedMessage::open(&env, &UserId::new("bob"), &UserId::new("alice"), &key("eve"));
        assert_eq!(msg, DecryptedMessage::Placeholder(PlaceholderReason::IntegrityFailed));
    }

    #[test]
    fn test_legacy_is_recognised() {
        let env = MessageEnvelope::from_json(r#"{"type":"legacy","ciphertext":"U2FsdGVkX1+abc"}"#).unwrap();
        assert_eq!(env.recipient_count(), 0);
        let msg = DecryptedMessage::open(&env, &UserId::new("bob"), &UserId::new("alice"), &key("bob"));
        assert_eq!(msg, DecryptedMessage::Placeholder(PlaceholderReason::LegacyFormat));
        assert!(!msg.is_plaintext());
    }

    #[test]
    fn test_untagged_payload_rejected() {
        assert!(matches!(
            MessageEnvelope::from_json(r#"{"recipient_encrypted":{}}"#),
            Err(CourierError::Envelope(_))
        ));
        assert!(MessageEnvelope::from_json("not json").is_err());
    }

    #[test]
    fn test_placeholder_display() {
        assert!(PlaceholderReason::KeysNotReady.is_retryable());
        assert!(!PlaceholderReason::IntegrityFailed.is_retryable());
        let msg = DecryptedMessage::Placeholder(PlaceholderReason::KeysNotReady);
        assert_eq!(msg.to_string(), "Waiting for encryption keys...");
    }
}
