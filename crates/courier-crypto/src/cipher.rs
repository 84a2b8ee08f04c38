//! AES-256-GCM encryption of byte buffers and UTF-8 text.
//!
//! Payload format (JSON):
//! ```text
//! { "iv": base64(12 bytes), "authTag": base64(16 bytes), "ciphertext": base64(N bytes) }
//! ```
//!
//! Every call draws a fresh random IV. Keys are long-lived and reused across
//! many messages, so counter or deterministic IVs are never used.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use courier_core::{CourierError, CourierResult};

use crate::encoding::{b64, b64_array};
use crate::keys::DerivedKey;
use crate::{IV_SIZE, TAG_SIZE};

/// Output of one AES-256-GCM encryption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    #[serde(with = "b64_array")]
    pub iv: [u8; IV_SIZE],
    #[serde(with = "b64_array")]
    pub auth_tag: [u8; TAG_SIZE],
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` under `key` with a fresh IV.
pub fn encrypt_bytes(key: &DerivedKey, plaintext: &[u8]) -> CourierResult<EncryptedPayload> {
    let (iv, auth_tag, ciphertext) = seal(key, plaintext, b"")?;
    Ok(EncryptedPayload {
        iv,
        auth_tag,
        ciphertext,
    })
}

/// Decrypt and verify. Fails with `Integrity` without releasing any plaintext.
pub fn decrypt_bytes(key: &DerivedKey, payload: &EncryptedPayload) -> CourierResult<Vec<u8>> {
    open(key, &payload.iv, &payload.auth_tag, &payload.ciphertext, b"")
}

pub fn encrypt_text(key: &DerivedKey, text: &str) -> CourierResult<EncryptedPayload> {
    encrypt_bytes(key, text.as_bytes())
}

pub fn decrypt_text(key: &DerivedKey, payload: &EncryptedPayload) -> CourierResult<String> {
    let bytes = decrypt_bytes(key, payload)?;
    String::from_utf8(bytes).map_err(|e| {
        let mut bytes = e.into_bytes();
        bytes.zeroize();
        CourierError::Envelope("decrypted payload is not valid UTF-8".into())
    })
}

/// Encrypt with associated data, returning `(iv, tag, ciphertext)`.
pub(crate) fn seal(
    key: &DerivedKey,
    plaintext: &[u8],
    aad: &[u8],
) -> CourierResult<([u8; IV_SIZE], [u8; TAG_SIZE], Vec<u8>)> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut buffer = plaintext.to_vec();
    let tag = match cipher.encrypt_in_place_detached(Nonce::from_slice(&iv), aad, &mut buffer) {
        Ok(tag) => tag,
        Err(e) => {
            buffer.zeroize();
            return Err(CourierError::Other(anyhow::anyhow!("AES-GCM encrypt: {e}")));
        }
    };

    let mut auth_tag = [0u8; TAG_SIZE];
    auth_tag.copy_from_slice(&tag);
    Ok((iv, auth_tag, buffer))
}

/// Verify-and-decrypt with associated data.
pub(crate) fn open(
    key: &DerivedKey,
    iv: &[u8; IV_SIZE],
    auth_tag: &[u8; TAG_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> CourierResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut buffer = ciphertext.to_vec();
    match cipher.decrypt_in_place_detached(
        Nonce::from_slice(iv),
        aad,
        &mut buffer,
        Tag::from_slice(auth_tag),
    ) {
        Ok(()) => Ok(buffer),
        Err(_) => {
            buffer.zeroize();
            Err(CourierError::Integrity)
        }
    }
}
