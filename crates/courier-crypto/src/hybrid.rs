//! Hybrid file sharing: one random file key, wrapped once per recipient.
//!
//! The file itself is encrypted once under `FileKey::to_material()`. Each
//! participant gets a `RecipientKeyEntry` holding the file key sealed under
//! their derived key, with their user id as associated data so an entry
//! cannot be replayed under another id.

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use courier_core::{CourierError, CourierResult, UserId};

use crate::cipher::{open, seal};
use crate::encoding::{b64, b64_array};
use crate::keys::{DerivedKey, FileKey};
use crate::{IV_SIZE, KEY_SIZE, TAG_SIZE};

/// A file key sealed for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientKeyEntry {
    pub user_id: UserId,
    #[serde(with = "b64")]
    pub encrypted_symmetric_key: Vec<u8>,
    #[serde(with = "b64_array")]
    pub key_iv: [u8; IV_SIZE],
    #[serde(with = "b64_array")]
    pub key_auth_tag: [u8; TAG_SIZE],
}

pub fn wrap_file_key(
    file_key: &FileKey,
    user_id: &UserId,
    recipient_key: &DerivedKey,
) -> CourierResult<RecipientKeyEntry> {
    let (key_iv, key_auth_tag, encrypted_symmetric_key) =
        seal(recipient_key, file_key.as_bytes(), user_id.as_str().as_bytes())?;
    Ok(RecipientKeyEntry {
        user_id: user_id.clone(),
        encrypted_symmetric_key,
        key_iv,
        key_auth_tag,
    })
}

/// Recover the file key from this device's entry.
pub fn unwrap_file_key(entry: &RecipientKeyEntry, own_key: &DerivedKey) -> CourierResult<FileKey> {
    let mut plaintext = open(
        own_key,
        &entry.key_iv,
        &entry.key_auth_tag,
        &entry.encrypted_symmetric_key,
        entry.user_id.as_str().as_bytes(),
    )?;
    if plaintext.len() != KEY_SIZE {
        plaintext.zeroize();
        return Err(CourierError::Integrity);
    }
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(FileKey::from_bytes(bytes))
}

pub fn find_entry<'a>(entries: &'a [RecipientKeyEntry], user_id: &UserId) -> Option<&'a RecipientKeyEntry> {
    entries.iter().find(|e| &e.user_id == user_id)
}
