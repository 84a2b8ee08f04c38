//! Password-protected master key backups.
//!
//! Wrapping key = PBKDF2-HMAC-SHA256(password, random 16-byte salt, iterations).
//! The master key is sealed under it with AES-256-GCM. Any failure to open a
//! backup is reported as `InvalidPassword`, whether the password was wrong or
//! the backup was corrupted.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use courier_core::config::{MAX_BACKUP_ITERATIONS, MIN_BACKUP_ITERATIONS};
use courier_core::{CourierError, CourierResult};

use crate::cipher::{open, seal};
use crate::encoding::{b64, b64_array};
use crate::keys::{DerivedKey, MasterKey};
use crate::{IV_SIZE, KEY_SIZE, TAG_SIZE};

/// Current backup format version
pub const KEY_VERSION: u32 = 1;

pub const SALT_SIZE: usize = 16;

/// Serialized backup of the device master key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBackup {
    #[serde(with = "b64")]
    pub encrypted_master_key: Vec<u8>,
    #[serde(with = "b64_array")]
    pub salt: [u8; SALT_SIZE],
    #[serde(with = "b64_array")]
    pub iv: [u8; IV_SIZE],
    #[serde(with = "b64_array")]
    pub auth_tag: [u8; TAG_SIZE],
    pub iterations: u32,
    pub key_version: u32,
    /// Unix timestamp (seconds)
    pub created_at: u64,
}

impl KeyBackup {
    pub fn to_json(&self) -> CourierResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CourierError::Other(anyhow::anyhow!("backup serialization: {e}")))
    }

    /// Parse a backup. Structural garbage is treated like a wrong password.
    pub fn from_json(s: &str) -> CourierResult<Self> {
        serde_json::from_str(s).map_err(|_| CourierError::InvalidPassword)
    }
}

fn password_key(password: &SecretString, salt: &[u8; SALT_SIZE], iterations: u32) -> DerivedKey {
    let mut out = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(
        password.expose_secret().as_bytes(),
        salt,
        iterations,
        &mut out,
    );
    let key = DerivedKey::from_bytes(out);
    out.zeroize();
    key
}

/// Seal `master` under a password-derived key.
pub fn create_key_backup(
    master: &MasterKey,
    password: &SecretString,
    iterations: u32,
) -> CourierResult<KeyBackup> {
    if !(MIN_BACKUP_ITERATIONS..=MAX_BACKUP_ITERATIONS).contains(&iterations) {
        return Err(CourierError::Config(format!(
            "backup iterations {iterations} outside {MIN_BACKUP_ITERATIONS}..={MAX_BACKUP_ITERATIONS}"
        )));
    }

    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);

    let wrapping = password_key(password, &salt, iterations);
    let (iv, auth_tag, encrypted_master_key) = seal(&wrapping, master.as_bytes(), b"")?;

    Ok(KeyBackup {
        encrypted_master_key,
        salt,
        iv,
        auth_tag,
        iterations,
        key_version: KEY_VERSION,
        created_at: now_epoch(),
    })
}

/// Open a backup. Does not touch any stored state.
///
/// The work factor comes from the file, so it is bounded before any
/// derivation runs.
pub fn restore_master_key(backup: &KeyBackup, password: &SecretString) -> CourierResult<MasterKey> {
    if backup.key_version != KEY_VERSION
        || !(MIN_BACKUP_ITERATIONS..=MAX_BACKUP_ITERATIONS).contains(&backup.iterations)
    {
        return Err(CourierError::InvalidPassword);
    }

    let wrapping = password_key(password, &backup.salt, backup.iterations);
    let mut plaintext = open(
        &wrapping,
        &backup.iv,
        &backup.auth_tag,
        &backup.encrypted_master_key,
        b"",
    )
    .map_err(|_| CourierError::InvalidPassword)?;

    if plaintext.len() != KEY_SIZE {
        plaintext.zeroize();
        return Err(CourierError::InvalidPassword);
    }

    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(MasterKey::from_bytes(bytes))
}

fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITERS: u32 = MIN_BACKUP_ITERATIONS;

    #[test]
    fn test_backup_roundtrip() {
        let master = MasterKey::generate();
        let pw = SecretString::from("pw");
        let backup = create_key_backup(&master, &pw, ITERS).unwrap();

        assert_eq!(backup.key_version, KEY_VERSION);
        assert_eq!(backup.encrypted_master_key.len(), KEY_SIZE);

        let restored = restore_master_key(&backup, &pw).unwrap();
        assert_eq!(restored.as_bytes(), master.as_bytes());
    }

    #[test]
    fn test_wrong_password() {
        let master = MasterKey::generate();
        let backup = create_key_backup(&master, &SecretString::from("right"), ITERS).unwrap();
        let result = restore_master_key(&backup, &SecretString::from("wrong"));
        assert!(matches!(result, Err(CourierError::InvalidPassword)));
    }

    #[test]
    fn test_corrupted_backup_looks_like_wrong_password() {
        let master = MasterKey::generate();
        let pw = SecretString::from("pw");
        let mut backup = create_key_backup(&master, &pw, ITERS).unwrap();
        backup.encrypted_master_key[0] ^= 0x01;
        assert!(matches!(
            restore_master_key(&backup, &pw),
            Err(CourierError::InvalidPassword)
        ));
        assert!(matches!(
            KeyBackup::from_json("{not json"),
            Err(CourierError::InvalidPassword)
        ));
    }

    #[test]
    fn test_fresh_salt_per_backup() {
        let master = MasterKey::generate();
        let pw = SecretString::from("pw");
        let a = create_key_backup(&master, &pw, ITERS).unwrap();
        let b = create_key_backup(&master, &pw, ITERS).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.encrypted_master_key, b.encrypted_master_key);
    }

    #[test]
    fn test_low_iterations_rejected() {
        let master = MasterKey::generate();
        let result = create_key_backup(&master, &SecretString::from("pw"), 1000);
        assert!(matches!(result, Err(CourierError::Config(_))));
        let result = create_key_backup(&master, &SecretString::from("pw"), u32::MAX);
        assert!(matches!(result, Err(CourierError::Config(_))));
    }

    #[test]
    fn test_restore_rejects_unbounded_work_factor() {
        let master = MasterKey::generate();
        let pw = SecretString::from("pw");
        let mut backup = create_key_backup(&master, &pw, ITERS).unwrap();
        backup.iterations = u32::MAX;
        // Rejected up front; the derivation never runs.
        assert!(matches!(
            restore_master_key(&backup, &pw),
            Err(CourierError::InvalidPassword)
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let master = MasterKey::generate();
        let pw = SecretString::from("pw");
        let backup = create_key_backup(&master, &pw, ITERS).unwrap();
        let parsed = KeyBackup::from_json(&backup.to_json().unwrap()).unwrap();
        assert_eq!(parsed, backup);
        assert!(backup.to_json().unwrap().contains("encryptedMasterKey"));
    }
}
