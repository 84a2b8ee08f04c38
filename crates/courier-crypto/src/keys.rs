//! Key types: device master key, shared key material, derived AES keys, file keys

use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use courier_core::{CourierError, CourierResult};

use crate::encoding::{base64_decode, base64_encode};
use crate::KEY_SIZE;

/// The 256-bit device master key. Generated once per installation.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Draw a fresh key from the OS-seeded CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// The base64 form persisted in the secure store and published to peers.
    pub fn to_material(&self) -> KeyMaterial {
        KeyMaterial::new(base64_encode(&self.bytes))
    }

    /// Parse the persisted base64 form.
    pub fn from_material(material: &KeyMaterial) -> CourierResult<Self> {
        let mut decoded = base64_decode(material.as_str())
            .map_err(|e| CourierError::Secrets(format!("stored master key is not base64: {e}")))?;
        if decoded.len() != KEY_SIZE {
            let len = decoded.len();
            decoded.zeroize();
            return Err(CourierError::Secrets(format!(
                "stored master key has wrong size: {len} bytes (expected {KEY_SIZE})"
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { bytes })
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A published key-material string (base64 of a 256-bit secret).
///
/// Despite being distributed as a "public key", this string is symmetric
/// material: every holder derives the same AES key from it.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    value: String,
}

impl KeyMaterial {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Derive the AES-256 key: `SHA-256(material string)`.
    pub fn derive(&self) -> DerivedKey {
        DerivedKey::from_material(self)
    }

    /// Key bytes for HMAC chunk tags: the UTF-8 bytes of the material string.
    pub fn mac_key(&self) -> &[u8] {
        self.value.as_bytes()
    }

    /// Short hex identifier for display, e.g. `3f2a9c01:5be4d7e0`. Reveals
    /// nothing usable about the key.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.derive().as_bytes());
        let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        format!("{}:{}", &hex[..8], &hex[8..])
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// A 256-bit AES key derived from key material. Zeroized on drop.
#[derive(Clone)]
pub struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Deterministic derivation: the same material always yields the same key.
    pub fn from_material(material: &KeyMaterial) -> Self {
        let digest = Sha256::digest(material.as_str().as_bytes());
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&digest);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A one-time 256-bit file key for hybrid (multi-recipient) uploads.
#[derive(Clone)]
pub struct FileKey {
    bytes: [u8; KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Generate a random file key. Never reused across files.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Express the file key as key material so the chunk cipher can use it.
    pub fn to_material(&self) -> KeyMaterial {
        KeyMaterial::new(base64_encode(&self.bytes))
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_key_generation() {
        let k1 = MasterKey::generate();
        let k2 = MasterKey::generate();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_master_key_material_roundtrip() {
        let key = MasterKey::generate();
        let material = key.to_material();
        let parsed = MasterKey::from_material(&material).unwrap();
        assert_eq!(key.as_bytes(), parsed.as_bytes());
    }

    #[test]
    fn test_master_key_rejects_wrong_size() {
        let short = KeyMaterial::new(base64_encode(&[1u8; 16]));
        assert!(MasterKey::from_material(&short).is_err());
        let garbage = KeyMaterial::new("not base64!!");
        assert!(MasterKey::from_material(&garbage).is_err());
    }

    #[test]
    fn test_derivation_is_sha256_of_string() {
        let material = KeyMaterial::new("abc");
        let derived = material.derive();
        // SHA-256("abc")
        let expected: [u8; 32] = [
            0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea, 0x41, 0x41, 0x40, 0xde, 0x5d, 0xae,
            0x22, 0x23, 0xb0, 0x03, 0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c, 0xb4, 0x10, 0xff, 0x61,
            0xf2, 0x00, 0x15, 0xad,
        ];
        assert_eq!(derived.as_bytes(), &expected);
    }

    #[test]
    fn test_derivation_deterministic() {
        let material = MasterKey::generate().to_material();
        assert_eq!(material.derive().as_bytes(), material.derive().as_bytes());
    }

    #[test]
    fn test_debug_redacts() {
        let material = KeyMaterial::new("super-secret");
        let rendered = format!("{material:?} {:?}", material.derive());
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let material = KeyMaterial::new("abc");
        let fp = material.fingerprint();
        assert_eq!(fp, material.fingerprint());
        assert_eq!(fp.len(), 17);
        assert_ne!(fp, KeyMaterial::new("abd").fingerprint());
    }

    #[test]
    fn test_file_key_material_is_base64_of_bytes() {
        let key = FileKey::from_bytes([7u8; KEY_SIZE]);
        let decoded = base64_decode(key.to_material().as_str()).unwrap();
        assert_eq!(decoded, vec![7u8; KEY_SIZE]);
    }
}
