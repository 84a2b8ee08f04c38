//! courier-crypto: client-side E2E encryption for Courier
//!
//! Primitive: AES-256-GCM with a fresh random 96-bit IV per encryption.
//!
//! Key model:
//! ```text
//! Master Key (256-bit random, one per device, held in the secure store)
//!   └── key material = base64(master key), published to peers
//!         └── Derived Key = SHA-256(key material string)  → AES-256-GCM key
//!
//! File Key (256-bit random, one per shared file, hybrid uploads)
//!   └── wrapped once per recipient under that recipient's derived key
//! ```
//!
//! Files at or above the small-file threshold are split into 512 KiB chunks.
//! Each chunk carries its own GCM tag plus an HMAC-SHA256 tag binding it to
//! the file id and its index; a master tag over the ordered chunk tags
//! authenticates the chunk set and order.

pub mod backup;
pub mod cache;
pub mod chunk;
pub mod cipher;
pub mod container;
mod encoding;
pub mod envelope;
pub mod file;
pub mod hybrid;
pub mod keys;
pub mod keystore;

pub use backup::{create_key_backup, restore_master_key, KeyBackup};
pub use cache::{KeyCache, KeyPurpose};
pub use chunk::{
    decrypt_file_chunked, decrypt_file_chunked_to, decrypt_reader_chunked_to,
    encrypt_file_chunked, encrypt_reader_chunked, encrypt_reader_chunked_to, total_chunks_for,
    verify_manifest, ChunkEncryptor, ChunkInfo, ChunkState, ChunkedEncryptionResult,
    EncryptedChunk, FileSeal,
};
pub use cipher::{decrypt_bytes, decrypt_text, encrypt_bytes, encrypt_text, EncryptedPayload};
pub use container::{open_file_from, read_trailer, seal_file_to, CONTAINER_MAGIC};
pub use envelope::{DecryptedMessage, MessageEnvelope, PlaceholderReason, RecipientCiphertext};
pub use file::{
    decrypt_file, encrypt_file, encrypt_path, guess_file_type, select_file_path, EncryptedFile,
    FilePath, WholeFile,
};
pub use hybrid::{find_entry, unwrap_file_key, wrap_file_key, RecipientKeyEntry};
pub use keys::{DerivedKey, FileKey, KeyMaterial, MasterKey};
pub use keystore::KeyStore;

/// Size of a master, derived, or file key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM IV (96-bit)
pub const IV_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Fixed plaintext chunk size for the chunked file path (512 KiB)
pub const CHUNK_SIZE: usize = 512 * 1024;

/// Default size at which callers switch from the whole-buffer path to chunks
pub const SMALL_FILE_THRESHOLD: u64 = 8 * 1024 * 1024;
