use thiserror::Error;

pub type CourierResult<T> = Result<T, CourierError>;

#[derive(Debug, Error)]
pub enum CourierError {
    /// No master key exists yet; `initialize_keys` must run first.
    #[error("encryption keys are not initialized on this device")]
    KeyNotInitialized,

    /// Keys were not initialized before the readiness timeout elapsed.
    #[error("encryption keys not ready")]
    KeysNotReady,

    #[error("public key unavailable for user {user_id}")]
    PeerKeyUnavailable { user_id: String },

    /// AEAD tag verification failed. Never carries plaintext.
    #[error("integrity check failed: ciphertext, iv, or tag was altered")]
    Integrity,

    #[error("integrity check failed for chunk {index}")]
    ChunkIntegrity { index: u64 },

    #[error("file integrity check failed: chunk set or order was altered")]
    FileIntegrity,

    /// Wrong password or corrupted backup; deliberately indistinguishable.
    #[error("invalid backup password")]
    InvalidPassword,

    #[error("operation cancelled")]
    Cancelled,

    #[error("upload error: {0}")]
    Upload(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("secrets error: {0}")]
    Secrets(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("malformed envelope: {0}")]
    Envelope(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CourierError {
    /// Whether retrying the same operation later can succeed without
    /// re-fetching the source data.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CourierError::PeerKeyUnavailable { .. }
                | CourierError::KeysNotReady
                | CourierError::Transport(_)
        )
    }

    /// Cryptographic verification failures: the data must not be trusted.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CourierError::Integrity
                | CourierError::ChunkIntegrity { .. }
                | CourierError::FileIntegrity
        )
    }
}
