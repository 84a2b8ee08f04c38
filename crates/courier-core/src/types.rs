use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Backend conversation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phase of a file encryption or upload pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Reading,
    Thumbnail,
    Encrypting,
    Uploading,
    Decrypting,
    Finalizing,
    Complete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Reading => "reading",
            Phase::Thumbnail => "thumbnail",
            Phase::Encrypting => "encrypting",
            Phase::Uploading => "uploading",
            Phase::Decrypting => "decrypting",
            Phase::Finalizing => "finalizing",
            Phase::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// A progress report: determinate percentage plus byte counts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub phase: Phase,
    /// 0.0..=100.0
    pub percent: f64,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl Progress {
    pub fn new(phase: Phase, percent: f64, bytes_done: u64, bytes_total: u64) -> Self {
        Self {
            phase,
            percent: percent.clamp(0.0, 100.0),
            bytes_done,
            bytes_total,
        }
    }

    /// Map `done / total` into the `[start, end]` percentage band.
    pub fn in_band(
        phase: Phase,
        start: f64,
        end: f64,
        done: u64,
        total: u64,
        bytes_done: u64,
        bytes_total: u64,
    ) -> Self {
        let fraction = if total == 0 {
            1.0
        } else {
            done as f64 / total as f64
        };
        Self::new(
            phase,
            start + (end - start) * fraction,
            bytes_done,
            bytes_total,
        )
    }
}

/// Progress callback
pub type ProgressFn = dyn Fn(&Progress) + Send + Sync;
