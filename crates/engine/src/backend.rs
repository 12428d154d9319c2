use async_trait::async_trait;
use draftsync_core::Fields;
use thiserror::Error;

/// Message fragment that marks a backend failure as a version conflict.
pub const VERSION_CONFLICT_SENTINEL: &str = "version conflict";

/// Fields sent to the backend in one save call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartialUpdate {
    pub fields: Fields,
    /// Draft version the edits were made against, when optimistic concurrency is on.
    pub version: Option<u64>,
}

/// Backend acknowledgment. `SaveAck::default()` is a bare success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveAck {
    pub version: Option<u64>,
}

impl SaveAck {
    pub fn with_version(version: u64) -> Self {
        Self {
            version: Some(version),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaveError {
    #[error("version conflict: {0}")]
    VersionConflict(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("save rejected: {0}")]
    Rejected(String),
}

impl SaveError {
    /// Conflicts are never retried; the host must reload.
    pub fn is_version_conflict(&self) -> bool {
        match self {
            SaveError::VersionConflict(_) => true,
            SaveError::Network(msg) | SaveError::Rejected(msg) => {
                msg.to_lowercase().contains(VERSION_CONFLICT_SENTINEL)
            }
        }
    }
}

/// Remote persistence endpoint supplied by the host.
#[async_trait]
pub trait SaveBackend: Send + Sync {
    async fn save(&self, update: PartialUpdate) -> Result<SaveAck, SaveError>;
}
