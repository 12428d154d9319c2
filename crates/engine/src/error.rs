use draftsync_core::CoreError;
use draftsync_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("invalid config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("history index out of range: {index} (len {len})")]
    HistoryIndex { index: usize, len: usize },
}
