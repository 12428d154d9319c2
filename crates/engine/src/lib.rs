pub mod autosave;
pub mod backend;
pub mod config;
pub mod connectivity;
pub mod debounce;
pub mod error;
pub mod history;
pub mod retry;
pub mod rules;
pub mod validation;

pub use autosave::{
    AutosaveBuilder, AutosaveController, AutosaveObserver, PendingRetry, SaveOutcome,
};
pub use backend::{PartialUpdate, SaveAck, SaveBackend, SaveError, VERSION_CONFLICT_SENTINEL};
pub use config::{AutosaveConfig, EditorConfig, HistoryConfig, ValidationConfig};
pub use connectivity::Connectivity;
pub use debounce::{DebounceError, Debouncer};
pub use error::EngineError;
pub use history::{HistoryManager, HistoryMode};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use rules::{Rule, RuleError, RuleResult};
pub use validation::ValidationEngine;
