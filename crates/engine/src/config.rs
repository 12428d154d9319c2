use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;
use crate::retry::RetryPolicy;

/// Message shown in place of a validator that failed to run.
pub const DEFAULT_FAULT_MESSAGE: &str = "Validation error";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    /// Quiet period before pending edits are flushed.
    pub delay_ms: u64,
    /// Per-field overrides of `delay_ms`.
    pub field_delays_ms: HashMap<String, u64>,
    /// Send the draft version with every save.
    pub optimistic_concurrency: bool,
    /// Route flushes into the offline queue while disconnected.
    pub queue_offline: bool,
    pub retry: RetryPolicy,
    /// Store key for the durable offline queue, when a store is attached.
    pub offline_queue_key: String,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1_000,
            field_delays_ms: HashMap::new(),
            optimistic_concurrency: true,
            queue_offline: true,
            retry: RetryPolicy::default(),
            offline_queue_key: "draftsync:offline-queue".to_string(),
        }
    }
}

impl AutosaveConfig {
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_field_delay(mut self, field: &str, delay: Duration) -> Self {
        self.field_delays_ms
            .insert(field.to_string(), delay.as_millis() as u64);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn delay_for(&self, field: &str) -> Duration {
        Duration::from_millis(
            self.field_delays_ms
                .get(field)
                .copied()
                .unwrap_or(self.delay_ms),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_entries: usize,
    /// Collapse same-field edits closer together than this.
    pub merge_window_ms: u64,
    pub enable_batching: bool,
    /// Compress automatically once the length reaches `compress_threshold * max_entries`.
    pub auto_compress: bool,
    pub compress_threshold: f64,
    pub compress_ratio: f64,
    pub persist_debounce_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 50,
            merge_window_ms: 1_000,
            enable_batching: true,
            auto_compress: false,
            compress_threshold: 0.9,
            compress_ratio: 0.5,
            persist_debounce_ms: 500,
        }
    }
}

impl HistoryConfig {
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    #[must_use]
    pub fn with_merge_window(mut self, window: Duration) -> Self {
        self.merge_window_ms = window.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn without_batching(mut self) -> Self {
        self.enable_batching = false;
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub fault_message: String,
    /// Debounce applied to async rules that do not set their own.
    pub async_debounce_ms: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            fault_message: DEFAULT_FAULT_MESSAGE.to_string(),
            async_debounce_ms: 0,
        }
    }
}

/// Settings for one card editor, usually loaded from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    pub autosave: AutosaveConfig,
    pub history: HistoryConfig,
    pub validation: ValidationConfig,
}

impl EditorConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, EngineError> {
        Ok(toml::from_str(source)?)
    }
}
