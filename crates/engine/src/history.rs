//! Linear undo/redo log of draft snapshots.
//!
//! `entries[0]` is the initial state and survives eviction and compression.
//! Recording a new entry discards everything after the cursor. Consecutive
//! edits to the same field inside the merge window collapse into one entry,
//! so one undo step reverts a whole typing burst.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use draftsync_core::{
    Action, ActionId, ActionKind, Clock, CoreError, FieldValue, Fields, HistoryEntry, SystemClock,
};
use draftsync_storage::{KeyValueStore, get_decoded, put_encoded};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HistoryConfig;
use crate::debounce::Debouncer;
use crate::error::EngineError;

const INITIAL_DESCRIPTION: &str = "Initial state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryMode {
    #[default]
    Recording,
    /// A restored snapshot is being applied; record calls are ignored until
    /// [`HistoryManager::finish_restore`].
    Restoring,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedHistory {
    entries: Vec<HistoryEntry>,
    current_index: usize,
}

struct Persistence {
    store: Arc<dyn KeyValueStore>,
    key: String,
    writer: Debouncer<Vec<u8>, (), Infallible>,
}

impl Persistence {
    fn new(store: Arc<dyn KeyValueStore>, key: &str, delay: Duration) -> Self {
        let writer_store = Arc::clone(&store);
        let writer_key = key.to_string();
        let writer = Debouncer::new(delay, move |bytes: Vec<u8>| {
            let store = Arc::clone(&writer_store);
            let key = writer_key.clone();
            async move {
                match store.set(&key, &bytes) {
                    Ok(()) => debug!(key, bytes = bytes.len(), "history persisted"),
                    Err(e) => warn!(key, error = %e, "failed to persist history"),
                }
                Ok(())
            }
        });
        Self {
            store,
            key: key.to_string(),
            writer,
        }
    }
}

pub struct HistoryManager {
    config: HistoryConfig,
    clock: Arc<dyn Clock>,
    entries: Vec<HistoryEntry>,
    current: usize,
    mode: HistoryMode,
    persistence: Option<Persistence>,
}

impl HistoryManager {
    pub fn new(config: HistoryConfig, initial: Fields) -> Self {
        Self::with_clock(config, initial, Arc::new(SystemClock))
    }

    pub fn with_clock(config: HistoryConfig, initial: Fields, clock: Arc<dyn Clock>) -> Self {
        let entries = vec![initial_entry(initial, clock.now_ms())];
        Self {
            config,
            clock,
            entries,
            current: 0,
            mode: HistoryMode::Recording,
            persistence: None,
        }
    }

    /// Load the history stored under `key`, or start a fresh one from
    /// `initial` when nothing is stored. Every later change is written back
    /// through a debounced writer, so this must run inside a tokio runtime.
    pub fn restore_or_new(
        config: HistoryConfig,
        initial: Fields,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KeyValueStore>,
        key: &str,
    ) -> Result<Self, EngineError> {
        let persisted: Option<PersistedHistory> = get_decoded(store.as_ref(), key)?;
        let delay = Duration::from_millis(config.persist_debounce_ms);
        let mut manager = Self::with_clock(config, initial, clock);

        if let Some(persisted) = persisted {
            if persisted.entries.is_empty() || persisted.current_index >= persisted.entries.len() {
                return Err(CoreError::InvalidData(format!(
                    "stored history cursor {} outside {} entries",
                    persisted.current_index,
                    persisted.entries.len()
                ))
                .into());
            }
            info!(
                key,
                entries = persisted.entries.len(),
                current = persisted.current_index,
                "restored history"
            );
            manager.entries = persisted.entries;
            manager.current = persisted.current_index;
        }
        manager.persistence = Some(Persistence::new(store, key, delay));
        Ok(manager)
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Record one field edit. Returns `None` while restoring.
    pub fn add_field_change(
        &mut self,
        field: &str,
        previous: FieldValue,
        new: FieldValue,
        snapshot: Fields,
    ) -> Option<ActionId> {
        if self.mode == HistoryMode::Restoring {
            return None;
        }
        let now = self.clock.now_ms();
        let action = Action::field_change(field, previous, new, now);
        let id = action.id;

        if self.can_merge(field, now) {
            let last = &mut self.entries[self.current];
            last.actions.push(action);
            last.snapshot = snapshot;
            last.merged = true;
            last.timestamp_ms = now;
            debug!(field, actions = last.actions.len(), "merged field change");
            self.schedule_persist();
            return Some(id);
        }

        self.record(HistoryEntry::new(now, snapshot, vec![action]));
        Some(id)
    }

    /// Record several field edits as one undo step. Returns the id of the
    /// parent `BatchUpdate` action.
    pub fn add_batch_update(
        &mut self,
        changes: Vec<(String, FieldValue, FieldValue)>,
        snapshot: Fields,
        description: impl Into<String>,
    ) -> Option<ActionId> {
        if self.mode == HistoryMode::Restoring || changes.is_empty() {
            return None;
        }
        let now = self.clock.now_ms();
        let parent = Action::new(ActionKind::BatchUpdate, description, now);
        let id = parent.id;
        let mut actions = Vec::with_capacity(changes.len() + 1);
        actions.push(parent);
        actions.extend(
            changes
                .into_iter()
                .map(|(field, previous, new)| Action::field_change(&field, previous, new, now)),
        );
        self.record(HistoryEntry::new(now, snapshot, actions));
        Some(id)
    }

    /// Record a whole-entity action such as `Create` or `Delete`.
    pub fn add_action(
        &mut self,
        kind: ActionKind,
        description: impl Into<String>,
        snapshot: Fields,
    ) -> Option<ActionId> {
        if self.mode == HistoryMode::Restoring {
            return None;
        }
        let now = self.clock.now_ms();
        let action = Action::new(kind, description, now);
        let id = action.id;
        self.record(HistoryEntry::new(now, snapshot, vec![action]));
        Some(id)
    }

    /// Record an accepted AI suggestion. Never merged with neighbouring edits.
    pub fn add_ai_enhancement(
        &mut self,
        field: &str,
        previous: FieldValue,
        new: FieldValue,
        snapshot: Fields,
    ) -> Option<ActionId> {
        if self.mode == HistoryMode::Restoring {
            return None;
        }
        let now = self.clock.now_ms();
        let action = Action {
            kind: ActionKind::AiEnhance,
            description: format!("AI enhanced {field}"),
            ..Action::field_change(field, previous, new, now)
        };
        let id = action.id;
        self.record(HistoryEntry::new(now, snapshot, vec![action]));
        Some(id)
    }

    fn can_merge(&self, field: &str, now: u64) -> bool {
        if !self.config.enable_batching || self.current == 0 || self.can_redo() {
            return false;
        }
        let last = &self.entries[self.current];
        last.single_field() == Some(field)
            && now.saturating_sub(last.timestamp_ms) < self.config.merge_window_ms
    }

    fn record(&mut self, entry: HistoryEntry) {
        let abandoned = self.entries.len() - self.current - 1;
        if abandoned > 0 {
            debug!(abandoned, "dropping redo entries");
        }
        self.entries.truncate(self.current + 1);
        self.entries.push(entry);
        self.current = self.entries.len() - 1;

        // Keep the initial entry and at least one edit.
        let max = self.config.max_entries.max(2);
        let overflow = self.entries.len().saturating_sub(max);
        if overflow > 0 {
            self.entries.drain(1..=overflow);
            self.current -= overflow;
            debug!(evicted = overflow, "evicted oldest history entries");
        }

        if self.config.auto_compress
            && self.entries.len() as f64
                >= self.config.compress_threshold * self.config.max_entries as f64
        {
            self.compress_history(self.config.compress_ratio);
        }
        self.schedule_persist();
    }

    // ========================================================================
    // Restoring
    // ========================================================================

    /// Step back one entry and return the snapshot to apply. The manager
    /// keeps recording, so the next edit truncates the redo branch.
    pub fn undo(&mut self) -> Option<Fields> {
        if !self.can_undo() {
            return None;
        }
        self.current -= 1;
        Some(self.move_cursor())
    }

    pub fn redo(&mut self) -> Option<Fields> {
        if !self.can_redo() {
            return None;
        }
        self.current += 1;
        Some(self.move_cursor())
    }

    pub fn jump_to_index(&mut self, index: usize) -> Result<Fields, EngineError> {
        if index >= self.entries.len() {
            return Err(EngineError::HistoryIndex {
                index,
                len: self.entries.len(),
            });
        }
        self.current = index;
        Ok(self.move_cursor())
    }

    fn move_cursor(&mut self) -> Fields {
        self.schedule_persist();
        self.entries[self.current].snapshot.clone()
    }

    /// Ignore record calls while a restored snapshot propagates back through
    /// the host's edit path. Pair with [`HistoryManager::finish_restore`].
    pub fn begin_restore(&mut self) {
        self.mode = HistoryMode::Restoring;
    }

    pub fn finish_restore(&mut self) {
        self.mode = HistoryMode::Recording;
    }

    /// Undo and hand the snapshot to `apply` with recording suspended.
    /// Returns whether there was anything to undo.
    pub fn undo_with(&mut self, apply: impl FnOnce(&Fields)) -> bool {
        let Some(snapshot) = self.undo() else {
            return false;
        };
        self.begin_restore();
        apply(&snapshot);
        self.finish_restore();
        true
    }

    pub fn redo_with(&mut self, apply: impl FnOnce(&Fields)) -> bool {
        let Some(snapshot) = self.redo() else {
            return false;
        };
        self.begin_restore();
        apply(&snapshot);
        self.finish_restore();
        true
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Thin the log to roughly `ratio` of its length. The first, last and
    /// current entries always survive, plus every n-th entry for
    /// `n = ceil(1 / ratio)`.
    pub fn compress_history(&mut self, ratio: f64) {
        let len = self.entries.len();
        if len <= 2 || !(ratio > 0.0 && ratio < 1.0) {
            return;
        }
        let step = (1.0 / ratio).ceil() as usize;
        let current = self.current;
        let keep = |i: usize| i == 0 || i == len - 1 || i == current || i % step == 0;

        let new_current = (0..current).filter(|&i| keep(i)).count();
        let mut index = 0;
        self.entries.retain(|_| {
            let kept = keep(index);
            index += 1;
            kept
        });
        self.current = new_current;
        info!(before = len, after = self.entries.len(), "compressed history");
        self.schedule_persist();
    }

    /// Drop every entry and start over from `initial`.
    pub fn clear(&mut self, initial: Fields) {
        self.entries = vec![initial_entry(initial, self.clock.now_ms())];
        self.current = 0;
        self.mode = HistoryMode::Recording;
        self.schedule_persist();
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Actions that touched `field`, most recent first, up to the cursor.
    pub fn field_history(&self, field: &str) -> Vec<&Action> {
        self.effective_actions().filter(|a| a.touches(field)).collect()
    }

    pub fn recent_actions(&self, limit: usize) -> Vec<&Action> {
        self.effective_actions().take(limit).collect()
    }

    fn effective_actions(&self) -> impl Iterator<Item = &Action> {
        self.entries[..=self.current]
            .iter()
            .rev()
            .flat_map(|entry| entry.actions.iter().rev())
    }

    pub fn can_undo(&self) -> bool {
        self.current > 0
    }

    pub fn can_redo(&self) -> bool {
        self.current + 1 < self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_snapshot(&self) -> &Fields {
        &self.entries[self.current].snapshot
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn mode(&self) -> HistoryMode {
        self.mode
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    fn persisted(&self) -> PersistedHistory {
        PersistedHistory {
            entries: self.entries.clone(),
            current_index: self.current,
        }
    }

    fn schedule_persist(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        match rmp_serde::to_vec_named(&self.persisted()) {
            Ok(bytes) => {
                let _ = persistence.writer.call(bytes);
            }
            Err(e) => warn!(error = %e, "failed to encode history"),
        }
    }

    /// Write the current log now instead of waiting for the debounced writer.
    pub fn flush_persistence(&self) -> Result<(), EngineError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        persistence.writer.cancel();
        put_encoded(persistence.store.as_ref(), &persistence.key, &self.persisted())?;
        Ok(())
    }
}

fn initial_entry(snapshot: Fields, timestamp_ms: u64) -> HistoryEntry {
    HistoryEntry::new(
        timestamp_ms,
        snapshot,
        vec![Action::new(ActionKind::Create, INITIAL_DESCRIPTION, timestamp_ms)],
    )
}
