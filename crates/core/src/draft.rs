use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::field_value::{FieldValue, Fields};
use crate::ids::QueueEntryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SaveStatus {
    #[default]
    Idle,
    Dirty,
    Saving,
    Saved,
    Error,
    Offline,
}

impl SaveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dirty => "dirty",
            Self::Saving => "saving",
            Self::Saved => "saved",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }
}

/// The live value of an entity under edit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub fields: Fields,
    pub dirty_fields: BTreeSet<String>,
    /// Edits not yet acknowledged by the save backend.
    pub pending_updates: Fields,
    pub version: u64,
    pub save_status: SaveStatus,
}

impl Draft {
    pub fn new(fields: Fields, version: u64) -> Self {
        Self {
            fields,
            version,
            ..Self::default()
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty_fields.is_empty()
    }

    /// Apply an edit: the value lands in the draft and in the pending buffer.
    pub fn stage(&mut self, field: &str, value: FieldValue) {
        self.fields.insert(field.to_string(), value.clone());
        self.pending_updates.insert(field.to_string(), value);
        self.dirty_fields.insert(field.to_string());
    }

    /// Drop the sent fields from the pending buffer, except those edited again
    /// while the save was in flight.
    pub fn acknowledge(&mut self, sent: &Fields) {
        for (field, value) in sent {
            if self.pending_updates.get(field) == Some(value) {
                self.pending_updates.remove(field);
                self.dirty_fields.remove(field);
            }
        }
    }

    /// Move the whole pending buffer out, clearing the dirty markers.
    pub fn take_pending(&mut self) -> Fields {
        self.dirty_fields.clear();
        std::mem::take(&mut self.pending_updates)
    }
}

/// A partial update captured while connectivity was unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedUpdate {
    pub id: QueueEntryId,
    pub fields: Fields,
    pub queued_at: u64,
}

impl QueuedUpdate {
    pub fn new(fields: Fields, queued_at: u64) -> Self {
        Self {
            id: QueueEntryId::new(),
            fields,
            queued_at,
        }
    }
}
