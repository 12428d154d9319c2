use serde::{Deserialize, Serialize};

use crate::field_value::{FieldValue, Fields};
use crate::ids::ActionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    FieldChange,
    BatchUpdate,
    Create,
    Delete,
    AiEnhance,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FieldChange => "field_change",
            Self::BatchUpdate => "batch_update",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::AiEnhance => "ai_enhance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    pub field: Option<String>,
    pub previous_value: Option<FieldValue>,
    pub new_value: Option<FieldValue>,
    pub description: String,
    pub timestamp_ms: u64,
}

impl Action {
    pub fn new(kind: ActionKind, description: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            id: ActionId::new(),
            kind,
            field: None,
            previous_value: None,
            new_value: None,
            description: description.into(),
            timestamp_ms,
        }
    }

    pub fn field_change(
        field: &str,
        previous_value: FieldValue,
        new_value: FieldValue,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            field: Some(field.to_string()),
            previous_value: Some(previous_value),
            new_value: Some(new_value),
            ..Self::new(ActionKind::FieldChange, format!("Changed {field}"), timestamp_ms)
        }
    }

    pub fn touches(&self, field: &str) -> bool {
        self.field.as_deref() == Some(field)
    }
}

/// One undo step: the draft as it stood after the recorded actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp_ms: u64,
    pub snapshot: Fields,
    pub actions: Vec<Action>,
    pub merged: bool,
}

impl HistoryEntry {
    pub fn new(timestamp_ms: u64, snapshot: Fields, actions: Vec<Action>) -> Self {
        Self {
            timestamp_ms,
            snapshot,
            actions,
            merged: false,
        }
    }

    /// The field this entry edits, when every action is a plain change to that one field.
    pub fn single_field(&self) -> Option<&str> {
        let first = self.actions.first()?;
        let field = first.field.as_deref()?;
        self.actions
            .iter()
            .all(|a| a.kind == ActionKind::FieldChange && a.touches(field))
            .then_some(field)
    }
}
