pub mod clock;
pub mod draft;
pub mod error;
pub mod field_value;
pub mod history;
pub mod ids;

pub use clock::{Clock, SystemClock};
pub use draft::{Draft, QueuedUpdate, SaveStatus};
pub use error::CoreError;
pub use field_value::{FieldValue, Fields};
pub use history::{Action, ActionKind, HistoryEntry};
pub use ids::*;
