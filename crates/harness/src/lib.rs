//! Test doubles for driving the editing kernel without a real backend.

pub mod backend;
pub mod clock;
pub mod observer;

pub use backend::{RecordedCall, ScriptedBackend};
pub use clock::ManualClock;
pub use observer::{ObservedEvent, RecordingObserver};

use draftsync_core::{FieldValue, Fields};
use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber filtered by `RUST_LOG` (default `warn`).
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init();
}

/// Build a field map from literal pairs.
pub fn fields<const N: usize>(pairs: [(&str, FieldValue); N]) -> Fields {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}
