use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use draftsync_engine::{PartialUpdate, SaveAck, SaveBackend, SaveError};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// A save call as the backend saw it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub update: PartialUpdate,
    pub at: Instant,
}

struct BackendState {
    calls: Vec<RecordedCall>,
    /// Responses for upcoming calls; an empty script means success.
    script: VecDeque<Result<(), SaveError>>,
    latencies: VecDeque<Duration>,
    latency: Duration,
    version: u64,
    assign_versions: bool,
}

/// In-process stand-in for the remote persistence endpoint.
///
/// Every call is recorded before it is answered. Successful calls bump and
/// return a server version unless [`ScriptedBackend::without_versions`] was
/// used.
pub struct ScriptedBackend {
    state: Mutex<BackendState>,
}

impl ScriptedBackend {
    pub fn new(version: u64) -> Self {
        Self {
            state: Mutex::new(BackendState {
                calls: Vec::new(),
                script: VecDeque::new(),
                latencies: VecDeque::new(),
                latency: Duration::ZERO,
                version,
                assign_versions: true,
            }),
        }
    }

    /// Acknowledge saves without a version, like a backend returning nothing.
    #[must_use]
    pub fn without_versions(self) -> Self {
        self.state.lock().assign_versions = false;
        self
    }

    /// Default time every call takes to answer.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Latency for the next unanswered call only.
    pub fn delay_next(&self, latency: Duration) {
        self.state.lock().latencies.push_back(latency);
    }

    pub fn fail_next(&self, error: SaveError) {
        self.state.lock().script.push_back(Err(error));
    }

    pub fn fail_times(&self, times: usize, error: SaveError) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state.script.push_back(Err(error.clone()));
        }
    }

    pub fn succeed_next(&self) {
        self.state.lock().script.push_back(Ok(()));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn updates(&self) -> Vec<PartialUpdate> {
        self.state.lock().calls.iter().map(|c| c.update.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }
}

#[async_trait]
impl SaveBackend for ScriptedBackend {
    async fn save(&self, update: PartialUpdate) -> Result<SaveAck, SaveError> {
        let (response, latency) = {
            let mut state = self.state.lock();
            debug!(call = state.calls.len(), fields = update.fields.len(), "backend received save");
            state.calls.push(RecordedCall {
                update,
                at: Instant::now(),
            });
            let latency = state.latencies.pop_front().unwrap_or(state.latency);
            (state.script.pop_front().unwrap_or(Ok(())), latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        response?;

        let mut state = self.state.lock();
        if !state.assign_versions {
            return Ok(SaveAck::default());
        }
        state.version += 1;
        Ok(SaveAck::with_version(state.version))
    }
}
