//! Draft ownership, debounced persistence and the save-status state machine.
//!
//! ```text
//!  Idle ──edit──▶ Dirty ──flush──▶ Saving ──ok──▶ Saved ──edit──▶ Dirty
//!                   ▲                 │
//!                   │                 └─fail─▶ Error ──retry/edit──▶ …
//!                   └──────────── edit ─────────┘
//!
//!  offline + queued updates  ⇒  Offline (overrides the above)
//! ```
//!
//! Every save carries a generation number. Starting a new save, resetting or
//! tearing down bumps the generation and aborts the previous request; a
//! completion whose generation is no longer current is discarded.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use draftsync_core::{Clock, Draft, FieldValue, Fields, QueuedUpdate, SaveStatus, SystemClock};
use draftsync_storage::{KeyValueStore, get_decoded, put_encoded};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{PartialUpdate, SaveAck, SaveBackend, SaveError};
use crate::config::AutosaveConfig;
use crate::debounce::Debouncer;
use crate::error::EngineError;

/// Host hooks for save lifecycle events. All methods default to no-ops.
///
/// Called outside the controller's internal lock, so implementations may
/// call back into the controller.
pub trait AutosaveObserver: Send + Sync {
    fn on_status_change(&self, _status: SaveStatus) {}

    fn on_save_success(&self, _version: u64) {}

    /// A failed save will be retried after `delay`.
    fn on_retry_scheduled(&self, _attempt: u32, _delay: Duration) {}

    /// Retries are exhausted.
    fn on_save_error(&self, _error: &SaveError) {}

    /// The backend reported a version conflict; the host must reload the entity.
    fn on_conflict(&self, _error: &SaveError) {}
}

struct NoopObserver;

impl AutosaveObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    NothingToSave,
    Saved { version: u64 },
    /// Offline: the pending buffer went to the offline queue.
    Queued { queue_len: usize },
    /// The offline queue is draining; the buffer stays pending and is
    /// flushed once the drain finishes.
    Deferred,
    /// A newer save or a teardown made this one irrelevant.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRetry {
    pub attempt: u32,
    pub delay: Duration,
    pub due_at: Instant,
}

impl PendingRetry {
    /// Time left until the retry fires, for countdown displays.
    pub fn remaining(&self) -> Duration {
        self.due_at.saturating_duration_since(Instant::now())
    }
}

enum Notice {
    Status(SaveStatus),
    Saved(u64),
    Retry(u32, Duration),
    Failed(SaveError),
    Conflict(SaveError),
}

struct Session {
    /// Last draft supplied from outside; `reset` returns here.
    baseline: Fields,
    draft: Draft,
    /// Status ignoring connectivity; `draft.save_status` holds the effective one.
    base_status: SaveStatus,
    online: bool,
    offline_queue: VecDeque<QueuedUpdate>,
    last_saved: Option<u64>,
    last_error: Option<SaveError>,
    retries: u32,
    pending_retry: Option<PendingRetry>,
    retry_timer: Option<JoinHandle<()>>,
    generation: u64,
    in_flight: Option<AbortHandle>,
    draining: bool,
    /// A flush arrived mid-drain and must run after it.
    deferred_flush: bool,
    torn_down: bool,
    /// Observer calls collected under the lock, delivered after it is released.
    notices: Vec<Notice>,
}

impl Session {
    fn supersede(&mut self) {
        self.generation += 1;
        if let Some(request) = self.in_flight.take() {
            request.abort();
        }
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        self.pending_retry = None;
    }
}

struct Shared {
    config: AutosaveConfig,
    backend: Arc<dyn SaveBackend>,
    observer: Arc<dyn AutosaveObserver>,
    clock: Arc<dyn Clock>,
    queue_store: Option<Arc<dyn KeyValueStore>>,
    session: Mutex<Session>,
    status: watch::Sender<SaveStatus>,
    flush: Debouncer<(), SaveOutcome, SaveError>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn transition(&self, session: &mut Session, status: SaveStatus) {
        session.base_status = status;
        self.publish(session);
    }

    fn publish(&self, session: &mut Session) {
        let effective = if !session.online && !session.offline_queue.is_empty() {
            SaveStatus::Offline
        } else {
            session.base_status
        };
        if session.draft.save_status != effective {
            debug!(
                from = session.draft.save_status.as_str(),
                to = effective.as_str(),
                "save status changed"
            );
            session.draft.save_status = effective;
            self.status.send_replace(effective);
            session.notices.push(Notice::Status(effective));
        }
    }

    /// Unlock the session, then deliver the notices gathered while it was held.
    fn release(&self, mut session: MutexGuard<'_, Session>) {
        let notices = std::mem::take(&mut session.notices);
        drop(session);
        for notice in notices {
            self.notify(notice);
        }
    }

    fn persist_queue(&self, queue: &VecDeque<QueuedUpdate>) {
        let Some(store) = &self.queue_store else {
            return;
        };
        let entries: Vec<&QueuedUpdate> = queue.iter().collect();
        if let Err(e) = put_encoded(store.as_ref(), &self.config.offline_queue_key, &entries) {
            warn!(error = %e, "failed to persist offline queue");
        }
    }

    fn notify(&self, notice: Notice) {
        match notice {
            Notice::Status(status) => self.observer.on_status_change(status),
            Notice::Saved(version) => self.observer.on_save_success(version),
            Notice::Retry(attempt, delay) => self.observer.on_retry_scheduled(attempt, delay),
            Notice::Failed(error) => self.observer.on_save_error(&error),
            Notice::Conflict(error) => self.observer.on_conflict(&error),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        session.supersede();
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

pub struct AutosaveBuilder {
    backend: Arc<dyn SaveBackend>,
    config: AutosaveConfig,
    observer: Arc<dyn AutosaveObserver>,
    clock: Arc<dyn Clock>,
    queue_store: Option<Arc<dyn KeyValueStore>>,
}

impl AutosaveBuilder {
    #[must_use]
    pub fn config(mut self, config: AutosaveConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn AutosaveObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Keep the offline queue in `store` so it outlives the session.
    #[must_use]
    pub fn queue_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.queue_store = Some(store);
        self
    }

    /// Start a session for an entity whose persisted state is `fields` at `version`.
    ///
    /// Must be called within a tokio runtime. Fails only if a durable offline
    /// queue exists but cannot be read.
    pub fn build(self, fields: Fields, version: u64) -> Result<AutosaveController, EngineError> {
        let offline_queue: VecDeque<QueuedUpdate> = match &self.queue_store {
            Some(store) => get_decoded::<Vec<QueuedUpdate>>(
                store.as_ref(),
                &self.config.offline_queue_key,
            )?
            .unwrap_or_default()
            .into(),
            None => VecDeque::new(),
        };
        if !offline_queue.is_empty() {
            info!(entries = offline_queue.len(), "restored offline queue");
        }

        let (status, _) = watch::channel(SaveStatus::Idle);
        let delay = self.config.delay();
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            Shared {
                session: Mutex::new(Session {
                    baseline: fields.clone(),
                    draft: Draft::new(fields, version),
                    base_status: SaveStatus::Idle,
                    online: true,
                    offline_queue,
                    last_saved: None,
                    last_error: None,
                    retries: 0,
                    pending_retry: None,
                    retry_timer: None,
                    generation: 0,
                    in_flight: None,
                    draining: false,
                    deferred_flush: false,
                    torn_down: false,
                    notices: Vec::new(),
                }),
                flush: Debouncer::new(delay, move |()| {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(shared) => AutosaveController { shared }.save_changes().await,
                            None => Ok(SaveOutcome::Superseded),
                        }
                    }
                }),
                config: self.config,
                backend: self.backend,
                observer: self.observer,
                clock: self.clock,
                queue_store: self.queue_store,
                status,
                listener: Mutex::new(None),
            }
        });
        Ok(AutosaveController { shared })
    }
}

/// Handle to one editing session. Clones share the same draft.
#[derive(Clone)]
pub struct AutosaveController {
    shared: Arc<Shared>,
}

impl AutosaveController {
    pub fn builder(backend: Arc<dyn SaveBackend>) -> AutosaveBuilder {
        AutosaveBuilder {
            backend,
            config: AutosaveConfig::default(),
            observer: Arc::new(NoopObserver),
            clock: Arc::new(SystemClock),
            queue_store: None,
        }
    }

    // ========================================================================
    // Edits
    // ========================================================================

    /// Stage one field edit and (re)schedule a flush.
    pub fn update_field(&self, field: &str, value: FieldValue) {
        let delay = self.shared.config.delay_for(field);
        {
            let mut session = self.shared.session.lock();
            if session.torn_down {
                return;
            }
            session.draft.stage(field, value);
            session.last_error = None;
            session.retries = 0;
            self.shared.transition(&mut session, SaveStatus::Dirty);
            self.shared.release(session);
        }
        let _ = self.shared.flush.call_after((), delay);
    }

    /// Stage several edits at once. The flush uses the shortest delay among
    /// the edited fields.
    pub fn update_fields(&self, fields: Fields) {
        let Some(delay) = fields
            .keys()
            .map(|field| self.shared.config.delay_for(field))
            .min()
        else {
            return;
        };
        {
            let mut session = self.shared.session.lock();
            if session.torn_down {
                return;
            }
            for (field, value) in fields {
                session.draft.stage(&field, value);
            }
            session.last_error = None;
            session.retries = 0;
            self.shared.transition(&mut session, SaveStatus::Dirty);
            self.shared.release(session);
        }
        let _ = self.shared.flush.call_after((), delay);
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Flush pending edits now.
    ///
    /// Offline with queueing enabled, the pending buffer moves to the offline
    /// queue instead. While the queue drains the buffer is held back, so
    /// older queued values never land after newer ones. Otherwise any
    /// in-flight save is superseded and the buffer goes to the backend.
    pub async fn save_changes(&self) -> Result<SaveOutcome, SaveError> {
        let (update, generation) = {
            let mut session = self.shared.session.lock();
            if session.torn_down {
                return Ok(SaveOutcome::Superseded);
            }
            if !session.draft.is_dirty() {
                return Ok(SaveOutcome::NothingToSave);
            }

            if !session.online && self.shared.config.queue_offline {
                let fields = session.draft.take_pending();
                let entry = QueuedUpdate::new(fields, self.shared.clock.now_ms());
                info!(fields = entry.fields.len(), "offline, queued pending update");
                session.offline_queue.push_back(entry);
                let queue_len = session.offline_queue.len();
                self.shared.transition(&mut session, SaveStatus::Idle);
                self.shared.persist_queue(&session.offline_queue);
                self.shared.release(session);
                return Ok(SaveOutcome::Queued { queue_len });
            }

            if session.draining {
                debug!("offline queue draining, flush deferred");
                session.deferred_flush = true;
                return Ok(SaveOutcome::Deferred);
            }

            session.supersede();
            let update = PartialUpdate {
                fields: session.draft.pending_updates.clone(),
                version: self
                    .shared
                    .config
                    .optimistic_concurrency
                    .then_some(session.draft.version),
            };
            self.shared.transition(&mut session, SaveStatus::Saving);
            let generation = session.generation;
            self.shared.release(session);
            (update, generation)
        };

        debug!(generation, fields = update.fields.len(), "flushing pending updates");
        let sent = update.fields.clone();
        let backend = Arc::clone(&self.shared.backend);
        let request = tokio::spawn(async move { backend.save(update).await });
        {
            let mut session = self.shared.session.lock();
            if session.generation == generation {
                session.in_flight = Some(request.abort_handle());
            }
        }

        let result = match request.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => {
                debug!(generation, "save request aborted");
                return Ok(SaveOutcome::Superseded);
            }
            Err(e) => Err(SaveError::Rejected(format!("save task failed: {e}"))),
        };
        self.complete(generation, &sent, result)
    }

    /// Skip the debounce timer and flush immediately.
    pub async fn force_save(&self) -> Result<SaveOutcome, SaveError> {
        self.shared.flush.cancel();
        self.save_changes().await
    }

    fn complete(
        &self,
        generation: u64,
        sent: &Fields,
        result: Result<SaveAck, SaveError>,
    ) -> Result<SaveOutcome, SaveError> {
        let mut session = self.shared.session.lock();
        if session.torn_down || session.generation != generation {
            debug!(generation, "discarding stale save response");
            return Ok(SaveOutcome::Superseded);
        }
        session.in_flight = None;

        let outcome = {
            match result {
                Ok(ack) => {
                    session.draft.acknowledge(sent);
                    if let Some(version) = ack.version {
                        session.draft.version = version;
                    }
                    session.last_saved = Some(self.shared.clock.now_ms());
                    session.last_error = None;
                    session.retries = 0;
                    let status = if session.draft.is_dirty() {
                        SaveStatus::Dirty
                    } else {
                        SaveStatus::Saved
                    };
                    self.shared.transition(&mut session, status);
                    let version = session.draft.version;
                    info!(version, "saved");
                    session.notices.push(Notice::Saved(version));
                    Ok(SaveOutcome::Saved { version })
                }
                Err(error) if error.is_version_conflict() => {
                    warn!(error = %error, "version conflict, reload required");
                    session.last_error = Some(error.clone());
                    self.shared.transition(&mut session, SaveStatus::Error);
                    session.notices.push(Notice::Conflict(error.clone()));
                    Err(error)
                }
                Err(error) => {
                    session.last_error = Some(error.clone());
                    self.shared.transition(&mut session, SaveStatus::Error);
                    let policy = &self.shared.config.retry;
                    if policy.allows(session.retries) {
                        session.retries += 1;
                        let attempt = session.retries;
                        let delay = policy.delay(attempt);
                        warn!(error = %error, attempt, ?delay, "save failed, retry scheduled");
                        session.pending_retry = Some(PendingRetry {
                            attempt,
                            delay,
                            due_at: Instant::now() + delay,
                        });
                        session.retry_timer = Some(self.spawn_retry(generation, delay));
                        session.notices.push(Notice::Retry(attempt, delay));
                    } else {
                        warn!(error = %error, "save failed, retries exhausted");
                        session.notices.push(Notice::Failed(error.clone()));
                    }
                    Err(error)
                }
            }
        };
        self.shared.release(session);
        outcome
    }

    fn spawn_retry(&self, generation: u64, delay: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            {
                let mut session = shared.session.lock();
                if session.torn_down || session.generation != generation {
                    return;
                }
                // Detach before flushing so the flush does not abort this task.
                session.retry_timer = None;
                session.pending_retry = None;
            }
            let _ = AutosaveController { shared }.save_changes().await;
        })
    }

    /// Discard pending edits and return to the last externally supplied draft.
    pub fn reset(&self) {
        self.shared.flush.cancel();
        let mut session = self.shared.session.lock();
        session.supersede();
        let version = session.draft.version;
        let baseline = session.baseline.clone();
        let status = session.draft.save_status;
        session.draft = Draft::new(baseline, version);
        session.draft.save_status = status;
        session.last_error = None;
        session.retries = 0;
        self.shared.transition(&mut session, SaveStatus::Idle);
        self.shared.release(session);
    }

    /// Install a freshly loaded draft, e.g. after a version conflict.
    pub fn replace_draft(&self, fields: Fields, version: u64) {
        self.shared.flush.cancel();
        let mut session = self.shared.session.lock();
        session.supersede();
        let status = session.draft.save_status;
        session.baseline = fields.clone();
        session.draft = Draft::new(fields, version);
        session.draft.save_status = status;
        session.last_error = None;
        session.retries = 0;
        self.shared.transition(&mut session, SaveStatus::Idle);
        self.shared.release(session);
    }

    // ========================================================================
    // Connectivity
    // ========================================================================

    /// React to a connectivity change. Coming online drains the offline
    /// queue and then flushes any remaining edits.
    pub async fn set_online(&self, online: bool) {
        let was_online = {
            let mut session = self.shared.session.lock();
            if session.torn_down {
                return;
            }
            let was_online = session.online;
            session.online = online;
            self.shared.publish(&mut session);
            self.shared.release(session);
            was_online
        };
        if online && !was_online {
            info!("connectivity restored");
            self.drain_offline_queue().await;
            let _ = self.force_save().await;
        } else if !online && was_online {
            info!("connectivity lost");
        }
    }

    /// Follow a connectivity signal until teardown.
    pub fn attach_connectivity(&self, mut signal: watch::Receiver<bool>) {
        let weak = Arc::downgrade(&self.shared);
        let listener = tokio::spawn(async move {
            loop {
                let online = *signal.borrow_and_update();
                match weak.upgrade() {
                    Some(shared) => AutosaveController { shared }.set_online(online).await,
                    None => break,
                }
                if signal.changed().await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.shared.listener.lock().replace(listener) {
            previous.abort();
        }
    }

    /// Send each queued update, oldest first. Acknowledged entries leave the
    /// queue; failed ones stay for the next online transition. Returns the
    /// number of entries synced.
    pub async fn drain_offline_queue(&self) -> usize {
        let entries: Vec<QueuedUpdate> = {
            let mut session = self.shared.session.lock();
            if session.torn_down || session.draining || !session.online {
                return 0;
            }
            session.draining = true;
            session.offline_queue.iter().cloned().collect()
        };
        if entries.is_empty() {
            self.finish_drain();
            return 0;
        }

        info!(entries = entries.len(), "draining offline queue");
        let mut synced = 0;
        let mut failure = None;
        for entry in entries {
            let version = {
                let session = self.shared.session.lock();
                self.shared
                    .config
                    .optimistic_concurrency
                    .then_some(session.draft.version)
            };
            let result = self
                .shared
                .backend
                .save(PartialUpdate {
                    fields: entry.fields.clone(),
                    version,
                })
                .await;

            let mut session = self.shared.session.lock();
            if session.torn_down {
                return synced;
            }
            match result {
                Ok(ack) => {
                    session.offline_queue.retain(|queued| queued.id != entry.id);
                    if let Some(version) = ack.version {
                        session.draft.version = version;
                    }
                    session.last_saved = Some(self.shared.clock.now_ms());
                    synced += 1;
                    let version = session.draft.version;
                    session.notices.push(Notice::Saved(version));
                }
                Err(error) => {
                    warn!(entry = %entry.id, error = %error, "queued update failed to sync");
                    if error.is_version_conflict() {
                        session.notices.push(Notice::Conflict(error.clone()));
                    }
                    failure = Some(error);
                }
            }
        }

        {
            let mut session = self.shared.session.lock();
            match failure {
                Some(error) => {
                    session.last_error = Some(error);
                    self.shared.transition(&mut session, SaveStatus::Error);
                }
                None => {
                    let status = if session.draft.is_dirty() {
                        SaveStatus::Dirty
                    } else {
                        SaveStatus::Saved
                    };
                    self.shared.transition(&mut session, status);
                }
            }
            self.shared.persist_queue(&session.offline_queue);
            self.shared.release(session);
        }
        self.finish_drain();
        synced
    }

    /// Clear the drain flag and reschedule a flush that was held back by it.
    fn finish_drain(&self) {
        let deferred = {
            let mut session = self.shared.session.lock();
            session.draining = false;
            std::mem::take(&mut session.deferred_flush)
        };
        if deferred {
            let _ = self.shared.flush.call_after((), Duration::ZERO);
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// End the session: cancel the flush timer, abort the in-flight save and
    /// any scheduled retry, stop following connectivity. Later completions
    /// are ignored.
    pub fn teardown(&self) {
        self.shared.flush.cancel();
        {
            let mut session = self.shared.session.lock();
            session.torn_down = true;
            session.supersede();
        }
        if let Some(listener) = self.shared.listener.lock().take() {
            listener.abort();
        }
        debug!("autosave session torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.shared.session.lock().torn_down
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn status(&self) -> SaveStatus {
        self.shared.session.lock().draft.save_status
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SaveStatus> {
        self.shared.status.subscribe()
    }

    pub fn draft(&self) -> Draft {
        self.shared.session.lock().draft.clone()
    }

    pub fn field(&self, field: &str) -> Option<FieldValue> {
        self.shared.session.lock().draft.fields.get(field).cloned()
    }

    pub fn version(&self) -> u64 {
        self.shared.session.lock().draft.version
    }

    pub fn is_dirty(&self) -> bool {
        self.shared.session.lock().draft.is_dirty()
    }

    pub fn dirty_fields(&self) -> BTreeSet<String> {
        self.shared.session.lock().draft.dirty_fields.clone()
    }

    pub fn is_online(&self) -> bool {
        self.shared.session.lock().online
    }

    /// Milliseconds since the Unix epoch of the last acknowledged save.
    pub fn last_saved(&self) -> Option<u64> {
        self.shared.session.lock().last_saved
    }

    pub fn last_error(&self) -> Option<SaveError> {
        self.shared.session.lock().last_error.clone()
    }

    pub fn pending_retry(&self) -> Option<PendingRetry> {
        self.shared.session.lock().pending_retry
    }

    pub fn offline_queue(&self) -> Vec<QueuedUpdate> {
        self.shared.session.lock().offline_queue.iter().cloned().collect()
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.shared.flush.is_pending()
    }
}
